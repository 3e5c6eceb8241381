mod common;

use common::*;
use hickory_proto::rr::RecordType;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

#[tokio::test]
async fn domain_target_is_resolved_before_connecting() {
    let upstream = echo_server().await;
    let (dns, mut queries) = dns_server(DnsAnswer::Address(Ipv4Addr::LOCALHOST)).await;
    let proxy = Proxy::start(Proxy::default_server().with_resolver(Some(dns)));

    let mut client = greet(proxy.addr).await;
    client
        .write_all(&domain_request("echo.test", upstream.port()))
        .await
        .unwrap();
    assert_eq!(
        read_exact_n(&mut client, 10).await,
        [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );

    let query = timeout(WAIT, queries.recv()).await.unwrap().unwrap();
    assert!(query.recursion_desired());
    assert!(query.authentic_data());
    assert_eq!(query.queries()[0].query_type(), RecordType::A);
    assert_eq!(query.queries()[0].name().to_ascii(), "echo.test.");

    client.write_all(b"resolved").await.unwrap();
    assert_eq!(read_exact_n(&mut client, 8).await, b"resolved");
}

#[tokio::test]
async fn empty_answer_reports_host_unreachable() {
    let (dns, _queries) = dns_server(DnsAnswer::NxDomain).await;
    let proxy = Proxy::start(Proxy::default_server().with_resolver(Some(dns)));

    let mut client = greet(proxy.addr).await;
    client
        .write_all(&domain_request("nowhere.invalid", 80))
        .await
        .unwrap();

    let reply = read_exact_n(&mut client, 10).await;
    assert_eq!(reply[1], 0x04, "host unreachable");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn silent_resolver_times_out_when_deadline_is_set() {
    let (dns, _queries) = dns_server(DnsAnswer::Silent).await;
    let proxy = Proxy::start(
        Proxy::default_server()
            .with_resolver(Some(dns))
            .with_timeout(Some(Duration::from_millis(200))),
    );

    let mut client = greet(proxy.addr).await;
    client
        .write_all(&domain_request("slow.test", 80))
        .await
        .unwrap();

    let reply = read_exact_n(&mut client, 10).await;
    assert_eq!(reply[1], 0x06, "ttl expired");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn silent_resolver_leaves_client_waiting_without_deadline() {
    let (dns, _queries) = dns_server(DnsAnswer::Silent).await;
    let proxy = Proxy::start(Proxy::default_server().with_resolver(Some(dns)));

    let mut client = greet(proxy.addr).await;
    client
        .write_all(&domain_request("slow.test", 80))
        .await
        .unwrap();

    let mut byte = [0u8; 1];
    let waited = timeout(
        Duration::from_millis(300),
        tokio::io::AsyncReadExt::read(&mut client, &mut byte),
    )
    .await;
    assert!(waited.is_err(), "client should still be waiting");
}
