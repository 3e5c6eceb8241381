#![allow(dead_code)]

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use sockrelay::{ShutdownHandle, Socks5Server};
use std::net::{Ipv4Addr, SocketAddr};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Address no test DNS traffic should ever reach
pub const UNUSED_RESOLVER: &str = "127.0.0.1:9";

/// Proxy runs a relay server on its own thread for the duration of a test
pub struct Proxy {
    pub addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Proxy {
    pub fn start(mut server: Socks5Server) -> Self {
        let addr = server.bind().expect("bind relay");
        let handle = server.shutdown_handle().expect("shutdown handle");
        let thread = std::thread::spawn(move || server.run());
        Self {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    pub fn default_server() -> Socks5Server {
        Socks5Server::new("127.0.0.1:0").with_resolver(Some(UNUSED_RESOLVER.parse().unwrap()))
    }

    /// stop shuts the loop down and returns what `run` returned
    pub fn stop(mut self) -> anyhow::Result<()> {
        self.handle.shutdown().expect("wake relay");
        self.thread
            .take()
            .expect("relay thread")
            .join()
            .expect("relay thread panicked")
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

/// echo_server accepts connections and writes back everything it reads
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

pub fn ipv4_request(command: u8, target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(target) = target else {
        panic!("IPv4 target expected");
    };
    let mut frame = vec![0x05, command, 0x00, 0x01];
    frame.extend_from_slice(&target.ip().octets());
    frame.extend_from_slice(&target.port().to_be_bytes());
    frame
}

pub fn domain_request(domain: &str, port: u16) -> Vec<u8> {
    let mut frame = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
    frame.extend_from_slice(domain.as_bytes());
    frame.extend_from_slice(&port.to_be_bytes());
    frame
}

pub async fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .expect("read");
    buf
}

/// expect_closed waits for the relay to close the stream
pub async fn expect_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    match timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .expect("relay kept the connection open")
    {
        Ok(_) => assert!(rest.is_empty(), "unexpected trailing bytes: {rest:?}"),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
}

/// greet connects to the relay and completes the method negotiation
pub async fn greet(proxy: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact_n(&mut client, 2).await, [0x05, 0x00]);
    client
}

/// DnsAnswer decides how the fake DNS server replies
#[derive(Clone, Copy)]
pub enum DnsAnswer {
    Address(Ipv4Addr),
    NxDomain,
    Silent,
}

/// dns_server answers every A query with `answer` and forwards the queries
/// it sees
pub async fn dns_server(answer: DnsAnswer) -> (SocketAddr, mpsc::UnboundedReceiver<Message>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            let _ = seen_tx.send(query.clone());

            let mut reply = Message::new();
            reply
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(query.recursion_desired())
                .set_recursion_available(true)
                .add_queries(query.queries().to_vec());

            match answer {
                DnsAnswer::Silent => continue,
                DnsAnswer::NxDomain => {
                    reply.set_response_code(ResponseCode::NXDomain);
                }
                DnsAnswer::Address(ip) => {
                    let name = query.queries()[0].name().clone();
                    reply.add_answer(Record::from_rdata(name, 60, RData::A(A(ip))));
                }
            }

            let _ = socket.send_to(&reply.to_vec().unwrap(), from).await;
        }
    });

    (addr, seen_rx)
}
