//! Non-blocking DNS resolution for domain-name destinations.
//!
//! A query is one UDP datagram sent to the configured nameserver. The socket
//! is registered like any other record (role `DnsQuery`) and the reply is
//! handled from the event loop, so resolution never blocks the thread.

use crate::commands;
use crate::connection::Connection;
use crate::protocol::ReplyCode;
use crate::reactor::Context;
use anyhow::{Result, anyhow};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use mio::net::UdpSocket;
use mio::{Interest, Token};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;
use tracing::debug;

/// Largest DNS message accepted over UDP without EDNS
pub const MAX_DNS_PACKET: usize = 512;

/// system_nameserver returns the first nameserver of the host's resolver
/// configuration
pub fn system_nameserver() -> Result<SocketAddr> {
    let (config, _opts) = hickory_resolver::system_conf::read_system_conf()
        .map_err(|e| anyhow!("[ERR] cannot read system resolver configuration: {e}"))?;

    config
        .name_servers()
        .first()
        .map(|ns| ns.socket_addr)
        .ok_or_else(|| anyhow!("[ERR] system resolver configuration lists no nameservers"))
}

/// build_query encodes a recursive A-record query for `domain`
pub fn build_query(id: u16, domain: &str) -> Result<Vec<u8>> {
    let mut name = Name::from_ascii(domain)
        .map_err(|e| anyhow!("[ERR] invalid domain name '{domain}': {e}"))?;
    name.set_fqdn(true);

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_authentic_data(true)
        .add_query(Query::query(name, RecordType::A));

    message
        .to_vec()
        .map_err(|e| anyhow!("[ERR] cannot encode DNS query: {e}"))
}

/// parse_reply extracts the first IPv4 address from the answer section.
///
/// Returns None for datagrams that are not the reply to query `id`, and an
/// error when the reply is malformed or carries no address record.
pub fn parse_reply(packet: &[u8], id: u16) -> Result<Option<Ipv4Addr>> {
    let message =
        Message::from_vec(packet).map_err(|e| anyhow!("[ERR] malformed DNS reply: {e}"))?;

    if message.id() != id || message.message_type() != MessageType::Response {
        return Ok(None);
    }

    message
        .answers()
        .iter()
        .find_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .map(Some)
        .ok_or_else(|| {
            anyhow!(
                "[ERR] DNS reply has no address records ({})",
                message.response_code()
            )
        })
}

/// resolve sends an A query for `domain` on behalf of `requester` and
/// registers the query socket for its reply
pub fn resolve(ctx: &mut Context, domain: &str, requester: Token) -> Result<Token> {
    let server = ctx
        .resolver
        .ok_or_else(|| anyhow!("[ERR] no DNS server configured"))?;

    let id = ctx.next_query_id();
    let query = build_query(id, domain)?;

    let local: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(local)?;
    socket.connect(server)?;
    socket.send(&query)?;

    let conn = Connection::dns_query(socket, id, requester, MAX_DNS_PACKET);
    let token = ctx.insert(conn, Interest::READABLE)?;
    if let Some(timeout) = ctx.config.connect_timeout {
        ctx.set_deadline(token, Instant::now() + timeout);
    }

    if let Some(client) = ctx.get_mut(requester) {
        client.peer = Some(token);
    }

    // DEBUG
    debug!("resolving {} via {} (query {:#06x})", domain, server, id);

    Ok(token)
}

/// on_reply handles read-readiness of a DNS query socket. On an answer the
/// query record is retired and the requester's connect-request is replayed
/// with the resolved address; on failure the requester is aborted.
pub fn on_reply(ctx: &mut Context, token: Token) -> Result<()> {
    let conn = ctx
        .get_mut(token)
        .ok_or_else(|| anyhow!("[ERR] unknown DNS query {token:?}"))?;
    let id = conn.query_id.unwrap_or_default();
    let requester = conn.peer;

    let answer = loop {
        conn.inbound.reset();
        match conn.fill() {
            // Nothing left to read: keep waiting
            Ok((0, _)) => return Ok(()),
            Ok(_) => match parse_reply(conn.inbound.drainable(), id) {
                Ok(Some(ip)) => break Ok(ip),
                Ok(None) => {
                    debug!("ignoring stray DNS datagram on {:?}", token);
                    continue;
                }
                Err(e) => break Err(e),
            },
            Err(e) => break Err(e.into()),
        }
    };

    let Some(requester) = requester else {
        ctx.close(token);
        return Ok(());
    };

    match answer {
        Ok(ip) => {
            // Retire the query record before the connect replaces the link
            if let Some(client) = ctx.get_mut(requester) {
                client.peer = None;
            }
            ctx.close(token);

            let request = ctx
                .get_mut(requester)
                .and_then(|client| client.pending.take())
                .ok_or_else(|| anyhow!("[ERR] resolved a name nobody is waiting for"))?;

            // DEBUG
            debug!("resolved {} to {}", request, ip);

            commands::connect_upstream(ctx, requester, request.resolved(ip));
        }
        Err(e) => {
            debug!("resolution failed for {:?}: {:#}", requester, e);
            ctx.abort_with_reply(requester, ReplyCode::HostUnreachable);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::{A, CNAME};
    use hickory_proto::rr::Record;

    fn reply_to(query: &[u8]) -> Message {
        let query = Message::from_vec(query).unwrap();
        let mut reply = Message::new();
        reply
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_recursion_available(true)
            .add_queries(query.queries().to_vec());
        reply
    }

    #[test]
    fn query_asks_for_a_record_with_rd_and_ad() {
        let bytes = build_query(0x1234, "example.com").unwrap();
        let message = Message::from_vec(&bytes).unwrap();

        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.message_type(), MessageType::Query);
        assert!(message.recursion_desired());
        assert!(message.authentic_data());

        let query = &message.queries()[0];
        assert_eq!(query.query_type(), RecordType::A);
        assert_eq!(query.name().to_ascii(), "example.com.");
    }

    #[test]
    fn first_address_record_wins() {
        let query = build_query(7, "www.example.com").unwrap();
        let mut reply = reply_to(&query);

        let name = Name::from_ascii("www.example.com.").unwrap();
        let target = Name::from_ascii("example.com.").unwrap();
        reply.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::CNAME(CNAME(target.clone())),
        ));
        reply.add_answer(Record::from_rdata(
            target.clone(),
            300,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        reply.add_answer(Record::from_rdata(
            target,
            300,
            RData::A(A(Ipv4Addr::new(10, 0, 0, 1))),
        ));

        let ip = parse_reply(&reply.to_vec().unwrap(), 7).unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(93, 184, 216, 34)));
    }

    #[test]
    fn empty_answer_is_a_failure() {
        let query = build_query(9, "nowhere.invalid").unwrap();
        let mut reply = reply_to(&query);
        reply.set_response_code(ResponseCode::NXDomain);

        assert!(parse_reply(&reply.to_vec().unwrap(), 9).is_err());
    }

    #[test]
    fn mismatched_id_is_ignored() {
        let query = build_query(1, "example.com").unwrap();
        let reply = reply_to(&query);

        assert_eq!(parse_reply(&reply.to_vec().unwrap(), 2).unwrap(), None);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(parse_reply(&[0xde, 0xad], 1).is_err());
    }
}
