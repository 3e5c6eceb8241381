//! Registration state shared by every event handler.
//!
//! [`Context`] owns the slab of connection records and a handle to the
//! readiness registry. Handlers receive it explicitly; it is the only place
//! that registers, reregisters or deregisters sockets and the only place
//! records are destroyed.

use crate::config::Config;
use crate::connection::{Connection, Role, Step};
use crate::protocol::{self, ReplyCode};
use mio::event::Source;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Context is the reactor state handed to every handler invocation
pub struct Context {
    registry: Registry,
    connections: Slab<Connection>,
    pub config: Config,
    /// DNS server used for domain-name destinations
    pub resolver: Option<SocketAddr>,
    /// Min-heap of armed deadlines. Entries whose record is gone or whose
    /// deadline changed since are skipped when they reach the top.
    deadlines: BinaryHeap<Reverse<(Instant, Token)>>,
    next_query_id: u16,
}

/// Context implementation block
impl Context {
    /// new builds an empty context over a registry handle
    pub fn new(registry: Registry, config: Config, resolver: Option<SocketAddr>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or_default();

        Self {
            registry,
            connections: Slab::new(),
            config,
            resolver,
            deadlines: BinaryHeap::new(),
            next_query_id: seed,
        }
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.connections.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(token.0)
    }

    /// pair_mut borrows two distinct records at once
    pub fn pair_mut(
        &mut self,
        a: Token,
        b: Token,
    ) -> Option<(&mut Connection, &mut Connection)> {
        self.connections.get2_mut(a.0, b.0)
    }

    /// len returns the number of live records
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// next_query_id hands out DNS message ids
    pub fn next_query_id(&mut self) -> u16 {
        self.next_query_id = self.next_query_id.wrapping_add(1);
        self.next_query_id
    }

    /// insert stores a record and registers its socket with `interest`.
    /// The record is dropped again if registration fails.
    pub fn insert(&mut self, conn: Connection, interest: Interest) -> io::Result<Token> {
        let token = Token(self.connections.insert(conn));
        if let Err(e) = self.set_interest(token, Some(interest)) {
            self.connections.remove(token.0);
            return Err(e);
        }
        Ok(token)
    }

    /// set_interest makes `interest` the record's registration. mio has no
    /// empty interest set, so None deregisters the socket.
    pub fn set_interest(&mut self, token: Token, interest: Option<Interest>) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown token"))?;

        match (conn.interest, interest) {
            (None, Some(new)) => conn.socket.register(&self.registry, token, new)?,
            // Reregistering also re-arms edge-triggered readiness
            (Some(_), Some(new)) => conn.socket.reregister(&self.registry, token, new)?,
            (Some(_), None) => conn.socket.deregister(&self.registry)?,
            (None, None) => {}
        }
        conn.interest = interest;
        Ok(())
    }

    /// enable adds `interest` to the record's registration
    pub fn enable(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let current = self.get(token).and_then(|c| c.interest);
        let next = current.map_or(interest, |c| c.add(interest));
        self.set_interest(token, Some(next))
    }

    /// disable removes `interest` from the record's registration
    pub fn disable(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let current = self.get(token).and_then(|c| c.interest);
        let next = current.and_then(|c| c.remove(interest));
        self.set_interest(token, next)
    }

    /// close deregisters and destroys a record in one step. The socket is
    /// closed when the returned record is dropped.
    pub fn close(&mut self, token: Token) -> Option<Connection> {
        let mut conn = self.connections.try_remove(token.0)?;
        if conn.interest.take().is_some() {
            if let Err(e) = conn.socket.deregister(&self.registry) {
                debug!("deregister of {:?} failed: {}", token, e);
            }
        }
        conn.step = Step::Closed;

        // DEBUG
        debug!(
            "closed {:?} {:?} ({}) after reading {} bytes",
            conn.role,
            token,
            conn.addr.map_or_else(|| "-".to_string(), |a| a.to_string()),
            conn.bytes_read
        );

        Some(conn)
    }

    /// teardown runs the close cascade for a failed or finished record.
    ///
    /// The record is closed at once. Its peer is severed, handed whatever
    /// the record had read but the peer had not written yet, and then closed
    /// as soon as that output is flushed.
    pub fn teardown(&mut self, token: Token) {
        let Some(mut conn) = self.close(token) else {
            return;
        };
        let Some(peer_token) = conn.peer.take() else {
            return;
        };
        let Some(peer) = self.connections.get_mut(peer_token.0) else {
            return;
        };
        if peer.peer != Some(token) {
            return;
        }
        peer.peer = None;

        if conn.role != Role::DnsQuery && peer.role != Role::DnsQuery {
            let (from_client, from_server) = match conn.role {
                Role::ClientFacing => (conn.bytes_read, peer.bytes_read),
                _ => (peer.bytes_read, conn.bytes_read),
            };

            // DEBUG
            info!(
                "connection closed: {} bytes from client, {} bytes from server",
                from_client, from_server
            );

            if conn.inbound.has_pending() {
                peer.stage_output(conn.inbound.drainable());
            }
        }

        self.drain_then_close(peer_token);
    }

    /// drain_then_close moves a severed record to Draining. It is closed
    /// right away when nothing is left to flush, otherwise once its write
    /// interest has drained the outbound buffer.
    pub fn drain_then_close(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token.0) else {
            return;
        };
        conn.step = Step::Draining;
        conn.pending = None;
        conn.deadline = None;
        conn.inbound.reset();

        match conn.flush_outbound() {
            Ok(true) => {
                self.close(token);
            }
            Ok(false) => {
                if let Err(e) = self.set_interest(token, Some(Interest::WRITABLE)) {
                    debug!("cannot drain {:?}: {}", token, e);
                    self.close(token);
                }
            }
            Err(e) => {
                debug!("drain of {:?} failed: {}", token, e);
                self.close(token);
            }
        }
    }

    /// abort_with_reply answers a client still in the handshake with a
    /// failure reply, retires whatever it was waiting on, and closes it once
    /// the reply is flushed
    pub fn abort_with_reply(&mut self, token: Token, code: ReplyCode) {
        let Some(conn) = self.connections.get_mut(token.0) else {
            return;
        };

        // DEBUG
        debug!("aborting {:?} with {:?}", token, code);

        let partner = conn.peer.take();
        conn.stage_output(&protocol::reply(code));

        if let Some(partner) = partner {
            if let Some(other) = self.connections.get_mut(partner.0) {
                other.peer = None;
            }
            self.close(partner);
        }

        self.drain_then_close(token);
    }

    /// set_deadline arms a deadline for the record
    pub fn set_deadline(&mut self, token: Token, deadline: Instant) {
        let Some(conn) = self.connections.get_mut(token.0) else {
            return;
        };
        conn.deadline = Some(deadline);
        self.deadlines.push(Reverse((deadline, token)));
    }

    /// is_armed reports whether a heap entry still matches its record
    fn is_armed(&self, deadline: Instant, token: Token) -> bool {
        self.get(token).is_some_and(|conn| conn.deadline == Some(deadline))
    }

    /// next_deadline returns the earliest pending deadline, dropping stale
    /// heap entries on the way
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, token))) = self.deadlines.peek() {
            if self.is_armed(deadline, token) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// expired pops the records whose deadline has passed at `now`
    pub fn expired(&mut self, now: Instant) -> Vec<Token> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, token))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if self.is_armed(deadline, token) {
                due.push(token);
            }
        }
        due
    }

    /// expire gives up on a connect or DNS query whose deadline passed and
    /// reports the timeout to the waiting client
    pub fn expire(&mut self, token: Token) {
        let Some(conn) = self.get(token) else {
            return;
        };

        // DEBUG
        debug!("{:?} {:?} timed out in {:?}", conn.role, token, conn.step);

        let waiting = conn.peer;
        match waiting {
            Some(client) => self.abort_with_reply(client, ReplyCode::TtlExpired),
            None => self.teardown(token),
        }
    }
}
