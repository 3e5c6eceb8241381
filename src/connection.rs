//! Per-socket state held by the reactor.
//!
//! Every registered socket (client leg, upstream leg or DNS query) owns one
//! [`Connection`]. Records refer to each other through [`Token`]s only; the
//! reactor's slab is the single owner of all of them.

use crate::address::SocksRequest;
use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

/// Buffer is a fixed-capacity byte buffer that alternates between being
/// filled by reads and drained by writes
///
/// Bytes are appended at the tail through [`Buffer::appendable`] +
/// [`Buffer::commit`] and removed from the head through
/// [`Buffer::drainable`] + [`Buffer::consume`].
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

/// Buffer implementation block
impl Buffer {
    /// with_capacity allocates an empty buffer
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// appendable exposes the free space after the last committed byte
    pub fn appendable(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// commit marks `n` bytes of the appendable view as filled
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.data.len());
    }

    /// drainable exposes the filled bytes not yet consumed
    pub fn drainable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// consume marks `n` bytes of the drainable view as written out
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.reset();
        }
    }

    /// append copies as much of `bytes` as fits and returns the count copied
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let room = self.appendable();
        let n = room.len().min(bytes.len());
        room[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// has_pending reports whether undrained bytes remain
    pub fn has_pending(&self) -> bool {
        self.start < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// is_full reports whether no appendable space is left
    pub fn is_full(&self) -> bool {
        self.end == self.data.len()
    }

    /// reset discards everything and returns the buffer to the fill phase
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// compact moves the undrained bytes to the front so the whole
    /// remaining capacity is appendable again
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

/// Role tells which side of the relay a record represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ClientFacing,
    Upstream,
    DnsQuery,
}

/// Step is the protocol position of a record
///
/// Steps only move forward. `AwaitingDnsReply` is held by DNS query records
/// only; `Draining` is entered once a record's peer is gone and it still has
/// output to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AwaitingGreeting,
    AwaitingRequest,
    Connecting,
    AwaitingDnsReply,
    Relaying,
    Draining,
    Closed,
}

/// Socket is the transport a record is bound to
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(stream) => stream.read(buf),
            Socket::Udp(socket) => socket.recv(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(stream) => stream.write(buf),
            Socket::Udp(socket) => socket.send(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => stream.flush(),
            Socket::Udp(_) => Ok(()),
        }
    }
}

impl Source for Socket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => stream.register(registry, token, interests),
            Socket::Udp(socket) => socket.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => stream.reregister(registry, token, interests),
            Socket::Udp(socket) => socket.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => stream.deregister(registry),
            Socket::Udp(socket) => socket.deregister(registry),
        }
    }
}

/// Connection is the record the reactor keeps for every registered socket
#[derive(Debug)]
pub struct Connection {
    pub socket: Socket,
    pub role: Role,
    pub step: Step,
    /// Bytes read from this socket; the peer drains them
    pub inbound: Buffer,
    /// Bytes this record owns for itself to write: handshake replies, failure
    /// replies and whatever a departed peer left behind
    pub outbound: Option<Buffer>,
    pub peer: Option<Token>,
    /// Request replayed once its domain name is resolved
    pub pending: Option<SocksRequest>,
    /// Current registration; `None` means deregistered
    pub interest: Option<Interest>,
    pub deadline: Option<Instant>,
    /// Id of the outstanding DNS query, DnsQuery records only
    pub query_id: Option<u16>,
    pub addr: Option<SocketAddr>,
    pub bytes_read: u64,
}

/// Connection implementation block
impl Connection {
    /// client creates the record for a freshly accepted client socket
    pub fn client(stream: TcpStream, addr: SocketAddr, buffer_size: usize) -> Self {
        Self::new(
            Socket::Tcp(stream),
            Role::ClientFacing,
            Step::AwaitingGreeting,
            buffer_size,
        )
        .with_addr(addr)
    }

    /// upstream creates the record for an outbound connect in flight
    pub fn upstream(stream: TcpStream, addr: SocketAddr, peer: Token, buffer_size: usize) -> Self {
        let mut conn = Self::new(
            Socket::Tcp(stream),
            Role::Upstream,
            Step::Connecting,
            buffer_size,
        )
        .with_addr(addr);
        conn.peer = Some(peer);
        conn
    }

    /// dns_query creates the record for an outstanding DNS query
    pub fn dns_query(socket: UdpSocket, id: u16, requester: Token, buffer_size: usize) -> Self {
        let mut conn = Self::new(
            Socket::Udp(socket),
            Role::DnsQuery,
            Step::AwaitingDnsReply,
            buffer_size,
        );
        conn.query_id = Some(id);
        conn.peer = Some(requester);
        conn
    }

    fn new(socket: Socket, role: Role, step: Step, buffer_size: usize) -> Self {
        Self {
            socket,
            role,
            step,
            inbound: Buffer::with_capacity(buffer_size),
            outbound: None,
            peer: None,
            pending: None,
            interest: None,
            deadline: None,
            query_id: None,
            addr: None,
            bytes_read: 0,
        }
    }

    fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// has_pending_output reports whether this record's own outbound buffer
    /// still holds bytes
    pub fn has_pending_output(&self) -> bool {
        self.outbound.as_ref().is_some_and(Buffer::has_pending)
    }

    /// stage_output queues bytes on this record's own outbound buffer
    pub fn stage_output(&mut self, bytes: &[u8]) {
        let queued = self.outbound.as_ref().map_or(0, Buffer::len);
        let mut out = Buffer::with_capacity(queued + bytes.len());
        if let Some(prev) = self.outbound.take() {
            out.append(prev.drainable());
        }
        out.append(bytes);
        self.outbound = Some(out);
    }

    /// fill reads from the socket until it would block, the inbound buffer is
    /// full, or the remote end closed. Returns the byte count read and whether
    /// EOF was seen.
    pub fn fill(&mut self) -> io::Result<(usize, bool)> {
        let mut total = 0;
        loop {
            if self.inbound.is_full() {
                return Ok((total, false));
            }
            match self.socket.read(self.inbound.appendable()) {
                Ok(0) if self.role == Role::DnsQuery => return Ok((total, false)),
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    self.inbound.commit(n);
                    self.bytes_read += n as u64;
                    total += n;
                    // Datagrams arrive whole
                    if self.role == Role::DnsQuery {
                        return Ok((total, false));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// flush_outbound writes this record's own outbound buffer until it is
    /// drained or the socket would block. Returns true once drained.
    pub fn flush_outbound(&mut self) -> io::Result<bool> {
        let Some(out) = self.outbound.as_mut() else {
            return Ok(true);
        };
        let drained = drain_into(&mut self.socket, out)?;
        if drained {
            self.outbound = None;
        }
        Ok(drained)
    }
}

/// drain_into writes `buf` into `socket` until it is empty or the socket
/// would block. Returns true once the buffer is drained.
pub fn drain_into(socket: &mut Socket, buf: &mut Buffer) -> io::Result<bool> {
    while buf.has_pending() {
        match socket.write(buf.drainable()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf.consume(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
