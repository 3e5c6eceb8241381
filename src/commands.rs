use crate::address::SocksRequest;
use crate::connection::{Connection, Socket, Step};
use crate::protocol::{self, Command, ReplyCode};
use crate::reactor::Context;
use crate::resolver;
use anyhow::{Result, anyhow};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info};

/// handle_socks_request routes a parsed connect-request: IPv4 targets are
/// connected right away, domain names are resolved first.
///
/// Every command byte is served as CONNECT unless the server runs with
/// strict command checking.
pub fn handle_socks_request(ctx: &mut Context, token: Token, request: SocksRequest) -> Result<()> {
    if ctx.config.strict_command && Command::from_byte(request.command) != Some(Command::Connect)
    {
        debug!("{:?} sent unsupported command {:#04x}", token, request.command);
        ctx.abort_with_reply(token, ReplyCode::CommandNotSupported);
        return Ok(());
    }

    // The client neither reads nor writes while its target is being reached
    ctx.set_interest(token, None)?;
    let client = ctx
        .get_mut(token)
        .ok_or_else(|| anyhow!("[ERR] unknown client {token:?}"))?;
    client.step = Step::Connecting;

    match request.domain().map(str::to_string) {
        Some(domain) => {
            client.pending = Some(request);
            if let Err(e) = resolver::resolve(ctx, &domain, token) {
                debug!("cannot resolve {}: {:#}", domain, e);
                ctx.abort_with_reply(token, ReplyCode::HostUnreachable);
            }
        }
        None => connect_upstream(ctx, token, request),
    }

    Ok(())
}

// ================
// CONNECT COMMAND
// ================

/// connect_upstream starts the outbound connect for a request whose address
/// is known. Failures are reported to the client with a reply code.
pub fn connect_upstream(ctx: &mut Context, client: Token, request: SocksRequest) {
    let Some(target) = request.target() else {
        ctx.abort_with_reply(client, ReplyCode::ServerFailure);
        return;
    };

    // DEBUG
    info!(
        "{} -> {}",
        ctx.get(client)
            .and_then(|c| c.addr)
            .map_or_else(|| "-".to_string(), |a| a.to_string()),
        target
    );

    if let Err(e) = open_upstream(ctx, client, target) {
        debug!("connect to {} failed: {}", target, e);
        ctx.abort_with_reply(client, ReplyCode::from_io_error(&e));
    }
}

/// open_upstream issues a non-blocking connect and links the new upstream
/// record with its client in both directions
fn open_upstream(ctx: &mut Context, client: Token, target: SocketAddr) -> io::Result<Token> {
    let stream = TcpStream::connect(target)?;

    let conn = Connection::upstream(stream, target, client, ctx.config.buffer_size);
    let upstream = ctx.insert(conn, Interest::WRITABLE)?;
    if let Some(timeout) = ctx.config.connect_timeout {
        ctx.set_deadline(upstream, Instant::now() + timeout);
    }

    if let Some(conn) = ctx.get_mut(client) {
        conn.peer = Some(upstream);
        conn.step = Step::Connecting;
    }

    Ok(upstream)
}

/// finish_connect handles readiness of an upstream socket whose connect is
/// in flight.
///
/// On success the success reply is staged in the upstream's inbound buffer,
/// which is what the client drains, and both legs enter Relaying.
pub fn finish_connect(ctx: &mut Context, token: Token) -> Result<()> {
    let conn = ctx
        .get_mut(token)
        .ok_or_else(|| anyhow!("[ERR] unknown upstream {token:?}"))?;
    let Socket::Tcp(stream) = &conn.socket else {
        return Err(anyhow!("[ERR] upstream {token:?} is not a TCP socket"));
    };

    let status = match stream.take_error() {
        Ok(Some(e)) | Err(e) => Err(e),
        Ok(None) => match stream.peer_addr() {
            Ok(_) => Ok(true),
            // Spurious wakeup, the handshake is still in flight
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        },
    };
    let client = conn.peer;

    let connected = match status {
        Ok(connected) => connected,
        Err(e) => {
            debug!("connect of {:?} failed: {}", token, e);
            match client {
                Some(client) => ctx.abort_with_reply(client, ReplyCode::from_io_error(&e)),
                None => ctx.teardown(token),
            }
            return Ok(());
        }
    };
    if !connected {
        return Ok(());
    }

    let Some(client) = client else {
        ctx.teardown(token);
        return Ok(());
    };

    conn.step = Step::Relaying;
    conn.deadline = None;
    conn.inbound.append(&protocol::reply(ReplyCode::Succeeded));

    let client_conn = ctx
        .get_mut(client)
        .ok_or_else(|| anyhow!("[ERR] client {client:?} vanished during connect"))?;
    client_conn.step = Step::Relaying;
    // Bytes the client sent right after its request are the first payload
    let early_payload = client_conn.inbound.has_pending();

    // The client writes the success reply; each leg reads only while its
    // own buffer is empty
    if early_payload {
        ctx.set_interest(client, Some(Interest::WRITABLE))?;
        ctx.set_interest(token, Some(Interest::WRITABLE))?;
    } else {
        ctx.set_interest(client, Some(Interest::READABLE | Interest::WRITABLE))?;
        ctx.set_interest(token, None)?;
    }

    // DEBUG
    debug!("{:?} <-> {:?} relaying", client, token);

    Ok(())
}
