//! Byte pump between the two legs of an established pair.
//!
//! Each leg owns one fixed buffer filled by its own reads. A leg that has
//! read something stops reading and its peer starts writing; once the peer
//! has written every byte, the buffer is reset and the reader resumes. Memory
//! per pair is therefore bounded by two buffers whatever the throughput.

use crate::connection::drain_into;
use crate::reactor::Context;
use anyhow::{Result, anyhow};
use mio::{Interest, Token};

/// on_readable reads from a relaying leg into its inbound buffer and hands
/// the bytes over to the peer's write side
pub fn on_readable(ctx: &mut Context, token: Token) -> Result<()> {
    let conn = ctx
        .get_mut(token)
        .ok_or_else(|| anyhow!("[ERR] unknown relay leg {token:?}"))?;
    let peer = conn
        .peer
        .ok_or_else(|| anyhow!("[ERR] relay leg {token:?} has no peer"))?;

    let (_, eof) = conn.fill()?;

    if conn.inbound.has_pending() {
        // Stop reading until the peer has written everything out
        ctx.disable(token, Interest::READABLE)?;
        ctx.enable(peer, Interest::WRITABLE)?;
    }

    if eof {
        ctx.teardown(token);
    }

    Ok(())
}

/// on_writable writes the peer's pending bytes to this leg. When the peer's
/// buffer is empty it is reset, the peer may read again and this leg stops
/// asking for write-readiness.
pub fn on_writable(ctx: &mut Context, token: Token) -> Result<()> {
    let peer = ctx
        .get(token)
        .and_then(|conn| conn.peer)
        .ok_or_else(|| anyhow!("[ERR] relay leg {token:?} has no peer"))?;

    let (conn, other) = ctx
        .pair_mut(token, peer)
        .ok_or_else(|| anyhow!("[ERR] peer {peer:?} of {token:?} is gone"))?;

    // A handshake reply still queued goes out ahead of relayed bytes
    if !conn.flush_outbound()? || !drain_into(&mut conn.socket, &mut other.inbound)? {
        return Ok(());
    }
    other.inbound.reset();

    ctx.disable(token, Interest::WRITABLE)?;
    ctx.enable(peer, Interest::READABLE)?;

    Ok(())
}
