use crate::protocol::Version;
use anyhow::{Result, bail};

/// Greeting is a complete method-selection message from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    /// Two-byte acknowledgement to send back
    pub reply: [u8; 2],
    /// Number of bytes the greeting occupied
    pub len: usize,
}

/// negotiate_auth parses the client greeting at the head of `data` and
/// builds the method-selection reply. Returns None until the version byte,
/// the method count and the first method have arrived.
///
/// Only "no authentication" is served; the reply echoes the version byte and
/// the byte at offset 2 whatever the client offered. The greeting occupies
/// `2 + NMETHODS` bytes (at least 3), or fewer if the client sent fewer.
pub fn negotiate_auth(data: &[u8]) -> Result<Option<Greeting>> {
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    let Some(&version) = data.first() else {
        return Ok(None);
    };

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    if data.len() < 3 {
        return Ok(None);
    }
    // The echoed byte is consumed even when NMETHODS claims no methods
    let len = (2 + data[1] as usize).clamp(3, data.len());

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    Ok(Some(Greeting {
        reply: [data[0], data[2]],
        len,
    }))
}
