use crate::protocol::{AddressType, Version};
use anyhow::{Result, anyhow, bail};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Destination is the target named by a connect-request: an IPv4 address,
/// or a domain name until it has been resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    IPv4(Ipv4Addr),
    DomainName(String),
}

/// SocksRequest holds a parsed connect-request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: u8,
    pub command: u8,
    pub reserved: u8,
    pub address_type: u8,
    pub destination: Destination,
    pub port: u16,
}

/// SocksRequest implementation block
impl SocksRequest {
    /// target returns the socket address to connect to, once known
    pub fn target(&self) -> Option<SocketAddr> {
        match self.destination {
            Destination::IPv4(ip) => Some(SocketAddr::V4(SocketAddrV4::new(ip, self.port))),
            Destination::DomainName(_) => None,
        }
    }

    /// domain returns the name still waiting for resolution
    pub fn domain(&self) -> Option<&str> {
        match &self.destination {
            Destination::DomainName(name) => Some(name),
            Destination::IPv4(_) => None,
        }
    }

    /// resolved replays the request with its domain name replaced by `ip`
    pub fn resolved(self, ip: Ipv4Addr) -> Self {
        Self {
            destination: Destination::IPv4(ip),
            ..self
        }
    }
}

impl fmt::Display for SocksRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Destination::IPv4(ip) => write!(f, "{ip}:{}", self.port),
            Destination::DomainName(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

/// request_len returns the full length of the connect-request at the head of
/// `data`, or None while too few bytes have arrived to tell
pub fn request_len(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < 4 {
        return Ok(None);
    }

    match AddressType::from_byte(data[3]) {
        // VER CMD RSV ATYP + 4 address bytes + 2 port bytes
        Some(AddressType::IPv4) => Ok(Some(10)),
        Some(AddressType::DomainName) => {
            // First octet in DomainName contains the number of
            // octets to follow
            let Some(&domain_len) = data.get(4) else {
                return Ok(None);
            };
            if domain_len == 0 {
                bail!("[ERR] domain length cannot be 0");
            }
            Ok(Some(7 + domain_len as usize))
        }
        None => Err(anyhow!("[ERR] unsupported or unknown address type: {}", data[3])),
    }
}

/// parse_request parses the connect-request at the head of `data`.
/// Returns the request and the number of bytes it occupied, or None if the
/// frame is still incomplete.
pub fn parse_request(data: &[u8]) -> Result<Option<(SocksRequest, usize)>> {
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Ensure version is 0x05 -> SOCKS5
    if data.first().is_some_and(|&v| v != Version::SOCKS5 as u8) {
        bail!("[ERR] not SOCKS5");
    }

    let Some(len) = request_len(data)? else {
        return Ok(None);
    };
    if data.len() < len {
        return Ok(None);
    }
    let frame = &data[..len];

    // Port occupies the final two bytes -> BigEndian (network order)
    let port = u16::from_be_bytes([frame[len - 2], frame[len - 1]]);

    let destination = match AddressType::from_byte(frame[3]) {
        Some(AddressType::IPv4) => {
            let ip_bytes: [u8; 4] = frame[4..len - 2]
                .try_into()
                .map_err(|_| anyhow!("[ERR] invalid IPv4 bytes"))?;
            Destination::IPv4(Ipv4Addr::from(ip_bytes))
        }
        Some(AddressType::DomainName) => {
            let domain = std::str::from_utf8(&frame[5..len - 2])
                .map_err(|e| anyhow!("[ERR] invalid domain: {e}"))?;
            if !domain.is_ascii() {
                bail!("[ERR] domain must be ASCII: {domain}");
            }
            Destination::DomainName(domain.to_string())
        }
        None => bail!("[ERR] unsupported or unknown address type: {}", frame[3]),
    };

    let request = SocksRequest {
        version: frame[0],
        command: frame[1],
        reserved: frame[2],
        address_type: frame[3],
        destination,
        port,
    };

    Ok(Some((request, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_connect() {
        let frame = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];
        let (request, used) = parse_request(&frame).unwrap().unwrap();

        assert_eq!(used, 10);
        assert_eq!(request.command, 0x01);
        assert_eq!(request.target(), Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(request.domain(), None);
    }

    #[test]
    fn parses_domain_between_length_byte_and_port() {
        let mut frame = vec![0x05, 0x01, 0x00, 0x03, 11];
        frame.extend_from_slice(b"example.com");
        frame.extend_from_slice(&443u16.to_be_bytes());

        let (request, used) = parse_request(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(request.domain(), Some("example.com"));
        assert_eq!(request.port, 443);
        assert_eq!(request.target(), None);

        let request = request.resolved(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(request.target(), Some("93.184.216.34:443".parse().unwrap()));
        assert_eq!(request.to_string(), "93.184.216.34:443");
    }

    #[test]
    fn incomplete_frames_wait_for_more() {
        let frame = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];
        for cut in 0..frame.len() {
            assert!(parse_request(&frame[..cut]).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_left_alone() {
        let frame = [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 2, 0x00, 0x50, b'G', b'E'];
        let (request, used) = parse_request(&frame).unwrap().unwrap();
        assert_eq!(used, 10);
        assert_eq!(request.port, 80);
    }

    #[test]
    fn command_byte_is_not_validated() {
        let frame = [0x05, 0x7F, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x16];
        let (request, _) = parse_request(&frame).unwrap().unwrap();
        assert_eq!(request.command, 0x7F);
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(parse_request(&[0x04, 0x01, 0x00, 0x01]).is_err());
        assert!(parse_request(&[0x05, 0x01, 0x00, 0x04, 0]).is_err());
        assert!(parse_request(&[0x05, 0x01, 0x00, 0x03, 0, 0, 80]).is_err());
        assert!(parse_request(&[0x05, 0x01, 0x00, 0x03, 2, 0xC3, 0x28, 0, 80]).is_err());
    }
}
