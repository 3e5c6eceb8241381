use std::io;

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// AddressType represents the SOCKS5 address types understood by the relay:
/// IPv4 and Domain Name
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    // IPv6 = 0x04, not supported
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            _ => None,
        }
    }
}

/// Version represents available SOCKS proxy versions
/// This implementation only supports SOCKS5
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents available SOCKS5
/// authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    // 0x01 - 0x7f: GSSAPI, username/password, IANA reserved
    // 0x80 - 0xFE: private methods
    // 0xFF no acceptable methods: never sent, every greeting is answered
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    // 0x08 address type not supported: malformed requests are closed silently
    // 0x09 - 0xFF: unassigned
}

/// ReplyCode implementation block
impl ReplyCode {
    /// from_io_error maps a failed outbound connect onto the closest reply code
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
            _ => ReplyCode::ServerFailure,
        }
    }
}

/// Length of every reply frame the relay sends after a connect-request
pub const REPLY_LEN: usize = 10;

/// reply builds the fixed-size reply frame sent after a connect-request.
/// The bound address and port are always reported as zero.
pub fn reply(code: ReplyCode) -> [u8; REPLY_LEN] {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   |    4     |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut frame = [0u8; REPLY_LEN];
    frame[0] = Version::SOCKS5 as u8;
    frame[1] = code as u8;
    frame[2] = RSV;
    frame[3] = AddressType::IPv4 as u8;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reply_is_ten_bytes_with_zeroed_bound_address() {
        assert_eq!(
            reply(ReplyCode::Succeeded),
            [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn failure_reply_carries_code() {
        let frame = reply(ReplyCode::HostUnreachable);
        assert_eq!(frame[1], 0x04);
        assert_eq!(&frame[4..], &[0u8; 6]);
    }

    #[test]
    fn connect_errors_map_to_reply_codes() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ReplyCode::from_io_error(&refused), ReplyCode::ConnectionRefused);

        let other = io::Error::other("boom");
        assert_eq!(ReplyCode::from_io_error(&other), ReplyCode::ServerFailure);
    }

    #[test]
    fn unknown_bytes_do_not_decode() {
        assert_eq!(AddressType::from_byte(0x04), None);
        assert_eq!(Command::from_byte(0x09), None);
        assert_eq!(Command::from_byte(0x01), Some(Command::Connect));
    }
}
