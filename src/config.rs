use std::net::SocketAddr;
use std::time::Duration;

/// Default listener address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1080";

/// Default capacity of each leg's buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Config holds the knobs of a relay server
#[derive(Debug, Clone)]
pub struct Config {
    /// DNS server queried for domain-name destinations. None means the first
    /// nameserver of the system resolver configuration.
    pub resolver: Option<SocketAddr>,

    /// Deadline for outbound connects and DNS resolution. None waits forever.
    pub connect_timeout: Option<Duration>,

    /// Answer commands other than CONNECT with "command not supported"
    /// instead of treating every command as CONNECT
    pub strict_command: bool,

    /// Capacity of each leg's buffer
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolver: None,
            connect_timeout: None,
            strict_command: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}
