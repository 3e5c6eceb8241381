//! A single-threaded, readiness-driven SOCKS5 relay
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT over IPv4 and domain names
//!     - No Authentication
//!     - Non-blocking DNS resolution for domain-name targets
//!     - One thread, one mio event loop, no blocking calls
//!     - Backpressure: two fixed buffers per relayed pair
//!     - Half-close cascade: a leg whose peer is gone flushes its last
//!       output before it is closed
//!     - Optional deadline for outbound connects and DNS lookups
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use sockrelay::Socks5Server;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut server = Socks5Server::new("127.0.0.1:1080");
//!     server.run()
//! }
//! ```

pub mod address;
pub mod auth;
pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod reactor;
pub mod relay;
pub mod resolver;
pub mod server;

// Re-export main types at crate root for convenience
pub use address::{Destination, SocksRequest};
pub use config::Config;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::{ShutdownHandle, Signal, Socks5Server};
