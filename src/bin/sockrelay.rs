use anyhow::Result;
use clap::Parser;
use sockrelay::Socks5Server;
use sockrelay::config::{DEFAULT_BUFFER_SIZE, DEFAULT_LISTEN_ADDR};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A single-threaded SOCKS5 relay proxy", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// DNS server for domain-name targets (defaults to the system resolver)
    #[arg(short, long)]
    dns: Option<SocketAddr>,

    /// Give up on outbound connects and DNS lookups after this many seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Answer commands other than CONNECT with "command not supported"
    #[arg(long, action)]
    strict: bool,

    /// Per-connection buffer size in bytes
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    if args.strict {
        info!("Strict command checking enabled");
    }

    // Instantiate server
    let mut server = Socks5Server::new(args.listen)
        .with_resolver(args.dns)
        .with_timeout(args.timeout.map(Duration::from_secs))
        .with_strict_command(args.strict)
        .with_buffer_size(args.buffer_size);

    // Run it
    info!("Starting SOCKS5 relay: {}", server.listen_addr);
    server.run()
}
