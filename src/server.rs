use crate::address;
use crate::auth;
use crate::commands;
use crate::config::Config;
use crate::connection::{Connection, Role, Step};
use crate::reactor::Context;
use crate::relay;
use crate::resolver;
use anyhow::{Result, anyhow, bail};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 1024;

/// Smallest buffer able to hold any greeting or connect-request
const MIN_BUFFER_SIZE: usize = 512;

/// Signal reports conditions the loop survives but its owner may care about
#[derive(Debug)]
pub enum Signal {
    /// A freshly accepted client could not be registered and was dropped
    RegistrationFailed { peer: SocketAddr, error: io::Error },
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::RegistrationFailed { peer, error } => {
                write!(f, "failed to register client {peer}: {error}")
            }
        }
    }
}

/// ShutdownHandle stops a running server from another thread
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// shutdown makes `run` return after the current batch of events
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

type SignalHandler = Box<dyn FnMut(Signal) + Send>;

/// Reactor is everything `bind` sets up: the multiplexer, the listening
/// socket and the handler context
struct Reactor {
    poll: Poll,
    listener: TcpListener,
    ctx: Context,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

/// Socks5Server represents a SOCKS5 relay and houses related
/// configuration data
pub struct Socks5Server {
    pub listen_addr: String,
    config: Config,
    on_signal: Option<SignalHandler>,
    reactor: Option<Reactor>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            config: Config::default(),
            on_signal: None,
            reactor: None,
        }
    }

    /// with_config replaces the whole configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// with_resolver sets the DNS server used for domain-name targets
    pub fn with_resolver(mut self, resolver: Option<SocketAddr>) -> Self {
        self.config.resolver = resolver;
        self
    }

    /// with_timeout bounds outbound connects and DNS resolution
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// with_strict_command answers non-CONNECT commands with an error
    /// instead of treating them as CONNECT
    pub fn with_strict_command(mut self, strict: bool) -> Self {
        self.config.strict_command = strict;
        self
    }

    /// with_buffer_size sets the per-leg buffer capacity
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size.max(MIN_BUFFER_SIZE);
        self
    }

    /// on_signal installs a handler for conditions the loop survives.
    /// Without one they are logged.
    pub fn on_signal(mut self, handler: impl FnMut(Signal) + Send + 'static) -> Self {
        self.on_signal = Some(Box::new(handler));
        self
    }

    /// bind to the listen address and set up the multiplexer
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if self.reactor.is_some() {
            bail!("[ERR] bind can only be called once");
        }

        let addr = self
            .listen_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("[ERR] cannot resolve listen address {}", self.listen_addr))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let resolver = match self.config.resolver {
            Some(resolver) => Some(resolver),
            None => match resolver::system_nameserver() {
                Ok(resolver) => Some(resolver),
                Err(e) => {
                    warn!("domain-name targets will fail: {:#}", e);
                    None
                }
            },
        };

        let config = Config {
            buffer_size: self.config.buffer_size.max(MIN_BUFFER_SIZE),
            ..self.config.clone()
        };
        let ctx = Context::new(poll.registry().try_clone()?, config, resolver);
        let local = listener.local_addr()?;

        // DEBUG
        info!("SOCKS5 proxy listening on {:?}", local);

        self.reactor = Some(Reactor {
            poll,
            listener,
            ctx,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        Ok(local)
    }

    /// shutdown_handle returns a handle that stops `run`. Requires `bind`.
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        let reactor = self
            .reactor
            .as_ref()
            .ok_or_else(|| anyhow!("[ERR] server is not bound"))?;
        Ok(ShutdownHandle {
            flag: reactor.shutdown.clone(),
            waker: reactor.waker.clone(),
        })
    }

    /// run drives the event loop until shutdown or a multiplexer failure
    pub fn run(&mut self) -> Result<()> {
        if self.reactor.is_none() {
            self.bind()?;
        }
        let Self {
            reactor, on_signal, ..
        } = self;
        let reactor = reactor
            .as_mut()
            .ok_or_else(|| anyhow!("[ERR] server is not bound"))?;

        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            let timeout = reactor
                .ctx
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(e) = reactor.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {}", e);
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => {
                        if let Err(e) = accept(&reactor.listener, &mut reactor.ctx, on_signal) {
                            // Edge-triggered: queued clients raise no new event
                            // until the listener is rearmed
                            warn!("accept failed: {}", e);
                            reactor.poll.registry().reregister(
                                &mut reactor.listener,
                                LISTENER,
                                Interest::READABLE,
                            )?;
                        }
                    }
                    WAKER => {}
                    token => dispatch(&mut reactor.ctx, token, event),
                }
            }

            if reactor.shutdown.load(Ordering::SeqCst) {
                info!(
                    "shutting down with {} open connections",
                    reactor.ctx.len()
                );
                return Ok(());
            }

            for token in reactor.ctx.expired(Instant::now()) {
                reactor.ctx.expire(token);
            }
        }
    }
}

/// accept takes every pending client off the listener. Errors that belong to
/// a single aborted handshake are skipped; any other error stops the batch.
fn accept(
    listener: &TcpListener,
    ctx: &mut Context,
    on_signal: &mut Option<SignalHandler>,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                // DEBUG
                info!("new client: {}", peer_addr);

                let conn = Connection::client(stream, peer_addr, ctx.config.buffer_size);
                if let Err(error) = ctx.insert(conn, Interest::READABLE) {
                    let signal = Signal::RegistrationFailed {
                        peer: peer_addr,
                        error,
                    };
                    match on_signal {
                        Some(handler) => handler(signal),
                        None => warn!("{}", signal),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if is_per_client(&e) => {
                debug!("skipping aborted client: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// is_per_client tells accept errors that concern one queued client apart
/// from those of the listener itself, such as running out of descriptors
fn is_per_client(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// dispatch hands one readiness event to the handler for the record's role
/// and step. Any error tears the record down.
fn dispatch(ctx: &mut Context, token: Token, event: &Event) {
    // Closed by an earlier event of the same batch
    let Some(conn) = ctx.get(token) else {
        return;
    };
    let (role, step) = (conn.role, conn.step);

    let result = match (role, step) {
        (Role::DnsQuery, Step::AwaitingDnsReply) => resolver::on_reply(ctx, token),
        (Role::Upstream, Step::Connecting) => commands::finish_connect(ctx, token),
        (_, Step::AwaitingGreeting | Step::AwaitingRequest) => {
            handle_connection(ctx, token, event)
        }
        (_, Step::Relaying) => relay_event(ctx, token, event),
        (_, Step::Draining) => drain(ctx, token),
        _ => Ok(()),
    };

    if let Err(e) = result {
        // DEBUG
        debug!("{:?} {:?} failed in {:?}: {:#}", role, token, step, e);
        ctx.teardown(token);
    }
}

/// handle_connection drives the client side of the handshake: greeting,
/// then connect-request
fn handle_connection(ctx: &mut Context, token: Token, event: &Event) -> Result<()> {
    if event.is_writable() {
        flush_reply(ctx, token)?;
    }
    if !event.is_readable() {
        return Ok(());
    }

    let conn = ctx
        .get_mut(token)
        .ok_or_else(|| anyhow!("[ERR] unknown client {token:?}"))?;
    let (_, eof) = conn.fill()?;

    loop {
        let Some(conn) = ctx.get_mut(token) else {
            return Ok(());
        };

        match conn.step {
            Step::AwaitingGreeting => {
                // Negotiate authentication with client
                let Some(greeting) = auth::negotiate_auth(conn.inbound.drainable())? else {
                    break;
                };
                conn.inbound.consume(greeting.len);
                conn.inbound.compact();
                conn.step = Step::AwaitingRequest;
                conn.stage_output(&greeting.reply);
                flush_reply(ctx, token)?;
            }
            Step::AwaitingRequest => {
                // Handle connection request from client
                let Some((request, len)) = address::parse_request(conn.inbound.drainable())?
                else {
                    break;
                };
                conn.inbound.consume(len);
                conn.inbound.compact();

                // DEBUG
                debug!("{:?} requests {} (command {:#04x})", token, request, request.command);

                commands::handle_socks_request(ctx, token, request)?;
                break;
            }
            _ => break,
        }
    }

    // A client aborted above keeps its chance to receive the failure reply
    if eof {
        if ctx.get(token).is_some_and(|c| c.step != Step::Draining) {
            ctx.teardown(token);
        }
        return Ok(());
    }

    // A full buffer that still holds no complete frame never will
    if let Some(conn) = ctx.get(token) {
        let handshaking = matches!(conn.step, Step::AwaitingGreeting | Step::AwaitingRequest);
        if handshaking && conn.inbound.is_full() {
            bail!("[ERR] handshake frame exceeds buffer");
        }
    }

    Ok(())
}

/// flush_reply writes a handshake reply, asking for write-readiness only
/// while part of it is still queued
fn flush_reply(ctx: &mut Context, token: Token) -> Result<()> {
    let conn = ctx
        .get_mut(token)
        .ok_or_else(|| anyhow!("[ERR] unknown client {token:?}"))?;

    if conn.flush_outbound()? {
        if conn.interest.is_some_and(|i| i.is_writable()) {
            ctx.disable(token, Interest::WRITABLE)?;
        }
    } else {
        ctx.enable(token, Interest::WRITABLE)?;
    }
    Ok(())
}

fn relay_event(ctx: &mut Context, token: Token, event: &Event) -> Result<()> {
    if event.is_writable() {
        relay::on_writable(ctx, token)?;
    }
    let still_relaying = ctx.get(token).is_some_and(|c| c.step == Step::Relaying);
    if event.is_readable() && still_relaying {
        relay::on_readable(ctx, token)?;
    }
    Ok(())
}

/// drain flushes the last output of a record whose peer is gone and closes
/// it once everything is written
fn drain(ctx: &mut Context, token: Token) -> Result<()> {
    let conn = ctx
        .get_mut(token)
        .ok_or_else(|| anyhow!("[ERR] unknown record {token:?}"))?;

    if conn.flush_outbound()? {
        ctx.close(token);
    }
    Ok(())
}
