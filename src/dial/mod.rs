//! Reverse dialing: outbound connections presented as inbound accepts.
//!
//! The host behind NAT runs a [`ReverseDialListener`] pointed at the routable
//! peer and serves from it like from any listener. Each delivered connection
//! opens with the configured role token so the peer's
//! [`PrefaceListener`](crate::PrefaceListener) can route it to a waiting
//! `dial_role` caller.
//!
//! Redialing polls at a fixed interval: while a delivered connection is still
//! waiting for its first byte, `accept` sleeps one retry delay and reports a
//! temporary error. Once every connection has carried traffic, the next
//! `accept` dials. A failed dial costs whatever is left of one retry delay.
//! This trades up to one delay of latency after a spare is claimed for a
//! single wakeup per delay while idle. Concurrent `accept` callers take turns,
//! so at most one spare is parked.

mod tracker;

pub use tracker::{PoolCounters, PoolStats, TrackedStream};

use crate::error;
use crate::listener::Listener;
use crate::logger::{default_logger, emit, Logger};
use crate::role::Role;
use crate::shutdown::Shutdown;
use crate::tcp;
use socket2::{SockRef, Socket, TcpKeepalive};
use std::io::{Error, ErrorKind, IoSlice, Result};
use std::net::{Shutdown::Both, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::{select, time};

#[cfg(feature = "tls")]
use std::future::Future;
#[cfg(feature = "tls")]
use tokio_rustls::{client::TlsStream, rustls::pki_types::ServerName, Connect, TlsConnector};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// TLS client session layered over each outbound connection, after the
/// cleartext role token.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClient {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

#[derive(Clone)]
pub struct DialConfig {
    pub remote_addr: SocketAddr,
    pub role: Role,
    /// Fixed local address, bound with address/port reuse.
    pub local_addr: Option<SocketAddr>,
    pub retry_delay: Duration,
    /// Bounds the TCP connect and the role token write.
    pub dial_timeout: Duration,
    /// Idle time before TCP keepalive probes start.
    pub keepalive: Option<Duration>,
    /// The handshake runs on first read or write, since the peer only answers
    /// once its side claims the connection.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsClient>,
}

impl DialConfig {
    pub fn new(remote_addr: SocketAddr, role: Role) -> Self {
        Self {
            remote_addr,
            role,
            local_addr: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keepalive: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

/// Outbound connection as delivered by [`ReverseDialListener::accept`].
pub struct Outbound(Stream);

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound").finish_non_exhaustive()
    }
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Connecting(Pin<Box<Connect<TcpStream>>>),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(feature = "tls")]
    Failed(ErrorKind),
}

impl Outbound {
    pub fn is_tls(&self) -> bool {
        !matches!(self.0, Stream::Tcp(_))
    }

    /// Drives a pending TLS handshake; ready at once for plain TCP.
    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        #[cfg(feature = "tls")]
        match &mut self.0 {
            Stream::Connecting(connect) => match ready!(connect.as_mut().poll(cx)) {
                Ok(tls) => self.0 = Stream::Tls(Box::new(tls)),
                Err(e) => {
                    self.0 = Stream::Failed(e.kind());
                    return Poll::Ready(Err(e));
                }
            },
            Stream::Failed(kind) => {
                return Poll::Ready(Err(Error::new(*kind, "tls handshake failed")))
            }
            _ => {}
        }
        let _ = cx;
        Poll::Ready(Ok(()))
    }
}

macro_rules! delegate {
    ($self:ident, $cx:ident, $s:ident => $call:expr) => {{
        let this = $self.get_mut();
        ready!(this.poll_handshake($cx))?;
        match &mut this.0 {
            Stream::Tcp($s) => {
                let $s = Pin::new($s);
                $call
            }
            #[cfg(feature = "tls")]
            Stream::Tls($s) => {
                let $s = Pin::new(&mut **$s);
                $call
            }
            #[cfg(feature = "tls")]
            _ => Poll::Ready(Err(ErrorKind::NotConnected.into())),
        }
    }};
}

impl AsyncRead for Outbound {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        delegate!(self, cx, s => s.poll_read(cx, buf))
    }
}

impl AsyncWrite for Outbound {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        delegate!(self, cx, s => s.poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<Result<usize>> {
        delegate!(self, cx, s => s.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        match &self.0 {
            Stream::Tcp(s) => s.is_write_vectored(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.is_write_vectored(),
            #[cfg(feature = "tls")]
            _ => false,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        delegate!(self, cx, s => s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        delegate!(self, cx, s => s.poll_shutdown(cx))
    }
}

/// Most recently delivered connection. `socket` duplicates its handle so
/// close() can shut it down, and is dropped once the connection leaves the
/// pool so it never outlives the caller's stream.
struct Held {
    generation: u64,
    socket: Option<Socket>,
    local_addr: SocketAddr,
}

/// Listener with no listening socket: `accept` dials out to a fixed remote.
///
/// Callers must retry `accept` on temporary errors (see
/// [`is_temporary`](crate::is_temporary)); a permanent error means the
/// listener was closed.
pub struct ReverseDialListener {
    config: DialConfig,
    counters: Arc<PoolCounters>,
    held: Arc<Mutex<Option<Held>>>,
    generation: AtomicU64,
    dialing: tokio::sync::Mutex<()>,
    exit: Shutdown,
    logger: Arc<dyn Logger>,
}

fn lock_held(held: &Mutex<Option<Held>>) -> MutexGuard<'_, Option<Held>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReverseDialListener {
    pub fn new(config: DialConfig) -> Self {
        Self {
            config,
            counters: Default::default(),
            held: Default::default(),
            generation: AtomicU64::new(0),
            dialing: tokio::sync::Mutex::new(()),
            exit: Shutdown::new(),
            logger: default_logger(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &DialConfig {
        &self.config
    }

    pub fn counters(&self) -> PoolStats {
        self.counters.snapshot()
    }

    async fn dial(&self) -> Result<(Outbound, Socket, SocketAddr)> {
        let mut stream = tcp::connect(self.config.remote_addr, self.config.local_addr).await?;
        let (socket, local_addr) = {
            let sock = SockRef::from(&stream);
            if let Some(time) = self.config.keepalive {
                sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
            }
            (sock.try_clone()?, stream.local_addr()?)
        };

        stream.write_all(self.config.role.token()).await?;

        #[cfg(feature = "tls")]
        if let Some(tls) = &self.config.tls {
            let connect = tls.connector.connect(tls.server_name.clone(), stream);
            return Ok((
                Outbound(Stream::Connecting(Box::pin(connect))),
                socket,
                local_addr,
            ));
        }

        Ok((Outbound(Stream::Tcp(stream)), socket, local_addr))
    }

    /// Sleeps out the rest of one retry delay, unless closed first.
    async fn hold_off(&self, since: time::Instant) -> Result<()> {
        let mut exit = self.exit.subscribe();
        let rest = self.config.retry_delay.saturating_sub(since.elapsed());
        select! {
            biased;
            _ = exit.wait() => Err(error::closed("reverse dial listener")),
            _ = time::sleep(rest) => Ok(()),
        }
    }
}

impl Listener for ReverseDialListener {
    type Conn = TrackedStream<Outbound>;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
        let mut exit = self.exit.subscribe();
        if self.exit.is_triggered() {
            return Err(error::closed("reverse dial listener"));
        }
        let _turn = select! {
            biased;
            _ = exit.wait() => return Err(error::closed("reverse dial listener")),
            turn = self.dialing.lock() => turn,
        };

        let remote = self.config.remote_addr;
        let start = time::Instant::now();
        let stats = self.counters.snapshot();
        if stats.has_spare() {
            self.hold_off(start).await?;
            return Err(error::temporary(Error::new(
                ErrorKind::Other,
                format!(
                    "{} of {} connections to {} still unclaimed",
                    stats.established - stats.active,
                    stats.established,
                    remote
                ),
            )));
        }

        emit!(self.logger, Debug, "dialing {} as {}", remote, self.config.role);
        let dialed = select! {
            biased;
            _ = exit.wait() => return Err(error::closed("reverse dial listener")),
            r = time::timeout(self.config.dial_timeout, self.dial()) => r.unwrap_or_else(|_| {
                Err(Error::new(ErrorKind::TimedOut, format!("dial {} timed out", remote)))
            }),
        };

        let (outbound, socket, local) = match dialed {
            Ok(v) => v,
            Err(e) => {
                emit!(self.logger, Debug, "dial {} failed: {}", remote, e);
                self.hold_off(start).await?;
                return Err(error::temporary(e));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let conn = {
            let held = self.held.clone();
            TrackedStream::new(outbound, self.counters.clone()).on_release(move || {
                if let Some(h) = lock_held(&held).as_mut() {
                    if h.generation == generation {
                        h.socket = None;
                    }
                }
            })
        };
        *lock_held(&self.held) = Some(Held {
            generation,
            socket: Some(socket),
            local_addr: local,
        });

        // close() may have run while dialing, after taking the previous handle
        if self.exit.is_triggered() {
            let taken = lock_held(&self.held).take();
            if let Some(socket) = taken.and_then(|h| h.socket) {
                let _ = socket.shutdown(Both);
            }
            return Err(error::closed("reverse dial listener"));
        }

        emit!(
            self.logger,
            Debug,
            "connected {} -> {} as {}",
            local,
            remote,
            self.config.role
        );
        Ok((conn, remote))
    }

    /// Local address of the most recent connection, or the configured bind
    /// address before the first one.
    fn local_addr(&self) -> Result<SocketAddr> {
        if let Some(held) = lock_held(&self.held).as_ref() {
            return Ok(held.local_addr);
        }
        self.config
            .local_addr
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "no connection established"))
    }

    fn close(&self) -> Result<()> {
        if !self.exit.trigger() {
            return Ok(());
        }
        emit!(
            self.logger,
            Debug,
            "closing reverse dial listener to {}",
            self.config.remote_addr
        );
        let taken = lock_held(&self.held).take();
        if let Some(socket) = taken.and_then(|h| h.socket) {
            let _ = socket.shutdown(Both);
        }
        Ok(())
    }
}
