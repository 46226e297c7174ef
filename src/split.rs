//! TLS listener that fans connections out to child listeners by SNI.

use crate::error;
use crate::listener::{Connection, Listener};
use crate::logger::{default_logger, emit, Logger};
use crate::shutdown::Shutdown;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::{select, time};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

pub const DEFAULT_QUEUE_DEPTH: usize = 100;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Routed<C> = (TlsStream<C>, SocketAddr);

struct Route<C> {
    server_name: String,
    tx: mpsc::Sender<Routed<C>>,
}

/// Terminates TLS on an inner listener and hands each connection to the
/// first child registered for its server name. Unmatched connections are
/// returned from [`accept`](Listener::accept).
///
/// Children only receive connections while something drives `accept`; when
/// every connection is expected to be split, run [`drop_unsplit`](Self::drop_unsplit)
/// in its own task.
pub struct SniSplitter<L: Listener> {
    inner: L,
    acceptor: TlsAcceptor,
    routes: Mutex<Vec<Route<L::Conn>>>,
    handshake_timeout: Duration,
    queue_depth: usize,
    exit: Shutdown,
    logger: Arc<dyn Logger>,
}

impl<L: Listener> SniSplitter<L> {
    pub fn new(inner: L, acceptor: TlsAcceptor) -> Self {
        Self {
            inner,
            acceptor,
            routes: Mutex::new(Vec::new()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            exit: Shutdown::new(),
            logger: default_logger(),
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Queue depth of children created afterwards.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Child listener for connections negotiated with `server_name`. Affects
    /// only connections accepted after the call.
    pub fn split_sni(&self, server_name: &str) -> SniListener<L::Conn> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.lock_routes().push(Route {
            server_name: server_name.to_owned(),
            tx,
        });
        if self.exit.is_triggered() {
            self.lock_routes().clear();
        }
        SniListener {
            server_name: server_name.to_owned(),
            local_addr: self.inner.local_addr().ok(),
            rx: tokio::sync::Mutex::new(rx),
            exit: Shutdown::new(),
        }
    }

    /// Accepts and closes unsplit connections until the splitter fails.
    pub async fn drop_unsplit(&self) {
        while let Ok((_, peer)) = self.accept().await {
            emit!(self.logger, Trace, "dropping unsplit connection from {}", peer);
        }
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, Vec<Route<L::Conn>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gives `conn` to a matching child, or back if none matches.
    fn route(&self, conn: TlsStream<L::Conn>, peer: SocketAddr) -> Option<TlsStream<L::Conn>> {
        let routes = self.lock_routes();
        let route = match conn.get_ref().1.server_name() {
            Some(name) => routes
                .iter()
                .find(|r| r.server_name.eq_ignore_ascii_case(name)),
            None => None,
        };
        let Some(route) = route else {
            return Some(conn);
        };

        match route.tx.try_send((conn, peer)) {
            Ok(()) => emit!(
                self.logger,
                Trace,
                "routed {} to {}",
                peer,
                route.server_name
            ),
            Err(TrySendError::Full(_)) => emit!(
                self.logger,
                Warn,
                "dropping {} for {}: queue full",
                peer,
                route.server_name
            ),
            Err(TrySendError::Closed(_)) => emit!(
                self.logger,
                Debug,
                "dropping {} for {}: listener closed",
                peer,
                route.server_name
            ),
        }
        None
    }
}

impl<L: Listener> Listener for SniSplitter<L> {
    type Conn = TlsStream<L::Conn>;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
        let mut exit = self.exit.subscribe();
        loop {
            let (conn, peer) = self.inner.accept().await?;

            let handshake = time::timeout(self.handshake_timeout, self.acceptor.accept(conn));
            let tls = select! {
                biased;
                _ = exit.wait() => return Err(error::closed("sni splitter")),
                r = handshake => r,
            };
            let tls = match tls {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    emit!(self.logger, Debug, "tls handshake with {} failed: {}", peer, e);
                    continue;
                }
                Err(_) => {
                    emit!(self.logger, Debug, "tls handshake with {} timed out", peer);
                    continue;
                }
            };

            if let Some(tls) = self.route(tls, peer) {
                return Ok((tls, peer));
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Closes the inner listener. Children fail once their queues drain.
    fn close(&self) -> Result<()> {
        self.exit.trigger();
        let res = self.inner.close();
        self.lock_routes().clear();
        res
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_deadline(deadline)
    }
}

/// Child of a [`SniSplitter`], fed in acceptance order.
pub struct SniListener<C> {
    server_name: String,
    local_addr: Option<SocketAddr>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Routed<C>>>,
    exit: Shutdown,
}

impl<C> SniListener<C> {
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

impl<C: Connection> Listener for SniListener<C> {
    type Conn = TlsStream<C>;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
        let mut exit = self.exit.subscribe();
        let mut rx = select! {
            biased;
            _ = exit.wait() => return Err(error::closed("sni listener")),
            rx = self.rx.lock() => rx,
        };
        select! {
            biased;
            _ = exit.wait() => {
                rx.close();
                Err(error::closed("sni listener"))
            }
            routed = rx.recv() => routed.ok_or_else(|| error::closed("sni splitter")),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "no local address"))
    }

    /// Stops this child only; later connections for its name are dropped.
    fn close(&self) -> Result<()> {
        if self.exit.trigger() {
            if let Ok(mut rx) = self.rx.try_lock() {
                rx.close();
                while rx.try_recv().is_ok() {}
            }
        }
        Ok(())
    }
}
