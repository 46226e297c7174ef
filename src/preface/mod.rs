//! Preface-classifying listener and the role-tagged connection store.
//!
//! A [`PrefaceListener`] sits in front of the routable host's acceptor. Every
//! inbound connection is asked for its first bytes: a role token from a
//! registered peer is parked in that peer's slot for [`PrefaceListener::dial_role`],
//! anything else goes back to the caller of `accept` with the bytes replayed.

mod slot;
mod stream;

pub use stream::PrefacedStream;

use crate::error;
use crate::listener::Listener;
use crate::logger::{default_logger, emit, Logger};
use crate::role::{Preface, Role, ROLE_TOKEN_LEN};
use crate::shutdown::Shutdown;
use slot::{Endpoint, Stored};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::{select, time};

/// How long a new connection gets to send its preface.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Routes role-tagged connections away from the wrapped listener.
///
/// `accept` must be called in a loop for as long as `dial_role` is used,
/// since classification happens inside it.
pub struct PrefaceListener<L: Listener> {
    inner: L,
    read_timeout: Duration,
    endpoints: Mutex<HashMap<IpAddr, Arc<Endpoint<L::Conn>>>>,
    exit: Shutdown,
    logger: Arc<dyn Logger>,
}

impl<L: Listener> PrefaceListener<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            read_timeout: DEFAULT_READ_TIMEOUT,
            endpoints: Default::default(),
            exit: Shutdown::new(),
            logger: default_logger(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    /// Allows `addr` to open role-tagged connections. Registering twice is a no-op.
    pub fn register(&self, addr: IpAddr) {
        let addr = addr.to_canonical();
        self.lock_endpoints()
            .entry(addr)
            .or_insert_with(|| Arc::new(Endpoint::new()));
        emit!(self.logger, Debug, "registered endpoint {}", addr);
    }

    /// Forgets `addr`, closing whatever it left unclaimed.
    pub fn unregister(&self, addr: IpAddr) -> bool {
        let removed = self.lock_endpoints().remove(&addr.to_canonical());
        match removed {
            Some(endpoint) => {
                endpoint.drain_all();
                true
            }
            None => false,
        }
    }

    /// Waits up to `timeout` for a connection `addr` opened under `role`.
    ///
    /// Each arrival is handed out once. Fails with `TimedOut` when nothing
    /// arrives in time, `NotFound` for an unregistered address, and with a
    /// permanent error once the listener is closed.
    pub async fn dial_role(&self, addr: IpAddr, role: Role, timeout: Duration) -> Result<L::Conn> {
        let mut exit = self.exit.subscribe();
        if self.exit.is_triggered() {
            return Err(error::closed("listener"));
        }

        let addr = addr.to_canonical();
        let endpoint = self.lock_endpoints().get(&addr).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("endpoint {} not registered", addr),
            )
        })?;

        let slot = endpoint.slot(role);
        select! {
            biased;
            _ = exit.wait() => {
                // close() cannot drain a slot while a claimant holds it
                slot.drain();
                Err(error::closed("listener"))
            }
            r = time::timeout(timeout, slot.claim()) => match r {
                Ok(Some(conn)) => Ok(conn),
                Ok(None) => Err(error::closed("listener")),
                Err(_) => Err(error::deadline_exceeded()),
            },
        }
    }

    fn lock_endpoints(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, Arc<Endpoint<L::Conn>>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads until the first bytes are decided, they stop arriving, or the
    /// read timeout fires. Never consumes more than a role token.
    async fn read_preface(&self, conn: &mut L::Conn) -> Vec<u8> {
        let mut initial = Vec::with_capacity(ROLE_TOKEN_LEN);
        let read = async {
            let mut buf = [0u8; ROLE_TOKEN_LEN];
            while Preface::undecided(&initial) {
                let want = ROLE_TOKEN_LEN - initial.len();
                match conn.read(&mut buf[..want]).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => initial.extend_from_slice(&buf[..n]),
                }
            }
        };
        let _ = time::timeout(self.read_timeout, read).await;
        initial
    }

    fn route(&self, conn: L::Conn, peer: SocketAddr, role: Role) {
        let addr = peer.ip().to_canonical();
        let endpoint = self.lock_endpoints().get(&addr).cloned();
        let Some(endpoint) = endpoint else {
            emit!(
                self.logger,
                Info,
                "dropping {} connection from unregistered endpoint {}",
                role,
                peer
            );
            return;
        };

        let slot = endpoint.slot(role);
        match slot.store(conn) {
            Stored::Fresh => emit!(self.logger, Debug, "stored {} connection from {}", role, peer),
            Stored::Evicted => emit!(
                self.logger,
                Debug,
                "replaced unclaimed {} connection from {}",
                role,
                peer
            ),
            Stored::Dropped => emit!(
                self.logger,
                Debug,
                "dropped {} connection from {}: claim in progress",
                role,
                peer
            ),
        }

        // close() may have drained the slots while this one was classified
        if self.exit.is_triggered() {
            slot.drain();
        }
    }
}

impl<L: Listener> Listener for PrefaceListener<L> {
    type Conn = PrefacedStream<L::Conn>;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
        loop {
            let (mut conn, peer) = self.inner.accept().await?;
            let initial = self.read_preface(&mut conn).await;

            match Preface::classify(&initial) {
                Preface::Role(role) => self.route(conn, peer, role),
                Preface::Client => return Ok((PrefacedStream::new(initial, conn), peer)),
                Preface::Unknown => {
                    emit!(
                        self.logger,
                        Trace,
                        "unrecognized preface {:?} from {}, treating as client",
                        String::from_utf8_lossy(&initial),
                        peer
                    );
                    return Ok((PrefacedStream::new(initial, conn), peer));
                }
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) -> Result<()> {
        let first = self.exit.trigger();
        let res = self.inner.close();
        if first {
            for endpoint in self.lock_endpoints().values() {
                endpoint.drain_all();
            }
        }
        res
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_deadline(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_temporary;
    use crate::logger::Discard;
    use crate::role::CLIENT_PREFACE;
    use crate::tcp::TcpAcceptor;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn listener() -> (Arc<PrefaceListener<TcpAcceptor>>, SocketAddr) {
        let pl = PrefaceListener::new(TcpAcceptor::bind("127.0.0.1:0").await.unwrap())
            .with_read_timeout(Duration::from_millis(100))
            .with_logger(Arc::new(Discard));
        let addr = pl.local_addr().unwrap();
        (Arc::new(pl), addr)
    }

    /// Keeps classification running, discarding client connections.
    fn serve(pl: &Arc<PrefaceListener<TcpAcceptor>>) -> JoinHandle<Error> {
        let pl = pl.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = pl.accept().await {
                    return e;
                }
            }
        })
    }

    async fn read_closed(s: &mut TcpStream) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            timeout(Duration::from_secs(1), s.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn test_addr() {
        let (pl, addr) = listener().await;
        assert_eq!(pl.get_ref().local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_client_bytes_replayed() {
        let (pl, addr) = listener().await;
        let payload = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n".to_vec();

        let sent = payload.clone();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(&sent).await.unwrap();
            s.shutdown().await.unwrap();
        });

        let (mut conn, _) = pl.accept().await.unwrap();
        let mut got = Vec::new();
        conn.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, payload);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_http2_client_preface() {
        let (pl, addr) = listener().await;
        tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(CLIENT_PREFACE).await.unwrap();
            s.write_all(b"\x00\x00\x00\x04").await.unwrap();
            sleep(Duration::from_secs(1)).await;
        });

        let (mut conn, _) = pl.accept().await.unwrap();
        let mut got = vec![0u8; CLIENT_PREFACE.len() + 4];
        conn.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..CLIENT_PREFACE.len()], CLIENT_PREFACE);
        assert_eq!(&got[CLIENT_PREFACE.len()..], b"\x00\x00\x00\x04");
    }

    #[tokio::test]
    async fn test_slow_preface_is_client() {
        let (pl, addr) = listener().await;
        pl.register(LOCALHOST);

        tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"E").await.unwrap();
            sleep(Duration::from_millis(300)).await;
            s.write_all(b"VA!").await.unwrap();
            s.shutdown().await.unwrap();
        });

        let (mut conn, _) = timeout(Duration::from_secs(1), pl.accept())
            .await
            .unwrap()
            .unwrap();
        let mut got = Vec::new();
        conn.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"EVA!");
    }

    #[tokio::test]
    async fn test_silent_client_is_returned() {
        let (pl, addr) = listener().await;
        let _s = TcpStream::connect(addr).await.unwrap();

        let (conn, _) = timeout(Duration::from_secs(1), pl.accept())
            .await
            .unwrap()
            .unwrap();
        let (rest, _) = conn.into_parts();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_dial_role() {
        let (pl, addr) = listener().await;
        pl.register(LOCALHOST);
        let _server = serve(&pl);

        let appliance = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"EVA").await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            s.write_all(b"pong").await.unwrap();
        });

        let mut conn = pl
            .dial_role(LOCALHOST, Role::Eva, Duration::from_secs(1))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        appliance.await.unwrap();
    }

    #[tokio::test]
    async fn test_fresher_arrival_evicts() {
        let (pl, addr) = listener().await;
        pl.register(LOCALHOST);
        let _server = serve(&pl);

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"EVA").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let second = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"EVA").await.unwrap();
            let mut buf = [0u8; 1];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(b"2").await.unwrap();
            sleep(Duration::from_millis(200)).await;
        });
        sleep(Duration::from_millis(100)).await;

        assert!(read_closed(&mut first).await);

        let mut conn = pl
            .dial_role(LOCALHOST, Role::Eva, Duration::from_secs(1))
            .await
            .unwrap();
        conn.write_all(b"?").await.unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2");
        second.await.unwrap();

        let err = pl
            .dial_role(LOCALHOST, Role::Eva, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_roles_do_not_mix() {
        let (pl, addr) = listener().await;
        pl.register(LOCALHOST);
        let _server = serve(&pl);

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"ELA").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let err = pl
            .dial_role(LOCALHOST, Role::Eva, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        pl.dial_role(LOCALHOST, Role::Ela, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_role_timeout() {
        let (pl, _) = listener().await;
        pl.register(LOCALHOST);

        let start = Instant::now();
        let err = pl
            .dial_role(LOCALHOST, Role::Eva, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(is_temporary(&err));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unregistered() {
        let (pl, addr) = listener().await;
        let _server = serve(&pl);

        let err = pl
            .dial_role(LOCALHOST, Role::Eva, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"EVA").await.unwrap();
        assert!(read_closed(&mut s).await);
    }

    #[tokio::test]
    async fn test_unregister_closes_unclaimed() {
        let (pl, addr) = listener().await;
        pl.register(LOCALHOST);
        let _server = serve(&pl);

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"EDA").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(pl.unregister(LOCALHOST));
        assert!(!pl.unregister(LOCALHOST));
        assert!(read_closed(&mut s).await);
    }

    #[tokio::test]
    async fn test_mapped_ipv6_peer() {
        let (pl, _) = listener().await;
        pl.register(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped()));
        let err = pl
            .dial_role(LOCALHOST, Role::Eva, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_close_drains_slot_under_claim() {
        let (pl, _) = listener().await;
        pl.register(LOCALHOST);

        let side = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut peer = TcpStream::connect(side.local_addr().unwrap()).await.unwrap();
        let (conn, _) = side.accept().await.unwrap();

        let claimant = {
            let pl = pl.clone();
            tokio::spawn(async move {
                pl.dial_role(LOCALHOST, Role::Eda, Duration::from_secs(10))
                    .await
                    .map(|_| ())
            })
        };
        sleep(Duration::from_millis(20)).await;

        // the claimant holds the slot, so close() itself cannot drain it
        let endpoint = pl.lock_endpoints().get(&LOCALHOST).cloned().unwrap();
        assert_eq!(endpoint.slot(Role::Eda).store(conn), Stored::Fresh);
        pl.close().unwrap();

        let err = timeout(Duration::from_secs(1), claimant)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(!is_temporary(&err));
        assert!(read_closed(&mut peer).await);
    }

    #[tokio::test]
    async fn test_close_unblocks() {
        let (pl, addr) = listener().await;
        pl.register(LOCALHOST);
        let server = serve(&pl);

        let mut parked = TcpStream::connect(addr).await.unwrap();
        parked.write_all(b"EDA").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let waiting = {
            let pl = pl.clone();
            tokio::spawn(async move {
                pl.dial_role(LOCALHOST, Role::Eva, Duration::from_secs(10))
                    .await
            })
        };
        sleep(Duration::from_millis(20)).await;
        pl.close().unwrap();
        pl.close().unwrap();

        let err = timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(!is_temporary(&err));

        let err = timeout(Duration::from_secs(1), server).await.unwrap().unwrap();
        assert!(!is_temporary(&err));

        let err = pl
            .dial_role(LOCALHOST, Role::Eda, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!is_temporary(&err));
        assert!(read_closed(&mut parked).await);
    }

    struct NoDeadline;

    impl Listener for NoDeadline {
        type Conn = tokio::io::DuplexStream;

        async fn accept(&self) -> Result<(Self::Conn, SocketAddr)> {
            std::future::pending().await
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_deadline() {
        let (pl, _) = listener().await;
        pl.set_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();
        let err = pl.accept().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);

        let pl = PrefaceListener::new(NoDeadline);
        let err = pl.set_deadline(Some(Instant::now())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
