//! Plain TCP acceptor plus the socket helpers shared with the reverse dialer.

use crate::error;
use crate::listener::Listener;
use crate::shutdown::Shutdown;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::net::{TcpListener, TcpSocket, TcpStream, ToSocketAddrs};
use tokio::{select, time};

/// Closable [`TcpListener`] with accept deadlines.
pub struct TcpAcceptor {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    deadline: Mutex<Option<Instant>>,
    exit: Shutdown,
}

impl TcpAcceptor {
    pub async fn bind<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        Self::from_listener(TcpListener::bind(listen_addr).await?)
    }

    pub fn from_listener(listener: TcpListener) -> Result<Self> {
        Ok(Self {
            local_addr: listener.local_addr()?,
            listener: Mutex::new(Some(Arc::new(listener))),
            deadline: Mutex::new(None),
            exit: Shutdown::new(),
        })
    }
}

impl Listener for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| error::closed("listener"))?;
        let deadline = *self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        let mut exit = self.exit.subscribe();

        let accept = async {
            match deadline {
                Some(d) => match time::timeout_at(d.into(), listener.accept()).await {
                    Ok(r) => r,
                    Err(_) => Err(error::deadline_exceeded()),
                },
                None => listener.accept().await,
            }
        };

        select! {
            biased;
            _ = exit.wait() => Err(error::closed("listener")),
            r = accept => r,
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn close(&self) -> Result<()> {
        if self.exit.trigger() {
            log::debug!("closing listener {}", self.local_addr);
        }
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
        Ok(())
    }
}

/// Socket bound to `local_addr` with address (and on unix, port) reuse, so
/// a fixed local port can be shared with other sockets.
pub(crate) fn bind(local_addr: SocketAddr) -> Result<TcpSocket> {
    let s = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    s.set_reuseaddr(true)?;
    #[cfg(unix)]
    s.set_reuseport(true)?;
    s.bind(local_addr)?;

    Ok(s)
}

pub(crate) async fn connect(remote: SocketAddr, local: Option<SocketAddr>) -> Result<TcpStream> {
    let s = match local {
        Some(addr) => bind(addr)?,
        None => match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        },
    };
    s.connect(remote).await
}
