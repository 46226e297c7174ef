use crate::error;
use std::future::Future;
use std::io::Result;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream handed out by a [`Listener`].
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Connection for T {}

/// Acceptor shape shared by every component: the platform acceptor, the
/// preface classifier, the reverse dialer and the SNI splitter.
///
/// All methods take `&self` so that `close` can be called from another task
/// while an `accept` is pending. A pending or later `accept` on a closed
/// listener fails with a permanent error (see [`crate::is_temporary`]).
pub trait Listener: Send + Sync {
    type Conn: Connection;

    fn accept(&self) -> impl Future<Output = Result<(Self::Conn, SocketAddr)>> + Send;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Idempotent.
    fn close(&self) -> Result<()>;

    /// Bounds `accept` calls started afterwards. `None` clears the deadline.
    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let _ = deadline;
        Err(error::deadline_unsupported())
    }
}
