use crate::error::is_transient;
use std::fmt;
use std::io::{IoSlice, Result};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const ESTABLISHED: u64 = 1 << 32;

/// Pool accounting shared by a reverse dialer and its connections.
///
/// Both counters live in one word so every snapshot satisfies
/// `established >= active`.
#[derive(Debug, Default)]
pub struct PoolCounters(AtomicU64);

/// Point-in-time view of [`PoolCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections not yet known to be dead.
    pub established: u32,
    /// The subset that has received at least one byte.
    pub active: u32,
}

impl PoolStats {
    /// Whether some delivered connection is still waiting for its first byte.
    pub fn has_spare(&self) -> bool {
        self.established > self.active
    }
}

impl PoolCounters {
    pub fn snapshot(&self) -> PoolStats {
        let v = self.0.load(Ordering::SeqCst);
        PoolStats {
            established: (v >> 32) as u32,
            active: v as u32,
        }
    }

    fn establish(&self) {
        self.0.fetch_add(ESTABLISHED, Ordering::SeqCst);
    }

    fn activate(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, active: bool) {
        self.0
            .fetch_sub(ESTABLISHED + u64::from(active), Ordering::SeqCst);
    }
}

/// Counts a pooled connection as established for as long as it looks alive.
///
/// The first non-empty read marks it active. The first terminal error seen
/// by any read, write, flush or shutdown (anything but a transient kind, and
/// EOF) takes it out of the pool; dropping the stream does the same if no
/// error got there first. Either way the counters move exactly once.
pub struct TrackedStream<S> {
    inner: S,
    counters: Arc<PoolCounters>,
    active: bool,
    released: bool,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> TrackedStream<S> {
    pub(crate) fn new(inner: S, counters: Arc<PoolCounters>) -> Self {
        counters.establish();
        Self {
            inner,
            counters,
            active: false,
            released: false,
            on_release: None,
        }
    }

    /// Runs `f` once, when the stream leaves the pool.
    pub(crate) fn on_release(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(f));
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn mark_active(&mut self) {
        if !self.active && !self.released {
            self.active = true;
            self.counters.activate();
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.release(self.active);
            if let Some(f) = self.on_release.take() {
                f();
            }
        }
    }

    fn observe<T>(&mut self, poll: &Poll<Result<T>>) {
        if let Poll::Ready(Err(e)) = poll {
            if !is_transient(e) {
                self.release();
            }
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for TrackedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedStream")
            .field("inner", &self.inner)
            .field("active", &self.active)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = poll {
            if buf.filled().len() > before {
                this.mark_active();
            } else if buf.remaining() > 0 {
                // eof
                this.release();
            }
        }
        this.observe(&poll);
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.observe(&poll);
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.observe(&poll);
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.observe(&poll);
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.observe(&poll);
        poll
    }
}
