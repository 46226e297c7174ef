use crate::role::{Role, ROLE_COUNT};
use tokio::sync::{mpsc, Mutex};

/// Outcome of [`HandoffSlot::store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stored {
    Fresh,
    /// An unclaimed predecessor was closed to make room.
    Evicted,
    /// A claimant was mid-way through taking the previous value; the new
    /// connection was closed instead.
    Dropped,
}

/// Capacity-1 mailbox handing a classified connection to one claimant.
pub(crate) struct HandoffSlot<C> {
    tx: mpsc::Sender<C>,
    rx: Mutex<mpsc::Receiver<C>>,
}

impl<C> HandoffSlot<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Never blocks: drains a stale value, then offers the new one.
    pub fn store(&self, conn: C) -> Stored {
        let evicted = self.drain();
        match self.tx.try_send(conn) {
            Ok(()) if evicted => Stored::Evicted,
            Ok(()) => Stored::Fresh,
            Err(_) => Stored::Dropped,
        }
    }

    /// Closes the unclaimed value, if any. Leaves it alone when a claimant
    /// currently holds the slot, since that claimant is about to take it.
    pub fn drain(&self) -> bool {
        match self.rx.try_lock() {
            Ok(mut rx) => rx.try_recv().is_ok(),
            Err(_) => false,
        }
    }

    pub async fn claim(&self) -> Option<C> {
        self.rx.lock().await.recv().await
    }
}

/// Peer address allowed to open role-tagged connections; one slot per role.
pub(crate) struct Endpoint<C> {
    slots: [HandoffSlot<C>; ROLE_COUNT],
}

impl<C> Endpoint<C> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| HandoffSlot::new()),
        }
    }

    pub fn slot(&self, role: Role) -> &HandoffSlot<C> {
        &self.slots[role.index()]
    }

    pub fn drain_all(&self) {
        for slot in &self.slots {
            slot.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    async fn is_closed(peer: &mut DuplexStream) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            timeout(Duration::from_millis(100), peer.read(&mut buf)).await,
            Ok(Ok(0))
        )
    }

    #[tokio::test]
    async fn test_store_then_claim() {
        let slot = HandoffSlot::new();
        let (a, mut a_peer) = duplex(8);
        assert_eq!(slot.store(a), Stored::Fresh);

        let mut got = slot.claim().await.unwrap();
        a_peer.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        got.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_store_evicts_unclaimed() {
        let slot = HandoffSlot::new();
        let (a, mut a_peer) = duplex(8);
        let (b, mut b_peer) = duplex(8);

        assert_eq!(slot.store(a), Stored::Fresh);
        assert_eq!(slot.store(b), Stored::Evicted);
        assert!(is_closed(&mut a_peer).await);

        let mut got = slot.claim().await.unwrap();
        b_peer.write_all(b"b").await.unwrap();
        let mut buf = [0u8; 1];
        got.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b");

        // claimed exactly once
        assert!(timeout(Duration::from_millis(50), slot.claim())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_claim_waits_for_store() {
        let slot = Arc::new(HandoffSlot::<u32>::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.claim().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(slot.store(7u32), Stored::Fresh);
        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn test_store_while_claimant_holds_slot() {
        let slot = HandoffSlot::new();
        assert_eq!(slot.store(1u32), Stored::Fresh);

        let _claimant = slot.rx.try_lock().unwrap();
        assert_eq!(slot.store(2), Stored::Dropped);
    }

    #[tokio::test]
    async fn test_drain_all() {
        let endpoint = Endpoint::new();
        let (a, mut a_peer) = duplex(8);
        endpoint.slot(Role::Eda).store(a);
        endpoint.drain_all();
        assert!(is_closed(&mut a_peer).await);
    }
}
