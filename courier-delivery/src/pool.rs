//! Fixed-size pool of transport connections.
//!
//! Slots are claimed with a compare-and-swap on their availability flag; the
//! first free slot wins. The number of in-flight workers never exceeds the
//! number of slots, so a claim only fails if that bound is broken.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use courier_common::tracing;
use courier_smtp::{Transport, TransportFactory};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::PoolError;

/// One pooled connection and its availability flag.
pub struct ConnectionSlot {
    in_use: Arc<AtomicBool>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
}

impl ConnectionSlot {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            in_use: Arc::new(AtomicBool::new(false)),
            transport: Arc::new(Mutex::new(transport)),
        }
    }

    fn claim(&self) -> Option<Claim> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Claim {
                in_use: Arc::clone(&self.in_use),
            })
    }
}

/// Resets the availability flag when dropped.
struct Claim {
    in_use: Arc<AtomicBool>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}

/// Exclusive use of one pooled transport.
///
/// Dropping the guard unlocks the transport, then marks the slot available.
pub struct SlotGuard {
    // field order is drop order: unlock before releasing the claim
    transport: OwnedMutexGuard<Box<dyn Transport>>,
    _claim: Claim,
    index: usize,
}

impl SlotGuard {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl Deref for SlotGuard {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &**self.transport
    }
}

impl DerefMut for SlotGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.transport
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

pub struct Pool {
    slots: Box<[ConnectionSlot]>,
}

impl Pool {
    /// Creates `size` unconnected transports.
    #[must_use]
    pub fn new(size: usize, factory: &dyn TransportFactory) -> Self {
        Self {
            slots: (0..size)
                .map(|_| ConnectionSlot::new(factory.create()))
                .collect(),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Claims the first available slot.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] if every slot is in use.
    pub fn acquire(&self) -> Result<SlotGuard, PoolError> {
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(claim) = slot.claim() else {
                continue;
            };

            // A claimed slot is only ever locked by its holder or by `close`.
            if let Ok(transport) = Arc::clone(&slot.transport).try_lock_owned() {
                tracing::trace!(slot = index, "Claimed connection slot");
                return Ok(SlotGuard {
                    transport,
                    _claim: claim,
                    index,
                });
            }
        }

        Err(PoolError::Exhausted(self.slots.len()))
    }

    /// Number of slots currently claimed.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_use.load(Ordering::Acquire))
            .count()
    }

    /// Disconnects and disposes every transport.
    pub async fn close(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            slot.transport.lock().await.close().await;
            tracing::debug!(slot = index, "Closed pooled connection");
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use courier_smtp::{
        Credentials, Endpoint,
        client::{ClientError, Mail, Result},
    };

    use super::*;

    #[derive(Default)]
    struct Idle {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for Idle {
        fn is_connected(&self) -> bool {
            false
        }

        fn is_authenticated(&self) -> bool {
            false
        }

        async fn connect(&mut self, _: &Endpoint) -> Result<()> {
            Ok(())
        }

        async fn authenticate(&mut self, _: &Credentials) -> Result<()> {
            Ok(())
        }

        async fn noop(&mut self) -> Result<()> {
            Err(ClientError::NotConnected)
        }

        async fn send(&mut self, _: &Mail) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }

        fn abort(&mut self) {}

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct IdleFactory {
        closed: Arc<AtomicBool>,
    }

    impl TransportFactory for IdleFactory {
        fn create(&self) -> Box<dyn Transport> {
            Box::new(Idle {
                closed: Arc::clone(&self.closed),
            })
        }
    }

    fn pool(size: usize) -> (Pool, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let factory = IdleFactory {
            closed: Arc::clone(&closed),
        };
        (Pool::new(size, &factory), closed)
    }

    #[test]
    fn test_acquire_distinct_slots() {
        let (pool, _) = pool(3);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        let third = pool.acquire().unwrap();

        assert_eq!(
            [first.index(), second.index(), third.index()],
            [0, 1, 2]
        );
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_exhausted_when_all_claimed() {
        let (pool, _) = pool(2);

        let _first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();

        assert_eq!(pool.acquire().unwrap_err(), PoolError::Exhausted(2));
    }

    #[test]
    fn test_drop_releases_slot() {
        let (pool, _) = pool(2);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(second.index(), 1);

        drop(first);
        assert_eq!(pool.in_use(), 1);

        let again = pool.acquire().unwrap();
        assert_eq!(again.index(), 0);

        drop(again);
        drop(second);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_guard_gives_transport_access() {
        let (pool, _) = pool(1);

        let mut guard = pool.acquire().unwrap();
        assert!(!guard.is_connected());
        assert!(matches!(guard.noop().await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_disposes_every_transport() {
        let (pool, closed) = pool(2);

        pool.close().await;

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.in_use(), 0);
    }
}
