//! Keyed single-flight coordination.
//!
//! At most one operation runs per key. Callers arriving while it runs await
//! the same result instead of starting their own, and every one of them sees
//! the same value or the same error.
//!
//! ## Slot lifecycle
//!
//! ```text
//! run(key) ──► check() hit? ──yes──► return cached value
//!                  │ no
//!                  ▼
//!          live flight for key? ──yes──► await it
//!                  │ no
//!                  ▼
//!          start flight, store weak handle ──► await it
//!
//! flight: work() ──► (commit inside work) ──► remove own slot ──► resolve
//! ```
//!
//! The slot map only holds weak handles. If every waiter is cancelled the
//! flight is dropped, its slot goes with it, and the next caller starts over.
//! A slot is removed only by the flight that created it (matched by id).
//!
//! `check` runs under the slot lock. Since a flight commits its result before
//! removing its slot, a caller either finds the committed value or a live
//! flight to join, never neither.

use crate::error::Result;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Slot<V> {
    id: u64,
    flight: WeakShared<BoxFuture<'static, Result<V>>>,
}

type Slots<K, V> = Arc<Mutex<HashMap<K, Slot<V>>>>;

fn lock<K, V>(slots: &Slots<K, V>) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the owning flight's slot when the flight finishes or is dropped.
struct SlotGuard<K: Eq + Hash, V> {
    slots: Slots<K, V>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for SlotGuard<K, V> {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if slots.get(&self.key).map(|slot| slot.id) == Some(self.id) {
            slots.remove(&self.key);
        }
    }
}

/// A group of single-flight slots keyed by `K`.
pub struct SingleFlight<K, V> {
    slots: Slots<K, V>,
    next_id: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `check()`'s value if it has one, otherwise join or start the
    /// flight for `key`.
    ///
    /// `work` is only called when a new flight starts. Its future must
    /// publish any side effects (cache inserts) before resolving.
    pub async fn run<P, F, Fut>(&self, key: K, check: P, work: F) -> Result<V>
    where
        P: FnOnce() -> Option<V>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let flight: Flight<V> = {
            let mut slots = lock(&self.slots);

            if let Some(value) = check() {
                return Ok(value);
            }

            match slots.get(&key).and_then(|slot| slot.flight.upgrade()) {
                Some(flight) => flight,
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let guard = SlotGuard {
                        slots: Arc::clone(&self.slots),
                        key: key.clone(),
                        id,
                    };
                    let work = work();
                    let flight = async move {
                        let result = work.await;
                        drop(guard);
                        result
                    }
                    .boxed()
                    .shared();

                    if let Some(weak) = flight.downgrade() {
                        slots.insert(key, Slot { id, flight: weak });
                    }
                    flight
                }
            }
        };

        flight.await
    }

    /// Number of flights currently running.
    pub fn in_flight(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.flight.upgrade().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_flight() {
        let group: Arc<SingleFlight<&'static str, i32>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                group
                    .run("k", || None, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let group: SingleFlight<i32, i32> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let call = |key: i32| {
            let runs = Arc::clone(&runs);
            group.run(key, || None, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(key * 10)
            })
        };

        let (a, b) = tokio::join!(call(1), call(2));
        assert_eq!((a.unwrap(), b.unwrap()), (10, 20));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_releases_slot() {
        let group: SingleFlight<&'static str, i32> = SingleFlight::new();

        let failing = || {
            group.run("k", || None, || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(RegistryError::Transport("registry down".into()))
            })
        };
        let (a, b) = tokio::join!(failing(), failing());
        assert_eq!(a.unwrap_err(), RegistryError::Transport("registry down".into()));
        assert_eq!(b.unwrap_err(), RegistryError::Transport("registry down".into()));
        assert_eq!(group.in_flight(), 0);

        // Nothing is remembered about the failure
        let ok = group.run("k", || None, || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cached_hit_skips_work() {
        let group: SingleFlight<&'static str, i32> = SingleFlight::new();
        let value = group
            .run("k", || Some(3), || async {
                Err(RegistryError::Internal("work must not run on a cached hit".into()))
            })
            .await;
        assert_eq!(value.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_flight_releases_slot() {
        let group: Arc<SingleFlight<&'static str, i32>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let stuck = {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                group
                    .run("k", || None, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(0)
                    })
                    .await
            })
        };

        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        assert_eq!(group.in_flight(), 0);

        let runs_clone = Arc::clone(&runs);
        let value = group
            .run("k", || None, || async move {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            })
            .await;
        assert_eq!(value.unwrap(), 5);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
