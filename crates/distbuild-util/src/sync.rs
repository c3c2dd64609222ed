//! Cross-task coordination primitives that don't fit any one component: the happens-before
//! rendezvous used to hand build state from `StartBuild` to `SignalBuild`, a per-key lock used to
//! serialize concurrent uploads of the same cache ID, and a single-flight group used to
//! deduplicate concurrent downloads of the same ID.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};

struct KeyState {
    pending_happens: u64,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            pending_happens: 0,
            waiters: VecDeque::new(),
        }
    }
}

/// A key-indexed pair-rendezvous. For a given key, the *n*-th call to [`Happen`] pairs with the
/// *n*-th call to [`Before`], regardless of which arrives first; later pairs reuse the same key.
///
/// Used to let `SignalBuild` (running on one request handler) safely observe state published by
/// `StartBuild` (running on a different request handler) for the same build ID, without a lock
/// that would serialize unrelated builds.
#[derive(Default)]
pub struct HappensBefore<K> {
    keys: Mutex<HashMap<K, KeyState>>,
}

impl<K: Eq + Hash + Clone> HappensBefore<K> {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Run `event`, then release the next `Before` call waiting on `key` (or record that a
    /// `Happen` has occurred, if nobody is waiting yet).
    pub fn happen(&self, key: K, event: impl FnOnce()) {
        event();
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key).or_default();
        if let Some(waiter) = state.waiters.pop_front() {
            // A Before was already registered; wake it. Ignore send errors: a dropped receiver
            // means the waiter gave up, which is fine, nobody is harmed by losing the wakeup.
            let _ = waiter.send(());
        } else {
            state.pending_happens += 1;
        }
    }

    /// Block until the paired `Happen(key)` call has run.
    pub async fn before(&self, key: K) {
        let rx = {
            let mut keys = self.keys.lock().unwrap();
            let state = keys.entry(key).or_default();
            if state.pending_happens > 0 {
                state.pending_happens -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

/// A map of per-key async mutexes, used to serialize operations that must not run concurrently
/// for the same ID (e.g. two uploads of the same cache entry) without serializing unrelated IDs.
#[derive(Default)]
pub struct KeyLock<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyLock<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }
}

enum Slot<V> {
    InFlight(Vec<oneshot::Sender<V>>),
}

/// Deduplicates concurrent callers asking for the same key: the first caller runs `f`, everyone
/// else who calls `work` with the same key before it finishes gets the same result without
/// redoing the work. Used by the file cache's GET path so N concurrent downloads of the same ID
/// share one disk read.
#[derive(Default)]
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn work<Fut>(&self, key: K, f: impl FnOnce() -> Fut) -> V
    where
        Fut: std::future::Future<Output = V>,
    {
        enum Action<Fut> {
            Lead(Fut),
            Follow(oneshot::Receiver<V>),
        }

        let action = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get_mut(&key) {
                Some(Slot::InFlight(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Action::Follow(rx)
                }
                None => {
                    inflight.insert(key.clone(), Slot::InFlight(Vec::new()));
                    Action::Lead(f())
                }
            }
        };

        match action {
            Action::Follow(rx) => rx.await.expect("single-flight leader dropped without a result"),
            Action::Lead(fut) => {
                let result = fut.await;
                let waiters = {
                    let mut inflight = self.inflight.lock().unwrap();
                    match inflight.remove(&key) {
                        Some(Slot::InFlight(waiters)) => waiters,
                        None => Vec::new(),
                    }
                };
                for tx in waiters {
                    let _ = tx.send(result.clone());
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn before_after_happen_returns_immediately() {
        let hb: HappensBefore<u32> = HappensBefore::new();
        hb.happen(1, || {});
        tokio::time::timeout(Duration::from_millis(100), hb.before(1))
            .await
            .expect("before should not block once happen already ran");
    }

    #[tokio::test]
    async fn before_before_happen_blocks_until_released() {
        let hb = Arc::new(HappensBefore::new());
        let published = Arc::new(AtomicU32::new(0));

        let hb2 = hb.clone();
        let published2 = published.clone();
        let waiter = tokio::spawn(async move {
            hb2.before(1).await;
            published2.load(Ordering::Acquire)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(published.load(Ordering::Acquire), 0);

        hb.happen(1, || {
            published.store(42, Ordering::Release);
        });

        let seen = waiter.await.unwrap();
        assert_eq!(seen, 42);
    }

    #[tokio::test]
    async fn nth_happen_pairs_with_nth_before() {
        let hb = Arc::new(HappensBefore::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for i in 0..3u32 {
            let hb = hb.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                hb.before(0).await;
                order.lock().unwrap().push(i);
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..3 {
            hb.happen(0, || {});
        }
        for w in waiters {
            w.await.unwrap();
        }
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn single_flight_runs_work_once() {
        let sf: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicU32::new(0));
        let sf = Arc::new(sf);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let sf = sf.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                sf.work(1, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    7u32
                })
                .await
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
