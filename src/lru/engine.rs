//! Event-queue LRU cache
//!
//! Reads and writes hit a sharded concurrent map directly. Every change to
//! the recency list is expressed as a closure and pushed onto an unbounded
//! queue; a single background thread drains the queue and is the only code
//! that ever touches the list. The thread exits after an idle period and is
//! restarted by the next enqueue.

use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Instant, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use linked_hash_map::LinkedHashMap;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use super::worker::{AtomicWorkerState, WorkerState};
use crate::config::LruOptions;
use crate::error::{CacheError, Result};

/// Callback invoked with every value evicted or removed from the cache
pub type ItemRemovedCallback<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Recency list: front is least recently used, back is most recently used
type Order<K> = LinkedHashMap<K, ()>;

/// Deferred mutation of the recency list, run on the worker thread
type Action<K, V> = Box<dyn FnOnce(&Shared<K, V>, &mut Order<K>) + Send>;

#[derive(Clone)]
struct CachedValue<V> {
    value: V,
    expires_at: Option<SystemTime>,
}

impl<V> CachedValue<V> {
    fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Queue receiver and recency list, owned by whichever worker is running
struct WorkerSlot<K, V> {
    receiver: UnboundedReceiver<Action<K, V>>,
    order: Order<K>,
}

struct Shared<K, V> {
    map: DashMap<K, CachedValue<V>>,
    options: LruOptions,
    sender: UnboundedSender<Action<K, V>>,
    slot: Mutex<Option<WorkerSlot<K, V>>>,
    state: AtomicWorkerState,
    /// Reference point for the millisecond clocks below
    epoch: Instant,
    stop_at_ms: AtomicU64,
    next_sweep_ms: AtomicU64,
    pending: AtomicUsize,
    worker_starts: AtomicUsize,
    shutdown: AtomicBool,
    on_item_removed: Option<ItemRemovedCallback<V>>,
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn notify_removed(&self, value: &V) {
        if let Some(callback) = &self.on_item_removed {
            callback(value);
        }
    }

    /// Number of entries to keep after one compaction
    fn compaction_target(&self) -> usize {
        let current = self.map.len().min(self.options.capacity);
        current - (current as f64 * self.options.compaction_percentage) as usize
    }

    fn over_capacity_threshold(&self) -> bool {
        let ratio = self.map.len() as f64 / self.options.capacity as f64;
        ratio >= self.options.max_capacity_percentage
    }

    /// Evict from the front of the recency list until the target size is reached
    fn compact_lru(&self, order: &mut Order<K>) {
        let target = self.compaction_target();
        let before = self.map.len();
        while self.map.len() > target {
            let Some((key, ())) = order.pop_front() else {
                break;
            };
            if let Some((_, removed)) = self.map.remove(&key) {
                self.notify_removed(&removed.value);
            }
        }
        debug!(before = before, after = self.map.len(), "LRU compaction");
    }

    /// Remove arbitrary entries until the target size is reached
    fn compact_unordered(&self) {
        let target = self.compaction_target();
        let before = self.map.len();
        while self.map.len() > target {
            let next = self.map.iter().next().map(|entry| entry.key().clone());
            let Some(key) = next else {
                break;
            };
            if let Some((_, removed)) = self.map.remove(&key) {
                self.notify_removed(&removed.value);
            }
        }
        debug!(before = before, after = self.map.len(), "Unordered compaction");
    }

    fn remove_expired(&self, order: &mut Order<K>) {
        let now = SystemTime::now();
        let expired: Vec<K> = if self.options.maintain_lru {
            order
                .keys()
                .filter(|key| self.map.get(*key).map_or(true, |v| v.is_expired(now)))
                .cloned()
                .collect()
        } else {
            self.map
                .iter()
                .filter(|entry| entry.value().is_expired(now))
                .map(|entry| entry.key().clone())
                .collect()
        };

        let mut removed_count = 0usize;
        for key in expired {
            order.remove(&key);
            if let Some((_, removed)) = self.map.remove_if(&key, |_, v| v.is_expired(now)) {
                self.notify_removed(&removed.value);
                removed_count += 1;
            }
        }
        if removed_count > 0 {
            debug!(removed = removed_count, "Removed expired cache values");
        }
    }
}

/// Concurrent cache with an asynchronously maintained LRU order
pub struct LruCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache; fails if `options.capacity` is zero
    pub fn new(options: LruOptions) -> Result<Self> {
        Self::build(options, None)
    }

    /// Create a cache that reports every evicted or removed value
    pub fn with_removal_callback(
        options: LruOptions,
        on_item_removed: ItemRemovedCallback<V>,
    ) -> Result<Self> {
        Self::build(options, Some(on_item_removed))
    }

    fn build(options: LruOptions, on_item_removed: Option<ItemRemovedCallback<V>>) -> Result<Self> {
        if options.capacity == 0 {
            return Err(CacheError::InvalidArgument(
                "LRU capacity must be greater than zero".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let epoch = Instant::now();
        let next_sweep_ms = options.expired_sweep_interval.as_millis() as u64;

        Ok(Self {
            shared: Arc::new(Shared {
                map: DashMap::new(),
                sender,
                slot: Mutex::new(Some(WorkerSlot {
                    receiver,
                    order: LinkedHashMap::new(),
                })),
                state: AtomicWorkerState::new(),
                epoch,
                stop_at_ms: AtomicU64::new(0),
                next_sweep_ms: AtomicU64::new(next_sweep_ms),
                pending: AtomicUsize::new(0),
                worker_starts: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                on_item_removed,
                options,
            }),
        })
    }

    /// Insert or replace a value without expiration
    pub fn set(&self, key: K, value: V) -> bool {
        self.set_with_expiration(key, value, None)
    }

    /// Insert or replace a value.
    ///
    /// Returns false (and stores nothing) when expired values are being
    /// removed and `expires_at` is already in the past.
    pub fn set_with_expiration(&self, key: K, value: V, expires_at: Option<SystemTime>) -> bool {
        let shared = &self.shared;
        if shared.options.remove_expired_values {
            if let Some(at) = expires_at {
                if at <= SystemTime::now() {
                    return false;
                }
            }
        }

        if !shared.map.contains_key(&key) {
            self.compact_if_needed();
        }

        shared
            .map
            .insert(key.clone(), CachedValue { value, expires_at });

        if shared.options.maintain_lru {
            self.enqueue(Box::new(move |shared, order| touch(shared, order, key)));
        }
        true
    }

    /// Look up a value, marking it most recently used
    pub fn try_get(&self, key: &K) -> Option<V> {
        let shared = &self.shared;
        let value = {
            let entry = shared.map.get(key)?;
            if shared.options.remove_expired_values && entry.is_expired(SystemTime::now()) {
                return None;
            }
            entry.value.clone()
        };

        if shared.options.maintain_lru {
            let key = key.clone();
            self.enqueue(Box::new(move |shared, order| touch(shared, order, key)));
        }
        Some(value)
    }

    /// Return the cached value or insert the one produced by `make`.
    ///
    /// `make` runs at most once per call and only while the key is absent.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.try_get(&key) {
            return value;
        }

        let shared = &self.shared;
        if !shared.map.contains_key(&key) {
            self.compact_if_needed();
        }

        let value = match shared.map.entry(key.clone()) {
            Entry::Occupied(occupied) => occupied.get().value.clone(),
            Entry::Vacant(vacant) => {
                let value = make();
                vacant.insert(CachedValue {
                    value: value.clone(),
                    expires_at: None,
                });
                value
            }
        };

        if shared.options.maintain_lru {
            self.enqueue(Box::new(move |shared, order| touch(shared, order, key)));
        }
        value
    }

    /// Remove a value, reporting it to the removal callback
    pub fn try_remove(&self, key: &K) -> Option<V> {
        let (key, removed) = self.shared.map.remove(key)?;
        if self.shared.options.maintain_lru {
            self.enqueue(Box::new(move |_, order| {
                order.remove(&key);
            }));
        }
        self.shared.notify_removed(&removed.value);
        Some(removed.value)
    }

    /// Whether the key is present (does not affect recency)
    pub fn contains(&self, key: &K) -> bool {
        self.shared.map.contains_key(key)
    }

    /// Snapshot of all values in unspecified order
    pub fn get_all(&self) -> Vec<V> {
        self.shared
            .map
            .iter()
            .map(|entry| entry.value().value.clone())
            .collect()
    }

    /// Snapshot of all keys in unspecified order
    pub fn keys(&self) -> Vec<K> {
        self.shared.map.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop every entry without invoking the removal callback
    pub fn clear(&self) {
        self.shared.map.clear();
        if self.shared.options.maintain_lru {
            self.enqueue(Box::new(|_, order| order.clear()));
        }
    }

    pub fn len(&self) -> usize {
        self.shared.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.map.is_empty()
    }

    fn compact_if_needed(&self) {
        if !self.shared.over_capacity_threshold() {
            return;
        }
        if self.shared.options.maintain_lru {
            self.enqueue(Box::new(|shared, order| shared.compact_lru(order)));
        } else {
            self.enqueue(Box::new(|shared, _| shared.compact_unordered()));
        }
    }

    fn enqueue(&self, action: Action<K, V>) {
        let shared = &self.shared;
        shared.pending.fetch_add(1, Ordering::AcqRel);
        if shared.sender.send(action).is_err() {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            warn!("LRU event queue closed; dropping action");
            return;
        }
        self.start_worker_if_not_running();
    }

    fn start_worker_if_not_running(&self) {
        let shared = &self.shared;
        let stop_at = shared.now_ms() + shared.options.idle_timeout.as_millis() as u64;
        shared.stop_at_ms.store(stop_at, Ordering::Release);

        if shared.state.transition(WorkerState::Running, WorkerState::DoNotStop) {
            return;
        }
        if !shared.state.transition(WorkerState::Stopped, WorkerState::Running) {
            // Another enqueuer just started it, or it is already marked DoNotStop
            return;
        }

        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("lru-cache-worker".to_string())
            .spawn(move || run_worker(worker_shared));
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn LRU worker");
            shared.state.store(WorkerState::Stopped);
        }
    }

    /// Block until every queued action has been processed
    #[cfg(test)]
    pub(crate) fn wait_for_processing(&self) {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while self.shared.pending.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[cfg(test)]
    fn worker_state(&self) -> WorkerState {
        self.shared.state.load()
    }

    #[cfg(test)]
    fn worker_starts(&self) -> usize {
        self.shared.worker_starts.load(Ordering::Acquire)
    }
}

impl<K, V> Drop for LruCache<K, V> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

/// Move a key to the back of the recency list if it still exists in the map
fn touch<K, V>(shared: &Shared<K, V>, order: &mut Order<K>, key: K)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    order.remove(&key);
    if shared.map.contains_key(&key) {
        order.insert(key, ());
    }
}

fn run_worker<K, V>(shared: Arc<Shared<K, V>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let taken = shared
        .slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let Some(mut slot) = taken else {
        warn!("LRU worker started without a queue");
        shared.state.store(WorkerState::Stopped);
        return;
    };

    shared.worker_starts.fetch_add(1, Ordering::AcqRel);
    trace!("LRU worker started");

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared.state.store(WorkerState::Running);

        if shared.options.remove_expired_values {
            let now = shared.now_ms();
            if now >= shared.next_sweep_ms.load(Ordering::Acquire) {
                shared.remove_expired(&mut slot.order);
                let next = now + shared.options.expired_sweep_interval.as_millis() as u64;
                shared.next_sweep_ms.store(next, Ordering::Release);
            }
        }

        match slot.receiver.try_recv() {
            Ok(action) => {
                let order = &mut slot.order;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| action(shared.as_ref(), order)));
                if outcome.is_err() {
                    warn!("LRU queue action panicked; continuing");
                }
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Err(TryRecvError::Empty) => {
                if shared.now_ms() <= shared.stop_at_ms.load(Ordering::Acquire) {
                    thread::sleep(shared.options.polling_interval);
                    continue;
                }

                // Hand the queue back before publishing Stopped so the next worker finds it
                *shared.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(slot);
                if shared.state.transition(WorkerState::Running, WorkerState::Stopped) {
                    trace!("LRU worker idle; exiting");
                    return;
                }

                // An enqueuer marked DoNotStop; nobody else can own the slot yet
                let reclaimed = shared
                    .slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match reclaimed {
                    Some(reclaimed) => slot = reclaimed,
                    None => {
                        warn!("LRU worker lost its queue");
                        return;
                    }
                }
            }
            Err(TryRecvError::Disconnected) => break,
        }
    }

    *shared.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(slot);
    shared.state.store(WorkerState::Stopped);
    trace!("LRU worker shut down");
}
