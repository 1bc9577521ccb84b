//! Bounded queue multiplexer between the ingress stage and the egress workers.
//!
//! An arbitrary, runtime-discovered set of logical queues (one per egress port and
//! traffic class) is multiplexed onto a fixed number of physical FIFOs, one per
//! egress worker thread. Each logical queue has its own capacity; a push against a
//! full queue is rejected and the frame handed back to the caller. A single mutex
//! guards all physical queues and the occupancy registry: logical queue ids have no
//! upper bound, so per-worker locking over an indexable array is not an option, and
//! the critical sections only do constant-time deque and map work.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of one logical queue: an egress port paired with a per-port queue index
/// (traffic class). Pure value type, used as a registry key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct QueueKey {
    pub port: usize,
    pub queue: usize,
}

/// Maps a queue id to the worker (and physical queue) that services it.
///
/// Any total function into `[0, nb_workers)` is a valid mapping. The mapper is
/// consulted on every push with the queue id alone, so all traffic for a given
/// queue id lands on the same worker regardless of port.
pub trait WorkerMapper: Send + Sync {
    fn worker_for(&self, queue_id: usize) -> usize;
}

impl<F> WorkerMapper for F
where
    F: Fn(usize) -> usize + Send + Sync,
{
    fn worker_for(&self, queue_id: usize) -> usize {
        self(queue_id)
    }
}

/// Default mapping: queue id modulo the worker count.
#[derive(Debug, Clone, Copy)]
pub struct RoundRobinMapper {
    nb_workers: usize,
}

impl RoundRobinMapper {
    pub fn new(nb_workers: usize) -> Self {
        assert!(nb_workers > 0, "mapper needs at least one worker");
        Self { nb_workers }
    }
}

impl WorkerMapper for RoundRobinMapper {
    fn worker_for(&self, queue_id: usize) -> usize {
        queue_id % self.nb_workers
    }
}

/// Rejected push: the target logical queue is at capacity. Carries the frame back
/// to the caller, who owns the retry-or-drop decision.
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("logical queue at capacity")
    }
}

impl<T> Error for QueueFull<T> {}

struct Entry<T> {
    item: T,
    // Full key, not just the port: several queue ids can share a worker, and the
    // originating registry entry must be found exactly on pop.
    key: QueueKey,
}

#[derive(Default)]
struct QueueInfo {
    size: usize,
}

struct MuxState<T> {
    lanes: Box<[VecDeque<Entry<T>>]>,
    registry: HashMap<QueueKey, QueueInfo>,
    depth: usize,
    shutdown: bool,
}

/// Concurrent queue multiplexer.
///
/// Constructed once with a uniform per-logical-queue capacity and the number of
/// worker threads, then shared behind an `Arc` for the lifetime of the switch.
/// Registry entries are created lazily on first reference and never removed, so
/// memory grows with the number of distinct `(port, queue)` pairs ever seen, not
/// with traffic volume.
pub struct QueueMux<T, M = RoundRobinMapper> {
    state: Mutex<MuxState<T>>,
    not_empty: Box<[Condvar]>,
    capacity: usize,
    mapper: M,
}

impl<T> QueueMux<T> {
    /// Multiplexer with the modulo mapping over `nb_workers` physical queues.
    pub fn new(capacity: usize, nb_workers: usize) -> Self {
        Self::with_mapper(capacity, nb_workers, RoundRobinMapper::new(nb_workers))
    }
}

impl<T, M: WorkerMapper> QueueMux<T, M> {
    /// Multiplexer with a caller-supplied queue-to-worker mapping. The mapper must
    /// return indexes below `nb_workers`; an out-of-range index is a bug in the
    /// mapper and panics.
    pub fn with_mapper(capacity: usize, nb_workers: usize, mapper: M) -> Self {
        assert!(nb_workers > 0, "need at least one worker");
        Self {
            state: Mutex::new(MuxState {
                lanes: (0..nb_workers).map(|_| VecDeque::new()).collect(),
                registry: HashMap::new(),
                depth: 0,
                shutdown: false,
            }),
            not_empty: (0..nb_workers).map(|_| Condvar::new()).collect(),
            capacity,
            mapper,
        }
    }

    /// Enqueue `item` on the logical queue `(port, queue)`.
    ///
    /// Fails fast with [`QueueFull`] once the logical queue holds `capacity`
    /// items; the state is left untouched and the item returned. On success the
    /// worker draining the mapped physical queue is woken.
    pub fn push(&self, port: usize, queue: usize, item: T) -> Result<(), QueueFull<T>> {
        let worker = self.mapper.worker_for(queue);
        let key = QueueKey { port, queue };
        let mut state = self.state.lock();
        let info = state.registry.entry(key).or_default();
        if info.size >= self.capacity {
            return Err(QueueFull(item));
        }
        info.size += 1;
        state.lanes[worker].push_front(Entry { item, key });
        state.depth += 1;
        drop(state);
        self.not_empty[worker].notify_one();
        Ok(())
    }

    /// Dequeue the oldest entry of physical queue `worker`, if any.
    ///
    /// Non-blocking: an empty physical queue reports `None` immediately and
    /// mutates nothing. Returns the egress port the frame was queued under along
    /// with the frame. `worker` must be below the constructed worker count.
    pub fn pop(&self, worker: usize) -> Option<(usize, T)> {
        let mut state = self.state.lock();
        Self::take(&mut state, worker)
    }

    /// Dequeue from physical queue `worker`, suspending until an item arrives.
    ///
    /// Returns `None` only once [`shutdown`](Self::shutdown) has been called and
    /// the physical queue is drained.
    pub fn pop_wait(&self, worker: usize) -> Option<(usize, T)> {
        let mut state = self.state.lock();
        loop {
            if let Some(popped) = Self::take(&mut state, worker) {
                return Some(popped);
            }
            if state.shutdown {
                return None;
            }
            self.not_empty[worker].wait(&mut state);
        }
    }

    /// Bounded-wait variant of [`pop_wait`](Self::pop_wait): gives up after
    /// `timeout` and reports `None`, also returning `None` on shutdown.
    pub fn pop_wait_timeout(&self, worker: usize, timeout: Duration) -> Option<(usize, T)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(popped) = Self::take(&mut state, worker) {
                return Some(popped);
            }
            if state.shutdown {
                return None;
            }
            if self.not_empty[worker]
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return None;
            }
        }
    }

    fn take(state: &mut MuxState<T>, worker: usize) -> Option<(usize, T)> {
        // Entries are appended at the front, so the back holds the oldest.
        let entry = state.lanes[worker].pop_back()?;
        let info = state
            .registry
            .get_mut(&entry.key)
            .expect("dequeued an entry whose logical queue was never registered");
        debug_assert!(info.size > 0, "occupancy underflow for {:?}", entry.key);
        info.size -= 1;
        state.depth -= 1;
        Some((entry.key.port, entry.item))
    }

    /// Wake every blocked worker and make all future waits return immediately.
    /// Items already queued remain poppable; only the suspension ends.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);
        for signal in self.not_empty.iter() {
            signal.notify_all();
        }
    }

    /// Current occupancy of one logical queue, `0` if the pair was never pushed.
    /// Advisory: the value can be stale by the time the caller acts on it.
    pub fn occupancy(&self, port: usize, queue: usize) -> usize {
        let state = self.state.lock();
        state
            .registry
            .get(&QueueKey { port, queue })
            .map_or(0, |info| info.size)
    }

    /// Total items resident across all logical queues.
    pub fn overall_occupancy(&self) -> usize {
        self.state.lock().depth
    }

    /// Snapshot of every logical queue key registered so far. The set only grows;
    /// intended for introspection, not for the push/pop path.
    pub fn active_queues(&self) -> Vec<QueueKey> {
        self.state.lock().registry.keys().copied().collect()
    }

    /// Number of physical queues (= worker threads) fixed at construction.
    pub fn nb_workers(&self) -> usize {
        self.not_empty.len()
    }

    /// Per-logical-queue capacity fixed at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
