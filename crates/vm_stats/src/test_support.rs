//! Deterministic stand-ins for the monitored runtime and the clock.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::clock::Clock;
use crate::runtime::{
    CollectorCounters, CollectorInfo, MemoryPoolInfo, MemoryUsage, PoolKind, PoolUsage, ReadError,
    Runtime, StackFrame, ThreadCounts, ThreadId, ThreadInfo, ThreadState, ThreadTimes,
    ThresholdListener,
};

pub const PARALLEL_EDEN: &str = "PS Eden Space";
pub const PARALLEL_SURVIVOR: &str = "PS Survivor Space";
pub const PARALLEL_OLD: &str = "PS Old Gen";
pub const PARALLEL_SCAVENGE: &str = "PS Scavenge";
pub const PARALLEL_MARK_SWEEP: &str = "PS MarkSweep";

#[derive(Debug, Clone)]
struct FakeThread {
    name: String,
    state: ThreadState,
    daemon: bool,
    times: ThreadTimes,
    blocked_nanos: u64,
    stack: Vec<StackFrame>,
    unreadable: bool,
}

#[derive(Debug, Clone)]
struct FakePool {
    kind: PoolKind,
    current: MemoryUsage,
    after_collection: Option<MemoryUsage>,
    peak_used: u64,
    peak_resets: usize,
}

#[derive(Debug, Clone)]
struct FakeCollector {
    pool_names: Vec<String>,
    counters: CollectorCounters,
}

#[derive(Default)]
struct FakeState {
    threads: IndexMap<ThreadId, FakeThread>,
    peak_threads: u32,
    fail_listing: bool,
    pools: IndexMap<String, FakePool>,
    collectors: IndexMap<String, FakeCollector>,
    collector_errors: HashMap<String, ReadError>,
    listeners: HashMap<String, Vec<ThresholdListener>>,
}

/// In-memory [`Runtime`] whose counters only move when a test moves them.
pub struct FakeRuntime {
    processors: usize,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    /// A runtime with no threads, pools or collectors.
    pub fn new(processors: usize) -> Self {
        Self {
            processors,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// A runtime with the pools and collectors of a parallel collector setup,
    /// all pools empty.
    pub fn with_parallel_heap(processors: usize) -> Self {
        let runtime = Self::new(processors);
        runtime.add_pool(PARALLEL_EDEN, PoolKind::Heap);
        runtime.add_pool(PARALLEL_SURVIVOR, PoolKind::Heap);
        runtime.add_pool(PARALLEL_OLD, PoolKind::Heap);
        runtime.add_pool("Metaspace", PoolKind::NonHeap);
        runtime.add_collector(PARALLEL_SCAVENGE, &[PARALLEL_EDEN, PARALLEL_SURVIVOR]);
        runtime.add_collector(
            PARALLEL_MARK_SWEEP,
            &[PARALLEL_EDEN, PARALLEL_SURVIVOR, PARALLEL_OLD],
        );
        runtime
    }

    pub fn add_thread(&self, id: ThreadId, name: &str) {
        let mut state = self.state.lock();
        state.threads.insert(
            id,
            FakeThread {
                name: name.to_string(),
                state: ThreadState::Runnable,
                daemon: false,
                times: ThreadTimes::default(),
                blocked_nanos: 0,
                stack: Vec::new(),
                unreadable: false,
            },
        );
        state.peak_threads = state.peak_threads.max(state.threads.len() as u32);
    }

    pub fn set_daemon(&self, id: ThreadId, daemon: bool) {
        self.with_thread(id, |thread| thread.daemon = daemon);
    }

    pub fn remove_thread(&self, id: ThreadId) {
        self.state.lock().threads.shift_remove(&id);
    }

    pub fn add_thread_times(&self, id: ThreadId, cpu: Duration, user: Duration) {
        self.with_thread(id, |thread| {
            thread.times.cpu_nanos += cpu.as_nanos() as u64;
            thread.times.user_nanos += user.as_nanos() as u64;
        });
    }

    pub fn add_blocked_time(&self, id: ThreadId, blocked: Duration) {
        self.with_thread(id, |thread| thread.blocked_nanos += blocked.as_nanos() as u64);
    }

    pub fn set_thread_state(&self, id: ThreadId, thread_state: ThreadState) {
        self.with_thread(id, |thread| thread.state = thread_state);
    }

    pub fn set_stack(&self, id: ThreadId, stack: Vec<StackFrame>) {
        self.with_thread(id, |thread| thread.stack = stack);
    }

    /// Keeps the thread listed but makes every per-thread read fail.
    pub fn fail_thread_reads(&self, id: ThreadId) {
        self.with_thread(id, |thread| thread.unreadable = true);
    }

    pub fn fail_thread_listing(&self, fail: bool) {
        self.state.lock().fail_listing = fail;
    }

    pub fn add_pool(&self, name: &str, kind: PoolKind) {
        let after_collection = match kind {
            PoolKind::Heap => Some(MemoryUsage::default()),
            PoolKind::NonHeap => None,
        };
        self.state.lock().pools.insert(
            name.to_string(),
            FakePool {
                kind,
                current: MemoryUsage::default(),
                after_collection,
                peak_used: 0,
                peak_resets: 0,
            },
        );
    }

    pub fn remove_pool(&self, name: &str) {
        self.state.lock().pools.shift_remove(name);
    }

    /// Sets the current occupancy; the peak follows it upwards.
    pub fn set_pool_usage(&self, name: &str, used: u64, committed: u64) {
        self.with_pool(name, |pool| {
            pool.current = MemoryUsage { used, committed };
            pool.peak_used = pool.peak_used.max(used);
        });
    }

    pub fn set_collection_usage(&self, name: &str, used: u64, committed: u64) {
        self.with_pool(name, |pool| {
            pool.after_collection = Some(MemoryUsage { used, committed })
        });
    }

    /// Makes the pool report no post-collection usage.
    pub fn clear_collection_usage(&self, name: &str) {
        self.with_pool(name, |pool| pool.after_collection = None);
    }

    pub fn set_peak_used(&self, name: &str, bytes: u64) {
        self.with_pool(name, |pool| pool.peak_used = bytes);
    }

    pub fn peak_resets(&self, name: &str) -> usize {
        self.state
            .lock()
            .pools
            .get(name)
            .map_or(0, |pool| pool.peak_resets)
    }

    pub fn add_collector(&self, name: &str, pools: &[&str]) {
        self.state.lock().collectors.insert(
            name.to_string(),
            FakeCollector {
                pool_names: pools.iter().map(|pool| pool.to_string()).collect(),
                counters: CollectorCounters::default(),
            },
        );
    }

    /// Makes every counter read of `name` fail with `error` until called
    /// again with `None`.
    pub fn fail_collector_reads(&self, name: &str, error: Option<ReadError>) {
        let mut state = self.state.lock();
        match error {
            Some(error) => {
                state.collector_errors.insert(name.to_string(), error);
            }
            None => {
                state.collector_errors.remove(name);
            }
        }
    }

    pub fn record_collections(&self, name: &str, count: u64, time_ms: u64) {
        if let Some(collector) = self.state.lock().collectors.get_mut(name) {
            collector.counters.collection_count += count;
            collector.counters.collection_time_ms += time_ms;
        }
    }

    pub fn listener_count(&self, pool: &str) -> usize {
        self.state.lock().listeners.get(pool).map_or(0, Vec::len)
    }

    /// Delivers a post-collection notification for `pool` on the calling
    /// thread.
    pub fn fire_collection_threshold(&self, pool: &str) {
        let listeners = self
            .state
            .lock()
            .listeners
            .get(pool)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(pool);
        }
    }

    fn with_thread(&self, id: ThreadId, update: impl FnOnce(&mut FakeThread)) {
        if let Some(thread) = self.state.lock().threads.get_mut(&id) {
            update(thread);
        }
    }

    fn with_pool(&self, name: &str, update: impl FnOnce(&mut FakePool)) {
        if let Some(pool) = self.state.lock().pools.get_mut(name) {
            update(pool);
        }
    }

    fn read_thread<T>(
        &self,
        id: ThreadId,
        read: impl FnOnce(&FakeThread) -> T,
    ) -> Result<T, ReadError> {
        let state = self.state.lock();
        let thread = state
            .threads
            .get(&id)
            .ok_or_else(|| ReadError::thread_not_found(id))?;
        if thread.unreadable {
            return Err(ReadError::Failed(format!("thread {id} is unreadable")));
        }
        Ok(read(thread))
    }
}

impl Runtime for FakeRuntime {
    fn available_processors(&self) -> usize {
        self.processors
    }

    fn thread_ids(&self) -> Result<Vec<ThreadId>, ReadError> {
        let state = self.state.lock();
        if state.fail_listing {
            return Err(ReadError::Failed("thread listing unavailable".into()));
        }
        Ok(state.threads.keys().copied().collect())
    }

    fn thread_counts(&self) -> Result<ThreadCounts, ReadError> {
        let state = self.state.lock();
        Ok(ThreadCounts {
            live: state.threads.len() as u32,
            daemon: state.threads.values().filter(|thread| thread.daemon).count() as u32,
            peak: state.peak_threads,
        })
    }

    fn thread_times(&self, id: ThreadId) -> Result<ThreadTimes, ReadError> {
        self.read_thread(id, |thread| thread.times)
    }

    fn thread_blocked_nanos(&self, id: ThreadId) -> Result<u64, ReadError> {
        self.read_thread(id, |thread| thread.blocked_nanos)
    }

    fn thread_info(&self, id: ThreadId, max_frames: usize) -> Result<ThreadInfo, ReadError> {
        self.read_thread(id, |thread| ThreadInfo {
            id,
            name: thread.name.clone(),
            state: thread.state,
            stack: thread.stack.iter().take(max_frames).cloned().collect(),
        })
    }

    fn memory_pools(&self) -> Result<Vec<MemoryPoolInfo>, ReadError> {
        Ok(self
            .state
            .lock()
            .pools
            .iter()
            .map(|(name, pool)| MemoryPoolInfo {
                name: name.clone(),
                kind: pool.kind,
            })
            .collect())
    }

    fn pool_usage(&self, pool: &str) -> Result<PoolUsage, ReadError> {
        let state = self.state.lock();
        let fake = state
            .pools
            .get(pool)
            .ok_or_else(|| ReadError::pool_not_found(pool))?;
        Ok(PoolUsage {
            current: fake.current,
            after_collection: fake.after_collection,
            peak_used: fake.peak_used,
        })
    }

    fn reset_peak_usage(&self, pool: &str) -> Result<(), ReadError> {
        let mut state = self.state.lock();
        let fake = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| ReadError::pool_not_found(pool))?;
        fake.peak_used = fake.current.used;
        fake.peak_resets += 1;
        Ok(())
    }

    fn collectors(&self) -> Result<Vec<CollectorInfo>, ReadError> {
        Ok(self
            .state
            .lock()
            .collectors
            .iter()
            .map(|(name, collector)| CollectorInfo {
                name: name.clone(),
                pool_names: collector.pool_names.clone(),
            })
            .collect())
    }

    fn collector_counters(&self, collector: &str) -> Result<CollectorCounters, ReadError> {
        let state = self.state.lock();
        if let Some(error) = state.collector_errors.get(collector) {
            return Err(error.clone());
        }
        state
            .collectors
            .get(collector)
            .map(|fake| fake.counters)
            .ok_or_else(|| ReadError::collector_not_found(collector))
    }

    fn subscribe_collection_threshold(
        &self,
        pool: &str,
        listener: ThresholdListener,
    ) -> Result<(), ReadError> {
        let mut state = self.state.lock();
        let fake = state
            .pools
            .get(pool)
            .ok_or_else(|| ReadError::pool_not_found(pool))?;
        if fake.after_collection.is_none() {
            return Err(ReadError::Unsupported("collection usage threshold"));
        }
        state
            .listeners
            .entry(pool.to_string())
            .or_default()
            .push(listener);
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: Duration) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}
