//! Statistical hot method profiling.
//!
//! Sampling runs on a fast timer and only looks at the threads currently
//! ranked in the top thread slots. The CPU time each of those threads earned
//! since its previous capture is charged to the method on top of its stack.
//! Methods that spend more time on CPU are observed proportionally more
//! often, so the relative ranking converges even though a single sample says
//! little.
//!
//! Reduction runs on the slow collector interval: it ranks the accumulated
//! methods, publishes the top ones with their share of the total, and starts
//! a fresh accumulation window.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::health::ComponentHealth;
use crate::history::{CounterHistory, Snapshot};
use crate::rank_map::RankMap;
use crate::ranker::ThreadSlot;
use crate::runtime::{Runtime, StackFrame, ThreadId, ThreadInfo, ThreadState};
use crate::settings::CollectorSettings;
use crate::slots::SlotTable;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MethodKey {
    pub class_name: String,
    pub method_name: String,
}

impl From<&StackFrame> for MethodKey {
    fn from(frame: &StackFrame) -> Self {
        Self {
            class_name: frame.class_name.clone(),
            method_name: frame.method_name.clone(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.method_name)
    }
}

/// CPU time charged to one method in the current window, with the thread
/// and stack it was first observed on.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodEntry {
    pub cpu_nanos: u64,
    pub thread_name: String,
    pub thread_id: ThreadId,
    pub stack_trace: Vec<StackFrame>,
}

#[derive(Debug, Default)]
struct Accumulator {
    methods: IndexMap<MethodKey, MethodEntry>,
    total_cpu_nanos: u64,
}

impl Accumulator {
    fn charge(&mut self, method: MethodKey, cpu_nanos: u64, thread: ThreadInfo) {
        self.total_cpu_nanos = self.total_cpu_nanos.saturating_add(cpu_nanos);
        self.methods
            .entry(method)
            .and_modify(|entry| entry.cpu_nanos = entry.cpu_nanos.saturating_add(cpu_nanos))
            .or_insert_with(|| MethodEntry {
                cpu_nanos,
                thread_name: thread.name,
                thread_id: thread.id,
                stack_trace: thread.stack,
            });
    }
}

/// One published hot method rank. The default value is the cleared slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HotMethodSlot {
    pub rank: usize,
    pub method: Option<MethodKey>,
    /// Share of all CPU time charged during the window, in percent.
    pub load_percent: f64,
    pub cpu_nanos: u64,
    pub thread_name: String,
    pub thread_id: Option<ThreadId>,
    pub stack_trace: Vec<StackFrame>,
}

impl HotMethodSlot {
    pub fn is_empty(&self) -> bool {
        self.method.is_none()
    }
}

pub struct HotMethodProfiler {
    runtime: Arc<dyn Runtime>,
    clock: Arc<dyn Clock>,
    top_threads: Arc<SlotTable<ThreadSlot>>,
    stack_depth: usize,
    captures: Mutex<CounterHistory<ThreadId>>,
    accumulator: Mutex<Accumulator>,
    slots: SlotTable<HotMethodSlot>,
    health: ComponentHealth,
}

impl HotMethodProfiler {
    /// Profiles the threads published in `top_threads`.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        clock: Arc<dyn Clock>,
        top_threads: Arc<SlotTable<ThreadSlot>>,
        settings: &CollectorSettings,
    ) -> Self {
        log::info!(
            "hot method profiler sampling every {} ms, ranking {} methods",
            settings.sample_interval_ms,
            settings.hot_methods
        );
        Self {
            runtime,
            clock,
            top_threads,
            stack_depth: settings.hot_method_stack_depth.max(1),
            captures: Mutex::new(CounterHistory::new()),
            accumulator: Mutex::new(Accumulator::default()),
            slots: SlotTable::new(settings.hot_methods),
            health: ComponentHealth::new("hot method profiler"),
        }
    }

    /// Fast-timer trigger.
    pub fn sample_tick(&self) {
        self.health.guard(|| Ok(self.sample()));
    }

    /// Slow-timer trigger.
    pub fn reduce_tick(&self) {
        self.health.guard(|| Ok(self.reduce()));
    }

    /// Captures the stack of every ranked thread and charges its CPU delta
    /// to the top-of-stack method. Returns the number of threads charged.
    pub fn sample(&self) -> usize {
        let thread_ids: Vec<ThreadId> = self
            .top_threads
            .snapshot()
            .into_iter()
            .filter_map(|slot| slot.thread_id)
            .collect();
        let now = self.clock.now();

        let mut charges = Vec::with_capacity(thread_ids.len());
        {
            let mut captures = self.captures.lock();
            captures.begin_pass();
            for thread_id in thread_ids {
                let times = match self.runtime.thread_times(thread_id) {
                    Ok(times) => times,
                    Err(error) => {
                        log::trace!("skipping stack sample of thread {thread_id}: {error}");
                        continue;
                    }
                };
                let info = match self.runtime.thread_info(thread_id, self.stack_depth) {
                    Ok(info) => info,
                    Err(error) => {
                        log::trace!("skipping stack sample of thread {thread_id}: {error}");
                        continue;
                    }
                };
                let cpu_nanos = captures
                    .update(thread_id, Snapshot::new(times.cpu_nanos, now))
                    .amount;
                if info.state != ThreadState::Runnable || cpu_nanos == 0 {
                    continue;
                }
                let Some(method) = info.stack.first().map(MethodKey::from) else {
                    continue;
                };
                charges.push((method, cpu_nanos, info));
            }
            captures.end_pass();
        }

        let charged = charges.len();
        if charged > 0 {
            let mut accumulator = self.accumulator.lock();
            for (method, cpu_nanos, mut info) in charges {
                info.stack.truncate(self.stack_depth);
                accumulator.charge(method, cpu_nanos, info);
            }
        }
        charged
    }

    /// Publishes the hottest methods of the current window and starts a new
    /// one. Returns the number of populated slots.
    pub fn reduce(&self) -> usize {
        let Accumulator {
            methods,
            total_cpu_nanos,
        } = std::mem::take(&mut *self.accumulator.lock());

        let mut ranking = RankMap::new();
        for (index, entry) in methods.values().enumerate() {
            ranking.insert(entry.cpu_nanos as f64, index);
        }

        let mut populated = 0;
        for (_, &index) in ranking.top(self.slots.len()) {
            let Some((method, entry)) = methods.get_index(index) else {
                continue;
            };
            populated += 1;
            let load_percent = if total_cpu_nanos == 0 {
                0.0
            } else {
                entry.cpu_nanos as f64 / total_cpu_nanos as f64 * 100.0
            };
            self.slots.set(
                populated,
                HotMethodSlot {
                    rank: populated,
                    method: Some(method.clone()),
                    load_percent,
                    cpu_nanos: entry.cpu_nanos,
                    thread_name: entry.thread_name.clone(),
                    thread_id: Some(entry.thread_id),
                    stack_trace: entry.stack_trace.clone(),
                },
            );
        }
        self.slots.clear_from(populated + 1);

        log::debug!(
            "hot method window closed: {} methods, {} ns charged",
            methods.len(),
            total_cpu_nanos
        );
        populated
    }

    pub fn hot_method(&self, rank: usize) -> Option<HotMethodSlot> {
        self.slots.get(rank)
    }

    pub fn slots(&self) -> &SlotTable<HotMethodSlot> {
        &self.slots
    }

    /// Methods charged so far in the current window.
    pub fn accumulated_methods(&self) -> usize {
        self.accumulator.lock().methods.len()
    }

    pub fn health(&self) -> &ComponentHealth {
        &self.health
    }
}
