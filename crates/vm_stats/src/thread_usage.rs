//! Per-thread CPU and contention accounting.
//!
//! One call to [`ThreadUsageTracker::sample`] is one pass over every live
//! thread: cumulative counters are turned into interval deltas through the
//! counter histories, summed into process-wide percentages, ranked, and
//! published into the top and blocked thread slots.

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, interval_between};
use crate::health::ComponentHealth;
use crate::history::{CounterHistory, Snapshot};
use crate::rank_map::RankMap;
use crate::ranker::{RankingKind, ThreadSample, ThreadSlot, rank_threads};
use crate::runtime::{ReadError, Runtime, StackFrame, ThreadId, ThreadState};
use crate::settings::CollectorSettings;
use crate::slots::SlotTable;

/// Process-wide thread figures of the last pass.
///
/// Percentages are relative to the whole machine: the sum of the per-thread
/// percentages divided by the number of available processors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThreadUsage {
    pub cpu_percent: f64,
    pub user_percent: f64,
    pub system_percent: f64,
    pub live_threads: u32,
    pub daemon_threads: u32,
    pub peak_threads: u32,
    pub sampled_threads: usize,
    pub interval_ms: u64,
}

struct PassState {
    cpu: CounterHistory<ThreadId>,
    user: CounterHistory<ThreadId>,
    blocked: CounterHistory<ThreadId>,
    last_pass_at: Option<Duration>,
    samples: HashMap<ThreadId, ThreadSample>,
    cpu_ranking: RankMap<ThreadId>,
    blocked_ranking: RankMap<ThreadId>,
}

impl PassState {
    fn new() -> Self {
        Self {
            cpu: CounterHistory::new(),
            user: CounterHistory::new(),
            blocked: CounterHistory::new(),
            last_pass_at: None,
            samples: HashMap::new(),
            cpu_ranking: RankMap::new(),
            blocked_ranking: RankMap::new(),
        }
    }

    fn begin(&mut self) {
        self.cpu.begin_pass();
        self.user.begin_pass();
        self.blocked.begin_pass();
        self.samples.clear();
        self.cpu_ranking.clear();
        self.blocked_ranking.clear();
    }

    fn end(&mut self) -> usize {
        let purged = self.cpu.end_pass();
        self.user.end_pass();
        self.blocked.end_pass();
        purged
    }
}

pub struct ThreadUsageTracker {
    runtime: Arc<dyn Runtime>,
    clock: Arc<dyn Clock>,
    contention_monitoring: bool,
    pass: Mutex<PassState>,
    usage: Mutex<ThreadUsage>,
    top_threads: Arc<SlotTable<ThreadSlot>>,
    blocked_threads: Arc<SlotTable<ThreadSlot>>,
    health: ComponentHealth,
}

impl ThreadUsageTracker {
    pub fn new(runtime: Arc<dyn Runtime>, clock: Arc<dyn Clock>, settings: &CollectorSettings) -> Self {
        log::info!(
            "thread usage tracker ranking {} top and {} blocked threads (contention monitoring {})",
            settings.top_threads,
            settings.blocked_threads,
            if settings.contention_monitoring { "on" } else { "off" },
        );
        Self {
            runtime,
            clock,
            contention_monitoring: settings.contention_monitoring,
            pass: Mutex::new(PassState::new()),
            usage: Mutex::new(ThreadUsage::default()),
            top_threads: Arc::new(SlotTable::new(settings.top_threads)),
            blocked_threads: Arc::new(SlotTable::new(settings.blocked_threads)),
            health: ComponentHealth::new("thread usage tracker"),
        }
    }

    /// Update trigger for the periodic scheduler. Never fails; a systemic
    /// failure disables the tracker instead.
    pub fn update(&self) {
        self.health.guard(|| self.sample());
    }

    /// Runs one sampling pass and publishes its results.
    ///
    /// The first pass only seeds the counter histories, so it reports zero
    /// usage. A pass that finds the clock has not moved since the previous one
    /// changes nothing and returns the previous figures.
    pub fn sample(&self) -> Result<ThreadUsage> {
        let mut guard = self.pass.lock();
        let pass = &mut *guard;
        let now = self.clock.now();
        let interval = match pass.last_pass_at {
            Some(previous) => match interval_between(previous, now) {
                Some(interval) => Some(interval),
                None => {
                    log::debug!("skipping thread pass, clock did not advance");
                    return Ok(self.usage());
                }
            },
            None => None,
        };

        let thread_ids = self
            .runtime
            .thread_ids()
            .context("Failed to list live threads")?;
        let processors = self.runtime.available_processors().max(1) as f64;

        pass.begin();
        let mut usage = ThreadUsage::default();
        for thread_id in thread_ids {
            let times = match self.runtime.thread_times(thread_id) {
                Ok(times) => times,
                Err(error) => {
                    log::trace!("no CPU time for thread {thread_id} this interval: {error}");
                    continue;
                }
            };
            let cpu_nanos = pass
                .cpu
                .update(thread_id, Snapshot::new(times.cpu_nanos, now))
                .amount;
            let user_nanos = pass
                .user
                .update(thread_id, Snapshot::new(times.user_nanos, now))
                .amount;
            let blocked_nanos = if self.contention_monitoring {
                match self.runtime.thread_blocked_nanos(thread_id) {
                    Ok(blocked) => Some(
                        pass.blocked
                            .update(thread_id, Snapshot::new(blocked, now))
                            .amount,
                    ),
                    Err(error) => {
                        log::trace!("no blocked time for thread {thread_id} this interval: {error}");
                        None
                    }
                }
            } else {
                None
            };

            let sample = ThreadSample {
                cpu_nanos,
                user_nanos,
                blocked_nanos,
                cpu_percent: percent_of_interval(cpu_nanos, interval),
                user_percent: percent_of_interval(user_nanos, interval),
                blocked_percent: percent_of_interval(blocked_nanos.unwrap_or(0), interval),
            };
            usage.cpu_percent += sample.cpu_percent;
            usage.user_percent += sample.user_percent;

            pass.cpu_ranking.insert(cpu_nanos as f64, thread_id);
            if let Some(blocked_nanos) = blocked_nanos {
                pass.blocked_ranking.insert(blocked_nanos as f64, thread_id);
            }
            pass.samples.insert(thread_id, sample);
        }
        let purged = pass.end();
        pass.last_pass_at = Some(now);

        usage.cpu_percent /= processors;
        usage.user_percent /= processors;
        usage.system_percent = (usage.cpu_percent - usage.user_percent).max(0.0);
        usage.sampled_threads = pass.samples.len();
        usage.interval_ms = interval.map_or(0, |interval| interval.as_millis() as u64);
        match self.runtime.thread_counts() {
            Ok(counts) => {
                usage.live_threads = counts.live;
                usage.daemon_threads = counts.daemon;
                usage.peak_threads = counts.peak;
            }
            Err(error) => log::trace!("thread counts unavailable this interval: {error}"),
        }

        let describe = |thread_id: ThreadId| self.describe(thread_id);
        rank_threads(
            &pass.cpu_ranking,
            &pass.samples,
            RankingKind::Cpu,
            &self.top_threads,
            describe,
        );
        if self.contention_monitoring {
            rank_threads(
                &pass.blocked_ranking,
                &pass.samples,
                RankingKind::Blocked,
                &self.blocked_threads,
                describe,
            );
        } else {
            self.blocked_threads.clear_from(1);
        }

        log::debug!(
            "thread pass: {} threads, {:.1}% cpu, {} purged",
            usage.sampled_threads,
            usage.cpu_percent,
            purged
        );
        *self.usage.lock() = usage;
        Ok(usage)
    }

    fn describe(&self, thread_id: ThreadId) -> Option<(String, ThreadState)> {
        match self.runtime.thread_info(thread_id, 0) {
            Ok(info) => Some((info.name, info.state)),
            Err(error) => {
                log::trace!("no info for thread {thread_id}: {error}");
                None
            }
        }
    }

    /// Up to `max_frames` frames of the thread currently holding `rank`.
    pub fn stack_trace(
        &self,
        kind: RankingKind,
        rank: usize,
        max_frames: usize,
    ) -> Result<Vec<StackFrame>, ReadError> {
        let slots = match kind {
            RankingKind::Cpu => &self.top_threads,
            RankingKind::Blocked => &self.blocked_threads,
        };
        let thread_id = slots
            .read(rank, |slot| slot.thread_id)
            .flatten()
            .ok_or_else(|| ReadError::NotFound(format!("ranked thread #{rank}")))?;
        let mut info = self.runtime.thread_info(thread_id, max_frames)?;
        info.stack.truncate(max_frames);
        Ok(info.stack)
    }

    pub fn usage(&self) -> ThreadUsage {
        *self.usage.lock()
    }

    pub fn top_thread(&self, rank: usize) -> Option<ThreadSlot> {
        self.top_threads.get(rank)
    }

    pub fn blocked_thread(&self, rank: usize) -> Option<ThreadSlot> {
        self.blocked_threads.get(rank)
    }

    pub fn top_threads(&self) -> &Arc<SlotTable<ThreadSlot>> {
        &self.top_threads
    }

    pub fn blocked_threads(&self) -> &Arc<SlotTable<ThreadSlot>> {
        &self.blocked_threads
    }

    pub fn contention_monitoring(&self) -> bool {
        self.contention_monitoring
    }

    /// Number of threads with retained CPU history.
    pub fn tracked_threads(&self) -> usize {
        self.pass.lock().cpu.len()
    }

    pub fn health(&self) -> &ComponentHealth {
        &self.health
    }
}

fn percent_of_interval(nanos: u64, interval: Option<Duration>) -> f64 {
    match interval {
        Some(interval) => nanos as f64 / interval.as_nanos() as f64 * 100.0,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeRuntime, ManualClock};
    use pretty_assertions::assert_eq;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn tracker(
        runtime: &Arc<FakeRuntime>,
        clock: &Arc<ManualClock>,
        settings: CollectorSettings,
    ) -> ThreadUsageTracker {
        ThreadUsageTracker::new(runtime.clone(), clock.clone(), &settings)
    }

    fn ranked(slots: &SlotTable<ThreadSlot>) -> Vec<Option<ThreadId>> {
        slots.snapshot().iter().map(|slot| slot.thread_id).collect()
    }

    #[test]
    fn test_busiest_threads_ranked_by_interval_cpu() {
        let runtime = Arc::new(FakeRuntime::new(2));
        let clock = Arc::new(ManualClock::new());
        for id in 1..=3 {
            runtime.add_thread(id, &format!("worker-{id}"));
        }
        let tracker = tracker(
            &runtime,
            &clock,
            CollectorSettings {
                top_threads: 2,
                ..Default::default()
            },
        );
        assert_eq!(tracker.sample().unwrap().cpu_percent, 0.0);

        runtime.add_thread_times(1, ms(50), ms(40));
        runtime.add_thread_times(2, ms(30), ms(30));
        runtime.add_thread_times(3, ms(10), ms(0));
        clock.advance(ms(1000));
        let usage = tracker.sample().unwrap();

        assert_eq!(ranked(tracker.top_threads()), vec![Some(1), Some(2)]);
        let first = tracker.top_thread(1).unwrap();
        assert_eq!(first.name, "worker-1");
        assert_close(first.cpu_percent, 5.0);
        assert_close(tracker.top_thread(2).unwrap().cpu_percent, 3.0);

        // (5 + 3 + 1) / 2 processors, user (4 + 3 + 0) / 2.
        assert_close(usage.cpu_percent, 4.5);
        assert_close(usage.user_percent, 3.5);
        assert_close(usage.system_percent, 1.0);
        assert_eq!(usage.sampled_threads, 3);
        assert_eq!(usage.interval_ms, 1000);
        assert_eq!(usage.live_threads, 3);
        assert_eq!(tracker.usage(), usage);
    }

    #[test]
    fn test_dead_threads_are_purged() {
        let runtime = Arc::new(FakeRuntime::new(1));
        let clock = Arc::new(ManualClock::new());
        runtime.add_thread(1, "main");
        runtime.add_thread(2, "short-lived");
        let tracker = tracker(&runtime, &clock, CollectorSettings::default());

        tracker.sample().unwrap();
        assert_eq!(tracker.tracked_threads(), 2);

        runtime.remove_thread(2);
        runtime.add_thread_times(1, ms(5), ms(5));
        clock.advance(ms(500));
        tracker.sample().unwrap();

        assert_eq!(tracker.tracked_threads(), 1);
        assert_eq!(
            ranked(tracker.top_threads())[..2].to_vec(),
            vec![Some(1), None]
        );
    }

    #[test]
    fn test_unreadable_thread_does_not_abort_pass() {
        let runtime = Arc::new(FakeRuntime::new(1));
        let clock = Arc::new(ManualClock::new());
        runtime.add_thread(1, "healthy");
        runtime.add_thread(2, "flaky");
        let tracker = tracker(&runtime, &clock, CollectorSettings::default());
        tracker.sample().unwrap();

        runtime.fail_thread_reads(2);
        runtime.add_thread_times(1, ms(100), ms(100));
        clock.advance(ms(1000));
        let usage = tracker.sample().unwrap();

        assert_eq!(usage.sampled_threads, 1);
        assert_close(usage.cpu_percent, 10.0);
        assert_eq!(tracker.top_thread(1).unwrap().thread_id, Some(1));
        assert!(!tracker.health().is_disabled());
    }

    #[test]
    fn test_blocked_threads_ranked_and_idle_cleared() {
        let runtime = Arc::new(FakeRuntime::new(1));
        let clock = Arc::new(ManualClock::new());
        for id in 1..=3 {
            runtime.add_thread(id, &format!("t{id}"));
        }
        let tracker = tracker(
            &runtime,
            &clock,
            CollectorSettings {
                blocked_threads: 3,
                ..Default::default()
            },
        );
        tracker.sample().unwrap();

        runtime.add_blocked_time(2, ms(200));
        runtime.add_blocked_time(3, ms(100));
        clock.advance(ms(1000));
        tracker.sample().unwrap();
        assert_eq!(
            ranked(tracker.blocked_threads()),
            vec![Some(2), Some(3), None]
        );
        assert_close(tracker.blocked_thread(1).unwrap().blocked_percent, 20.0);

        // Thread 2 stops blocking; its old slot must not keep a stale figure.
        runtime.add_blocked_time(3, ms(50));
        clock.advance(ms(1000));
        tracker.sample().unwrap();
        assert_eq!(ranked(tracker.blocked_threads()), vec![Some(3), None, None]);
        assert_eq!(tracker.blocked_thread(2), Some(ThreadSlot::default()));
    }

    #[test]
    fn test_contention_monitoring_off_leaves_blocked_slots_cleared() {
        let runtime = Arc::new(FakeRuntime::new(1));
        let clock = Arc::new(ManualClock::new());
        runtime.add_thread(1, "t1");
        let tracker = tracker(
            &runtime,
            &clock,
            CollectorSettings {
                contention_monitoring: false,
                blocked_threads: 2,
                ..Default::default()
            },
        );
        runtime.add_blocked_time(1, ms(300));
        tracker.sample().unwrap();
        clock.advance(ms(100));
        runtime.add_blocked_time(1, ms(300));
        tracker.sample().unwrap();
        assert_eq!(ranked(tracker.blocked_threads()), vec![None, None]);
    }

    #[test]
    fn test_clock_standstill_skips_pass() {
        let runtime = Arc::new(FakeRuntime::new(1));
        let clock = Arc::new(ManualClock::new());
        runtime.add_thread(1, "t1");
        let tracker = tracker(&runtime, &clock, CollectorSettings::default());
        tracker.sample().unwrap();
        clock.advance(ms(1000));
        runtime.add_thread_times(1, ms(250), ms(0));
        let usage = tracker.sample().unwrap();

        runtime.add_thread_times(1, ms(900), ms(0));
        let repeated = tracker.sample().unwrap();
        assert_eq!(repeated, usage);
        assert!(repeated.cpu_percent.is_finite());
    }

    #[test]
    fn test_listing_failure_disables_tracker() {
        let runtime = Arc::new(FakeRuntime::new(1));
        let clock = Arc::new(ManualClock::new());
        let tracker = tracker(&runtime, &clock, CollectorSettings::default());
        runtime.fail_thread_listing(true);
        tracker.update();
        assert!(tracker.health().is_disabled());
        assert!(
            tracker
                .health()
                .failure()
                .unwrap()
                .contains("Failed to list live threads")
        );

        // Stays disabled even after the runtime recovers.
        runtime.fail_thread_listing(false);
        runtime.add_thread(1, "t1");
        tracker.update();
        assert_eq!(tracker.usage().sampled_threads, 0);
    }

    #[test]
    fn test_stack_trace_for_ranked_slot() {
        let runtime = Arc::new(FakeRuntime::new(1));
        let clock = Arc::new(ManualClock::new());
        runtime.add_thread(1, "t1");
        runtime.set_stack(
            1,
            vec![
                StackFrame::new("a.B", "inner"),
                StackFrame::new("a.B", "middle"),
                StackFrame::new("a.B", "outer"),
            ],
        );
        let tracker = tracker(&runtime, &clock, CollectorSettings::default());
        tracker.sample().unwrap();

        let frames = tracker.stack_trace(RankingKind::Cpu, 1, 2).unwrap();
        assert_eq!(
            frames,
            vec![StackFrame::new("a.B", "inner"), StackFrame::new("a.B", "middle")]
        );
        assert!(matches!(
            tracker.stack_trace(RankingKind::Cpu, 2, 5),
            Err(ReadError::NotFound(_))
        ));
    }
}
