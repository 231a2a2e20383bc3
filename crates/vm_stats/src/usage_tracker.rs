//! Event-driven churn accounting for one heap region.
//!
//! Polling alone misses memory that is allocated and collected several times
//! between two polls. The tracker is therefore invoked from two places: the
//! periodic poll and the runtime's post-collection threshold notifications.
//! Each invocation estimates the bytes turned over by the collections that
//! happened since the previous invocation and adds them to a running total.
//! The total only grows until [`UsageTracker::take`] reads and resets it,
//! and both happen under the same lock, so interleaved notifications and
//! polls neither lose nor double count a collection.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::heap_layout::{HeapLayout, HeapRegion};
use crate::runtime::{ReadError, Runtime, ThresholdListener};

/// How a region's occupancy relates to its collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnMode {
    /// The region is emptied by each collection and refilled afterwards
    /// (young, tenured). Each cycle turns over the peak minus what was left
    /// after the previous collection.
    ResetByCollection,
    /// The region keeps what survives each collection (survivor). Each cycle
    /// turns over the post-collection occupancy.
    AccumulatesAcrossCollections,
}

impl ChurnMode {
    pub fn for_region(region: HeapRegion) -> Self {
        match region {
            HeapRegion::Young | HeapRegion::Tenured => ChurnMode::ResetByCollection,
            HeapRegion::Survivor => ChurnMode::AccumulatesAcrossCollections,
        }
    }
}

/// Churn accumulated since the last [`UsageTracker::take`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Churn {
    pub bytes: u64,
    pub collections: u64,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    collection_count: u64,
    post_collection_used: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    baseline: Option<Baseline>,
    pending: Churn,
}

pub struct UsageTracker {
    runtime: Arc<dyn Runtime>,
    pool: String,
    collector: String,
    mode: ChurnMode,
    state: Mutex<TrackerState>,
}

impl UsageTracker {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        pool: impl Into<String>,
        collector: impl Into<String>,
        mode: ChurnMode,
    ) -> Self {
        Self {
            runtime,
            pool: pool.into(),
            collector: collector.into(),
            mode,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn for_region(runtime: Arc<dyn Runtime>, layout: &HeapLayout, region: HeapRegion) -> Self {
        Self::new(
            runtime,
            layout.pool(region),
            layout.collector(region),
            ChurnMode::for_region(region),
        )
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn collector(&self) -> &str {
        &self.collector
    }

    /// Accounts for the collections since the previous invocation and resets
    /// the pool's peak watermark. The first invocation only sets the baseline.
    pub fn record(&self) -> Result<(), ReadError> {
        let mut state = self.state.lock();
        self.record_locked(&mut state)
    }

    /// Returns the accumulated churn and resets it.
    pub fn take(&self) -> Churn {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// [`Self::record`] followed by [`Self::take`] without releasing the lock.
    /// On a read failure nothing is taken; the pending churn stays for the
    /// next successful call.
    pub fn record_and_take(&self) -> Result<Churn, ReadError> {
        let mut state = self.state.lock();
        self.record_locked(&mut state)?;
        Ok(std::mem::take(&mut state.pending))
    }

    /// Listener for the runtime's post-collection notifications. Holds the
    /// tracker weakly so a subscription does not keep it alive.
    pub fn listener(self: &Arc<Self>) -> ThresholdListener {
        let tracker: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |pool: &str| {
            if let Some(tracker) = tracker.upgrade() {
                if let Err(error) = tracker.record() {
                    log::trace!("collection notification for {pool:?} not recorded: {error}");
                }
            }
        })
    }

    fn record_locked(&self, state: &mut TrackerState) -> Result<(), ReadError> {
        let usage = self.runtime.pool_usage(&self.pool)?;
        let counters = self.runtime.collector_counters(&self.collector)?;
        let post_collection_used = usage
            .after_collection
            .ok_or(ReadError::Unsupported("post-collection usage"))?
            .used;

        if let Some(baseline) = state.baseline {
            let collections = counters
                .collection_count
                .saturating_sub(baseline.collection_count);
            if collections > 0 {
                let per_collection = match self.mode {
                    ChurnMode::ResetByCollection => usage
                        .peak_used
                        .saturating_sub(baseline.post_collection_used),
                    ChurnMode::AccumulatesAcrossCollections => post_collection_used,
                };
                state.pending.bytes = state
                    .pending
                    .bytes
                    .saturating_add(per_collection.saturating_mul(collections));
                state.pending.collections += collections;
            }
        }
        state.baseline = Some(Baseline {
            collection_count: counters.collection_count,
            post_collection_used,
        });
        self.runtime.reset_peak_usage(&self.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeRuntime, PARALLEL_EDEN, PARALLEL_SCAVENGE, PARALLEL_SURVIVOR};
    use pretty_assertions::assert_eq;

    const MIB: u64 = 1024 * 1024;

    fn young_tracker(runtime: &Arc<FakeRuntime>) -> Arc<UsageTracker> {
        Arc::new(UsageTracker::new(
            runtime.clone(),
            PARALLEL_EDEN,
            PARALLEL_SCAVENGE,
            ChurnMode::ResetByCollection,
        ))
    }

    #[test]
    fn test_young_churn_is_weighted_by_collections() {
        let runtime = Arc::new(FakeRuntime::with_parallel_heap(2));
        runtime.set_collection_usage(PARALLEL_EDEN, 2 * MIB, 64 * MIB);
        let tracker = young_tracker(&runtime);
        tracker.record().unwrap();
        assert_eq!(tracker.take(), Churn::default());

        runtime.set_peak_used(PARALLEL_EDEN, 12 * MIB);
        runtime.record_collections(PARALLEL_SCAVENGE, 3, 15);
        assert_eq!(
            tracker.record_and_take().unwrap(),
            Churn {
                bytes: 30 * MIB,
                collections: 3,
            }
        );
        assert_eq!(tracker.take(), Churn::default());
    }

    #[test]
    fn test_survivor_churn_uses_post_collection_occupancy() {
        let runtime = Arc::new(FakeRuntime::with_parallel_heap(2));
        let tracker = UsageTracker::new(
            runtime.clone(),
            PARALLEL_SURVIVOR,
            PARALLEL_SCAVENGE,
            ChurnMode::for_region(HeapRegion::Survivor),
        );
        tracker.record().unwrap();

        runtime.set_collection_usage(PARALLEL_SURVIVOR, 4 * MIB, 8 * MIB);
        runtime.record_collections(PARALLEL_SCAVENGE, 2, 10);
        assert_eq!(tracker.record_and_take().unwrap().bytes, 8 * MIB);
    }

    #[test]
    fn test_no_collection_means_no_churn_and_peak_is_reset() {
        let runtime = Arc::new(FakeRuntime::with_parallel_heap(2));
        let tracker = young_tracker(&runtime);
        tracker.record().unwrap();
        runtime.set_peak_used(PARALLEL_EDEN, 40 * MIB);
        tracker.record().unwrap();
        assert_eq!(tracker.take(), Churn::default());
        assert_eq!(runtime.peak_resets(PARALLEL_EDEN), 2);
    }

    #[test]
    fn test_notification_and_poll_do_not_double_count() {
        let runtime = Arc::new(FakeRuntime::with_parallel_heap(2));
        runtime.set_collection_usage(PARALLEL_EDEN, MIB, 64 * MIB);
        let tracker = young_tracker(&runtime);
        runtime
            .subscribe_collection_threshold(PARALLEL_EDEN, tracker.listener())
            .unwrap();
        tracker.record().unwrap();

        runtime.set_peak_used(PARALLEL_EDEN, 5 * MIB);
        runtime.record_collections(PARALLEL_SCAVENGE, 1, 3);
        runtime.fire_collection_threshold(PARALLEL_EDEN);

        // The poll right after the notification sees no new collection.
        assert_eq!(
            tracker.record_and_take().unwrap(),
            Churn {
                bytes: 4 * MIB,
                collections: 1,
            }
        );
    }

    #[test]
    fn test_failed_read_keeps_pending_churn() {
        let runtime = Arc::new(FakeRuntime::with_parallel_heap(2));
        let tracker = young_tracker(&runtime);
        tracker.record().unwrap();
        runtime.set_peak_used(PARALLEL_EDEN, 3 * MIB);
        runtime.record_collections(PARALLEL_SCAVENGE, 1, 1);
        tracker.record().unwrap();

        runtime.remove_pool(PARALLEL_EDEN);
        assert!(matches!(tracker.record_and_take(), Err(ReadError::NotFound(_))));
        assert_eq!(tracker.take().collections, 1);
    }

    #[test]
    fn test_concurrent_notifications_lose_no_collection() {
        let runtime = Arc::new(FakeRuntime::with_parallel_heap(2));
        let tracker = young_tracker(&runtime);
        tracker.record().unwrap();

        let notifiers: Vec<_> = (0..4)
            .map(|_| {
                let runtime = runtime.clone();
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        runtime.record_collections(PARALLEL_SCAVENGE, 1, 1);
                        tracker.record().unwrap();
                    }
                })
            })
            .collect();

        let mut collections = 0;
        while notifiers.iter().any(|notifier| !notifier.is_finished()) {
            collections += tracker.record_and_take().unwrap().collections;
        }
        for notifier in notifiers {
            notifier.join().unwrap();
        }
        collections += tracker.record_and_take().unwrap().collections;
        assert_eq!(collections, 1000);
    }

    #[test]
    fn test_listener_does_not_keep_tracker_alive() {
        let runtime = Arc::new(FakeRuntime::with_parallel_heap(2));
        let tracker = young_tracker(&runtime);
        let listener = tracker.listener();
        drop(tracker);
        listener(PARALLEL_EDEN);
    }
}
