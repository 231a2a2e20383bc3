//! Allocation, survivor and promotion rates of the heap regions.
//!
//! Each region combines two views. The poll-time view compares the region's
//! occupancy with the previous poll, which is exact as long as no collection
//! ran in between. Once collections ran, occupancy differences say nothing
//! about how much was allocated, and the churn recorded by the region's
//! [`UsageTracker`] is used instead.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, interval_between};
use crate::health::ComponentHealth;
use crate::heap_layout::{DiscoveryError, HeapLayout, HeapRegion};
use crate::runtime::{MemoryUsage, ReadError, Runtime};
use crate::usage_tracker::UsageTracker;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Published figures of one region. Sizes in MB, means over the last
/// interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub rate_mb_per_sec: f64,
    pub used_mb: f64,
    pub committed_mb: f64,
    /// High water mark estimate.
    pub mean_used_mb: f64,
    pub mean_committed_mb: f64,
    /// Low water mark estimate.
    pub mean_post_collection_used_mb: f64,
    pub mean_post_collection_committed_mb: f64,
    pub collections: u64,
}

#[derive(Debug, Clone, Copy)]
struct PoolReading {
    at: Duration,
    current: MemoryUsage,
    after_collection: MemoryUsage,
    /// Cumulative count of the region's collector, when it could be read.
    collection_count: Option<u64>,
}

pub struct PoolRateTracker {
    runtime: Arc<dyn Runtime>,
    clock: Arc<dyn Clock>,
    region: HeapRegion,
    usage: Arc<UsageTracker>,
    last: Mutex<Option<PoolReading>>,
    stats: Mutex<PoolStats>,
}

impl PoolRateTracker {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        clock: Arc<dyn Clock>,
        region: HeapRegion,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            runtime,
            clock,
            region,
            usage,
            last: Mutex::new(None),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Takes a reading and publishes the rate since the previous one, in
    /// MB/s. Returns `None` on the first reading and when the clock has not
    /// moved since the previous reading; nothing is published in the latter
    /// case.
    ///
    /// Only a failure to read the pool's current usage is an error. Without
    /// churn data the rate comes from the used difference as long as no
    /// collection is known to have run; otherwise the previous rate stays.
    pub fn update(&self) -> Result<Option<f64>, ReadError> {
        let mut last = self.last.lock();
        let now = self.clock.now();
        if let Some(previous) = last.as_ref() {
            if interval_between(previous.at, now).is_none() {
                log::debug!("skipping {} pool update, clock did not advance", self.region);
                return Ok(None);
            }
        }

        let usage = self.runtime.pool_usage(self.usage.pool())?;
        let churn = match self.usage.record_and_take() {
            Ok(churn) => Some(churn),
            Err(error) => {
                log::trace!("no {} churn data this interval: {error}", self.region);
                None
            }
        };
        let collection_count = match self.runtime.collector_counters(self.usage.collector()) {
            Ok(counters) => Some(counters.collection_count),
            Err(error) => {
                log::trace!("no {} collection count this interval: {error}", self.region);
                None
            }
        };
        let reading = PoolReading {
            at: now,
            current: usage.current,
            after_collection: usage.after_collection.unwrap_or_default(),
            collection_count,
        };
        let Some(previous) = last.replace(reading) else {
            *self.stats.lock() = PoolStats {
                used_mb: to_mb(reading.current.used),
                committed_mb: to_mb(reading.current.committed),
                ..Default::default()
            };
            return Ok(None);
        };

        let collections = match churn {
            Some(churn) => Some(churn.collections),
            None => previous
                .collection_count
                .zip(reading.collection_count)
                .map(|(previous, current)| current.saturating_sub(previous)),
        };
        let bytes = match (churn, collections) {
            (Some(churn), _) if churn.collections > 0 => Some(churn.bytes),
            (_, Some(0)) => Some(
                reading
                    .current
                    .used
                    .saturating_sub(previous.current.used),
            ),
            _ => None,
        };

        let mut stats = self.stats.lock();
        let rate_mb_per_sec = match bytes {
            Some(bytes) => bytes as f64 / (now - previous.at).as_secs_f64() / BYTES_PER_MB,
            None => {
                log::debug!("{} rate unknown this interval, keeping the previous one", self.region);
                stats.rate_mb_per_sec
            }
        };
        *stats = PoolStats {
            rate_mb_per_sec,
            used_mb: to_mb(reading.current.used),
            committed_mb: to_mb(reading.current.committed),
            mean_used_mb: mean_mb(reading.current.used, previous.current.used),
            mean_committed_mb: mean_mb(reading.current.committed, previous.current.committed),
            mean_post_collection_used_mb: mean_mb(
                reading.after_collection.used,
                previous.after_collection.used,
            ),
            mean_post_collection_committed_mb: mean_mb(
                reading.after_collection.committed,
                previous.after_collection.committed,
            ),
            collections: collections.unwrap_or(0),
        };
        Ok(Some(rate_mb_per_sec))
    }

    pub fn region(&self) -> HeapRegion {
        self.region
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    pub fn usage_tracker(&self) -> &Arc<UsageTracker> {
        &self.usage
    }
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

fn mean_mb(current: u64, previous: u64) -> f64 {
    (to_mb(current) + to_mb(previous)) / 2.0
}

/// Rate trackers for the young, survivor and tenured regions.
pub struct MemoryPoolRates {
    layout: HeapLayout,
    young: PoolRateTracker,
    survivor: PoolRateTracker,
    tenured: PoolRateTracker,
    health: ComponentHealth,
}

impl MemoryPoolRates {
    /// Discovers the heap layout and subscribes every region to the
    /// runtime's post-collection notifications. Regions whose subscription
    /// fails fall back to polling only.
    pub fn new(runtime: Arc<dyn Runtime>, clock: Arc<dyn Clock>) -> Result<Self, DiscoveryError> {
        let layout = HeapLayout::discover(runtime.as_ref())?;
        Ok(Self::with_layout(runtime, clock, layout))
    }

    pub fn with_layout(runtime: Arc<dyn Runtime>, clock: Arc<dyn Clock>, layout: HeapLayout) -> Self {
        let tracker = |region: HeapRegion| {
            let usage = Arc::new(UsageTracker::for_region(runtime.clone(), &layout, region));
            if let Err(error) =
                runtime.subscribe_collection_threshold(usage.pool(), usage.listener())
            {
                log::warn!(
                    "no collection notifications for the {region} pool, polling only: {error}"
                );
            }
            PoolRateTracker::new(runtime.clone(), clock.clone(), region, usage)
        };
        let young = tracker(HeapRegion::Young);
        let survivor = tracker(HeapRegion::Survivor);
        let tenured = tracker(HeapRegion::Tenured);
        Self {
            layout,
            young,
            survivor,
            tenured,
            health: ComponentHealth::new("memory pool rates"),
        }
    }

    /// Update trigger for the periodic scheduler.
    pub fn update(&self) {
        self.health.guard(|| {
            self.refresh();
            Ok(())
        });
    }

    /// Updates every region. A region that cannot be read keeps its previous
    /// figures; the others are unaffected.
    pub fn refresh(&self) {
        for tracker in self.trackers() {
            if let Err(error) = tracker.update() {
                log::trace!("{} pool not updated this interval: {error}", tracker.region());
            }
        }
    }

    pub fn pool(&self, region: HeapRegion) -> PoolStats {
        self.tracker(region).stats()
    }

    pub fn allocation_rate(&self) -> f64 {
        self.young.stats().rate_mb_per_sec
    }

    pub fn survivor_rate(&self) -> f64 {
        self.survivor.stats().rate_mb_per_sec
    }

    pub fn promotion_rate(&self) -> f64 {
        self.tenured.stats().rate_mb_per_sec
    }

    pub fn tracker(&self, region: HeapRegion) -> &PoolRateTracker {
        match region {
            HeapRegion::Young => &self.young,
            HeapRegion::Survivor => &self.survivor,
            HeapRegion::Tenured => &self.tenured,
        }
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn health(&self) -> &ComponentHealth {
        &self.health
    }

    fn trackers(&self) -> [&PoolRateTracker; 3] {
        [&self.young, &self.survivor, &self.tenured]
    }
}
