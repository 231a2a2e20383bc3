//! Collection overhead and pause times of the young and tenured collectors.

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, interval_between};
use crate::health::ComponentHealth;
use crate::heap_layout::{DiscoveryError, HeapLayout, HeapRegion};
use crate::runtime::{CollectorCounters, ReadError, Runtime};

/// Figures of one collector generation over the last interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub collections: u64,
    pub collection_time_ms: u64,
    pub overhead_percent: f64,
    /// Kept from an earlier interval when no collection ran in this one.
    pub mean_pause_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GcStats {
    /// Young and tenured collection time combined.
    pub overhead_percent: f64,
    pub young: GenerationStats,
    pub tenured: GenerationStats,
}

/// Last successful reading of one collector. Only advanced by a successful
/// read, so a missed tick widens the next interval instead of losing it.
struct Baseline {
    collector: String,
    last: Option<(Duration, CollectorCounters)>,
}

impl Baseline {
    fn new(collector: &str) -> Self {
        Self {
            collector: collector.to_string(),
            last: None,
        }
    }
}

struct SampleState {
    last_pass_at: Option<Duration>,
    young: Baseline,
    tenured: Baseline,
}

pub struct GcOverheadCalculator {
    runtime: Arc<dyn Runtime>,
    clock: Arc<dyn Clock>,
    state: Mutex<SampleState>,
    stats: Mutex<GcStats>,
    health: ComponentHealth,
}

impl GcOverheadCalculator {
    pub fn new(runtime: Arc<dyn Runtime>, clock: Arc<dyn Clock>) -> Result<Self, DiscoveryError> {
        let layout = HeapLayout::discover(runtime.as_ref())?;
        Ok(Self::with_layout(runtime, clock, &layout))
    }

    pub fn with_layout(runtime: Arc<dyn Runtime>, clock: Arc<dyn Clock>, layout: &HeapLayout) -> Self {
        log::info!(
            "gc overhead calculator watching {:?} and {:?}",
            layout.collector(HeapRegion::Young),
            layout.collector(HeapRegion::Tenured)
        );
        Self {
            runtime,
            clock,
            state: Mutex::new(SampleState {
                last_pass_at: None,
                young: Baseline::new(layout.collector(HeapRegion::Young)),
                tenured: Baseline::new(layout.collector(HeapRegion::Tenured)),
            }),
            stats: Mutex::new(GcStats::default()),
            health: ComponentHealth::new("gc overhead calculator"),
        }
    }

    /// Update trigger for the periodic scheduler.
    pub fn update(&self) {
        self.health.guard(|| self.sample());
    }

    /// Reads both collectors and publishes the figures of the interval since
    /// each one's previous reading. The first reading only seeds; a sample
    /// taken before the clock advanced is discarded.
    ///
    /// A collector whose counters cannot be read this tick keeps its previous
    /// figures while the other one is still updated. Only a runtime that does
    /// not provide collector counters at all is an error.
    pub fn sample(&self) -> Result<GcStats> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        if let Some(previous) = state.last_pass_at {
            if interval_between(previous, now).is_none() {
                log::debug!("skipping gc update, clock did not advance");
                return Ok(self.stats());
            }
        }
        state.last_pass_at = Some(now);

        let mut stats = self.stats.lock();
        let young = self.advance(&mut state.young, now, stats.young)?;
        let tenured = self.advance(&mut state.tenured, now, stats.tenured)?;
        *stats = GcStats {
            overhead_percent: young.overhead_percent + tenured.overhead_percent,
            young,
            tenured,
        };
        log::debug!(
            "gc interval: {} young / {} tenured collections, {:.2}% overhead",
            young.collections,
            tenured.collections,
            stats.overhead_percent
        );
        Ok(*stats)
    }

    fn advance(
        &self,
        baseline: &mut Baseline,
        now: Duration,
        published: GenerationStats,
    ) -> Result<GenerationStats> {
        let counters = match self.runtime.collector_counters(&baseline.collector) {
            Ok(counters) => counters,
            Err(error @ ReadError::Unsupported(_)) => {
                return Err(error)
                    .with_context(|| format!("Failed to read collector {:?}", baseline.collector));
            }
            Err(error) => {
                log::trace!(
                    "collector {:?} not read this interval: {error}",
                    baseline.collector
                );
                return Ok(published);
            }
        };
        let Some((previous_at, previous)) = baseline.last.replace((now, counters)) else {
            return Ok(published);
        };
        let interval_ms = now.saturating_sub(previous_at).as_secs_f64() * 1000.0;
        Ok(generation(&previous, &counters, interval_ms, published))
    }

    pub fn stats(&self) -> GcStats {
        *self.stats.lock()
    }

    pub fn health(&self) -> &ComponentHealth {
        &self.health
    }
}

fn generation(
    previous: &CollectorCounters,
    current: &CollectorCounters,
    interval_ms: f64,
    last: GenerationStats,
) -> GenerationStats {
    let collections = current
        .collection_count
        .saturating_sub(previous.collection_count);
    let collection_time_ms = current
        .collection_time_ms
        .saturating_sub(previous.collection_time_ms);
    GenerationStats {
        collections,
        collection_time_ms,
        overhead_percent: percent(collection_time_ms, interval_ms),
        mean_pause_ms: if collections > 0 {
            collection_time_ms as f64 / collections as f64
        } else {
            last.mean_pause_ms
        },
    }
}

fn percent(time_ms: u64, interval_ms: f64) -> f64 {
    time_ms as f64 / interval_ms * 100.0
}
