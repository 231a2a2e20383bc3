//! Flat field schema of each metric group, for writers that emit one column
//! per attribute.

use crate::gc::GcStats;
use crate::hot_methods::HotMethodSlot;
use crate::memory_pools::PoolStats;
use crate::ranker::ThreadSlot;
use crate::thread_usage::ThreadUsage;

pub trait MetricRecord {
    /// Column names, in the order of [`MetricRecord::values`].
    const FIELDS: &'static [&'static str];

    fn values(&self) -> Vec<f64>;

    fn fields(&self) -> impl Iterator<Item = (&'static str, f64)> {
        Self::FIELDS.iter().copied().zip(self.values())
    }
}

impl MetricRecord for ThreadUsage {
    const FIELDS: &'static [&'static str] = &[
        "cpu_percent",
        "user_percent",
        "system_percent",
        "live_threads",
        "daemon_threads",
        "peak_threads",
        "sampled_threads",
        "interval_ms",
    ];

    fn values(&self) -> Vec<f64> {
        vec![
            self.cpu_percent,
            self.user_percent,
            self.system_percent,
            self.live_threads as f64,
            self.daemon_threads as f64,
            self.peak_threads as f64,
            self.sampled_threads as f64,
            self.interval_ms as f64,
        ]
    }
}

impl MetricRecord for PoolStats {
    const FIELDS: &'static [&'static str] = &[
        "rate_mb_per_sec",
        "used_mb",
        "committed_mb",
        "mean_used_mb",
        "mean_committed_mb",
        "mean_post_collection_used_mb",
        "mean_post_collection_committed_mb",
        "collections",
    ];

    fn values(&self) -> Vec<f64> {
        vec![
            self.rate_mb_per_sec,
            self.used_mb,
            self.committed_mb,
            self.mean_used_mb,
            self.mean_committed_mb,
            self.mean_post_collection_used_mb,
            self.mean_post_collection_committed_mb,
            self.collections as f64,
        ]
    }
}

impl MetricRecord for GcStats {
    const FIELDS: &'static [&'static str] = &[
        "overhead_percent",
        "young_collections",
        "young_collection_time_ms",
        "young_overhead_percent",
        "young_mean_pause_ms",
        "tenured_collections",
        "tenured_collection_time_ms",
        "tenured_overhead_percent",
        "tenured_mean_pause_ms",
    ];

    fn values(&self) -> Vec<f64> {
        let mut values = vec![self.overhead_percent];
        for generation in [&self.young, &self.tenured] {
            values.extend([
                generation.collections as f64,
                generation.collection_time_ms as f64,
                generation.overhead_percent,
                generation.mean_pause_ms,
            ]);
        }
        values
    }
}

/// Numeric columns of a ranked thread. A cleared slot reports thread id 0.
impl MetricRecord for ThreadSlot {
    const FIELDS: &'static [&'static str] = &[
        "rank",
        "thread_id",
        "cpu_percent",
        "user_percent",
        "blocked_percent",
        "cpu_nanos",
        "blocked_nanos",
    ];

    fn values(&self) -> Vec<f64> {
        vec![
            self.rank as f64,
            self.thread_id.map_or(0.0, |id| id as f64),
            self.cpu_percent,
            self.user_percent,
            self.blocked_percent,
            self.cpu_nanos as f64,
            self.blocked_nanos as f64,
        ]
    }
}

impl MetricRecord for HotMethodSlot {
    const FIELDS: &'static [&'static str] = &["rank", "thread_id", "load_percent", "cpu_nanos"];

    fn values(&self) -> Vec<f64> {
        vec![
            self.rank as f64,
            self.thread_id.map_or(0.0, |id| id as f64),
            self.load_percent,
            self.cpu_nanos as f64,
        ]
    }
}
