//! Identification of the young, survivor and tenured regions and of the
//! collectors responsible for them.
//!
//! Runtimes name their pools and collectors after the collector family in
//! use ("PS Eden Space", "G1 Old Gen", "Copy", "ConcurrentMarkSweep", ...).
//! The layout is discovered once by matching those names and the
//! collector-to-pool relationships.

use serde::Serialize;

use crate::runtime::{CollectorInfo, MemoryPoolInfo, PoolKind, ReadError, Runtime};

const YOUNG_POOL_PATTERNS: &[&str] = &["eden", "nursery"];
const SURVIVOR_POOL_PATTERNS: &[&str] = &["survivor"];
const TENURED_POOL_PATTERNS: &[&str] = &["old", "tenured"];
const YOUNG_COLLECTOR_PATTERNS: &[&str] =
    &["young", "scavenge", "copy", "parnew", "minor", "nursery"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum HeapRegion {
    Young,
    Survivor,
    Tenured,
}

impl HeapRegion {
    pub const ALL: [HeapRegion; 3] = [HeapRegion::Young, HeapRegion::Survivor, HeapRegion::Tenured];
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to query the runtime: {0}")]
    Runtime(#[from] ReadError),
    #[error("no {0} memory pool found")]
    MissingPool(HeapRegion),
    #[error("no collector manages the {region} pool {pool:?}")]
    MissingCollector { region: HeapRegion, pool: String },
}

/// Pool and collector names of the monitored heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLayout {
    pub young_pool: String,
    pub survivor_pool: String,
    pub tenured_pool: String,
    pub young_collector: String,
    pub tenured_collector: String,
}

impl HeapLayout {
    pub fn discover(runtime: &dyn Runtime) -> Result<Self, DiscoveryError> {
        let pools = runtime.memory_pools()?;
        let collectors = runtime.collectors()?;
        let layout = Self::from_parts(&pools, &collectors)?;
        log::info!(
            "heap layout: young {:?}, survivor {:?}, tenured {:?}, collectors {:?} / {:?}",
            layout.young_pool,
            layout.survivor_pool,
            layout.tenured_pool,
            layout.young_collector,
            layout.tenured_collector
        );
        Ok(layout)
    }

    pub fn from_parts(
        pools: &[MemoryPoolInfo],
        collectors: &[CollectorInfo],
    ) -> Result<Self, DiscoveryError> {
        let young_pool = find_pool(pools, HeapRegion::Young, YOUNG_POOL_PATTERNS)?;
        let survivor_pool = find_pool(pools, HeapRegion::Survivor, SURVIVOR_POOL_PATTERNS)?;
        let tenured_pool = find_pool(pools, HeapRegion::Tenured, TENURED_POOL_PATTERNS)?;

        let young_candidates: Vec<&CollectorInfo> = collectors
            .iter()
            .filter(|collector| collector.manages(&young_pool))
            .collect();
        let young_collector = young_candidates
            .iter()
            .find(|collector| !collector.manages(&tenured_pool))
            .or_else(|| {
                young_candidates
                    .iter()
                    .find(|collector| matches_any(&collector.name, YOUNG_COLLECTOR_PATTERNS))
            })
            .map(|collector| collector.name.clone())
            .ok_or_else(|| DiscoveryError::MissingCollector {
                region: HeapRegion::Young,
                pool: young_pool.clone(),
            })?;
        let tenured_collector = collectors
            .iter()
            .find(|collector| collector.name != young_collector && collector.manages(&tenured_pool))
            .map(|collector| collector.name.clone())
            .ok_or_else(|| DiscoveryError::MissingCollector {
                region: HeapRegion::Tenured,
                pool: tenured_pool.clone(),
            })?;

        Ok(Self {
            young_pool,
            survivor_pool,
            tenured_pool,
            young_collector,
            tenured_collector,
        })
    }

    pub fn pool(&self, region: HeapRegion) -> &str {
        match region {
            HeapRegion::Young => &self.young_pool,
            HeapRegion::Survivor => &self.survivor_pool,
            HeapRegion::Tenured => &self.tenured_pool,
        }
    }

    /// The collector whose collections empty `region`. Survivor space is
    /// turned over by young collections.
    pub fn collector(&self, region: HeapRegion) -> &str {
        match region {
            HeapRegion::Young | HeapRegion::Survivor => &self.young_collector,
            HeapRegion::Tenured => &self.tenured_collector,
        }
    }
}

fn find_pool(
    pools: &[MemoryPoolInfo],
    region: HeapRegion,
    patterns: &[&str],
) -> Result<String, DiscoveryError> {
    pools
        .iter()
        .filter(|pool| pool.kind == PoolKind::Heap)
        .find(|pool| matches_any(&pool.name, patterns))
        .map(|pool| pool.name.clone())
        .ok_or(DiscoveryError::MissingPool(region))
}

fn matches_any(name: &str, patterns: &[&str]) -> bool {
    let name = name.to_ascii_lowercase();
    patterns.iter().any(|pattern| name.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn heap(name: &str) -> MemoryPoolInfo {
        MemoryPoolInfo {
            name: name.into(),
            kind: PoolKind::Heap,
        }
    }

    fn collector(name: &str, pools: &[&str]) -> CollectorInfo {
        CollectorInfo {
            name: name.into(),
            pool_names: pools.iter().map(|pool| pool.to_string()).collect(),
        }
    }

    #[test]
    fn test_parallel_layout() {
        let pools = [
            MemoryPoolInfo {
                name: "Metaspace".into(),
                kind: PoolKind::NonHeap,
            },
            heap("PS Eden Space"),
            heap("PS Survivor Space"),
            heap("PS Old Gen"),
        ];
        let collectors = [
            collector("PS Scavenge", &["PS Eden Space", "PS Survivor Space"]),
            collector("PS MarkSweep", &["PS Eden Space", "PS Survivor Space", "PS Old Gen"]),
        ];
        assert_eq!(
            HeapLayout::from_parts(&pools, &collectors).unwrap(),
            HeapLayout {
                young_pool: "PS Eden Space".into(),
                survivor_pool: "PS Survivor Space".into(),
                tenured_pool: "PS Old Gen".into(),
                young_collector: "PS Scavenge".into(),
                tenured_collector: "PS MarkSweep".into(),
            }
        );
    }

    #[test]
    fn test_collectors_sharing_all_pools_use_names() {
        let pools = [heap("G1 Eden Space"), heap("G1 Survivor Space"), heap("G1 Old Gen")];
        let all = ["G1 Eden Space", "G1 Survivor Space", "G1 Old Gen"];
        let collectors = [
            collector("G1 Old Generation", &all),
            collector("G1 Young Generation", &all),
        ];
        let layout = HeapLayout::from_parts(&pools, &collectors).unwrap();
        assert_eq!(layout.young_collector, "G1 Young Generation");
        assert_eq!(layout.tenured_collector, "G1 Old Generation");
        assert_eq!(layout.collector(HeapRegion::Survivor), "G1 Young Generation");
        assert_eq!(layout.pool(HeapRegion::Tenured), "G1 Old Gen");
    }

    #[test]
    fn test_serial_layout() {
        let pools = [heap("Eden Space"), heap("Survivor Space"), heap("Tenured Gen")];
        let collectors = [
            collector("Copy", &["Eden Space", "Survivor Space"]),
            collector("MarkSweepCompact", &["Eden Space", "Survivor Space", "Tenured Gen"]),
        ];
        let layout = HeapLayout::from_parts(&pools, &collectors).unwrap();
        assert_eq!(layout.young_collector, "Copy");
        assert_eq!(layout.tenured_collector, "MarkSweepCompact");
    }

    #[test]
    fn test_missing_pool_or_collector() {
        let collectors = [collector("Copy", &["Eden Space"])];
        assert_eq!(
            HeapLayout::from_parts(&[heap("Eden Space"), heap("Old Gen")], &collectors),
            Err(DiscoveryError::MissingPool(HeapRegion::Survivor))
        );

        let pools = [heap("Eden Space"), heap("Survivor Space"), heap("Old Gen")];
        assert_eq!(
            HeapLayout::from_parts(&pools, &collectors),
            Err(DiscoveryError::MissingCollector {
                region: HeapRegion::Tenured,
                pool: "Old Gen".into(),
            })
        );
        assert_eq!(
            DiscoveryError::MissingPool(HeapRegion::Survivor).to_string(),
            "no survivor memory pool found"
        );
    }
}
