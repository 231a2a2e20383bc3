//! Live statistics of a garbage-collected runtime, computed from its
//! cumulative counters.
//!
//! Every metric is an interval figure: a counter reading is compared with the
//! reading retained from the previous tick. Threads are ranked by CPU and
//! blocked time, the hottest methods are found by stack sampling the busiest
//! threads, and the heap regions report allocation, survivor and promotion
//! rates together with collection overhead and pause times.
//!
//! The monitored process is reached through the [`Runtime`] trait and time
//! through the [`Clock`] trait. [`Collector`] wires all components together
//! and runs them on periodic tasks.

pub mod clock;
pub mod collector;
pub mod gc;
pub mod health;
pub mod heap_layout;
pub mod history;
pub mod hot_methods;
pub mod memory_pools;
pub mod rank_map;
pub mod ranker;
pub mod runtime;
pub mod schema;
pub mod settings;
pub mod slots;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod thread_usage;
pub mod usage_tracker;

pub use clock::{Clock, MonotonicClock};
pub use collector::Collector;
pub use gc::{GcOverheadCalculator, GcStats, GenerationStats};
pub use health::ComponentHealth;
pub use heap_layout::{DiscoveryError, HeapLayout, HeapRegion};
pub use hot_methods::{HotMethodProfiler, HotMethodSlot, MethodKey};
pub use memory_pools::{BYTES_PER_MB, MemoryPoolRates, PoolStats};
pub use ranker::{RankingKind, ThreadSlot};
pub use runtime::{ReadError, Runtime, StackFrame, ThreadId, ThreadState};
pub use schema::MetricRecord;
pub use settings::{CollectorSettings, SettingsError};
pub use thread_usage::{ThreadUsage, ThreadUsageTracker};
