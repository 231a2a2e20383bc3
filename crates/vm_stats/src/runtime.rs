//! Introspection interface of the monitored runtime.
//!
//! Everything the engine knows about the monitored process comes through the
//! [`Runtime`] trait. Implementations wrap whatever attach or management
//! protocol is in use; the engine only sees counters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type ThreadId = u64;

/// Why a counter could not be read.
///
/// "Unavailable" is always distinct from a zero reading: callers skip the
/// entity for the current tick instead of treating it as idle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The entity no longer exists (a thread exited, a pool went away).
    #[error("{0} not found")]
    NotFound(String),
    /// The runtime does not provide this counter.
    #[error("{0} is not supported by the runtime")]
    Unsupported(&'static str),
    #[error("read failed: {0}")]
    Failed(String),
}

impl ReadError {
    pub fn thread_not_found(id: ThreadId) -> Self {
        Self::NotFound(format!("thread {id}"))
    }

    pub fn pool_not_found(name: &str) -> Self {
        Self::NotFound(format!("memory pool {name:?}"))
    }

    pub fn collector_not_found(name: &str) -> Self {
        Self::NotFound(format!("collector {name:?}"))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

/// Cumulative CPU counters of one thread, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTimes {
    pub cpu_nanos: u64,
    pub user_nanos: u64,
}

/// One frame of a captured stack, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
}

impl StackFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: None,
            line_number: None,
        }
    }

    pub fn with_location(mut self, file_name: impl Into<String>, line_number: u32) -> Self {
        self.file_name = Some(file_name.into());
        self.line_number = Some(line_number);
        self
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.method_name)?;
        match (&self.file_name, self.line_number) {
            (Some(file), Some(line)) => write!(f, "({file}:{line})"),
            (Some(file), None) => write!(f, "({file})"),
            _ => write!(f, "(Unknown Source)"),
        }
    }
}

/// Identity, state and (optionally) stack of a live thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    /// Innermost frame first. Empty when the caller asked for zero frames.
    pub stack: Vec<StackFrame>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCounts {
    pub live: u32,
    pub daemon: u32,
    pub peak: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub committed: u64,
}

/// All occupancy readings of one memory pool taken at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub current: MemoryUsage,
    /// Usage right after the most recent collection of the pool, if the
    /// runtime tracks it for this pool.
    pub after_collection: Option<MemoryUsage>,
    /// Highest used value since the last peak reset.
    pub peak_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    Heap,
    NonHeap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPoolInfo {
    pub name: String,
    pub kind: PoolKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorInfo {
    pub name: String,
    /// Names of the memory pools this collector manages.
    pub pool_names: Vec<String>,
}

impl CollectorInfo {
    pub fn manages(&self, pool: &str) -> bool {
        self.pool_names.iter().any(|name| name == pool)
    }
}

/// Cumulative totals of one collector since the runtime started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorCounters {
    pub collection_count: u64,
    pub collection_time_ms: u64,
}

/// Callback fired by the runtime when a pool's post-collection usage crosses
/// its threshold. Receives the pool name. Runs on the runtime's notification
/// thread.
pub type ThresholdListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Read access to the monitored runtime.
///
/// All methods may be called concurrently from several collector threads.
pub trait Runtime: Send + Sync {
    fn available_processors(&self) -> usize;

    fn thread_ids(&self) -> Result<Vec<ThreadId>, ReadError>;

    fn thread_counts(&self) -> Result<ThreadCounts, ReadError>;

    fn thread_times(&self, id: ThreadId) -> Result<ThreadTimes, ReadError>;

    /// Cumulative time the thread spent blocked on monitor entry, in
    /// nanoseconds. Only read when contention accounting is enabled.
    fn thread_blocked_nanos(&self, id: ThreadId) -> Result<u64, ReadError>;

    /// Returns at most `max_frames` frames of the thread's stack.
    fn thread_info(&self, id: ThreadId, max_frames: usize) -> Result<ThreadInfo, ReadError>;

    fn memory_pools(&self) -> Result<Vec<MemoryPoolInfo>, ReadError>;

    fn pool_usage(&self, pool: &str) -> Result<PoolUsage, ReadError>;

    fn reset_peak_usage(&self, pool: &str) -> Result<(), ReadError>;

    fn collectors(&self) -> Result<Vec<CollectorInfo>, ReadError>;

    fn collector_counters(&self, collector: &str) -> Result<CollectorCounters, ReadError>;

    /// Registers `listener` to run after every collection of `pool`.
    fn subscribe_collection_threshold(
        &self,
        pool: &str,
        listener: ThresholdListener,
    ) -> Result<(), ReadError>;
}
