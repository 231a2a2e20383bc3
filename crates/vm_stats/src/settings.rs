//! Collector settings, read once at startup.
//!
//! Locating and reading the settings file is the job of the embedding
//! application; this module only defines the schema, its defaults and the
//! bounds every component relies on.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on every ranked list. Slot tables are allocated once with the
/// configured size, so this also bounds their memory.
pub const MAX_RANKED_SLOTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Period of the thread, memory and GC updates and of the hot method
    /// reduction.
    pub poll_interval_ms: u64,
    /// Period of hot method stack sampling.
    pub sample_interval_ms: u64,
    pub top_threads: usize,
    pub blocked_threads: usize,
    pub hot_methods: usize,
    /// Read per-thread blocked time and rank the most blocked threads.
    pub contention_monitoring: bool,
    pub hot_method_profiling: bool,
    /// Frames kept with each hot method for display.
    pub hot_method_stack_depth: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            sample_interval_ms: 20,
            top_threads: 10,
            blocked_threads: 10,
            hot_methods: 10,
            contention_monitoring: true,
            hot_method_profiling: true,
            hot_method_stack_depth: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("sample interval ({sample_ms} ms) must not exceed the poll interval ({poll_ms} ms)")]
    SampleSlowerThanPoll { sample_ms: u64, poll_ms: u64 },
    #[error("{name} is {value}, at most {max} slots are supported", max = MAX_RANKED_SLOTS)]
    TooManySlots { name: &'static str, value: usize },
}

impl CollectorSettings {
    /// Parses settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self =
            serde_json::from_str(json).context("Failed to parse collector settings")?;
        settings
            .validate()
            .context("Invalid collector settings")?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.poll_interval_ms == 0 {
            return Err(SettingsError::ZeroInterval("poll_interval_ms"));
        }
        if self.sample_interval_ms == 0 {
            return Err(SettingsError::ZeroInterval("sample_interval_ms"));
        }
        if self.sample_interval_ms > self.poll_interval_ms {
            return Err(SettingsError::SampleSlowerThanPoll {
                sample_ms: self.sample_interval_ms,
                poll_ms: self.poll_interval_ms,
            });
        }
        for (name, value) in [
            ("top_threads", self.top_threads),
            ("blocked_threads", self.blocked_threads),
            ("hot_methods", self.hot_methods),
        ] {
            if value > MAX_RANKED_SLOTS {
                return Err(SettingsError::TooManySlots { name, value });
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}
