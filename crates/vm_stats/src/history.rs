//! Per-entity counter history used to turn cumulative counters into
//! per-interval deltas.
//!
//! Sampling happens in passes. [`CounterHistory::begin_pass`] marks every
//! record inactive, [`CounterHistory::update`] marks the entities observed in
//! the pass active again, and [`CounterHistory::end_pass`] drops whatever was
//! not observed. Dead threads therefore cost nothing after the pass in which
//! they disappear.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

/// One reading of a monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub value: u64,
    pub observed_at: Duration,
}

impl Snapshot {
    pub fn new(value: u64, observed_at: Duration) -> Self {
        Self { value, observed_at }
    }
}

/// Growth of a counter since the previous snapshot of the same entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub amount: u64,
    /// Time between the two snapshots. `None` on first sight.
    pub elapsed: Option<Duration>,
}

impl CounterDelta {
    pub fn is_first_sight(&self) -> bool {
        self.elapsed.is_none()
    }
}

#[derive(Debug)]
struct HistoryRecord {
    last: Snapshot,
    /// Pass in which the entity was last observed. The record is active when
    /// this equals the current pass.
    seen_in_pass: u64,
}

pub struct CounterHistory<K> {
    records: HashMap<K, HistoryRecord>,
    pass: u64,
    observed_this_pass: usize,
}

impl<K: Hash + Eq + Clone + fmt::Debug> CounterHistory<K> {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            pass: 0,
            observed_this_pass: 0,
        }
    }

    /// Starts a pass. Every record becomes inactive until it is updated again.
    pub fn begin_pass(&mut self) {
        self.pass = self.pass.wrapping_add(1);
        self.observed_this_pass = 0;
    }

    /// Records `snapshot` for `key` and returns the growth since the previous
    /// snapshot. The first snapshot of an entity yields a zero delta, and a
    /// counter that went backwards yields zero instead of a negative delta.
    pub fn update(&mut self, key: K, snapshot: Snapshot) -> CounterDelta {
        let pass = self.pass;
        match self.records.entry(key) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.seen_in_pass != pass {
                    record.seen_in_pass = pass;
                    self.observed_this_pass += 1;
                }
                let previous = std::mem::replace(&mut record.last, snapshot);
                if snapshot.value < previous.value {
                    log::trace!(
                        "counter of {:?} went backwards ({} -> {}), reporting no growth",
                        entry.key(),
                        previous.value,
                        snapshot.value
                    );
                }
                CounterDelta {
                    amount: snapshot.value.saturating_sub(previous.value),
                    elapsed: Some(snapshot.observed_at.saturating_sub(previous.observed_at)),
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(HistoryRecord {
                    last: snapshot,
                    seen_in_pass: pass,
                });
                self.observed_this_pass += 1;
                CounterDelta::default()
            }
        }
    }

    /// Ends a pass, dropping every record that was not updated during it.
    /// Returns the number of records dropped.
    ///
    /// The map only ever holds entities seen in the previous or the current
    /// pass, so the sweep is proportional to the live population.
    pub fn end_pass(&mut self) -> usize {
        if self.observed_this_pass == self.records.len() {
            return 0;
        }
        let before = self.records.len();
        let pass = self.pass;
        self.records.retain(|_, record| record.seen_in_pass == pass);
        before - self.records.len()
    }

    pub fn last(&self, key: &K) -> Option<Snapshot> {
        self.records.get(key).map(|record| record.last)
    }

    /// Whether `key` has been observed in the current pass.
    pub fn is_active(&self, key: &K) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| record.seen_in_pass == self.pass)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug> Default for CounterHistory<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for CounterHistory<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterHistory")
            .field("pass", &self.pass)
            .field("records", &self.records.len())
            .finish()
    }
}
