//! Publishing of ranked threads into fixed slot tables.

use serde::Serialize;
use std::collections::HashMap;

use crate::rank_map::RankMap;
use crate::runtime::{ThreadId, ThreadState};
use crate::slots::SlotTable;

/// Interval figures of one thread, computed by the thread usage tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThreadSample {
    pub cpu_nanos: u64,
    pub user_nanos: u64,
    /// `None` when contention accounting is off or the read failed.
    pub blocked_nanos: Option<u64>,
    pub cpu_percent: f64,
    pub user_percent: f64,
    pub blocked_percent: f64,
}

/// One published rank. The default value is the cleared slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreadSlot {
    pub rank: usize,
    pub thread_id: Option<ThreadId>,
    pub name: String,
    pub state: Option<ThreadState>,
    pub cpu_percent: f64,
    pub user_percent: f64,
    pub blocked_percent: f64,
    pub cpu_nanos: u64,
    pub blocked_nanos: u64,
}

impl ThreadSlot {
    pub fn is_empty(&self) -> bool {
        self.thread_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingKind {
    Cpu,
    Blocked,
}

/// Fills `slots` from `ranking` in descending order and clears the slots
/// that remain. Returns the number of populated slots.
///
/// `describe` resolves a thread's name and state. Threads it cannot resolve
/// have exited since they were sampled and are passed over.
pub fn rank_threads(
    ranking: &RankMap<ThreadId>,
    samples: &HashMap<ThreadId, ThreadSample>,
    kind: RankingKind,
    slots: &SlotTable<ThreadSlot>,
    mut describe: impl FnMut(ThreadId) -> Option<(String, ThreadState)>,
) -> usize {
    let mut populated = 0;
    for (_, &thread_id) in ranking.iter_descending() {
        if populated == slots.len() {
            break;
        }
        let Some(sample) = samples.get(&thread_id) else {
            continue;
        };
        let blocked_nanos = sample.blocked_nanos.unwrap_or(0);
        // Descending order: every thread after the first idle one is idle too,
        // and their slots are cleared below.
        if kind == RankingKind::Blocked && blocked_nanos == 0 {
            break;
        }
        let Some((name, state)) = describe(thread_id) else {
            log::trace!("thread {thread_id} exited before it could be ranked");
            continue;
        };

        populated += 1;
        slots.set(
            populated,
            ThreadSlot {
                rank: populated,
                thread_id: Some(thread_id),
                name,
                state: Some(state),
                cpu_percent: sample.cpu_percent,
                user_percent: sample.user_percent,
                blocked_percent: sample.blocked_percent,
                cpu_nanos: sample.cpu_nanos,
                blocked_nanos,
            },
        );
    }
    slots.clear_from(populated + 1);
    populated
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(cpu_ms: u64, blocked_ms: u64) -> ThreadSample {
        ThreadSample {
            cpu_nanos: cpu_ms * 1_000_000,
            blocked_nanos: Some(blocked_ms * 1_000_000),
            cpu_percent: cpu_ms as f64 / 10.0,
            blocked_percent: blocked_ms as f64 / 10.0,
            ..Default::default()
        }
    }

    fn describe(id: ThreadId) -> Option<(String, ThreadState)> {
        Some((format!("worker-{id}"), ThreadState::Runnable))
    }

    fn ranked_ids(slots: &SlotTable<ThreadSlot>) -> Vec<Option<ThreadId>> {
        slots.snapshot().iter().map(|slot| slot.thread_id).collect()
    }

    #[test]
    fn test_fills_slots_in_descending_order() {
        let samples = HashMap::from_iter([(1, sample(10, 0)), (2, sample(50, 0)), (3, sample(30, 0))]);
        let mut ranking = RankMap::new();
        for (id, sample) in &samples {
            ranking.insert(sample.cpu_nanos as f64, *id);
        }
        let slots = SlotTable::new(2);

        assert_eq!(rank_threads(&ranking, &samples, RankingKind::Cpu, &slots, describe), 2);
        assert_eq!(ranked_ids(&slots), vec![Some(2), Some(3)]);
        let first = slots.get(1).unwrap();
        assert_eq!(first.rank, 1);
        assert_eq!(first.name, "worker-2");
        assert_eq!(first.state, Some(ThreadState::Runnable));
    }

    #[test]
    fn test_stale_slots_are_cleared() {
        let slots = SlotTable::new(3);
        slots.set(
            3,
            ThreadSlot {
                rank: 3,
                thread_id: Some(99),
                ..Default::default()
            },
        );

        let samples = HashMap::from_iter([(1, sample(5, 0))]);
        let mut ranking = RankMap::new();
        ranking.insert(5.0, 1);

        assert_eq!(rank_threads(&ranking, &samples, RankingKind::Cpu, &slots, describe), 1);
        assert_eq!(ranked_ids(&slots), vec![Some(1), None, None]);
        assert_eq!(slots.get(3), Some(ThreadSlot::default()));
    }

    #[test]
    fn test_blocked_ranking_clears_idle_threads() {
        let samples = HashMap::from_iter([(1, sample(5, 40)), (2, sample(5, 0)), (3, sample(5, 0))]);
        let mut ranking = RankMap::new();
        ranking.insert(40.0, 1);
        ranking.insert(0.0, 2);
        ranking.insert(0.0, 3);

        let slots = SlotTable::new(3);
        slots.set(
            2,
            ThreadSlot {
                rank: 2,
                thread_id: Some(2),
                blocked_percent: 12.5,
                ..Default::default()
            },
        );

        assert_eq!(
            rank_threads(&ranking, &samples, RankingKind::Blocked, &slots, describe),
            1
        );
        assert_eq!(ranked_ids(&slots), vec![Some(1), None, None]);
        assert_eq!(slots.get(1).unwrap().blocked_nanos, 40_000_000);
    }

    #[test]
    fn test_exited_threads_are_skipped() {
        let samples = HashMap::from_iter([(1, sample(30, 0)), (2, sample(20, 0)), (3, sample(10, 0))]);
        let mut ranking = RankMap::new();
        ranking.insert(30.0, 1);
        ranking.insert(20.0, 2);
        ranking.insert(10.0, 3);
        let slots = SlotTable::new(2);

        let populated = rank_threads(&ranking, &samples, RankingKind::Cpu, &slots, |id| {
            (id != 1).then(|| (format!("t{id}"), ThreadState::Waiting))
        });
        assert_eq!(populated, 2);
        assert_eq!(ranked_ids(&slots), vec![Some(2), Some(3)]);
        assert_eq!(slots.get(1).unwrap().rank, 1);
    }
}
