use parking_lot::Mutex;

/// Fixed set of ranked slots, allocated once and rewritten every interval.
///
/// Ranks are 1-based. Every slot has its own lock, so a reader of rank 3
/// never waits for a writer of rank 1. `S::default()` is the cleared state.
#[derive(Debug)]
pub struct SlotTable<S> {
    slots: Box<[Mutex<S>]>,
}

impl<S: Clone + Default> SlotTable<S> {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Mutex::new(S::default())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Copy of the slot at `rank`, or `None` if the rank is out of range.
    pub fn get(&self, rank: usize) -> Option<S> {
        self.slot(rank).map(|slot| slot.lock().clone())
    }

    /// Reads one attribute of the slot at `rank` under its lock.
    pub fn read<R>(&self, rank: usize, read: impl FnOnce(&S) -> R) -> Option<R> {
        self.slot(rank).map(|slot| read(&slot.lock()))
    }

    /// Overwrites the slot at `rank`. Out-of-range ranks are ignored.
    pub fn set(&self, rank: usize, value: S) {
        if let Some(slot) = self.slot(rank) {
            *slot.lock() = value;
        }
    }

    /// Resets every slot from `rank` to the end.
    pub fn clear_from(&self, rank: usize) {
        for slot in self.slots.iter().skip(rank.saturating_sub(1)) {
            *slot.lock() = S::default();
        }
    }

    /// Copies of all slots in rank order.
    pub fn snapshot(&self) -> Vec<S> {
        self.slots.iter().map(|slot| slot.lock().clone()).collect()
    }

    fn slot(&self, rank: usize) -> Option<&Mutex<S>> {
        rank.checked_sub(1).and_then(|index| self.slots.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ranks_are_one_based() {
        let table = SlotTable::<u32>::new(3);
        table.set(1, 10);
        table.set(3, 30);
        table.set(0, 99);
        table.set(4, 99);
        assert_eq!(table.snapshot(), vec![10, 0, 30]);
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(3), Some(30));
        assert_eq!(table.read(1, |value| value * 2), Some(20));
    }

    #[test]
    fn test_clear_from() {
        let table = SlotTable::<u32>::new(4);
        for rank in 1..=4 {
            table.set(rank, rank as u32);
        }
        table.clear_from(3);
        assert_eq!(table.snapshot(), vec![1, 2, 0, 0]);
        table.clear_from(1);
        assert_eq!(table.snapshot(), vec![0; 4]);
    }
}
