use ordered_float::OrderedFloat;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Sorted multi-map from a metric value to the entities sharing it.
///
/// Iteration is by descending metric. Entities with exactly the same metric
/// come out in the order they were inserted, which keeps rankings stable
/// from one interval to the next.
#[derive(Debug, Clone)]
pub struct RankMap<T> {
    buckets: BTreeMap<OrderedFloat<f64>, SmallVec<[T; 1]>>,
    len: usize,
}

impl<T> RankMap<T> {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    /// Adds `entity` under `metric`. NaN metrics cannot be ranked and are
    /// ignored.
    pub fn insert(&mut self, metric: f64, entity: T) {
        if metric.is_nan() {
            log::debug!("ignoring NaN metric in ranking");
            return;
        }
        // Collapse -0.0 onto 0.0 so both land in the same bucket.
        let metric = if metric == 0.0 { 0.0 } else { metric };
        self.buckets
            .entry(OrderedFloat(metric))
            .or_default()
            .push(entity);
        self.len += 1;
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All entries from highest to lowest metric.
    pub fn iter_descending(&self) -> impl Iterator<Item = (f64, &T)> + '_ {
        self.buckets
            .iter()
            .rev()
            .flat_map(|(metric, entities)| entities.iter().map(move |entity| (metric.0, entity)))
    }

    /// The `n` highest-ranked entries.
    pub fn top(&self, n: usize) -> impl Iterator<Item = (f64, &T)> + '_ {
        self.iter_descending().take(n)
    }
}

impl<T> Default for RankMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids<'a>(entries: impl Iterator<Item = (f64, &'a u64)>) -> Vec<u64> {
        entries.map(|(_, id)| *id).collect()
    }

    #[test]
    fn test_descending_order() {
        let mut map = RankMap::new();
        map.insert(10.0, 1u64);
        map.insert(50.0, 2);
        map.insert(30.0, 3);
        assert_eq!(ids(map.iter_descending()), vec![2, 3, 1]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut map = RankMap::new();
        map.insert(5.0, 40u64);
        map.insert(9.0, 10);
        map.insert(5.0, 20);
        map.insert(5.0, 30);
        map.insert(0.0, 50);
        map.insert(-0.0, 60);
        assert_eq!(ids(map.iter_descending()), vec![10, 40, 20, 30, 50, 60]);
    }

    #[test]
    fn test_flattened_order_is_non_increasing() {
        let mut map = RankMap::new();
        let metrics = [3.5, 1.0, 7.25, 3.5, 0.0, 12.0, 1.0, 7.25];
        for (id, metric) in metrics.iter().enumerate() {
            map.insert(*metric, id as u64);
        }
        let flattened: Vec<f64> = map.iter_descending().map(|(metric, _)| metric).collect();
        assert_eq!(flattened.len(), metrics.len());
        assert!(flattened.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[test]
    fn test_top_is_bounded_and_spans_buckets() {
        let mut map = RankMap::new();
        map.insert(2.0, 1u64);
        map.insert(2.0, 2);
        map.insert(1.0, 3);
        assert_eq!(ids(map.top(2)), vec![1, 2]);
        assert_eq!(ids(map.top(10)), vec![1, 2, 3]);
        assert_eq!(ids(map.top(0)), Vec::<u64>::new());
    }

    #[test]
    fn test_nan_is_ignored_and_clear_resets() {
        let mut map = RankMap::new();
        map.insert(f64::NAN, 1u64);
        assert!(map.is_empty());
        map.insert(1.0, 2);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter_descending().count(), 0);
    }
}
