//! Ordering of transaction participants by commit position

use std::collections::BTreeMap;

/// Items grouped by an integer position, ascending, insertion order inside
/// a group.
#[derive(Debug, Clone)]
pub struct Scheduler<T> {
    groups: BTreeMap<i32, Vec<T>>,
    len: usize,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            len: 0,
        }
    }

    pub fn add(&mut self, item: T, position: i32) {
        self.groups.entry(position).or_default().push(item);
        self.len += 1;
    }

    /// Remove every item matching `predicate`, returns how many were removed
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.len;
        for items in self.groups.values_mut() {
            items.retain(|item| !predicate(item));
        }
        self.groups.retain(|_, items| !items.is_empty());
        self.len = self.groups.values().map(Vec::len).sum();
        before - self.len
    }

    /// Distinct positions, ascending
    pub fn priorities(&self) -> Vec<i32> {
        self.groups.keys().copied().collect()
    }

    pub fn by_priority(&self, position: i32) -> &[T] {
        self.groups.get(&position).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.groups.values().flat_map(|items| items.iter())
    }

    /// Last position first, last inserted first
    pub fn iter_reverse(&self) -> impl Iterator<Item = &T> {
        self.groups.values().rev().flat_map(|items| items.iter().rev())
    }

    pub fn groups(&self) -> impl Iterator<Item = (i32, &[T])> {
        self.groups.iter().map(|(p, items)| (*p, items.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<(T, i32)> for Scheduler<T> {
    fn from_iter<I: IntoIterator<Item = (T, i32)>>(iter: I) -> Self {
        let mut scheduler = Scheduler::new();
        for (item, position) in iter {
            scheduler.add(item, position);
        }
        scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouped_iteration_order() {
        let mut scheduler = Scheduler::new();
        scheduler.add("a", 1);
        scheduler.add("b", 1);
        scheduler.add("c", 1);
        scheduler.add("d", 0);
        scheduler.add("e", 10);

        assert_eq!(scheduler.priorities(), vec![0, 1, 10]);
        assert_eq!(scheduler.by_priority(0), &["d"]);
        assert_eq!(scheduler.by_priority(1), &["a", "b", "c"]);
        assert_eq!(scheduler.by_priority(10), &["e"]);
        assert!(scheduler.by_priority(5).is_empty());

        let order: Vec<_> = scheduler.iter().copied().collect();
        assert_eq!(order, vec!["d", "a", "b", "c", "e"]);
        assert_eq!(scheduler.len(), 5);
    }

    #[test]
    fn test_reverse_iteration() {
        let scheduler: Scheduler<&str> = vec![("a", 1), ("b", 1), ("z", 0)].into_iter().collect();
        let order: Vec<_> = scheduler.iter_reverse().copied().collect();
        assert_eq!(order, vec!["b", "a", "z"]);
    }

    #[test]
    fn test_remove_drops_empty_groups() {
        let mut scheduler = Scheduler::new();
        scheduler.add(1, 0);
        scheduler.add(2, 5);
        scheduler.add(3, 5);

        assert_eq!(scheduler.remove_where(|v| *v == 1), 1);
        assert_eq!(scheduler.priorities(), vec![5]);
        assert_eq!(scheduler.len(), 2);
    }
}
