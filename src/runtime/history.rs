//! Append-only history with an optional size bound.

use serde::{Deserialize, Serialize};

use std::collections::VecDeque;

/// Retention policy for snapshot sequences and alert history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    #[default]
    Unbounded,
    /// Keep at most this many entries, evicting the oldest first.
    Bounded(usize),
}

impl Retention {
    pub fn from_limit(limit: Option<usize>) -> Self {
        match limit {
            Some(n) => Self::Bounded(n.max(1)),
            None => Self::Unbounded,
        }
    }
}

#[derive(Debug, Clone)]
pub struct History<T> {
    items: VecDeque<T>,
    retention: Retention,
    evicted: u64,
}

impl<T> History<T> {
    pub fn new(retention: Retention) -> Self {
        Self {
            items: VecDeque::new(),
            retention,
            evicted: 0,
        }
    }

    pub fn push(&mut self, item: T) -> &T {
        if let Retention::Bounded(cap) = self.retention {
            while self.items.len() >= cap.max(1) {
                if self.items.pop_front().is_none() {
                    break;
                }
                self.evicted = self.evicted.saturating_add(1);
            }
        }
        self.items.push_back(item);
        &self.items[self.items.len() - 1]
    }

    /// Latest entry, pushing `make()` first when empty.
    pub fn last_or_push_with(&mut self, make: impl FnOnce() -> T) -> &T {
        if self.items.is_empty() {
            return self.push(make());
        }
        &self.items[self.items.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    /// Number of entries dropped by the retention bound.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.evicted = 0;
    }

    /// Contiguous view, oldest first.
    pub fn as_slice(&mut self) -> &[T] {
        self.items.make_contiguous()
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_keeps_everything_in_order() {
        let mut h = History::new(Retention::Unbounded);
        for i in 0..100 {
            h.push(i);
        }
        assert_eq!(h.len(), 100);
        assert_eq!(h.first(), Some(&0));
        assert_eq!(h.last(), Some(&99));
        assert_eq!(h.evicted(), 0);
    }

    #[test]
    fn bounded_evicts_oldest() {
        let mut h = History::new(Retention::Bounded(3));
        for i in 0..5 {
            h.push(i);
        }
        assert_eq!(h.to_vec(), vec![2, 3, 4]);
        assert_eq!(h.evicted(), 2);
    }

    #[test]
    fn last_or_push_with_only_fills_an_empty_history() {
        let mut h = History::new(Retention::Unbounded);
        assert_eq!(*h.last_or_push_with(|| 7), 7);
        assert_eq!(*h.last_or_push_with(|| 8), 7);
        h.push(9);
        assert_eq!(*h.last_or_push_with(|| 0), 9);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(Retention::from_limit(Some(0)), Retention::Bounded(1));
        assert_eq!(Retention::from_limit(None), Retention::Unbounded);
    }
}
