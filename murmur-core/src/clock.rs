use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Per-node logical clock used to track causal relationships between writes.
///
/// A node only ever increments its own entry; merging takes the pointwise
/// maximum, so a clock never moves backwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock {
    clocks: HashMap<String, u64>,
}

impl VectorClock {
    /// Create an empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the entry for `node_id`, returning the new counter value.
    pub fn tick(&mut self, node_id: &str) -> u64 {
        let entry = self.clocks.entry(node_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Counter recorded for `node_id`, zero when absent.
    #[must_use]
    pub fn counter(&self, node_id: &str) -> u64 {
        self.clocks.get(node_id).copied().unwrap_or(0)
    }

    /// Merge another clock into this one, keeping the maximum for each node.
    pub fn merge(&mut self, other: &Self) {
        for (node, &clock) in &other.clocks {
            let entry = self.clocks.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(clock);
        }
    }

    /// Compare two clocks to determine their causal relationship.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrdering {
        let mut less = false;
        let mut greater = false;
        let nodes: HashSet<_> = self
            .clocks
            .keys()
            .chain(other.clocks.keys())
            .cloned()
            .collect();

        for node in nodes {
            let left = self.clocks.get(&node).copied().unwrap_or(0);
            let right = other.clocks.get(&node).copied().unwrap_or(0);
            if left < right {
                less = true;
            } else if left > right {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrdering::Equal,
            (true, false) => CausalOrdering::Less,
            (false, true) => CausalOrdering::Greater,
            (true, true) => CausalOrdering::Concurrent,
        }
    }

    /// `true` when this clock happened-before `other`.
    #[must_use]
    pub fn happens_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrdering::Less
    }

    /// Number of nodes with a recorded counter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// `true` when no node has ticked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

/// Relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrdering {
    /// `self` happened-before `other`.
    Less,
    /// Clocks are identical.
    Equal,
    /// `self` happened-after `other`.
    Greater,
    /// Neither clock dominates; the updates were concurrent.
    Concurrent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_monotonic() {
        let mut clock = VectorClock::new();
        let mut previous = 0;
        for _ in 0..64 {
            let next = clock.tick("node-a");
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn merge_keeps_pointwise_maximum() {
        let mut left = VectorClock::new();
        let mut right = VectorClock::new();
        left.tick("node-a");
        left.tick("node-a");
        right.tick("node-a");
        right.tick("node-b");

        left.merge(&right);
        assert_eq!(left.counter("node-a"), 2);
        assert_eq!(left.counter("node-b"), 1);
    }

    #[test]
    fn detects_concurrent_clocks() {
        let mut clock_a = VectorClock::new();
        let mut clock_b = VectorClock::new();
        clock_a.tick("node-a");
        clock_b.tick("node-b");
        assert_eq!(clock_a.compare(&clock_b), CausalOrdering::Concurrent);
    }

    #[test]
    fn dominated_clock_happens_before() {
        let mut earlier = VectorClock::new();
        earlier.tick("node-a");
        let mut later = earlier.clone();
        later.tick("node-a");
        later.tick("node-b");

        assert!(earlier.happens_before(&later));
        assert_eq!(later.compare(&earlier), CausalOrdering::Greater);
        assert!(!later.happens_before(&earlier));
    }

    #[test]
    fn equal_clocks_are_equal() {
        let mut clock_a = VectorClock::new();
        clock_a.tick("node-a");
        let clock_b = clock_a.clone();
        assert_eq!(clock_a.compare(&clock_b), CausalOrdering::Equal);
    }
}
