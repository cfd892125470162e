//! Ordered-key search tree used by both load-balancing algorithms, standing
//! in for the original's intrusive `eb32` tree per the design note ("ordered
//! key trees -> any ordered map with insertion-order tie-break").
//!
//! An `eb32` tree tolerates duplicate keys, visiting them in the order they
//! were inserted on a tie. `WeightTree` gets the same behavior by keying its
//! `BTreeMap` on `(weight_key, insertion_sequence)`: two servers with equal
//! weight keys sort by which was queued first.

use std::collections::BTreeMap;
use std::collections::HashMap;

use super::ServerId;

#[derive(Default)]
pub struct WeightTree {
    entries: BTreeMap<(u32, u64), ServerId>,
    locations: HashMap<ServerId, (u32, u64)>,
    seq: u64,
}

impl WeightTree {
    pub fn new() -> WeightTree {
        WeightTree::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.locations.contains_key(&id)
    }

    /// Insert (or move, if already present) `id` at `key`. Ties with
    /// existing entries at the same key are broken by insertion order: this
    /// call's entry sorts after anything already at `key`.
    pub fn insert(&mut self, key: u32, id: ServerId) {
        self.remove(id);
        let loc = (key, self.seq);
        self.seq += 1;
        self.entries.insert(loc, id);
        self.locations.insert(id, loc);
    }

    pub fn remove(&mut self, id: ServerId) -> bool {
        if let Some(loc) = self.locations.remove(&id) {
            self.entries.remove(&loc);
            true
        } else {
            false
        }
    }

    /// The lowest-key entry, i.e. the original's `eb32_first`.
    pub fn first(&self) -> Option<ServerId> {
        self.entries.values().next().copied()
    }

    pub fn first_key(&self) -> Option<u32> {
        self.entries.keys().next().map(|(k, _)| *k)
    }

    /// Iterate in ascending key order, breaking ties by insertion order.
    pub fn iter(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.entries.values().copied()
    }

    /// Remove and return the lowest-key entry.
    pub fn pop_first(&mut self) -> Option<ServerId> {
        let id = self.first()?;
        self.remove(id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_break_by_insertion_order() {
        let mut t = WeightTree::new();
        t.insert(0, ServerId(1));
        t.insert(0, ServerId(2));
        t.insert(0, ServerId(3));
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![ServerId(1), ServerId(2), ServerId(3)]);
    }

    #[test]
    fn lowest_key_wins_regardless_of_insertion_order() {
        let mut t = WeightTree::new();
        t.insert(5, ServerId(1));
        t.insert(1, ServerId(2));
        assert_eq!(t.first(), Some(ServerId(2)));
    }

    #[test]
    fn reinsertion_moves_and_rebreaks_ties() {
        let mut t = WeightTree::new();
        t.insert(0, ServerId(1));
        t.insert(0, ServerId(2));
        t.insert(0, ServerId(1)); // re-queue 1: now behind 2
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![ServerId(2), ServerId(1)]);
    }
}
