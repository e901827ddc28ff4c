//! Compact set of received sequence numbers.
//!
//! Stored as disjoint, non-adjacent closed ranges `[start, end]` keyed by
//! `start`, so memory and lookup cost scale with the number of gaps rather
//! than the number of elements.  A healthy connection collapses to a single
//! range no matter how many requests it has seen.

use std::collections::{BTreeMap, BTreeSet};

/// Set of u64 sequence numbers maintained as disjoint closed ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: BTreeMap<u64, u64>,
}

impl SequenceSet {
    pub fn new() -> Self {
        SequenceSet::default()
    }

    /// Insert `seqn`, merging with an adjacent range on either side.
    /// Returns true iff the element was not already present.
    pub fn add(&mut self, seqn: u64) -> bool {
        let below = self
            .ranges
            .range(..=seqn)
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((_, end)) = below {
            if seqn <= end {
                return false;
            }
        }

        let mut start = seqn;
        let mut end = seqn;

        if let Some(above_start) = seqn.checked_add(1) {
            if let Some(&above_end) = self.ranges.get(&above_start) {
                self.ranges.remove(&above_start);
                end = above_end;
            }
        }
        if let Some((below_start, below_end)) = below {
            if below_end + 1 == seqn {
                start = below_start;
            }
        }

        self.ranges.insert(start, end);
        true
    }

    /// Remove `seqn`, splitting the range it falls inside.  Returns true
    /// iff the element was present.
    pub fn remove(&mut self, seqn: u64) -> bool {
        let Some((&start, &end)) = self.ranges.range(..=seqn).next_back() else {
            return false;
        };
        if seqn > end {
            return false;
        }

        self.ranges.remove(&start);
        if start < seqn {
            self.ranges.insert(start, seqn - 1);
        }
        if seqn < end {
            self.ranges.insert(seqn + 1, end);
        }
        true
    }

    pub fn contains(&self, seqn: u64) -> bool {
        self.ranges
            .range(..=seqn)
            .next_back()
            .is_some_and(|(_, &end)| seqn <= end)
    }

    /// Every integer strictly below the maximum present element that is not
    /// in the set.  These are the gaps a peer may be asked to retransmit.
    pub fn missing_below(&self) -> BTreeSet<u64> {
        let mut missing = BTreeSet::new();
        let mut next_expected = 0u64;
        for (&start, &end) in &self.ranges {
            missing.extend(next_expected..start);
            next_expected = end + 1;
        }
        missing
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of elements (not ranges).
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|(&s, &e)| e - s + 1).sum()
    }
}
