use std::fmt;

use serde::{Deserialize, Serialize};

/// The minimum and maximum write sequence numbers seen for a set of rows.
///
/// **IMPORTANT: These ranges include their start and their end (aka `[min, max]`)!**
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MinMaxSequence {
    min: u64,
    max: u64,
}

impl MinMaxSequence {
    /// Create new min-max sequence range.
    ///
    /// This panics if `min > max`.
    pub fn new(min: u64, max: u64) -> Self {
        assert!(
            min <= max,
            "min ({}) is greater than max ({}) sequence",
            min,
            max
        );
        Self { min, max }
    }

    /// Range containing a single sequence number
    pub fn single(sequence: u64) -> Self {
        Self {
            min: sequence,
            max: sequence,
        }
    }

    /// Inclusive minimum.
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Inclusive maximum.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Extend this range so that it also covers `sequence`
    pub fn extend(&mut self, sequence: u64) {
        self.min = self.min.min(sequence);
        self.max = self.max.max(sequence);
    }

    /// Smallest range covering both `self` and `other`
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.min <= sequence && sequence <= self.max
    }
}

impl fmt::Display for MinMaxSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Union of all ranges, `None` if the iterator is empty
pub fn union_all<'a>(ranges: impl IntoIterator<Item = &'a MinMaxSequence>) -> Option<MinMaxSequence> {
    ranges
        .into_iter()
        .fold(None, |acc: Option<MinMaxSequence>, r| match acc {
            Some(acc) => Some(acc.union(r)),
            None => Some(*r),
        })
}
