use serde::{Deserialize, Serialize};

/// Tracks an inclusive range of row timestamps (`[min, max]`), in nanoseconds
/// since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampRange {
    min: i64,
    max: i64,
}

impl TimestampRange {
    /// Create a new range.
    ///
    /// This panics if `min > max`.
    pub fn new(min: i64, max: i64) -> Self {
        assert!(min <= max, "min ({min}) is greater than max ({max}) timestamp");
        Self { min, max }
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Returns true if `time` lies within the range
    pub fn contains(&self, time: i64) -> bool {
        self.min <= time && time <= self.max
    }

    /// Returns true if the two ranges share at least one timestamp
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Smallest range covering both `self` and `other`
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_overlaps() {
        let r = TimestampRange::new(10, 20);
        assert!(r.contains(10));
        assert!(r.contains(20));
        assert!(!r.contains(21));

        assert!(r.overlaps(&TimestampRange::new(20, 30)));
        assert!(!r.overlaps(&TimestampRange::new(21, 30)));
        assert_eq!(r.union(&TimestampRange::new(0, 5)), TimestampRange::new(0, 20));
    }

    #[test]
    #[should_panic(expected = "min (2) is greater than max (1) timestamp")]
    fn test_invalid_range() {
        TimestampRange::new(2, 1);
    }
}
