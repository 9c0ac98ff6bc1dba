//! In memory structures for tracking data ingest and which of it has been persisted.
use std::{collections::VecDeque, time::Instant};

use data_types::timestamp::TimestampRange;
use serde::{Deserialize, Serialize};

use crate::min_max_sequence::MinMaxSequence;

/// A `PersistenceWindow` keeps track of the writes that landed in a partition and have not
/// yet been made durable, plus the watermark of what has.
///
/// Writes are recorded into the *open* window. When the partition's open mutable buffer
/// chunk is frozen the open window is *closed*: from then on its rows are candidates for
/// persistence. A persist operation takes a [`FlushHandle`] covering the closed windows that
/// exist at that point, and once the new artifact has been committed, hands it back to
/// [`PersistenceWindow::flush`], which drops those windows and advances the watermark.
///
/// Writes arriving while a persist is in flight go into a new open window and are
/// unaffected by the flush.
#[derive(Debug, Default)]
pub struct PersistenceWindow {
    closed: VecDeque<Window>,
    open: Option<Window>,

    /// The last sequence passed to [`PersistenceWindow::add_range`]
    last_sequence: Option<u64>,

    persisted: Option<PersistedWatermark>,
}

/// What is known to be durable for a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedWatermark {
    /// All writes with a sequence number up to and including this one are durable
    pub max_sequence: u64,

    /// Maximum row timestamp that has been persisted
    pub max_time: i64,
}

impl PersistedWatermark {
    /// Combine two watermarks, keeping the maximum of both fields
    pub fn merge(self, other: Self) -> Self {
        Self {
            max_sequence: self.max_sequence.max(other.max_sequence),
            max_time: self.max_time.max(other.max_time),
        }
    }
}

/// A handle for flushing closed windows from the [`PersistenceWindow`]
///
/// Only covers windows closed at the time the handle was created; windows closed later
/// stay in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushHandle {
    closed_count: usize,
    row_count: usize,
    sequence: MinMaxSequence,
    time_range: TimestampRange,
}

impl FlushHandle {
    /// Number of rows that will be flushed
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn sequence(&self) -> MinMaxSequence {
        self.sequence
    }

    pub fn time_range(&self) -> TimestampRange {
        self.time_range
    }

    /// The watermark that the partition will have once this handle is flushed
    pub fn watermark(&self) -> PersistedWatermark {
        PersistedWatermark {
            max_sequence: self.sequence.max(),
            max_time: self.time_range.max(),
        }
    }
}

impl PersistenceWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch of `row_count` rows with write sequence number `sequence`, spanning
    /// `time_range`, received at `received_at`.
    ///
    /// Sequence numbers must be strictly increasing per partition.
    pub fn add_range(
        &mut self,
        sequence: u64,
        row_count: usize,
        time_range: TimestampRange,
        received_at: Instant,
    ) {
        if let Some(last) = self.last_sequence {
            assert!(
                last < sequence,
                "sequence number {} was not greater than previous {}",
                sequence,
                last
            );
        }
        self.last_sequence = Some(sequence);

        match self.open.as_mut() {
            Some(w) => w.add_range(sequence, row_count, time_range),
            None => self.open = Some(Window::new(received_at, sequence, row_count, time_range)),
        }
    }

    /// Close the open window, if any, making its rows candidates for persistence
    pub fn rotate(&mut self) {
        if let Some(w) = self.open.take() {
            self.closed.push_back(w)
        }
    }

    /// Acquire a handle covering all currently closed windows
    ///
    /// Returns `None` if there is nothing closed
    pub fn flush_handle(&self) -> Option<FlushHandle> {
        let mut windows = self.closed.iter();
        let mut acc = windows.next()?.clone();
        for w in windows {
            acc.add_window(w);
        }

        Some(FlushHandle {
            closed_count: self.closed.len(),
            row_count: acc.row_count,
            sequence: acc.sequence,
            time_range: acc.time_range,
        })
    }

    /// Drop the windows covered by `handle` and advance the persisted watermark
    pub fn flush(&mut self, handle: FlushHandle) {
        assert!(
            self.closed.len() >= handle.closed_count,
            "closed windows dropped while a flush was in flight"
        );
        self.closed.drain(..handle.closed_count);
        self.mark_persisted(handle.watermark());
    }

    /// Advance the persisted watermark, e.g. when rebuilding from the transaction log.
    ///
    /// The watermark never moves backwards.
    pub fn mark_persisted(&mut self, watermark: PersistedWatermark) {
        self.persisted = Some(match self.persisted {
            Some(current) => current.merge(watermark),
            None => watermark,
        });
        if self.last_sequence.map(|s| s < watermark.max_sequence).unwrap_or(true) {
            self.last_sequence = Some(watermark.max_sequence);
        }
    }

    pub fn persisted(&self) -> Option<PersistedWatermark> {
        self.persisted
    }

    /// Returns an iterator over the windows starting with the oldest
    fn windows(&self) -> impl Iterator<Item = &Window> {
        self.closed.iter().chain(self.open.as_ref())
    }

    /// Sequence range of all writes not yet known to be durable
    pub fn unpersisted_sequence(&self) -> Option<MinMaxSequence> {
        self.windows()
            .map(|w| w.sequence)
            .reduce(|a, b| a.union(&b))
    }

    /// Time range of all rows not yet known to be durable
    pub fn unpersisted_time_range(&self) -> Option<TimestampRange> {
        self.windows()
            .map(|w| w.time_range)
            .reduce(|a, b| a.union(&b))
    }

    pub fn unpersisted_row_count(&self) -> usize {
        self.windows().map(|w| w.row_count).sum()
    }

    /// Number of rows in closed windows, i.e. rows that a persist would pick up
    pub fn persistable_row_count(&self) -> usize {
        self.closed.iter().map(|w| w.row_count).sum()
    }

    /// When the oldest unpersisted write was received
    pub fn minimum_unpersisted_age(&self) -> Option<Instant> {
        self.windows().next().map(|w| w.created_at)
    }
}

#[derive(Debug, Clone)]
struct Window {
    /// The server time when this window was created
    created_at: Instant,
    row_count: usize,
    time_range: TimestampRange,
    sequence: MinMaxSequence,
}

impl Window {
    fn new(created_at: Instant, sequence: u64, row_count: usize, time_range: TimestampRange) -> Self {
        Self {
            created_at,
            row_count,
            time_range,
            sequence: MinMaxSequence::single(sequence),
        }
    }

    fn add_range(&mut self, sequence: u64, row_count: usize, time_range: TimestampRange) {
        self.row_count += row_count;
        self.time_range = self.time_range.union(&time_range);
        self.sequence.extend(sequence);
    }

    /// Add one window to another
    fn add_window(&mut self, other: &Self) {
        self.row_count += other.row_count;
        self.time_range = self.time_range.union(&other.time_range);
        self.sequence = self.sequence.union(&other.sequence);
        self.created_at = self.created_at.min(other.created_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_open_window() {
        let mut w = PersistenceWindow::new();
        let i = Instant::now();

        w.add_range(2, 1, TimestampRange::new(10, 20), i);
        w.add_range(4, 2, TimestampRange::new(5, 15), i);

        assert_eq!(w.unpersisted_row_count(), 3);
        assert_eq!(w.unpersisted_sequence(), Some(MinMaxSequence::new(2, 4)));
        assert_eq!(w.unpersisted_time_range(), Some(TimestampRange::new(5, 20)));
        assert_eq!(w.minimum_unpersisted_age(), Some(i));

        // nothing closed yet
        assert_eq!(w.persistable_row_count(), 0);
        assert!(w.flush_handle().is_none());
        assert!(w.persisted().is_none());
    }

    #[test]
    #[should_panic(expected = "sequence number 3 was not greater than previous 3")]
    fn rejects_sequence_going_backwards() {
        let mut w = PersistenceWindow::new();
        w.add_range(3, 1, TimestampRange::new(0, 0), Instant::now());
        w.add_range(3, 1, TimestampRange::new(0, 0), Instant::now());
    }

    #[test]
    fn flush_only_covers_windows_closed_before_handle() {
        let mut w = PersistenceWindow::new();
        let i = Instant::now();

        w.add_range(1, 10, TimestampRange::new(100, 200), i);
        w.rotate();
        w.add_range(2, 5, TimestampRange::new(150, 300), i);
        w.rotate();

        let handle = w.flush_handle().unwrap();
        assert_eq!(handle.row_count(), 15);
        assert_eq!(handle.sequence(), MinMaxSequence::new(1, 2));
        assert_eq!(handle.time_range(), TimestampRange::new(100, 300));

        // writes and a further freeze while the persist is in flight
        w.add_range(3, 7, TimestampRange::new(50, 60), i);
        w.rotate();
        w.add_range(4, 1, TimestampRange::new(400, 400), i);

        w.flush(handle);

        assert_eq!(
            w.persisted(),
            Some(PersistedWatermark {
                max_sequence: 2,
                max_time: 300
            })
        );
        assert_eq!(w.unpersisted_row_count(), 8);
        assert_eq!(w.persistable_row_count(), 7);
        assert_eq!(w.unpersisted_sequence(), Some(MinMaxSequence::new(3, 4)));
        assert_eq!(w.unpersisted_time_range(), Some(TimestampRange::new(50, 400)));
    }

    #[test]
    fn mark_persisted_never_goes_backwards() {
        let mut w = PersistenceWindow::new();
        w.mark_persisted(PersistedWatermark {
            max_sequence: 10,
            max_time: 1_000,
        });
        w.mark_persisted(PersistedWatermark {
            max_sequence: 5,
            max_time: 2_000,
        });
        assert_eq!(
            w.persisted(),
            Some(PersistedWatermark {
                max_sequence: 10,
                max_time: 2_000
            })
        );

        // restored watermark also bounds the next sequence
        w.add_range(11, 1, TimestampRange::new(0, 0), Instant::now());
    }

    #[test]
    #[should_panic(expected = "sequence number 10 was not greater than previous 10")]
    fn restored_watermark_bounds_sequence() {
        let mut w = PersistenceWindow::new();
        w.mark_persisted(PersistedWatermark {
            max_sequence: 10,
            max_time: 0,
        });
        w.add_range(10, 1, TimestampRange::new(0, 0), Instant::now());
    }
}
