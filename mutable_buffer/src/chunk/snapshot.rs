use std::sync::Arc;

use data_types::{timestamp::TimestampRange, write::Row};
use persistence_windows::min_max_sequence::MinMaxSequence;

use super::MBChunk;

/// A queryable snapshot of a mutable buffer chunk
///
/// Owns a copy of the rows, so it has no ties to the chunk it was taken from.
#[derive(Debug)]
pub struct ChunkSnapshot {
    table_name: Arc<str>,
    rows: Vec<Row>,
    timestamp_range: Option<TimestampRange>,
    sequence: Option<MinMaxSequence>,
}

impl ChunkSnapshot {
    pub fn new(chunk: &MBChunk) -> Self {
        Self {
            table_name: Arc::clone(&chunk.table_name),
            rows: chunk.rows.clone(),
            timestamp_range: chunk.time_range,
            sequence: chunk.sequence,
        }
    }

    /// returns true if there is no data in this snapshot
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn table_name(&self) -> &Arc<str> {
        &self.table_name
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn time_range(&self) -> Option<TimestampRange> {
        self.timestamp_range
    }

    pub fn sequence(&self) -> Option<MinMaxSequence> {
        self.sequence
    }

    /// Returns true if this snapshot may contain rows within `range`
    pub fn has_timerange(&self, range: &TimestampRange) -> bool {
        self.timestamp_range
            .map(|r| r.overlaps(range))
            .unwrap_or(false)
    }

    /// Rows within `range`, in write order
    pub fn rows_in(&self, range: TimestampRange) -> impl Iterator<Item = &Row> + '_ {
        self.rows.iter().filter(move |r| range.contains(r.time))
    }
}
