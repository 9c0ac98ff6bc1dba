use std::sync::Arc;

use data_types::{
    timestamp::TimestampRange,
    write::{Row, rows_timestamp_range},
};
use parking_lot::Mutex;
use persistence_windows::min_max_sequence::MinMaxSequence;
use snafu::{Snafu, ensure};
use snapshot::ChunkSnapshot;

pub mod snapshot;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cannot write an empty batch to table {}", table_name))]
    EmptyWrite { table_name: String },

    #[snafu(display(
        "Write sequence {} for table {} is not greater than the last one ({})",
        sequence,
        table_name,
        last
    ))]
    SequenceNotIncreasing {
        table_name: String,
        sequence: u64,
        last: u64,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents a Chunk of data (a horizontal subset of a table) in
/// the mutable store.
#[derive(Debug)]
pub struct MBChunk {
    /// The name of this table
    table_name: Arc<str>,

    rows: Vec<Row>,

    time_range: Option<TimestampRange>,

    sequence: Option<MinMaxSequence>,

    /// Cached chunk snapshot
    ///
    /// Note: This is a mutex to allow mutation within
    /// `Chunk::snapshot()` which only takes an immutable borrow
    snapshot: Mutex<Option<Arc<ChunkSnapshot>>>,
}

impl MBChunk {
    /// Create a new chunk and write `rows` into it. Chunks shouldn't exist without some data.
    pub fn new(table_name: impl Into<Arc<str>>, sequence: u64, rows: &[Row]) -> Result<Self> {
        let mut chunk = Self {
            table_name: table_name.into(),
            rows: Vec::with_capacity(rows.len()),
            time_range: None,
            sequence: None,
            snapshot: Mutex::new(None),
        };
        chunk.write(sequence, rows)?;
        Ok(chunk)
    }

    /// Append `rows`, written with write sequence number `sequence`, to this chunk.
    pub fn write(&mut self, sequence: u64, rows: &[Row]) -> Result<()> {
        let range = rows_timestamp_range(rows).ok_or_else(|| Error::EmptyWrite {
            table_name: self.table_name.to_string(),
        })?;

        if let Some(current) = self.sequence {
            ensure!(
                current.max() < sequence,
                SequenceNotIncreasingSnafu {
                    table_name: self.table_name.as_ref(),
                    sequence,
                    last: current.max(),
                }
            );
        }

        self.rows.extend_from_slice(rows);
        self.time_range = Some(match self.time_range {
            Some(current) => current.union(&range),
            None => range,
        });
        match self.sequence.as_mut() {
            Some(current) => current.extend(sequence),
            None => self.sequence = Some(MinMaxSequence::single(sequence)),
        }

        // Invalidate chunk snapshot
        *self.snapshot.get_mut() = None;

        Ok(())
    }

    /// Returns a queryable snapshot of this chunk and an indicator if the snapshot was just cached.
    ///
    /// The snapshot is a detached copy: later writes to this chunk never show up in it.
    pub fn snapshot(&self) -> (Arc<ChunkSnapshot>, bool) {
        let mut guard = self.snapshot.lock();
        if let Some(snapshot) = &*guard {
            return (Arc::clone(snapshot), false);
        }

        let snapshot = Arc::new(ChunkSnapshot::new(self));
        *guard = Some(Arc::clone(&snapshot));
        (snapshot, true)
    }

    /// Return the name of the table in this chunk
    pub fn table_name(&self) -> &Arc<str> {
        &self.table_name
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there is no data in this chunk
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn time_range(&self) -> Option<TimestampRange> {
        self.time_range
    }

    /// Range of write sequence numbers contained in this chunk
    pub fn sequence(&self) -> Option<MinMaxSequence> {
        self.sequence
    }

    /// Approximate memory footprint in bytes
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.table_name.len()
            + self.rows.iter().map(Row::size).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::write::FieldValue;

    fn rows(times: &[i64]) -> Vec<Row> {
        times
            .iter()
            .map(|t| Row::new(*t).with_field("temp", FieldValue::F64(*t as f64)))
            .collect()
    }

    #[test]
    fn writes_update_stats() {
        let mut chunk = MBChunk::new("cpu", 1, &rows(&[10, 20])).unwrap();
        assert_eq!(chunk.rows(), 2);
        assert_eq!(chunk.time_range(), Some(TimestampRange::new(10, 20)));

        chunk.write(5, &rows(&[5])).unwrap();
        assert_eq!(chunk.rows(), 3);
        assert_eq!(chunk.time_range(), Some(TimestampRange::new(5, 20)));
        assert_eq!(chunk.sequence(), Some(MinMaxSequence::new(1, 5)));
        assert_eq!(chunk.table_name().as_ref(), "cpu");
        assert!(chunk.size() > 0);
    }

    #[test]
    fn rejects_bad_writes() {
        let mut chunk = MBChunk::new("cpu", 3, &rows(&[1])).unwrap();

        let err = chunk.write(4, &[]).unwrap_err();
        assert!(matches!(err, Error::EmptyWrite { .. }));

        let err = chunk.write(3, &rows(&[2])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Write sequence 3 for table cpu is not greater than the last one (3)"
        );
        assert_eq!(chunk.rows(), 1);

        assert!(MBChunk::new("cpu", 1, &[]).is_err());
    }

    #[test]
    fn snapshot_is_cached_until_next_write() {
        let mut chunk = MBChunk::new("cpu", 1, &rows(&[1, 2])).unwrap();

        let (s1, cached) = chunk.snapshot();
        assert!(cached);
        let (s2, cached) = chunk.snapshot();
        assert!(!cached);
        assert!(Arc::ptr_eq(&s1, &s2));

        chunk.write(2, &rows(&[3])).unwrap();
        let (s3, cached) = chunk.snapshot();
        assert!(cached);
        assert_eq!(s3.row_count(), 3);

        // the earlier snapshot is detached from the write
        assert_eq!(s1.row_count(), 2);
        assert_eq!(s1.time_range(), Some(TimestampRange::new(1, 2)));
    }
}
