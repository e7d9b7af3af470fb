//! One partition of the sink: a buffer, a storage connection and a write
//! strategy, driven sequentially by a single caller.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errors::{Result, SinkError};
use crate::record::Record;
use crate::storage::Storage;
use crate::strategy::{ConfiguredStrategy, WriteStrategy};
use crate::telemetry::SinkMetrics;

/// Checkpoint token of one partition, persisted as a
/// `(total_rows_written, buffer_length)` pair.
///
/// Only the buffer's length is recorded. Rows that were buffered at snapshot
/// time are not in the checkpoint and must be replayed by the upstream
/// engine, so delivery into storage is at-least-once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct ResumeState {
    pub total_rows_written: u64,
    pub buffer_length: u64,
}

impl From<(u64, u64)> for ResumeState {
    fn from((total_rows_written, buffer_length): (u64, u64)) -> Self {
        Self {
            total_rows_written,
            buffer_length,
        }
    }
}

impl From<ResumeState> for (u64, u64) {
    fn from(state: ResumeState) -> Self {
        (state.total_rows_written, state.buffer_length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Closed,
}

pub struct PartitionWriter<S: Storage, W: WriteStrategy = ConfiguredStrategy> {
    partition_id: String,
    table_name: String,
    batch_size: usize,
    buffer: Vec<Record>,
    total_rows_written: u64,
    storage: S,
    strategy: W,
    state: WriterState,
    metrics: SinkMetrics,
}

impl<S: Storage, W: WriteStrategy> PartitionWriter<S, W> {
    /// Wraps an already connected storage whose table is ready for inserts.
    pub fn open(
        partition_id: impl Into<String>,
        table_name: impl Into<String>,
        batch_size: usize,
        storage: S,
        strategy: W,
        resume_state: Option<ResumeState>,
    ) -> Self {
        let partition_id = partition_id.into();
        let resume_state = resume_state.unwrap_or_default();

        if resume_state.buffer_length > 0 {
            warn!(
                "Partition {} resumed with {} buffered rows that were never written; \
                 they must be replayed upstream",
                partition_id, resume_state.buffer_length
            );
        }
        info!(
            "Opened partition {} (rows written so far: {}, batch size: {})",
            partition_id, resume_state.total_rows_written, batch_size
        );

        Self {
            partition_id,
            table_name: table_name.into(),
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            total_rows_written: resume_state.total_rows_written,
            storage,
            strategy,
            state: WriterState::Open,
            metrics: SinkMetrics::default(),
        }
    }

    /// Buffers `items` in arrival order, then flushes every whole
    /// `batch_size` chunk from the front of the buffer.
    ///
    /// If a flush fails, chunks flushed earlier in this call stay counted and
    /// the failed chunk remains at the front of the buffer.
    pub fn write_batch(&mut self, items: Vec<Record>) -> Result<()> {
        self.ensure_open()?;
        if items.is_empty() {
            return Ok(());
        }
        self.buffer.extend(items);

        let mut flushed = 0;
        let mut outcome = Ok(());
        while self.buffer.len() - flushed >= self.batch_size {
            if let Err(e) = self.flush_now(flushed, self.batch_size) {
                outcome = Err(e);
                break;
            }
            flushed += self.batch_size;
        }
        self.buffer.drain(..flushed);
        outcome
    }

    /// Writes `buffer[start..start + len]`. Counters advance only on success.
    fn flush_now(&mut self, start: usize, len: usize) -> Result<()> {
        let chunk = &self.buffer[start..start + len];
        match self.strategy.write(&mut self.storage, &self.table_name, chunk) {
            Ok(path) => {
                self.total_rows_written += len as u64;
                self.metrics.record_flush(path, len);
                debug!(
                    "Partition {} flushed {} rows via {:?} (total {})",
                    self.partition_id, len, path, self.total_rows_written
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure();
                error!(
                    "Partition {} failed to flush {} rows: {}",
                    self.partition_id, len, e
                );
                Err(e)
            }
        }
    }

    /// Returns `(total_rows_written, buffer_length)` without side effects.
    pub fn snapshot(&self) -> Result<ResumeState> {
        self.ensure_open()?;
        Ok(ResumeState {
            total_rows_written: self.total_rows_written,
            buffer_length: self.buffer.len() as u64,
        })
    }

    /// Flushes whatever is buffered, even below `batch_size`, then releases
    /// the connection. The writer is closed afterwards even when the flush
    /// fails; the flush error is returned.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = WriterState::Closed;

        let flushed = if self.buffer.is_empty() {
            Ok(())
        } else {
            let len = self.buffer.len();
            self.flush_now(0, len).map(|_| {
                self.buffer.clear();
            })
        };

        let released = self.storage.close().map_err(|source| SinkError::Close {
            partition: self.partition_id.clone(),
            source,
        });

        info!(
            "Closed partition {} ({} rows written, {} left unflushed)",
            self.partition_id,
            self.total_rows_written,
            self.buffer.len()
        );
        flushed.and(released)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Closed => Err(SinkError::UseAfterClose {
                partition: self.partition_id.clone(),
            }),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn total_rows_written(&self) -> u64 {
        self.total_rows_written
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn metrics(&self) -> &SinkMetrics {
        &self.metrics
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}

// Dropping an open writer still gives buffered rows one flush attempt.
impl<S: Storage, W: WriteStrategy> Drop for PartitionWriter<S, W> {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            if let Err(e) = self.close() {
                error!(
                    "Partition {} failed to close on drop: {}",
                    self.partition_id, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::strategy::{BulkInsertStrategy, WritePath};
    use arrow::record_batch::RecordBatch;
    use std::sync::{Arc, Mutex};

    /// Keeps inserted rows in memory; optionally fails every insert.
    #[derive(Clone, Default)]
    struct RecordingStorage {
        rows: Arc<Mutex<Vec<Record>>>,
        staged: Option<usize>,
        fail: Arc<Mutex<bool>>,
        closed: Arc<Mutex<bool>>,
    }

    impl RecordingStorage {
        fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }

        fn failing(&self) -> std::result::Result<(), StorageError> {
            if *self.fail.lock().unwrap() {
                return Err(StorageError::Closed);
            }
            Ok(())
        }
    }

    impl Storage for RecordingStorage {
        fn execute(&mut self, _sql: &str) -> std::result::Result<(), StorageError> {
            Ok(())
        }

        fn register(&mut self, _name: &str, batch: RecordBatch) -> std::result::Result<(), StorageError> {
            self.staged = Some(batch.num_rows());
            Ok(())
        }

        fn insert_from(&mut self, _table: &str, _relation: &str) -> std::result::Result<usize, StorageError> {
            self.failing()?;
            let n = self.staged.unwrap_or(0);
            let mut rows = self.rows.lock().unwrap();
            rows.extend((0..n).map(|_| Record::new()));
            Ok(n)
        }

        fn unregister(&mut self, _name: &str) -> std::result::Result<(), StorageError> {
            self.staged = None;
            Ok(())
        }

        fn execute_many(&mut self, _sql: &str, rows: &[Record]) -> std::result::Result<usize, StorageError> {
            self.failing()?;
            self.rows.lock().unwrap().extend(rows.iter().cloned());
            Ok(rows.len())
        }

        fn table_exists(&mut self, _table: &str) -> std::result::Result<bool, StorageError> {
            Ok(true)
        }

        fn close(&mut self) -> std::result::Result<(), StorageError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new().with("id", i as i64).with("name", format!("user-{}", i)))
            .collect()
    }

    fn writer(
        batch_size: usize,
    ) -> (PartitionWriter<RecordingStorage, BulkInsertStrategy>, RecordingStorage) {
        let storage = RecordingStorage::default();
        let writer = PartitionWriter::open(
            "partition_0",
            "events",
            batch_size,
            storage.clone(),
            BulkInsertStrategy::new(),
            None,
        );
        (writer, storage)
    }

    #[test]
    fn test_initial_state() {
        let (writer, storage) = writer(10);
        assert_eq!(writer.total_rows_written(), 0);
        assert_eq!(writer.buffer_len(), 0);
        assert_eq!(writer.state(), WriterState::Open);
        assert_eq!(storage.row_count(), 0);
    }

    #[test]
    fn test_write_below_threshold_stays_buffered() {
        let (mut writer, storage) = writer(10);
        writer.write_batch(records(2)).unwrap();

        assert_eq!(writer.buffer_len(), 2);
        assert_eq!(storage.row_count(), 0);
        assert_eq!(
            writer.snapshot().unwrap(),
            ResumeState {
                total_rows_written: 0,
                buffer_length: 2
            }
        );
    }

    #[test]
    fn test_empty_write_is_noop() {
        let (mut writer, _storage) = writer(1);
        writer.write_batch(Vec::new()).unwrap();
        assert_eq!(writer.metrics().flushes, 0);
        assert_eq!(writer.buffer_len(), 0);
    }

    #[test]
    fn test_flush_chunking_across_calls() {
        let batch_size = 7;
        let (mut writer, storage) = writer(batch_size);
        let sizes = [3, 0, 5, 20, 1, 6, 13];
        let mut total = 0;

        for size in sizes {
            writer.write_batch(records(size)).unwrap();
            total += size;

            let state = writer.snapshot().unwrap();
            assert_eq!(state.buffer_length as usize, total % batch_size);
            assert_eq!(state.total_rows_written as usize, total - total % batch_size);
        }
        assert_eq!(storage.row_count(), total - total % batch_size);
        assert_eq!(writer.metrics().flushes, total / batch_size);
    }

    #[test]
    fn test_end_to_end_hundred_records() {
        let (mut writer, storage) = writer(30);
        writer.write_batch(records(100)).unwrap();

        assert_eq!(writer.metrics().flushes, 3);
        assert_eq!(writer.total_rows_written(), 90);
        assert_eq!(writer.buffer_len(), 10);

        writer.close().unwrap();
        assert_eq!(writer.total_rows_written(), 100);
        assert_eq!(writer.buffer_len(), 0);
        assert_eq!(storage.row_count(), 100);
        assert!(*storage.closed.lock().unwrap());
    }

    #[test]
    fn test_close_drains_partial_batch() {
        let (mut writer, _storage) = writer(50);
        writer.write_batch(records(17)).unwrap();
        let before = writer.snapshot().unwrap();

        writer.close().unwrap();

        assert_eq!(
            writer.total_rows_written(),
            before.total_rows_written + before.buffer_length
        );
        assert_eq!(writer.buffer_len(), 0);
        assert_eq!(writer.metrics().bulk_writes, 1);
    }

    #[test]
    fn test_failed_flush_does_not_advance_counter() {
        let (mut writer, storage) = writer(5);
        writer.write_batch(records(5)).unwrap();
        assert_eq!(writer.total_rows_written(), 5);

        storage.set_failing(true);
        let err = writer.write_batch(records(12)).unwrap_err();
        assert!(matches!(err, SinkError::RowWrite { .. }));
        assert_eq!(writer.total_rows_written(), 5);
        assert_eq!(writer.buffer_len(), 12);
        assert_eq!(writer.metrics().failed_flushes, 1);

        storage.set_failing(false);
        writer.write_batch(Vec::from([Record::new().with("id", 99).with("name", "late")])).unwrap();
        assert_eq!(writer.total_rows_written(), 15);
        assert_eq!(writer.buffer_len(), 3);
        assert_eq!(storage.row_count(), 15);
    }

    #[test]
    fn test_bulk_failure_falls_back_before_failing() {
        let (mut writer, storage) = writer(2);
        let mixed = vec![
            Record::new().with("id", 1).with("name", "a"),
            Record::new().with("id", 2.5).with("name", "b"),
        ];

        writer.write_batch(mixed).unwrap();

        assert_eq!(writer.metrics().row_fallbacks, 1);
        assert_eq!(storage.row_count(), 2);
        let rows = storage.rows.lock().unwrap();
        let names: Vec<&str> = rows[1].field_names().collect();
        assert_eq!(names, vec!["id", "name"]);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (mut writer, _storage) = writer(10);
        writer.close().unwrap();

        assert!(matches!(
            writer.write_batch(records(1)),
            Err(SinkError::UseAfterClose { .. })
        ));
        assert!(matches!(writer.snapshot(), Err(SinkError::UseAfterClose { .. })));
        assert!(matches!(writer.close(), Err(SinkError::UseAfterClose { .. })));
    }

    #[test]
    fn test_close_with_failing_flush_still_releases() {
        let (mut writer, storage) = writer(10);
        writer.write_batch(records(4)).unwrap();
        storage.set_failing(true);

        assert!(writer.close().is_err());
        assert_eq!(writer.state(), WriterState::Closed);
        assert_eq!(writer.total_rows_written(), 0);
        assert!(*storage.closed.lock().unwrap());
    }

    #[test]
    fn test_drop_flushes_open_writer() {
        let (mut writer, storage) = writer(10);
        writer.write_batch(records(4)).unwrap();
        drop(writer);

        assert_eq!(storage.row_count(), 4);
        assert!(*storage.closed.lock().unwrap());
    }

    #[test]
    fn test_resume_restores_counter() {
        let storage = RecordingStorage::default();
        let resumed = ResumeState {
            total_rows_written: 240,
            buffer_length: 7,
        };
        let mut writer = PartitionWriter::open(
            "partition_2",
            "events",
            30,
            storage,
            BulkInsertStrategy::new(),
            Some(resumed),
        );

        assert_eq!(
            writer.snapshot().unwrap(),
            ResumeState {
                total_rows_written: 240,
                buffer_length: 0
            }
        );
        writer.write_batch(records(30)).unwrap();
        assert_eq!(writer.total_rows_written(), 270);
    }

    #[test]
    fn test_resume_state_is_a_pair() {
        let state = ResumeState {
            total_rows_written: 90,
            buffer_length: 10,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "[90,10]");

        let back: ResumeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_write_path_recorded() {
        let (mut writer, _storage) = writer(1);
        writer.write_batch(records(1)).unwrap();
        let mut expected = SinkMetrics::default();
        expected.record_flush(WritePath::Bulk, 1);
        assert_eq!(writer.metrics(), &expected);
    }
}
