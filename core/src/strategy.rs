//! Turning one flushed chunk into a storage mutation.
//!
//! The bulk path converts the chunk to arrow and inserts it with a single
//! statement. When conversion or the insert fails, the chunk is written again
//! record by record. Neither path retries on its own.

use tracing::{debug, warn};

use crate::columnar::to_record_batch;
use crate::errors::{SinkError, StorageError};
use crate::record::Record;
use crate::storage::{quote_ident, Storage};

/// Name under which a chunk is registered for the bulk insert.
pub const STAGING_RELATION: &str = "sink_staging";

/// Which path accepted a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    Bulk,
    RowFallback,
    Row,
}

pub trait WriteStrategy: Send {
    /// Durably applies `batch` to `table`, or fails without marking any of it written.
    fn write<S: Storage>(
        &mut self,
        storage: &mut S,
        table: &str,
        batch: &[Record],
    ) -> Result<WritePath, SinkError>;
}

/// Columnar insert with a row-by-row fallback.
#[derive(Debug, Default)]
pub struct BulkInsertStrategy;

impl BulkInsertStrategy {
    pub fn new() -> Self {
        Self
    }

    fn bulk_write<S: Storage>(
        storage: &mut S,
        table: &str,
        batch: &[Record],
    ) -> Result<usize, SinkError> {
        let bulk_error = |reason: String| SinkError::BulkWrite {
            table: table.to_string(),
            reason,
        };

        let record_batch = to_record_batch(batch).map_err(|e| bulk_error(e.to_string()))?;
        storage
            .register(STAGING_RELATION, record_batch)
            .map_err(|e| bulk_error(e.to_string()))?;

        let inserted = storage.insert_from(table, STAGING_RELATION);
        // Unregister on both outcomes so the next chunk can reuse the name.
        let unregistered = storage.unregister(STAGING_RELATION);

        let inserted = inserted.map_err(|e| bulk_error(e.to_string()))?;
        // The rows are in; a fallback from here would insert them twice.
        if let Err(e) = unregistered {
            warn!(
                "Failed to unregister {} after inserting into {}: {}",
                STAGING_RELATION, table, e
            );
        }
        Ok(inserted)
    }
}

impl WriteStrategy for BulkInsertStrategy {
    fn write<S: Storage>(
        &mut self,
        storage: &mut S,
        table: &str,
        batch: &[Record],
    ) -> Result<WritePath, SinkError> {
        if batch.is_empty() {
            return Ok(WritePath::Bulk);
        }

        let bulk_err = match Self::bulk_write(storage, table, batch) {
            Ok(inserted) => {
                debug!("Bulk inserted {} rows into {}", inserted, table);
                return Ok(WritePath::Bulk);
            }
            Err(e) => e,
        };

        warn!(
            "Bulk write failed: {}. Falling back to row inserts for {} records",
            bulk_err,
            batch.len()
        );

        write_rows(storage, table, batch).map_err(|e| SinkError::RowWrite {
            table: table.to_string(),
            reason: format!("{} (after bulk failure: {})", e, bulk_err),
        })?;
        Ok(WritePath::RowFallback)
    }
}

/// Row-by-row inserts only.
#[derive(Debug, Default)]
pub struct RowInsertStrategy;

impl WriteStrategy for RowInsertStrategy {
    fn write<S: Storage>(
        &mut self,
        storage: &mut S,
        table: &str,
        batch: &[Record],
    ) -> Result<WritePath, SinkError> {
        write_rows(storage, table, batch).map_err(|e| SinkError::RowWrite {
            table: table.to_string(),
            reason: e.to_string(),
        })?;
        Ok(WritePath::Row)
    }
}

/// Builds `INSERT INTO table VALUES (?, ...)` with one placeholder per field.
pub fn insert_template(table: &str, field_count: usize) -> String {
    let placeholders = vec!["?"; field_count].join(", ");
    format!("INSERT INTO {} VALUES ({})", quote_ident(table), placeholders)
}

// The template is sized by the first record; callers pass uniform records.
fn write_rows<S: Storage>(
    storage: &mut S,
    table: &str,
    batch: &[Record],
) -> Result<usize, StorageError> {
    let Some(first) = batch.first() else {
        return Ok(0);
    };
    let sql = insert_template(table, first.len());
    let inserted = storage.execute_many(&sql, batch)?;
    debug!("Row inserted {} records into {}", inserted, table);
    Ok(inserted)
}

/// Strategy selected by configuration.
#[derive(Debug)]
pub enum ConfiguredStrategy {
    Bulk(BulkInsertStrategy),
    Row(RowInsertStrategy),
}

impl ConfiguredStrategy {
    pub fn from_mode(mode: crate::config::WriteMode) -> Self {
        match mode {
            crate::config::WriteMode::Bulk => ConfiguredStrategy::Bulk(BulkInsertStrategy::new()),
            crate::config::WriteMode::Row => ConfiguredStrategy::Row(RowInsertStrategy),
        }
    }
}

impl WriteStrategy for ConfiguredStrategy {
    fn write<S: Storage>(
        &mut self,
        storage: &mut S,
        table: &str,
        batch: &[Record],
    ) -> Result<WritePath, SinkError> {
        match self {
            ConfiguredStrategy::Bulk(strategy) => strategy.write(storage, table, batch),
            ConfiguredStrategy::Row(strategy) => strategy.write(storage, table, batch),
        }
    }
}
