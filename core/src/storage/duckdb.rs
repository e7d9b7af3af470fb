use ::duckdb::types::{TimeUnit, ToSqlOutput, Value as DuckValue};
use ::duckdb::vtab::arrow::ArrowVTab;
use ::duckdb::vtab::arrow_recordbatch_to_query_params;
use ::duckdb::{params_from_iter, Connection, ToSql};
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::errors::StorageError;
use crate::record::{Record, Value};
use crate::storage::{quote_ident, Connector, Storage, StorageTarget};

/// Table function through which registered arrow batches are scanned.
const ARROW_SCAN_FUNCTION: &str = "arrow";

/// A DuckDB (or MotherDuck) connection owned by one partition.
pub struct DuckDbStorage {
    conn: Option<Connection>,
    target: StorageTarget,
    /// Batches registered by name, bound as `arrow(?, ?)` parameters on insert.
    relations: HashMap<String, RecordBatch>,
}

impl DuckDbStorage {
    pub fn open(target: &StorageTarget) -> Result<Self, StorageError> {
        let conn = match target {
            StorageTarget::Memory => Connection::open_in_memory()?,
            StorageTarget::File(path) => Connection::open(path)?,
            StorageTarget::Remote(location) => Connection::open(location)?,
        };
        conn.register_table_function::<ArrowVTab>(ARROW_SCAN_FUNCTION)?;

        info!("Connected to DuckDB at {}", target);
        Ok(Self {
            conn: Some(conn),
            target: target.clone(),
            relations: HashMap::new(),
        })
    }

    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn.as_ref().ok_or(StorageError::Closed)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, StorageError> {
        self.conn.as_mut().ok_or(StorageError::Closed)
    }

    /// Counts rows of `table`; mostly useful for verification.
    pub fn count_rows(&mut self, table: &str) -> Result<usize, StorageError> {
        let sql = format!("SELECT count(*) FROM {}", quote_ident(table));
        let count: i64 = self.conn()?.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }
}

impl Storage for DuckDbStorage {
    fn execute(&mut self, sql: &str) -> Result<(), StorageError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    fn register(&mut self, name: &str, batch: RecordBatch) -> Result<(), StorageError> {
        self.conn()?;
        if self.relations.contains_key(name) {
            return Err(StorageError::RelationExists {
                name: name.to_string(),
            });
        }
        self.relations.insert(name.to_string(), batch);
        Ok(())
    }

    fn insert_from(&mut self, table: &str, relation: &str) -> Result<usize, StorageError> {
        let batch = self
            .relations
            .get(relation)
            .cloned()
            .ok_or_else(|| StorageError::UnknownRelation {
                name: relation.to_string(),
            })?;

        let sql = format!(
            "INSERT INTO {} SELECT * FROM {}(?, ?)",
            quote_ident(table),
            ARROW_SCAN_FUNCTION
        );
        let params = arrow_recordbatch_to_query_params(batch);
        let inserted = self.conn()?.execute(&sql, params)?;
        Ok(inserted)
    }

    fn unregister(&mut self, name: &str) -> Result<(), StorageError> {
        self.relations
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::UnknownRelation {
                name: name.to_string(),
            })
    }

    fn execute_many(&mut self, sql: &str, rows: &[Record]) -> Result<usize, StorageError> {
        let tx = self.conn_mut()?.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(sql)?;
            for row in rows {
                inserted += stmt.execute(params_from_iter(row.values()))?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.relations.clear();
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StorageError::Engine(e))?;
        debug!("Closed DuckDB connection to {}", self.target);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDbConnector;

impl Connector for DuckDbConnector {
    type Storage = DuckDbStorage;

    fn connect(&self, target: &StorageTarget) -> Result<DuckDbStorage, StorageError> {
        DuckDbStorage::open(target)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> ::duckdb::Result<ToSqlOutput<'_>> {
        let value = match self {
            Value::Null => DuckValue::Null,
            Value::Bool(b) => DuckValue::Boolean(*b),
            Value::Int(i) => DuckValue::BigInt(*i),
            Value::Float(f) => DuckValue::Double(*f),
            Value::Text(s) => DuckValue::Text(s.clone()),
            Value::Timestamp(ts) => DuckValue::Timestamp(TimeUnit::Microsecond, ts.timestamp_micros()),
            Value::Blob(bytes) => DuckValue::Blob(bytes.clone()),
            // Bound as text; DuckDB casts list literals to the column's list type.
            Value::List(_) => DuckValue::Text(self.to_literal()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}
