pub mod duckdb;

use arrow::record_batch::RecordBatch;
use std::fmt;
use std::path::PathBuf;

use crate::errors::StorageError;
use crate::record::Record;

pub use self::duckdb::{DuckDbConnector, DuckDbStorage};

/// The contract a partition needs from the storage engine.
///
/// A connection is owned by exactly one partition writer, so every method
/// takes `&mut self` and no implementation needs to be `Sync`.
pub trait Storage: Send {
    /// Runs a statement without parameters, e.g. table DDL.
    fn execute(&mut self, sql: &str) -> Result<(), StorageError>;

    /// Binds a columnar batch under `name` so it can be selected from.
    fn register(&mut self, name: &str, batch: RecordBatch) -> Result<(), StorageError>;

    /// `INSERT INTO table SELECT * FROM relation`. Returns the inserted row count.
    fn insert_from(&mut self, table: &str, relation: &str) -> Result<usize, StorageError>;

    fn unregister(&mut self, name: &str) -> Result<(), StorageError>;

    /// Executes the parameterized `sql` once per record, binding the record's
    /// values in field order. Either every row is applied or none is.
    fn execute_many(&mut self, sql: &str, rows: &[Record]) -> Result<usize, StorageError>;

    fn table_exists(&mut self, table: &str) -> Result<bool, StorageError>;

    fn close(&mut self) -> Result<(), StorageError>;
}

/// Opens a storage connection for a resolved target.
pub trait Connector {
    type Storage: Storage;

    fn connect(&self, target: &StorageTarget) -> Result<Self::Storage, StorageError>;
}

/// Connection string prefixes of MotherDuck databases.
const REMOTE_PREFIXES: [&str; 2] = ["md:", "motherduck:"];

/// Where one partition's database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Memory,
    File(PathBuf),
    /// A MotherDuck database, kept as its full connection string.
    Remote(String),
}

impl StorageTarget {
    pub fn parse(location: &str) -> Self {
        match location {
            "" | ":memory:" => StorageTarget::Memory,
            remote if REMOTE_PREFIXES.iter().any(|p| remote.starts_with(p)) => {
                StorageTarget::Remote(remote.to_string())
            }
            path => StorageTarget::File(PathBuf::from(path)),
        }
    }

    /// Existence check performed before connecting. An in-memory database is
    /// always new; a remote one cannot be checked without connecting (`None`).
    pub fn exists(&self) -> Option<bool> {
        match self {
            StorageTarget::Memory => Some(false),
            StorageTarget::File(path) => Some(path.exists()),
            StorageTarget::Remote(_) => None,
        }
    }
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTarget::Memory => f.write_str(":memory:"),
            StorageTarget::File(path) => write!(f, "{}", path.display()),
            StorageTarget::Remote(location) => f.write_str(location),
        }
    }
}

/// Quotes an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
