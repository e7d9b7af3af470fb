use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to open storage target {target}")]
    Connection {
        target: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to create table {table}")]
    TableCreation {
        table: String,
        #[source]
        source: StorageError,
    },

    #[error("Bulk write to {table} failed: {reason}")]
    BulkWrite { table: String, reason: String },

    #[error("Row write to {table} failed: {reason}")]
    RowWrite { table: String, reason: String },

    #[error("Partition {partition} used after close")]
    UseAfterClose { partition: String },

    #[error("Unknown partition: {partition}")]
    UnknownPartition { partition: String },

    #[error("Failed to close storage for partition {partition}")]
    Close {
        partition: String,
        #[source]
        source: StorageError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage engine error: {0}")]
    Engine(#[from] duckdb::Error),

    #[error("Relation {name} is not registered")]
    UnknownRelation { name: String },

    #[error("Relation {name} is already registered")]
    RelationExists { name: String },

    #[error("Storage connection is closed")]
    Closed,
}

/// Raised while turning a batch of records into a columnar batch.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Cannot convert an empty batch")]
    EmptyBatch,

    #[error("Record {index} does not match the batch schema: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        index: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Column {column} mixes {first} and {other} values")]
    MixedTypes {
        column: String,
        first: &'static str,
        other: &'static str,
    },

    #[error("Column {column} holds unsupported {type_name} values")]
    UnsupportedType {
        column: String,
        type_name: &'static str,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint IO failed: {0}")]
    Io(String),

    #[error("Checkpoint serialization failed: {0}")]
    Serialization(String),

    #[error("Checkpoint is corrupted: {0}")]
    Corrupted(String),

    #[error("Unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, SinkError>;

impl SinkError {
    /// Whether the error must stop the partition that raised it.
    ///
    /// A bulk write failure is the only recoverable kind: the write strategy
    /// handles it by falling back to row inserts.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SinkError::BulkWrite { .. })
    }

    /// Whether an upstream engine may retry the whole call later.
    ///
    /// Rows of a failed flush stay buffered, so re-driving the partition is safe.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::RowWrite { .. } => true,
            SinkError::BulkWrite { .. } => true,
            SinkError::Connection { .. } => true,
            SinkError::Checkpoint(CheckpointError::Io(_)) => true,
            SinkError::TableCreation { .. } => false,
            SinkError::UseAfterClose { .. } => false,
            SinkError::UnknownPartition { .. } => false,
            SinkError::Config(_) => false,
            SinkError::Checkpoint(_) => false,
            SinkError::Close { .. } => false,
        }
    }
}
