//! A partitioned, buffering batch sink for DuckDB.
//!
//! Records arrive keyed; [`router::PartitionedSink`] maps each key to one of a
//! fixed set of partitions, and every partition's
//! [`partition::PartitionWriter`] buffers rows and flushes them in
//! `batch_size` chunks through a [`strategy::WriteStrategy`].

pub mod checkpoint;
pub mod collector;
pub mod columnar;
pub mod config;
pub mod errors;
pub mod ingestor;
pub mod partition;
pub mod record;
pub mod router;
pub mod storage;
pub mod strategy;
pub mod telemetry;

pub use config::SinkConfig;
pub use errors::{Result, SinkError};
pub use ingestor::{Ingestor, KeyedRecord};
pub use partition::{PartitionWriter, ResumeState};
pub use record::{Record, Value};
pub use router::PartitionedSink;
