use tracing::{debug, info};

use crate::config::{PARTITION_PLACEHOLDER, SinkConfig, TableCreationPolicy};
use crate::errors::{Result, SinkError};
use crate::partition::{PartitionWriter, ResumeState};
use crate::storage::{Connector, DuckDbConnector, Storage, StorageTarget};
use crate::strategy::ConfiguredStrategy;

/// A fixed set of partitions, each writing to its own storage target.
///
/// The partition space is derived from configuration only, so it is the same
/// after every restart with the same configuration.
pub struct PartitionedSink<C: Connector = DuckDbConnector> {
    config: SinkConfig,
    parts: Vec<String>,
    connector: C,
}

impl PartitionedSink<DuckDbConnector> {
    pub fn new(config: SinkConfig) -> Result<Self> {
        Self::with_connector(config, DuckDbConnector)
    }
}

impl<C: Connector> PartitionedSink<C> {
    pub fn with_connector(config: SinkConfig, connector: C) -> Result<Self> {
        config.validate()?;

        let count = if config.is_single_partition() {
            1
        } else {
            config.partition_count
        };
        let parts = (0..count).map(|i| format!("partition_{}", i)).collect();

        Ok(Self {
            config,
            parts,
            connector,
        })
    }

    pub fn list_parts(&self) -> &[String] {
        &self.parts
    }

    /// Maps a key onto one of [`list_parts`](Self::list_parts).
    pub fn route(&self, key: &str) -> &str {
        &self.parts[self.route_index(key)]
    }

    /// CRC-32 of the key's UTF-8 bytes, reduced modulo the partition count.
    pub fn route_index(&self, key: &str) -> usize {
        crc32fast::hash(key.as_bytes()) as usize % self.parts.len()
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn target_for(&self, partition: &str) -> Result<StorageTarget> {
        if !self.parts.iter().any(|p| p == partition) {
            return Err(SinkError::UnknownPartition {
                partition: partition.to_string(),
            });
        }
        let location = self
            .config
            .target_template
            .replace(PARTITION_PLACEHOLDER, partition);
        Ok(StorageTarget::parse(&location))
    }

    /// Connects to the partition's target, creates the table when the
    /// configured policy says so, and hands back an open writer.
    pub fn build_or_resume(
        &self,
        partition: &str,
        resume_state: Option<ResumeState>,
    ) -> Result<PartitionWriter<C::Storage>> {
        let target = self.target_for(partition)?;
        // Checked before connecting: opening a file database creates it.
        let existed = target.exists();

        let mut storage =
            self.connector
                .connect(&target)
                .map_err(|source| SinkError::Connection {
                    target: target.to_string(),
                    source,
                })?;

        if let Some(statement) = &self.config.create_table_statement {
            let due = match (self.config.table_creation, existed) {
                (TableCreationPolicy::AlwaysExecute, _) => true,
                (TableCreationPolicy::OnceIfNew, Some(existed)) => !existed,
                // Remote targets are only visible once connected; the table stands in.
                (TableCreationPolicy::OnceIfNew, None) => !storage
                    .table_exists(&self.config.table_name)
                    .map_err(|source| SinkError::TableCreation {
                        table: self.config.table_name.clone(),
                        source,
                    })?,
            };
            if due {
                storage
                    .execute(statement)
                    .map_err(|source| SinkError::TableCreation {
                        table: self.config.table_name.clone(),
                        source,
                    })?;
                info!(
                    "Ran table creation for {} on {}",
                    self.config.table_name, target
                );
            } else {
                debug!("Target {} already existed, skipping table creation", target);
            }
        }

        Ok(PartitionWriter::open(
            partition,
            self.config.table_name.clone(),
            self.config.batch_size,
            storage,
            ConfiguredStrategy::from_mode(self.config.write_mode),
            resume_state,
        ))
    }
}
