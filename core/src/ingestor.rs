use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, save_checkpoint};
use crate::collector::Collector;
use crate::config::SinkConfig;
use crate::errors::{Result, SinkError};
use crate::partition::{PartitionWriter, ResumeState};
use crate::record::Record;
use crate::router::PartitionedSink;
use crate::storage::{Connector, DuckDbConnector};
use crate::telemetry::SinkMetrics;

/// A record together with the key it is routed by.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyedRecord {
    pub key: String,
    pub value: Record,
}

/// The ingestor drives the data flow: key -> partition -> collected group ->
/// partition writer, and answers checkpoint requests for all partitions.
pub struct Ingestor<C: Connector = DuckDbConnector> {
    sink: PartitionedSink<C>,
    writers: BTreeMap<String, PartitionWriter<C::Storage>>,
    collector: Collector<Record>,
}

impl Ingestor<DuckDbConnector> {
    pub fn new(config: SinkConfig, checkpoint: Option<&Checkpoint>) -> Result<Self> {
        Self::with_sink(PartitionedSink::new(config)?, checkpoint)
    }
}

impl<C: Connector> Ingestor<C> {
    /// Builds or resumes one writer per configured partition.
    ///
    /// Checkpoint entries for partitions that are no longer configured are
    /// reported and ignored.
    pub fn with_sink(sink: PartitionedSink<C>, checkpoint: Option<&Checkpoint>) -> Result<Self> {
        if let Some(checkpoint) = checkpoint {
            for stale in checkpoint
                .partitions
                .keys()
                .filter(|id| !sink.list_parts().contains(*id))
            {
                warn!("Ignoring checkpoint state of unknown partition {}", stale);
            }
        }

        let mut writers = BTreeMap::new();
        for id in sink.list_parts() {
            let resume_state = checkpoint.and_then(|c| c.resume_state(id));
            writers.insert(id.clone(), sink.build_or_resume(id, resume_state)?);
        }

        let config = sink.config();
        let collector = Collector::new(config.batch_size, config.flush_timeout());
        info!(
            "Ingestor ready with {} partitions (batch size {}, flush timeout {:?})",
            writers.len(),
            config.batch_size,
            config.flush_timeout()
        );

        Ok(Self {
            sink,
            writers,
            collector,
        })
    }

    pub fn ingest(&mut self, key: &str, record: Record) -> Result<()> {
        self.ingest_at(key, record, Instant::now())
    }

    pub fn ingest_at(&mut self, key: &str, record: Record, now: Instant) -> Result<()> {
        let partition = self.sink.route(key).to_string();
        match self.collector.push(&partition, record, now) {
            Some(group) => self.deliver(&partition, group),
            None => Ok(()),
        }
    }

    /// Hands every timed-out group to its writer. Returns the number of
    /// records delivered.
    ///
    /// A failing partition does not stop delivery to the others; the first
    /// error is returned once every group has been handed over.
    pub fn tick(&mut self) -> Result<usize> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> Result<usize> {
        let mut delivered = 0;
        let mut first_error = None;
        for (partition, group) in self.collector.drain_expired(now) {
            let len = group.len();
            match self.deliver(&partition, group) {
                Ok(()) => delivered += len,
                Err(e) => {
                    error!("Failed to deliver timed-out group to {}: {}", partition, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    fn deliver(&mut self, partition: &str, items: Vec<Record>) -> Result<()> {
        let writer = self
            .writers
            .get_mut(partition)
            .ok_or_else(|| SinkError::UnknownPartition {
                partition: partition.to_string(),
            })?;
        writer.write_batch(items)
    }

    /// Resume states of every partition. Records still held by the collector
    /// are in neither the buffers nor the checkpoint and must be replayed.
    pub fn snapshot(&self) -> Result<Checkpoint> {
        let mut partitions = BTreeMap::new();
        for (id, writer) in &self.writers {
            partitions.insert(id.clone(), writer.snapshot()?);
        }
        Ok(Checkpoint::new(partitions))
    }

    /// Snapshots every partition and persists the result to `path`.
    pub fn save_checkpoint(&self, path: &Path) -> Result<Checkpoint> {
        let checkpoint = self.snapshot()?;
        save_checkpoint(path, &checkpoint)?;
        Ok(checkpoint)
    }

    /// Per-partition progress that stays readable after shutdown, for the
    /// final checkpoint.
    pub fn progress(&self) -> Checkpoint {
        let partitions = self
            .writers
            .iter()
            .map(|(id, writer)| {
                let state = ResumeState {
                    total_rows_written: writer.total_rows_written(),
                    buffer_length: writer.buffer_len() as u64,
                };
                (id.clone(), state)
            })
            .collect();
        Checkpoint::new(partitions)
    }

    /// Delivers everything still collected, then closes every partition.
    /// All partitions are closed even if one fails; the first error is returned.
    pub fn shutdown(&mut self) -> Result<SinkMetrics> {
        let mut first_error = None;

        for (partition, group) in self.collector.drain_all() {
            if let Err(e) = self.deliver(&partition, group) {
                error!("Failed to deliver final group to {}: {}", partition, e);
                first_error.get_or_insert(e);
            }
        }

        for (id, writer) in self.writers.iter_mut() {
            if let Err(e) = writer.close() {
                error!("Failed to close partition {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }

        let metrics = self.metrics();
        info!(
            "Sink shut down: {} rows written in {} flushes ({} row fallbacks)",
            metrics.rows_written, metrics.flushes, metrics.row_fallbacks
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(metrics),
        }
    }

    pub fn metrics(&self) -> SinkMetrics {
        let mut metrics = SinkMetrics::default();
        for writer in self.writers.values() {
            metrics.merge(writer.metrics());
        }
        metrics
    }

    pub fn writer(&self, partition: &str) -> Option<&PartitionWriter<C::Storage>> {
        self.writers.get(partition)
    }

    pub fn sink(&self) -> &PartitionedSink<C> {
        &self.sink
    }

    pub fn pending_len(&self) -> usize {
        self.collector.pending_len()
    }
}
