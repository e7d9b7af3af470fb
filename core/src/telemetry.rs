use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::strategy::WritePath;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sink_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SinkMetrics {
    pub flushes: usize,
    pub failed_flushes: usize,
    pub bulk_writes: usize,
    pub row_writes: usize,
    pub row_fallbacks: usize,
    pub rows_written: u64,
}

impl SinkMetrics {
    pub fn record_flush(&mut self, path: WritePath, rows: usize) {
        self.flushes += 1;
        self.rows_written += rows as u64;
        match path {
            WritePath::Bulk => self.bulk_writes += 1,
            WritePath::Row => self.row_writes += 1,
            WritePath::RowFallback => {
                self.row_writes += 1;
                self.row_fallbacks += 1;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.failed_flushes += 1;
    }

    pub fn merge(&mut self, other: &SinkMetrics) {
        self.flushes += other.flushes;
        self.failed_flushes += other.failed_flushes;
        self.bulk_writes += other.bulk_writes;
        self.row_writes += other.row_writes;
        self.row_fallbacks += other.row_fallbacks;
        self.rows_written += other.rows_written;
    }
}
