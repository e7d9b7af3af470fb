//! Persisted resume states, one per partition.
//!
//! The file is pretty-printed JSON followed by a `#crc32` trailer line and is
//! replaced atomically on every save.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::CheckpointError;
use crate::partition::ResumeState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub partitions: BTreeMap<String, ResumeState>,
    /// Unix millis.
    pub created_at: u64,
}

impl Checkpoint {
    pub const VERSION: u32 = 1;

    pub fn new(partitions: BTreeMap<String, ResumeState>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            version: Self::VERSION,
            partitions,
            created_at,
        }
    }

    pub fn resume_state(&self, partition: &str) -> Option<ResumeState> {
        self.partitions.get(partition).copied()
    }

    pub fn total_rows_written(&self) -> u64 {
        self.partitions.values().map(|s| s.total_rows_written).sum()
    }
}

pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let json = serde_json::to_string_pretty(checkpoint)
        .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    let checksum = crc32fast::hash(json.as_bytes());
    let content = format!("{}\n#{:08x}", json, checksum);

    let temp_path = path.with_extension("checkpoint.tmp");
    let mut file =
        std::fs::File::create(&temp_path).map_err(|e| CheckpointError::Io(e.to_string()))?;
    file.write_all(content.as_bytes())
        .map_err(|e| CheckpointError::Io(e.to_string()))?;
    file.sync_all()
        .map_err(|e| CheckpointError::Io(e.to_string()))?;
    drop(file);

    std::fs::rename(&temp_path, path).map_err(|e| CheckpointError::Io(e.to_string()))?;

    tracing::debug!(
        "Saved checkpoint for {} partitions ({} rows written)",
        checkpoint.partitions.len(),
        checkpoint.total_rows_written()
    );
    Ok(())
}

/// Returns `None` when no checkpoint was saved yet.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path).map_err(|e| CheckpointError::Io(e.to_string()))?;
    let (json, checksum_line) = content
        .rsplit_once('\n')
        .ok_or_else(|| CheckpointError::Corrupted("missing checksum line".to_string()))?;

    let expected = checksum_line
        .strip_prefix('#')
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| CheckpointError::Corrupted("invalid checksum format".to_string()))?;
    let actual = crc32fast::hash(json.as_bytes());
    if expected != actual {
        return Err(CheckpointError::Corrupted(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    let checkpoint: Checkpoint =
        serde_json::from_str(json).map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    if checkpoint.version > Checkpoint::VERSION {
        return Err(CheckpointError::UnsupportedVersion(checkpoint.version));
    }

    tracing::info!(
        "Loaded checkpoint for {} partitions ({} rows written)",
        checkpoint.partitions.len(),
        checkpoint.total_rows_written()
    );
    Ok(Some(checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            "partition_0".to_string(),
            ResumeState {
                total_rows_written: 90,
                buffer_length: 10,
            },
        );
        partitions.insert("partition_1".to_string(), ResumeState::default());
        Checkpoint::new(partitions)
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.checkpoint");
        let checkpoint = sample();

        save_checkpoint(&path, &checkpoint).unwrap();
        let loaded = load_checkpoint(&path).unwrap().unwrap();

        assert_eq!(loaded, checkpoint);
        assert_eq!(
            loaded.resume_state("partition_0"),
            Some(ResumeState {
                total_rows_written: 90,
                buffer_length: 10
            })
        );
        assert_eq!(loaded.resume_state("partition_9"), None);
        assert_eq!(loaded.total_rows_written(), 90);
    }

    #[test]
    fn test_partition_states_stored_as_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.checkpoint");
        save_checkpoint(&path, &sample()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"partition_0\": [\n      90,\n      10\n    ]"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_checkpoint(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn test_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.checkpoint");
        save_checkpoint(&path, &sample()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("90", "91")).unwrap();

        assert!(matches!(
            load_checkpoint(&path),
            Err(CheckpointError::Corrupted(_))
        ));
    }

    #[test]
    fn test_rejects_newer_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.checkpoint");
        let mut checkpoint = sample();
        checkpoint.version = Checkpoint::VERSION + 1;
        save_checkpoint(&path, &checkpoint).unwrap();

        assert!(matches!(
            load_checkpoint(&path),
            Err(CheckpointError::UnsupportedVersion(2))
        ));
    }
}
