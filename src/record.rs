//! Append-only iteration records for audit.
//!
//! One JSON line per iteration under the artifacts directory, preceded by a
//! run-header line carrying the run id. Indices are enforced to be strictly
//! increasing for the lifetime of the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::decide::Decision;
use crate::metrics::MetricsSummary;

/// What happened to the tree in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Candidate proved an improvement; the tree stays mutated.
    Kept,
    /// Candidate was applied and measured, then rolled back.
    Reverted,
    /// No candidate ever touched the tree.
    Skipped,
    /// Baseline infrastructure failed before any mutation.
    Failed,
}

/// Audit record for one iteration of the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: usize,
    pub baseline: MetricsSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<MetricsSummary>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunHeader {
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

/// Line-delimited JSON log of iteration records.
pub struct RecordLog {
    file: File,
    path: PathBuf,
    last_index: Option<usize>,
}

impl RecordLog {
    /// Create `records.jsonl` under the artifacts directory and stamp the
    /// run header.
    pub fn create(artifacts_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(artifacts_dir)?;
        let path = artifacts_dir.join("records.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let header = RunHeader {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        };
        writeln!(file, "{}", serde_json::to_string(&header)?)?;
        file.flush()?;

        Ok(Self {
            file,
            path,
            last_index: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Indices must be strictly increasing.
    pub fn append(&mut self, record: &IterationRecord) -> anyhow::Result<()> {
        if let Some(last) = self.last_index {
            anyhow::ensure!(
                record.index > last,
                "iteration index went backwards: {} after {}",
                record.index,
                last
            );
        }
        writeln!(self.file, "{}", serde_json::to_string(record)?)?;
        self.file.flush()?;
        self.last_index = Some(record.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, outcome: Outcome) -> IterationRecord {
        IterationRecord {
            index,
            baseline: MetricsSummary::failed(),
            candidate: None,
            outcome,
            decision: None,
            note: None,
        }
    }

    #[test]
    fn test_records_round_trip_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RecordLog::create(dir.path()).unwrap();
        log.append(&record(0, Outcome::Skipped)).unwrap();
        log.append(&record(1, Outcome::Kept)).unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 records

        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert!(header.get("run_id").is_some());

        let first: IterationRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.outcome, Outcome::Skipped);
    }

    #[test]
    fn test_indices_must_increase() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RecordLog::create(dir.path()).unwrap();
        log.append(&record(3, Outcome::Failed)).unwrap();
        assert!(log.append(&record(3, Outcome::Kept)).is_err());
        assert!(log.append(&record(2, Outcome::Kept)).is_err());
        assert!(log.append(&record(4, Outcome::Kept)).is_ok());
    }

    #[test]
    fn test_outcome_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Outcome::Reverted).unwrap(),
            "\"reverted\""
        );
    }
}
