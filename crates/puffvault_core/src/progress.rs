//! Progress tracking and resumable state.
//!
//! The cursor is the single high-water mark of fully-resolved batches. It
//! advances only after every record in a batch has been attempted, never
//! mid-batch, so a resumed run starting from the persisted value can never
//! skip an unprocessed record. State is written to a JSON file after each
//! batch; the run log appends one line per uploaded document.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Resumable run state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    /// Highest source id among fully-resolved batches.
    pub cursor: i64,
    pub processed: u64,
    pub failed: u64,
    pub owners_seen: u64,
    pub identities_provisioned: u64,
    pub batches_completed: u64,
}

/// One uploaded document, as recorded in the run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLogEntry {
    pub owner_ref: i64,
    pub owner_did: String,
    pub collection_id: Uuid,
    pub document_id: String,
}

/// Tracks the migration cursor and cumulative counters.
#[derive(Debug)]
pub struct ProgressTracker {
    state: ProgressState,
    owners: HashSet<i64>,
    state_path: Option<PathBuf>,
}

impl ProgressTracker {
    pub fn new(start_cursor: i64) -> Self {
        Self {
            state: ProgressState {
                cursor: start_cursor,
                ..Default::default()
            },
            owners: HashSet::new(),
            state_path: None,
        }
    }

    /// Resume from a state file if it exists, otherwise start fresh at
    /// `start_cursor`. The persisted cursor is the only value consulted on
    /// resume.
    pub fn resume(path: impl Into<PathBuf>, start_cursor: i64) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let state: ProgressState = serde_json::from_str(&contents)?;
                tracing::info!(
                    cursor = state.cursor,
                    processed = state.processed,
                    path = %path.display(),
                    "resuming from persisted state"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProgressState {
                cursor: start_cursor,
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state,
            owners: HashSet::new(),
            state_path: Some(path),
        })
    }

    /// Current cursor value.
    pub fn current(&self) -> i64 {
        self.state.cursor
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn record_owner(&mut self, owner_ref: i64) {
        if self.owners.insert(owner_ref) {
            self.state.owners_seen += 1;
        }
    }

    pub fn record_processed(&mut self, n: u64) {
        self.state.processed += n;
    }

    pub fn record_failed(&mut self, n: u64) {
        self.state.failed += n;
    }

    pub fn set_identities_provisioned(&mut self, n: u64) {
        self.state.identities_provisioned = n;
    }

    /// Mark a batch fully resolved up to `last_committed_id` and persist.
    /// The cursor never moves backward.
    pub fn advance(&mut self, last_committed_id: i64) -> Result<()> {
        self.state.cursor = self.state.cursor.max(last_committed_id);
        self.state.batches_completed += 1;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn summary(&self, elapsed: Duration) -> MigrationSummary {
        let elapsed_secs = elapsed.as_secs_f64();
        let records_per_second = if elapsed_secs > 0.0 {
            (self.state.processed as f64 / elapsed_secs).round() as u64
        } else {
            0
        };
        MigrationSummary {
            processed: self.state.processed,
            failed: self.state.failed,
            owners_seen: self.state.owners_seen,
            identities_provisioned: self.state.identities_provisioned,
            batches_completed: self.state.batches_completed,
            final_cursor: self.state.cursor,
            elapsed_secs: elapsed.as_secs(),
            records_per_second,
        }
    }
}

/// End-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub processed: u64,
    pub failed: u64,
    pub owners_seen: u64,
    pub identities_provisioned: u64,
    pub batches_completed: u64,
    pub final_cursor: i64,
    pub elapsed_secs: u64,
    pub records_per_second: u64,
}

impl std::fmt::Display for MigrationSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "processed:               {}", self.processed)?;
        writeln!(f, "failed:                  {}", self.failed)?;
        writeln!(f, "unique owners:           {}", self.owners_seen)?;
        writeln!(f, "identities provisioned:  {}", self.identities_provisioned)?;
        writeln!(f, "batches completed:       {}", self.batches_completed)?;
        writeln!(f, "final cursor:            {}", self.final_cursor)?;
        write!(
            f,
            "elapsed:                 {}s ({} records/s)",
            self.elapsed_secs, self.records_per_second
        )
    }
}

/// Append-only per-batch upload log.
#[derive(Debug)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Write one batch's upload records to `batch_<n>_log.txt`.
    pub fn append_batch(&self, batch_num: u64, entries: &[UploadLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(format!("batch_{batch_num}_log.txt"));
        let mut file = std::fs::File::create(&path)?;
        for entry in entries {
            writeln!(
                file,
                "{}, {}, {}, {}",
                entry.owner_ref, entry.owner_did, entry.collection_id, entry.document_id
            )?;
        }
        tracing::debug!(batch = batch_num, entries = entries.len(), path = %path.display(), "wrote batch log");
        Ok(())
    }
}
