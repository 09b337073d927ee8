//! Durable per-item outcomes for resumable runs.
//!
//! A batch over tens of thousands of items takes hours and gets interrupted.
//! This module remembers what each item ended as, so the next run only
//! re-attempts what did not succeed.
//!
//! # Design
//!
//! Workers compute results concurrently, but there is one logical writer:
//! [`StateStore::record`] takes the state mutex for the duration of a map
//! insert, nothing more. [`StateStore::checkpoint`] snapshots the map under
//! that same lock, then serializes and writes outside it, so a slow disk never
//! stalls the workers.
//!
//! ## Storage
//!
//! The state file is a single JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "processed": ["720575941350274352"],
//!   "failed": [{"id": "7205...", "error": "fetch: not found", "timestamp": "..."}],
//!   "records": {"720575941350274352": { "status": "success", ... }},
//!   "last_run": "2026-10-18T09:12:44Z"
//! }
//! ```
//!
//! `processed` and `failed` are derived from `records` at every checkpoint and
//! kept for operators and older tooling that only read those lists. A file
//! without `records` is upgraded on load by treating every `processed` id as a
//! success.
//!
//! Checkpoints are written to a temp file in the same directory and renamed
//! over the old file, so a reader sees either the previous document or the new
//! one, never a prefix of it.
//!
//! ## Resume semantics
//!
//! Only `success` counts as done. Failed items are retried on the next run,
//! and items that were queued but never started (cancelled run) have no record
//! at all.

use crate::route::RouteKind;
use crate::types::{Format, Region};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Version of the state document. Bump when the record layout changes
/// incompatibly.
const STATE_VERSION: u32 = 1;

/// Attempts per checkpoint before the error is surfaced.
const CHECKPOINT_ATTEMPTS: u32 = 3;

const CHECKPOINT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("state file {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("state file {path} has version {found}, expected {STATE_VERSION}")]
    Version { path: PathBuf, found: u32 },
}

/// Per-item status.
///
/// The pipeline only ever writes `success` and `failed`. Items skipped on
/// resume keep their earlier `success` record and show up as the skipped
/// count of the run summary. `skipped` is still accepted when reading a
/// state file, and such items are not done: they are processed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Pending => "pending",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        })
    }
}

/// Outcome for one template an item was written into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub template_id: String,
    pub template_name: String,
    pub region: Region,
    pub route: RouteKind,
    /// Candidate name whose transform succeeded (`None` for approximate or
    /// unregistered routes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate: Option<String>,
    pub files: BTreeMap<Format, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub item_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingRecord {
    pub fn pending(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            status: Status::Pending,
            primary_template: None,
            targets: Vec::new(),
            error: None,
            completed_at: None,
        }
    }

    pub fn success(
        item_id: impl Into<String>,
        primary_template: String,
        targets: Vec<TargetRecord>,
    ) -> Self {
        Self {
            status: Status::Success,
            primary_template: Some(primary_template),
            targets,
            completed_at: Some(Utc::now()),
            ..Self::pending(item_id)
        }
    }

    pub fn failed(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            error: Some(error.into()),
            completed_at: Some(Utc::now()),
            ..Self::pending(item_id)
        }
    }

    /// Files written for the primary template.
    pub fn primary_files(&self) -> Option<&BTreeMap<Format, String>> {
        let primary = self.primary_template.as_deref()?;
        self.targets
            .iter()
            .find(|t| t.template_id == primary)
            .map(|t| &t.files)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub id: String,
    pub error: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// The full map of outcomes plus the last-run timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub records: BTreeMap<String, ProcessingRecord>,
    pub last_run: Option<DateTime<Utc>>,
}

impl PipelineState {
    pub fn count(&self, status: Status) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }

    pub fn failures(&self) -> Vec<FailureEntry> {
        self.records
            .values()
            .filter(|r| r.status == Status::Failed)
            .map(|r| FailureEntry {
                id: r.item_id.clone(),
                error: r.error.clone().unwrap_or_else(|| "unknown error".into()),
                timestamp: r.completed_at,
            })
            .collect()
    }
}

/// On-disk shape of [`PipelineState`].
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default)]
    processed: Vec<String>,
    #[serde(default)]
    failed: Vec<FailureEntry>,
    #[serde(default)]
    records: BTreeMap<String, ProcessingRecord>,
    #[serde(default)]
    last_run: Option<DateTime<Utc>>,
}

impl StateDocument {
    fn from_state(state: &PipelineState) -> Self {
        Self {
            version: STATE_VERSION,
            processed: state
                .records
                .values()
                .filter(|r| r.status == Status::Success)
                .map(|r| r.item_id.clone())
                .collect(),
            failed: state.failures(),
            records: state.records.clone(),
            last_run: state.last_run,
        }
    }

    fn into_state(self) -> PipelineState {
        let mut records = self.records;
        for id in self.processed {
            records.entry(id.clone()).or_insert_with(|| ProcessingRecord {
                status: Status::Success,
                ..ProcessingRecord::pending(id)
            });
        }
        PipelineState {
            records,
            last_run: self.last_run,
        }
    }
}

/// Thread-safe owner of the [`PipelineState`] and its file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<PipelineState>,
    /// Serializes file writes so two checkpoints never race on the rename.
    flush: Mutex<()>,
}

impl StateStore {
    /// Load the state file at `path`.
    ///
    /// A missing file is a first run. An unreadable or corrupt file is logged
    /// loudly and also treated as a first run; the bad file is overwritten at
    /// the next checkpoint.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match read_state(&path) {
            Ok(Some(state)) => {
                tracing::info!(
                    path = %path.display(),
                    records = state.records.len(),
                    succeeded = state.count(Status::Success),
                    "loaded pipeline state"
                );
                state
            }
            Ok(None) => PipelineState::default(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "could not load pipeline state, starting as a first run"
                );
                PipelineState::default()
            }
        };
        Self::with_state(path, state)
    }

    pub fn with_state(path: impl Into<PathBuf>, state: PipelineState) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(state),
            flush: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert the record for `item_id`.
    pub fn record(&self, item_id: &str, record: ProcessingRecord) {
        self.lock_state().records.insert(item_id.to_string(), record);
    }

    /// True only if the stored record is a success.
    pub fn is_done(&self, item_id: &str) -> bool {
        self.lock_state()
            .records
            .get(item_id)
            .is_some_and(|r| r.status == Status::Success)
    }

    pub fn get(&self, item_id: &str) -> Option<ProcessingRecord> {
        self.lock_state().records.get(item_id).cloned()
    }

    pub fn snapshot(&self) -> PipelineState {
        self.lock_state().clone()
    }

    /// Flush the full map to disk, retrying transient failures.
    pub fn checkpoint(&self) -> Result<(), StateError> {
        let _flush = self.flush.lock().unwrap_or_else(|e| e.into_inner());
        let document = {
            let mut state = self.lock_state();
            state.last_run = Some(Utc::now());
            StateDocument::from_state(&state)
        };

        let mut attempt = 1;
        loop {
            match write_document(&self.path, &document) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < CHECKPOINT_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "checkpoint failed, retrying");
                    attempt += 1;
                    std::thread::sleep(CHECKPOINT_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        // A worker that panicked mid-insert leaves the map consistent (the
        // insert either happened or not), so poisoning is safe to ignore.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read and upgrade a state file. `Ok(None)` if it does not exist.
pub fn read_state(path: &Path) -> Result<Option<PipelineState>, StateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let document: StateDocument =
        serde_json::from_str(&content).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    if document.version != STATE_VERSION {
        return Err(StateError::Version {
            path: path.to_path_buf(),
            found: document.version,
        });
    }
    Ok(Some(document.into_state()))
}

fn write_document(path: &Path, document: &StateDocument) -> Result<(), StateError> {
    let io_err = |source: io::Error| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let json = serde_json::to_vec_pretty(document).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
