//! Run manifest: what a run produced, skipped and failed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clim_common::{ErrorScope, PipelineError};

/// One unit that did not produce output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub provider: String,
    pub variable: String,
    /// Decade label or region name; absent when the whole variable failed.
    pub selector: Option<String>,
    pub time_filter: Option<String>,
    pub product: Option<String>,
    pub scope: ErrorScope,
    pub kind: String,
    pub reason: String,
}

/// One store key that failed to merge or publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedKey {
    pub key: String,
    pub kind: String,
    pub reason: String,
}

impl FailedKey {
    pub fn new(key: impl Into<String>, error: &PipelineError) -> Self {
        Self {
            key: key.into(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicationSummary {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedKey>,
    pub deleted_objects: usize,
    /// Set when publication could not run at all.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub run_dir: PathBuf,
    pub store_root: PathBuf,
    pub store_generation: u64,
    pub succeeded_units: usize,
    /// Keys written into the store by this run.
    pub written_keys: Vec<String>,
    /// Keys whose content was already in the store.
    pub unchanged_keys: Vec<String>,
    pub failed_units: Vec<FailedUnit>,
    pub failed_merges: Vec<FailedKey>,
    /// Absent when publication is not configured or was skipped.
    pub publication: Option<PublicationSummary>,
}

impl RunManifest {
    pub fn new(run_id: Uuid, run_dir: PathBuf, store_root: PathBuf) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            run_dir,
            store_root,
            store_generation: 0,
            succeeded_units: 0,
            written_keys: Vec::new(),
            unchanged_keys: Vec::new(),
            failed_units: Vec::new(),
            failed_merges: Vec::new(),
            publication: None,
        }
    }

    /// A run succeeds when at least one unit produced output.
    pub fn is_success(&self) -> bool {
        self.succeeded_units > 0
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
    }
}
