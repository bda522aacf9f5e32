//! Merging run outputs into the consolidated store.
//!
//! The store is a Zarr hierarchy on the local filesystem. Each key is one
//! group directory, replaced as a whole: the new output is copied into a
//! staging area, then swapped in with directory renames. Readers see either
//! the previous or the new key, never a mix of chunks. Keys outside a batch
//! are never touched.
//!
//! `keys.json` at the store root maps every key to a digest of its files;
//! merging an output whose digest is already recorded is a no-op. A key
//! swap counts as committed once the index recording it is saved; until
//! then the displaced directory is kept and put back on failure.
//!
//! One process writes a store at a time: [`StoreMerger::open`] takes the
//! `.lock` file at the root and refuses a store that is already locked.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zarrs::group::GroupBuilder;
use zarrs_filesystem::FilesystemStore;

use clim_common::{PipelineError, PipelineResult};

use crate::error::{StoreError, StoreResult};
use crate::key::StoreKey;
use crate::output::RunOutput;

/// Index file at the store root.
pub const INDEX_FILE: &str = "keys.json";
const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";
/// Writer lock at the store root.
pub const LOCK_FILE: &str = ".lock";

/// Number of path components in a key.
const KEY_DEPTH: usize = 5;

// ============================================================================
// Index
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// CRC32 over relative paths and contents of the key's files, in path order.
    pub digest: String,
    pub files: usize,
    pub bytes: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreIndex {
    /// Incremented on every committed key.
    pub generation: u64,
    pub keys: BTreeMap<String, IndexEntry>,
}

impl StoreIndex {
    /// Read the index of a store; a store without one has an empty index.
    pub fn load(root: &Path) -> StoreResult<Self> {
        let path = root.join(INDEX_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the index through a temporary file and a rename.
    pub fn save(&self, root: &Path) -> StoreResult<()> {
        let tmp = root.join(format!(".{}.{}", INDEX_FILE, Uuid::new_v4()));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        if let Err(e) = std::fs::rename(&tmp, root.join(INDEX_FILE)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn digest(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(|e| e.digest.as_str())
    }
}

/// Files under `dir` as (relative `/`-separated path, absolute path), sorted.
pub fn list_files(dir: &Path) -> StoreResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| StoreError::Index(e.to_string()))?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((relative, entry.path().to_path_buf()));
    }
    Ok(files)
}

/// Digest, file count and byte count of a key directory.
pub fn digest_dir(dir: &Path) -> StoreResult<(String, usize, u64)> {
    let files = list_files(dir)?;
    if files.is_empty() {
        return Err(StoreError::Index(format!(
            "{} holds no files",
            dir.display()
        )));
    }
    let mut hasher = crc32fast::Hasher::new();
    let mut bytes = 0u64;
    for (relative, path) in &files {
        let contents = std::fs::read(path)?;
        hasher.update(relative.as_bytes());
        hasher.update(&[0]);
        hasher.update(&contents);
        bytes += contents.len() as u64;
    }
    Ok((format!("{:08x}", hasher.finalize()), files.len(), bytes))
}

// ============================================================================
// Merger
// ============================================================================

/// Handle to a consolidated store at a given generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRef {
    pub root: PathBuf,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The key now holds the new output.
    Written,
    /// The key already held identical content.
    Unchanged,
}

#[derive(Debug)]
pub struct MergeReport {
    pub store: StoreRef,
    pub written: Vec<StoreKey>,
    pub unchanged: Vec<StoreKey>,
    pub failed: Vec<(StoreKey, PipelineError)>,
}

/// Single writer per key over one consolidated store.
///
/// Merges of different keys run concurrently; merges of the same key queue
/// on that key's lock.
pub struct StoreMerger {
    root: PathBuf,
    _lock: WriterLock,
    key_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    index: tokio::sync::Mutex<StoreIndex>,
}

impl StoreMerger {
    /// Open (or create) the store at `root`.
    ///
    /// Fails with a conflict while another merger holds the store. Swaps
    /// interrupted before their index was saved are rolled back.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let lock = WriterLock::acquire(&root)?;
        if !root.join("zarr.json").exists() {
            let store = Arc::new(FilesystemStore::new(&root).map_err(StoreError::zarr)?);
            GroupBuilder::new()
                .build(store, "/")
                .map_err(StoreError::zarr)?
                .store_metadata()
                .map_err(StoreError::zarr)?;
        }
        recover(&root)?;
        let index = StoreIndex::load(&root)?;
        info!(root = %root.display(), keys = index.keys.len(), generation = index.generation, "Opened store");

        Ok(Self {
            root,
            _lock: lock,
            key_locks: std::sync::Mutex::new(HashMap::new()),
            index: tokio::sync::Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn store_ref(&self) -> StoreRef {
        StoreRef {
            root: self.root.clone(),
            generation: self.index.lock().await.generation,
        }
    }

    pub async fn index(&self) -> StoreIndex {
        self.index.lock().await.clone()
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.key_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Merge a batch of outputs.
    ///
    /// Every store path claimed by more than one output is rejected with a
    /// write conflict and left as it was; the other keys merge concurrently.
    #[instrument(skip(self, outputs), fields(root = %self.root.display(), outputs = outputs.len()))]
    pub async fn merge(&self, outputs: Vec<RunOutput>) -> MergeReport {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for output in &outputs {
            *counts.entry(output.key.path()).or_default() += 1;
        }

        let mut failed = Vec::new();
        let mut unique = Vec::new();
        let mut reported = std::collections::HashSet::new();
        for output in outputs {
            let n = counts.get(&output.key.path()).copied().unwrap_or(0);
            if n > 1 {
                if reported.insert(output.key.path()) {
                    let err = StoreError::Conflict(format!("{} outputs in one batch", n))
                        .into_pipeline(&output.key.path());
                    warn!(key = %output.key, reason = %err, "Rejected conflicting outputs");
                    failed.push((output.key, err));
                }
            } else {
                unique.push(output);
            }
        }

        let results =
            futures::future::join_all(unique.iter().map(|output| self.merge_output(output))).await;

        let mut written = Vec::new();
        let mut unchanged = Vec::new();
        for (output, result) in unique.into_iter().zip(results) {
            match result {
                Ok(MergeOutcome::Written) => written.push(output.key),
                Ok(MergeOutcome::Unchanged) => unchanged.push(output.key),
                Err(err) => failed.push((output.key, err)),
            }
        }

        let store = self.store_ref().await;
        info!(
            written = written.len(),
            unchanged = unchanged.len(),
            failed = failed.len(),
            generation = store.generation,
            "Merge complete"
        );
        MergeReport {
            store,
            written,
            unchanged,
            failed,
        }
    }

    /// Replace one key with an output, atomically for that key.
    #[instrument(skip(self, output), fields(key = %output.key))]
    pub async fn merge_output(&self, output: &RunOutput) -> PipelineResult<MergeOutcome> {
        let key_path = output.key.path();
        let lock = self.key_lock(&key_path);
        let _guard = lock.lock().await;

        let src = output.path.clone();
        let (digest, files, bytes) = blocking(&key_path, move || digest_dir(&src)).await?;

        let target = self.root.join(&key_path);
        {
            let index = self.index.lock().await;
            if index.digest(&key_path) == Some(digest.as_str()) && target.is_dir() {
                debug!(digest = %digest, "Key unchanged");
                return Ok(MergeOutcome::Unchanged);
            }
        }

        let root = self.root.clone();
        let src = output.path.clone();
        let path = key_path.clone();
        let swap = blocking(&key_path, move || {
            let swap = swap_into_place(&root, &src, &path)?;
            if let Err(e) = ensure_groups(&root, &path) {
                swap.rollback();
                return Err(e);
            }
            Ok(swap)
        })
        .await?;

        let mut index = self.index.lock().await;
        let mut updated = index.clone();
        updated.generation += 1;
        updated.keys.insert(
            key_path.clone(),
            IndexEntry {
                digest: digest.clone(),
                files,
                bytes,
                updated_at: Utc::now(),
            },
        );
        let root = self.root.clone();
        let to_save = updated.clone();
        blocking(&key_path, move || match to_save.save(&root) {
            Ok(()) => {
                swap.commit();
                Ok(())
            }
            Err(e) => {
                swap.rollback();
                Err(e)
            }
        })
        .await?;
        *index = updated;

        info!(digest = %digest, files = files, bytes = bytes, generation = index.generation, "Merged key");
        Ok(MergeOutcome::Written)
    }
}

/// Exclusive writer lock, held as a file created with `create_new`.
struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    fn acquire(root: &Path) -> StoreResult<Self> {
        let path = root.join(LOCK_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                writeln!(file, "{}", std::process::id())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                Err(StoreError::Conflict(format!(
                    "store {} is locked by process {}; remove {} if that process is gone",
                    root.display(),
                    holder.trim(),
                    path.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}

/// Run filesystem work on the blocking pool, scoping failures to `key`.
async fn blocking<T, F>(key: &str, f: F) -> PipelineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| e.into_pipeline(key)),
        Err(e) => Err(PipelineError::StoreWriteFailure {
            key: key.to_string(),
            reason: format!("merge task failed: {}", e),
        }),
    }
}

fn copy_dir(src: &Path, dst: &Path) -> StoreResult<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StoreError::Index(e.to_string()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A key directory swapped in but not yet committed.
///
/// Holds the displaced directory (if any) until [`Swap::commit`] drops it
/// or [`Swap::rollback`] puts it back.
#[derive(Debug)]
struct Swap {
    target: PathBuf,
    key_path: String,
    trash_root: PathBuf,
    displaced: Option<PathBuf>,
}

impl Swap {
    fn commit(self) {
        if self.trash_root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.trash_root) {
                warn!(key = %self.key_path, error = %e, "Failed to remove displaced key");
            }
        }
    }

    /// Remove the new directory and restore the displaced one.
    fn rollback(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.target) {
            warn!(key = %self.key_path, error = %e, "Failed to remove uncommitted key");
        }
        if let Some(displaced) = &self.displaced {
            if let Err(e) = std::fs::rename(displaced, &self.target) {
                warn!(key = %self.key_path, error = %e, "Failed to restore displaced key");
                return;
            }
        }
        let _ = std::fs::remove_dir_all(&self.trash_root);
    }
}

/// Stage `src`, then swap it in for `root/key_path`.
///
/// On failure the previous directory stays (or is put back) in place. On
/// success the caller commits or rolls back the returned [`Swap`].
fn swap_into_place(root: &Path, src: &Path, key_path: &str) -> StoreResult<Swap> {
    if !src.is_dir() {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("run output {} does not exist", src.display()),
        )));
    }

    let txn = Uuid::new_v4().to_string();
    let staging = root.join(STAGING_DIR).join(&txn);
    if let Err(e) = copy_dir(src, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let target = root.join(key_path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let trash_root = root.join(TRASH_DIR).join(&txn);
    let displaced = if target.exists() {
        let trash = trash_root.join(key_path);
        if let Some(parent) = trash.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = std::fs::rename(&target, &trash) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        Some(trash)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(&staging, &target) {
        if let Some(trash) = &displaced {
            if let Err(restore) = std::fs::rename(trash, &target) {
                warn!(key = %key_path, error = %restore, "Failed to restore displaced key");
            }
        }
        let _ = std::fs::remove_dir_all(&staging);
        let _ = std::fs::remove_dir_all(&trash_root);
        return Err(e.into());
    }

    Ok(Swap {
        target,
        key_path: key_path.to_string(),
        trash_root,
        displaced,
    })
}

/// Group metadata for every ancestor of a key, so the store is a complete hierarchy.
fn ensure_groups(root: &Path, key_path: &str) -> StoreResult<()> {
    let store = Arc::new(FilesystemStore::new(root).map_err(StoreError::zarr)?);
    let components: Vec<&str> = key_path.split('/').collect();
    for depth in 1..components.len() {
        let prefix = components[..depth].join("/");
        if root.join(&prefix).join("zarr.json").exists() {
            continue;
        }
        GroupBuilder::new()
            .build(store.clone(), &format!("/{}", prefix))
            .map_err(StoreError::zarr)?
            .store_metadata()
            .map_err(StoreError::zarr)?;
    }
    Ok(())
}

/// Roll back swaps whose index was never saved and clear leftovers.
///
/// A displaced key is restored unless the index already records the
/// digest of the directory that replaced it.
fn recover(root: &Path) -> StoreResult<()> {
    let trash = root.join(TRASH_DIR);
    if trash.is_dir() {
        let index = StoreIndex::load(root)?;
        let mut displaced = Vec::new();
        for entry in walkdir::WalkDir::new(&trash)
            .min_depth(KEY_DEPTH + 1)
            .max_depth(KEY_DEPTH + 1)
        {
            let entry = entry?;
            if entry.file_type().is_dir() {
                displaced.push(entry.into_path());
            }
        }
        for path in displaced {
            let Ok(relative) = path.strip_prefix(&trash) else {
                continue;
            };
            // First component is the transaction id.
            let key_path: PathBuf = relative.components().skip(1).collect();
            let key = key_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let target = root.join(&key_path);
            if target.exists() {
                let committed = match digest_dir(&target) {
                    Ok((digest, _, _)) => index.digest(&key) == Some(digest.as_str()),
                    Err(_) => false,
                };
                if committed {
                    continue;
                }
                warn!(key = %key, "Rolling back a key swapped in without a saved index");
                std::fs::remove_dir_all(&target)?;
            } else {
                warn!(key = %key, "Restoring key displaced by an interrupted merge");
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::rename(&path, &target)?;
        }
        std::fs::remove_dir_all(&trash)?;
    }
    let staging = root.join(STAGING_DIR);
    if staging.is_dir() {
        std::fs::remove_dir_all(&staging)?;
    }
    Ok(())
}
