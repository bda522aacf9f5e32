//! Publishing the consolidated store to object storage.
//!
//! Keys are uploaded independently, each with its own retries, so a failing
//! key never blocks the others. The remote copy of `keys.json` records what
//! was published; keys whose digest already matches it are skipped. The
//! index is uploaded last, after every key it lists.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::{debug, info, instrument, warn};

use clim_common::{PipelineError, PipelineResult};

use crate::config::PublishConfig;
use crate::error::{StoreError, StoreResult};
use crate::merge::{list_files, StoreIndex, INDEX_FILE};

#[derive(Debug, Default)]
pub struct PublishReport {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, PipelineError)>,
    /// Remote objects removed because a republished key no longer has them.
    pub deleted_objects: usize,
}

/// Uploads a local store to an object store.
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    config: PublishConfig,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, config: PublishConfig) -> Self {
        Self { store, config }
    }

    /// Publisher for the S3 bucket described by `config`.
    pub fn from_config(config: PublishConfig) -> StoreResult<Self> {
        config.validate().map_err(StoreError::Config)?;
        let store = config.build_object_store()?;
        Ok(Self::new(store, config))
    }

    fn remote_path(&self, relative: &str) -> ObjectPath {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            ObjectPath::from(relative)
        } else {
            ObjectPath::from(format!("{}/{}", prefix, relative))
        }
    }

    /// The published index, empty when nothing was published yet.
    pub async fn remote_index(&self) -> StoreResult<StoreIndex> {
        let location = self.remote_path(INDEX_FILE);
        match self.store.get(&location).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(StoreIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish every key of the store at `root` that differs from the remote copy.
    ///
    /// Fails as a whole only when the indexes or the store metadata cannot
    /// be read or written; per-key failures land in the report.
    #[instrument(skip(self, root), fields(root = %root.display(), prefix = %self.config.prefix))]
    pub async fn publish(&self, root: &Path) -> StoreResult<PublishReport> {
        let local = StoreIndex::load(root)?;
        let mut remote = self.remote_index().await?;
        let mut report = PublishReport::default();

        let mut pending = Vec::new();
        for (key, entry) in &local.keys {
            if remote.digest(key) == Some(entry.digest.as_str()) {
                report.skipped.push(key.clone());
            } else {
                pending.push((key.clone(), entry.clone()));
            }
        }
        debug!(pending = pending.len(), skipped = report.skipped.len(), "Planned publication");

        let results: Vec<_> = futures::stream::iter(pending)
            .map(|(key, entry)| async move {
                let result = retry_with_backoff(&self.config, &key, || {
                    self.publish_key(root, &key)
                })
                .await;
                (key, entry, result)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for (key, entry, result) in results {
            match result {
                Ok(deleted) => {
                    report.deleted_objects += deleted;
                    remote.keys.insert(key.clone(), entry);
                    report.uploaded.push(key);
                }
                Err(err) => {
                    warn!(key = %key, reason = %err, "Key not published");
                    // Forget the remote entry so the next run retries the key.
                    remote.keys.remove(&key);
                    report.failed.push((key, err));
                }
            }
        }

        self.upload_hierarchy_metadata(root, &local).await?;

        remote.generation = local.generation;
        let index = serde_json::to_vec_pretty(&remote)?;
        self.store
            .put(&self.remote_path(INDEX_FILE), Bytes::from(index).into())
            .await?;

        report.uploaded.sort();
        info!(
            uploaded = report.uploaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            deleted_objects = report.deleted_objects,
            "Publication complete"
        );
        Ok(report)
    }

    /// Upload one key and delete remote objects it no longer has.
    ///
    /// Returns the number of deleted objects.
    async fn publish_key(&self, root: &Path, key: &str) -> StoreResult<usize> {
        let dir = root.join(key);
        let files = list_files(&dir)?;
        let mut wanted = HashSet::with_capacity(files.len());

        for (relative, path) in &files {
            let location = self.remote_path(&format!("{}/{}", key, relative));
            let data = tokio::fs::read(path).await?;
            let size = data.len();
            self.store.put(&location, Bytes::from(data).into()).await?;
            debug!(path = %location, size = size, "Uploaded object");
            wanted.insert(location);
        }

        let prefix = self.remote_path(key);
        let existing: Vec<ObjectPath> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;

        let mut deleted = 0;
        for location in existing.into_iter().filter(|l| !wanted.contains(l)) {
            self.store.delete(&location).await?;
            debug!(path = %location, "Deleted stale object");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Group metadata above the keys (root and intermediate `zarr.json`).
    async fn upload_hierarchy_metadata(&self, root: &Path, index: &StoreIndex) -> StoreResult<()> {
        let key_prefixes: Vec<String> = index.keys.keys().map(|k| format!("{}/", k)).collect();
        for (relative, path) in list_files(root)? {
            let is_metadata = relative == "zarr.json" || relative.ends_with("/zarr.json");
            let hidden = relative.starts_with('.');
            let in_key = key_prefixes.iter().any(|p| relative.starts_with(p.as_str()));
            if !is_metadata || hidden || in_key {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            self.store
                .put(&self.remote_path(&relative), Bytes::from(data).into())
                .await?;
        }
        Ok(())
    }
}

/// Run `op` until it succeeds or `config.max_attempts` is reached, sleeping
/// with exponential backoff between attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &PublishConfig,
    key: &str,
    mut op: F,
) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_attempts => {
                let delay = config.backoff(attempt);
                warn!(
                    key = %key,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Publish attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(PipelineError::StorePublishFailure {
                    key: key.to_string(),
                    attempts: attempt,
                    reason: e.to_string(),
                })
            }
        }
    }
}
