//! Zarr storage backends for catalogue roots.
//!
//! Local directories are read through `zarrs_filesystem`; `s3://` roots go
//! through `object_store` wrapped for the synchronous zarrs API.

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use zarrs_filesystem::FilesystemStore;
use zarrs_object_store::AsyncObjectStore;
use zarrs_storage::storage_adapter::async_to_sync::{
    AsyncToSyncBlockOn, AsyncToSyncStorageAdapter,
};
use zarrs_storage::ReadableStorage;

use clim_common::{PipelineError, PipelineResult};

use crate::config::CatalogueEntry;

/// Drives async object-store reads from inside synchronous zarrs calls.
///
/// `block_in_place` moves the task off the async worker so the runtime
/// handle can block without nesting runtimes.
#[derive(Clone, Copy)]
pub struct TokioBlockOn;

impl AsyncToSyncBlockOn for TokioBlockOn {
    fn block_on<F: core::future::Future>(&self, future: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }
}

/// Opened catalogue root: the storage plus the node prefix inside it.
#[derive(Clone)]
pub struct CatalogueRoot {
    pub storage: ReadableStorage,
    pub prefix: String,
}

impl CatalogueRoot {
    /// Absolute zarr node path for a name under this root.
    pub fn node_path(&self, name: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("/{}", name)
        } else {
            format!("/{}/{}", prefix, name)
        }
    }
}

/// Open the storage backing a catalogue entry.
pub fn open_root(entry: &CatalogueEntry) -> PipelineResult<CatalogueRoot> {
    if let Some(rest) = entry.root.strip_prefix("s3://") {
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(endpoint) = &entry.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(region) = &entry.region {
            builder = builder.with_region(region);
        }
        let s3 = builder
            .with_allow_http(entry.allow_http)
            .build()
            .map_err(|e| {
                PipelineError::source_unavailable(
                    &entry.name,
                    format!("failed to create S3 client: {}", e),
                )
            })?;

        let async_store = Arc::new(AsyncObjectStore::new(s3));
        let storage: ReadableStorage =
            Arc::new(AsyncToSyncStorageAdapter::new(async_store, TokioBlockOn));
        return Ok(CatalogueRoot {
            storage,
            prefix: prefix.to_string(),
        });
    }

    let path = std::path::Path::new(&entry.root);
    if !path.is_dir() {
        return Err(PipelineError::source_unavailable(
            &entry.name,
            format!("catalogue root {} is not a directory", entry.root),
        ));
    }
    let store = FilesystemStore::new(path).map_err(|e| {
        PipelineError::source_unavailable(&entry.name, format!("failed to open {}: {}", entry.root, e))
    })?;
    Ok(CatalogueRoot {
        storage: Arc::new(store),
        prefix: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(root: &str) -> CatalogueEntry {
        CatalogueEntry {
            name: "model".to_string(),
            root: root.to_string(),
            endpoint: None,
            region: None,
            allow_http: false,
            variables: vec![],
            coords: Default::default(),
            vertical_index: 0,
            timeout_secs: 10,
        }
    }

    #[test]
    fn test_missing_directory_is_unavailable() {
        let err = open_root(&entry("/definitely/not/here.zarr")).err().unwrap();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_node_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&entry(dir.path().to_str().unwrap())).unwrap();
        assert_eq!(root.node_path("tas"), "/tas");
        let prefixed = CatalogueRoot {
            storage: root.storage.clone(),
            prefix: "runs/hist/".to_string(),
        };
        assert_eq!(prefixed.node_path("tas"), "/runs/hist/tas");
    }
}
