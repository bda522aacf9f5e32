//! Publishing a consolidated store to an in-memory object store.

use std::sync::Arc;

use chrono::NaiveDate;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

use clim_common::{Provenance, RegionSeriesRecord, TimeFilter, VariableDescriptor};
use product_store::{
    OutputWriter, PublishConfig, Publisher, RunOutput, StoreConfig, StoreKey, StoreMerger,
};

fn descriptor() -> VariableDescriptor {
    VariableDescriptor::new("tas", "K")
}

fn write_series(run: &std::path::Path, region: &str, months: usize) -> RunOutput {
    let records: Vec<_> = (0..months)
        .map(|m| RegionSeriesRecord {
            descriptor: descriptor(),
            region_name: region.to_string(),
            timestamp: NaiveDate::from_ymd_opt(2001 + (m / 12) as i32, (m % 12) as u32 + 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            value: Some(280.0 + m as f64),
            valid_fraction: 1.0,
        })
        .collect();
    let config = StoreConfig {
        zarr_time_chunk: 12,
        ..Default::default()
    };
    OutputWriter::new(config, run)
        .write_series(
            StoreKey::for_series(&descriptor(), "model", region, &TimeFilter::Year),
            &descriptor(),
            &Provenance::new("model"),
            &records,
        )
        .unwrap()
}

fn publisher(store: Arc<dyn ObjectStore>) -> Publisher {
    Publisher::new(
        store,
        PublishConfig {
            prefix: "products".to_string(),
            retry_base_ms: 1,
            ..Default::default()
        },
    )
}

async fn remote_paths(store: &Arc<dyn ObjectStore>) -> Vec<String> {
    let mut paths: Vec<String> = store
        .list(None)
        .map_ok(|meta| meta.location.to_string())
        .try_collect()
        .await
        .unwrap();
    paths.sort();
    paths
}

#[tokio::test]
async fn test_publish_uploads_keys_and_index() {
    let run = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(root.path()).unwrap();
    let domain = write_series(run.path(), "domain", 24);
    let north = write_series(run.path(), "north", 24);
    merger.merge(vec![domain.clone(), north]).await;

    let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let report = publisher(remote.clone()).publish(root.path()).await.unwrap();
    assert_eq!(report.uploaded.len(), 2);
    assert!(report.failed.is_empty());

    let paths = remote_paths(&remote).await;
    assert!(paths.contains(&"products/keys.json".to_string()));
    assert!(paths.contains(&"products/zarr.json".to_string()));
    assert!(paths.contains(&"products/region_series/zarr.json".to_string()));
    assert!(paths.contains(&format!("products/{}/zarr.json", domain.key.path())));
    assert!(!paths.iter().any(|p| p.contains(".staging") || p.contains(".trash")));

    let index = publisher(remote.clone()).remote_index().await.unwrap();
    assert_eq!(index, merger.index().await);
}

#[tokio::test]
async fn test_republish_skips_unchanged_keys() {
    let run = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(root.path()).unwrap();
    merger
        .merge(vec![
            write_series(run.path(), "domain", 24),
            write_series(run.path(), "north", 24),
        ])
        .await;

    let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    publisher(remote.clone()).publish(root.path()).await.unwrap();
    let report = publisher(remote.clone()).publish(root.path()).await.unwrap();
    assert!(report.uploaded.is_empty());
    assert_eq!(report.skipped.len(), 2);
}

#[tokio::test]
async fn test_republished_key_drops_stale_chunks() {
    let run1 = tempfile::tempdir().unwrap();
    let run2 = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(root.path()).unwrap();

    let long = write_series(run1.path(), "domain", 24);
    let untouched = write_series(run1.path(), "north", 24);
    merger.merge(vec![long.clone(), untouched.clone()]).await;
    let second_chunk = format!("{}/valid_fraction/c/1", long.key.path());
    assert!(root.path().join(&second_chunk).exists());

    let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    publisher(remote.clone()).publish(root.path()).await.unwrap();
    let stale = ObjectPath::from(format!("products/{}", second_chunk));
    assert!(remote.head(&stale).await.is_ok());

    // One year instead of two: a single chunk per array.
    let short = write_series(run2.path(), "domain", 12);
    merger.merge(vec![short]).await;
    let report = publisher(remote.clone()).publish(root.path()).await.unwrap();

    assert_eq!(report.uploaded, vec![long.key.path()]);
    assert_eq!(report.skipped, vec![untouched.key.path()]);
    assert!(report.deleted_objects >= 1);
    assert!(matches!(
        remote.head(&stale).await,
        Err(object_store::Error::NotFound { .. })
    ));
}
