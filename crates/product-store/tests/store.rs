//! Writing run outputs and merging them into a consolidated store.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use clim_common::{
    ClimatologyRecord, Period, PipelineError, Provenance, RegionSeriesRecord, StatisticKind,
    TimeFilter, VariableDescriptor,
};
use product_store::{
    digest_dir, read_attributes, read_f64, read_u32, MergeOutcome, OutputWriter, ProductKind,
    RunOutput, StoreConfig, StoreKey, StoreMerger, INDEX_FILE,
};
use test_utils::SyntheticField;

fn descriptor() -> VariableDescriptor {
    VariableDescriptor::new("tas", "K")
        .with_names("air_temperature", "Near-surface air temperature")
}

fn record(decade: Period, offset: f64) -> ClimatologyRecord {
    let grid = SyntheticField::default().grid();
    let n = grid.len();
    let mut provenance = Provenance::new("model");
    provenance.record("fill_value_mismatch", "2 values set missing");
    ClimatologyRecord {
        descriptor: descriptor(),
        decade,
        time_filter: TimeFilter::Year,
        statistic_kind: StatisticKind::Mean,
        unit: "K".to_string(),
        spatial_field: (0..n)
            .map(|i| if i == 7 { f64::NAN } else { 280.0 + offset + i as f64 * 0.1 })
            .collect(),
        sample_count: (0..n).map(|i| if i == 7 { 0 } else { 118 }).collect(),
        grid,
        provenance,
    }
}

fn series(region: &str, months: usize) -> Vec<RegionSeriesRecord> {
    (0..months)
        .map(|m| RegionSeriesRecord {
            descriptor: descriptor(),
            region_name: region.to_string(),
            timestamp: NaiveDate::from_ymd_opt(1991 + (m / 12) as i32, (m % 12) as u32 + 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            value: (m != 3).then(|| 280.0 + m as f64),
            valid_fraction: if m == 3 { 0.2 } else { 0.98 },
        })
        .collect()
}

fn decade(start: i32) -> Period {
    Period::new(start, start + 9).unwrap()
}

fn writer(dir: &Path) -> OutputWriter {
    OutputWriter::new(StoreConfig::default(), dir)
}

#[test]
fn test_gridded_output_round_trip() {
    let run = tempfile::tempdir().unwrap();
    let rec = record(decade(1991), 0.0);
    let output = writer(run.path()).write_record(&rec).unwrap();

    assert_eq!(output.key.product, ProductKind::Climatology);
    assert_eq!(output.key.path(), "climatology/tas/model/1991-2000/year");

    let values = read_f64(&output.path, "tas").unwrap();
    assert_eq!(values.len(), rec.spatial_field.len());
    assert!(values[7].is_nan());
    assert_eq!(values[8], rec.spatial_field[8]);
    assert_eq!(read_u32(&output.path, "sample_count").unwrap(), rec.sample_count);
    assert_eq!(read_f64(&output.path, "lat").unwrap(), rec.grid.lat);

    let attrs = read_attributes(&output.path).unwrap();
    assert_eq!(attrs["decade"], "1991-2000");
    assert_eq!(attrs["standard_name"], "air_temperature");
    assert_eq!(attrs["correction_log"][0]["symptom"], "fill_value_mismatch");
}

#[test]
fn test_series_output_round_trip() {
    let run = tempfile::tempdir().unwrap();
    let key = StoreKey::for_series(&descriptor(), "model", "domain", &TimeFilter::Year);
    let records = series("domain", 24);
    let output = writer(run.path())
        .write_series(key, &descriptor(), &Provenance::new("model"), &records)
        .unwrap();

    let values = read_f64(&output.path, "tas").unwrap();
    assert_eq!(values.len(), 24);
    assert!(values[3].is_nan());
    assert_eq!(values[4], 284.0);
    let fractions = read_f64(&output.path, "valid_fraction").unwrap();
    assert_eq!(fractions[0], 0.98);
    let times = read_f64(&output.path, "time").unwrap();
    assert_eq!(times[0], 662_688_000.0); // 1991-01-01T00:00:00Z
}

#[test]
fn test_series_rejects_foreign_region() {
    let run = tempfile::tempdir().unwrap();
    let key = StoreKey::for_series(&descriptor(), "model", "north", &TimeFilter::Year);
    let result = writer(run.path()).write_series(
        key,
        &descriptor(),
        &Provenance::new("model"),
        &series("domain", 2),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_merge_is_idempotent_per_key() {
    let run = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let output = writer(run.path()).write_record(&record(decade(1991), 0.0)).unwrap();
    let merger = StoreMerger::open(store.path()).unwrap();

    let first = merger.merge_output(&output).await.unwrap();
    let index_after_first = merger.index().await;
    let digest_after_first = digest_dir(&store.path().join(output.key.path())).unwrap();

    let second = merger.merge_output(&output).await.unwrap();
    assert_eq!(first, MergeOutcome::Written);
    assert_eq!(second, MergeOutcome::Unchanged);
    assert_eq!(merger.index().await, index_after_first);
    assert_eq!(
        digest_dir(&store.path().join(output.key.path())).unwrap(),
        digest_after_first
    );

    // The store is a readable Zarr hierarchy.
    assert!(store.path().join("zarr.json").exists());
    assert!(store.path().join("climatology/tas/zarr.json").exists());
    let merged = read_f64(&store.path().join(output.key.path()), "tas").unwrap();
    assert_eq!(merged.len(), 100);
}

#[tokio::test]
async fn test_new_run_replaces_only_its_key() {
    let run1 = tempfile::tempdir().unwrap();
    let run2 = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(store.path()).unwrap();

    let a = writer(run1.path()).write_record(&record(decade(1991), 0.0)).unwrap();
    let b = writer(run1.path()).write_record(&record(decade(2001), 0.0)).unwrap();
    let report = merger.merge(vec![a.clone(), b.clone()]).await;
    assert_eq!(report.written.len(), 2);
    let b_digest = digest_dir(&store.path().join(b.key.path())).unwrap();

    let a2 = writer(run2.path()).write_record(&record(decade(1991), 1.5)).unwrap();
    let report = merger.merge(vec![a2.clone()]).await;
    assert_eq!(report.written, vec![a2.key.clone()]);
    assert_eq!(report.store.generation, 3);

    let merged = read_f64(&store.path().join(a.key.path()), "tas").unwrap();
    assert_eq!(merged[0], 281.5);
    assert_eq!(digest_dir(&store.path().join(b.key.path())).unwrap(), b_digest);
}

#[tokio::test]
async fn test_failed_key_leaves_other_keys_intact() {
    let run = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(store.path()).unwrap();

    let a = writer(run.path()).write_record(&record(decade(1991), 0.0)).unwrap();
    let b = writer(run.path()).write_record(&record(decade(2001), 0.0)).unwrap();
    merger.merge(vec![a.clone(), b.clone()]).await;
    let a_digest = digest_dir(&store.path().join(a.key.path())).unwrap();
    let b_digest = digest_dir(&store.path().join(b.key.path())).unwrap();

    // A new output for `a` whose files vanished, next to a good one for `b`.
    let broken = RunOutput {
        key: a.key.clone(),
        path: run.path().join("vanished"),
    };
    let run_b = tempfile::tempdir().unwrap();
    let b2 = writer(run_b.path())
        .write_record(&record(decade(2001), 2.0))
        .unwrap();
    let report = merger.merge(vec![broken, b2.clone()]).await;

    assert_eq!(report.written, vec![b2.key.clone()]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].1,
        PipelineError::StoreWriteFailure { .. }
    ));
    assert_eq!(digest_dir(&store.path().join(a.key.path())).unwrap(), a_digest);
    assert_ne!(digest_dir(&store.path().join(b.key.path())).unwrap(), b_digest);
}

#[tokio::test]
async fn test_duplicate_keys_in_batch_conflict() {
    let run1 = tempfile::tempdir().unwrap();
    let run2 = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(store.path()).unwrap();

    let a = writer(run1.path()).write_record(&record(decade(1991), 0.0)).unwrap();
    let a_again = writer(run2.path()).write_record(&record(decade(1991), 5.0)).unwrap();
    let report = merger.merge(vec![a.clone(), a_again]).await;

    assert!(report.written.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].1,
        PipelineError::StoreWriteConflict { .. }
    ));
    assert!(!store.path().join(a.key.path()).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_merges_of_one_key_serialize() {
    let run1 = tempfile::tempdir().unwrap();
    let run2 = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let merger = Arc::new(StoreMerger::open(store.path()).unwrap());

    let a = writer(run1.path()).write_record(&record(decade(1991), 0.0)).unwrap();
    let b = writer(run2.path()).write_record(&record(decade(1991), 9.0)).unwrap();
    let candidates = [digest_dir(&a.path).unwrap().0, digest_dir(&b.path).unwrap().0];

    let mut handles = Vec::new();
    for i in 0..8 {
        let merger = merger.clone();
        let output = if i % 2 == 0 { a.clone() } else { b.clone() };
        handles.push(tokio::spawn(async move { merger.merge_output(&output).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let target = store.path().join(a.key.path());
    let (digest, _, _) = digest_dir(&target).unwrap();
    assert!(candidates.contains(&digest));
    assert_eq!(merger.index().await.digest(&a.key.path()), Some(digest.as_str()));
    assert!(!store.path().join(".staging").read_dir().map(|mut d| d.next().is_some()).unwrap_or(false));
}

#[tokio::test]
async fn test_regions_differing_in_punctuation_keep_separate_keys() {
    let run = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(store.path()).unwrap();

    let mut outputs = Vec::new();
    for (region, months) in [("North Sea", 12), ("North_Sea", 24)] {
        let key = StoreKey::for_series(&descriptor(), "model", region, &TimeFilter::Year);
        outputs.push(
            writer(run.path())
                .write_series(key, &descriptor(), &Provenance::new("model"), &series(region, months))
                .unwrap(),
        );
    }
    assert_ne!(outputs[0].path, outputs[1].path);

    let report = merger.merge(outputs.clone()).await;
    assert_eq!(report.written.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(merger.index().await.keys.len(), 2);

    let spaced = read_f64(&store.path().join(outputs[0].key.path()), "tas").unwrap();
    let underscored = read_f64(&store.path().join(outputs[1].key.path()), "tas").unwrap();
    assert_eq!(spaced.len(), 12);
    assert_eq!(underscored.len(), 24);
}

#[tokio::test]
async fn test_failed_index_save_keeps_previous_key_visible() {
    let run1 = tempfile::tempdir().unwrap();
    let run2 = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let merger = StoreMerger::open(store.path()).unwrap();

    let old = writer(run1.path()).write_record(&record(decade(1991), 0.0)).unwrap();
    merger.merge_output(&old).await.unwrap();
    let target = store.path().join(old.key.path());
    let old_digest = digest_dir(&target).unwrap();
    let index_before = merger.index().await;

    // A directory in place of the index makes the final rename fail.
    let index_path = store.path().join(INDEX_FILE);
    std::fs::remove_file(&index_path).unwrap();
    std::fs::create_dir(&index_path).unwrap();

    let new = writer(run2.path()).write_record(&record(decade(1991), 5.0)).unwrap();
    let result = merger.merge_output(&new).await;
    assert!(matches!(result, Err(PipelineError::StoreWriteFailure { .. })));
    assert_eq!(digest_dir(&target).unwrap(), old_digest);
    assert_eq!(read_f64(&target, "tas").unwrap()[0], 280.0);
    assert_eq!(merger.index().await, index_before);
    assert!(!store.path().join(".trash").read_dir().map(|mut d| d.next().is_some()).unwrap_or(false));

    // Once the index is writable again the same output is merged, not skipped.
    std::fs::remove_dir(&index_path).unwrap();
    assert_eq!(merger.merge_output(&new).await.unwrap(), MergeOutcome::Written);
    assert_eq!(read_f64(&target, "tas").unwrap()[0], 285.0);
}
