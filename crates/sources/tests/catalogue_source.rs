//! Reading variables back from a Zarr catalogue on disk.

use clim_common::{Calendar, Period, PipelineError, TimeRange};
use sources::{CatalogueEntry, ProviderConfig, Source, SourceAdapter, ZarrCatalogueSource};
use test_utils::SyntheticField;

fn synthetic() -> SyntheticField {
    SyntheticField {
        years: 3,
        ..Default::default()
    }
}

fn entry(root: &std::path::Path) -> CatalogueEntry {
    CatalogueEntry {
        name: "model".to_string(),
        root: root.display().to_string(),
        endpoint: None,
        region: None,
        allow_http: false,
        variables: vec!["tas".to_string()],
        coords: Default::default(),
        vertical_index: 0,
        timeout_secs: 300,
    }
}

fn whole_record() -> TimeRange {
    Period::new(1991, 1993).unwrap().time_range()
}

#[tokio::test]
async fn test_fetch_returns_stored_field() {
    let dir = tempfile::tempdir().unwrap();
    let synth = synthetic();
    let raw = synth.raw_field();
    test_utils::write_zarr_catalogue(dir.path(), &raw).unwrap();

    let source = ZarrCatalogueSource::open(entry(dir.path())).unwrap();
    assert_eq!(source.provider(), "model");
    assert_eq!(source.list_variables().await.unwrap(), vec!["tas".to_string()]);

    let fetched = source.fetch("tas", &whole_record()).await.unwrap();
    assert_eq!(fetched.native_unit, "K");
    assert_eq!(fetched.coords.time, raw.coords.time);
    assert_eq!(fetched.coords.lat, raw.coords.lat);
    assert_eq!(fetched.coords.lon, raw.coords.lon);
    assert_eq!(fetched.coords.calendar, Calendar::Standard);
    assert_eq!(fetched.data, raw.data);
    assert_eq!(fetched.encoding.fill_value, Some(synth.fill_value));
    assert_eq!(fetched.encoding.lat_units.as_deref(), Some("degrees_north"));
}

#[tokio::test]
async fn test_fetch_restricts_to_time_range() {
    let dir = tempfile::tempdir().unwrap();
    let synth = synthetic();
    let raw = synth.raw_field();
    test_utils::write_zarr_catalogue(dir.path(), &raw).unwrap();

    let source = ZarrCatalogueSource::open(entry(dir.path())).unwrap();
    let middle_year = Period::new(1992, 1992).unwrap().time_range();
    let fetched = source.fetch("tas", &middle_year).await.unwrap();

    let cells = synth.n_cells();
    assert_eq!(fetched.coords.time.len(), 12);
    assert_eq!(fetched.coords.time, raw.coords.time[12..24].to_vec());
    assert_eq!(fetched.data.len(), 12 * cells);
    assert_eq!(fetched.data, raw.data[12 * cells..24 * cells].to_vec());
}

#[tokio::test]
async fn test_unknown_variable_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    test_utils::write_zarr_catalogue(dir.path(), &synthetic().raw_field()).unwrap();

    let source = ZarrCatalogueSource::open(entry(dir.path())).unwrap();
    let err = source.fetch("pr", &whole_record()).await.unwrap_err();
    assert!(matches!(err, PipelineError::VariableNotFound { .. }));
}

#[tokio::test]
async fn test_configured_variable_without_array_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    test_utils::write_zarr_catalogue(dir.path(), &synthetic().raw_field()).unwrap();

    let mut listed = entry(dir.path());
    listed.variables.push("pr".to_string());
    let source = ZarrCatalogueSource::open(listed).unwrap();
    assert_eq!(source.list_variables().await.unwrap(), vec!["tas".to_string()]);
    let err = source.fetch("pr", &whole_record()).await.unwrap_err();
    assert!(matches!(err, PipelineError::VariableNotFound { .. }), "{}", err);
}

#[tokio::test]
async fn test_empty_catalogue_lists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let source = ZarrCatalogueSource::open(entry(dir.path())).unwrap();
    assert!(source.list_variables().await.unwrap().is_empty());
    let err = source.fetch("tas", &whole_record()).await.unwrap_err();
    assert!(!matches!(err, PipelineError::VariableNotFound { .. }));
}

#[tokio::test]
async fn test_source_from_yaml_config() {
    let dir = tempfile::tempdir().unwrap();
    test_utils::write_zarr_catalogue(dir.path(), &synthetic().raw_field()).unwrap();

    let yaml = format!(
        "kind: catalogue\nname: model\nroot: {}\nvariables: [tas]\n",
        dir.path().display()
    );
    let config: ProviderConfig = serde_yaml::from_str(&yaml).unwrap();
    let source = Source::from_config(&config).unwrap();
    let fetched = source.fetch("tas", &whole_record()).await.unwrap();
    assert_eq!(fetched.coords.time.len(), 36);
}
