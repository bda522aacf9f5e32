//! Write raw fields as Zarr catalogues on the local filesystem.
//!
//! Layout matches what the catalogue source reads: one array per
//! coordinate (`time`, `lat`, `lon`) and one `[time, lat, lon]` array per
//! variable, all at the store root.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use zarrs::array::{ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs_filesystem::FilesystemStore;

use clim_common::RawField;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn write_array(
    store: &Arc<FilesystemStore>,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Map<String, Value>,
    data: &[f64],
) -> TestResult<()> {
    let array = ArrayBuilder::new(
        shape.clone(),
        DataType::Float64,
        chunks.try_into()?,
        FillValue::from(f64::NAN),
    )
    .attributes(attrs)
    .build(store.clone(), path)?;
    array.store_metadata()?;

    let subset = ArraySubset::new_with_start_shape(vec![0; shape.len()], shape)?;
    array.store_array_subset_elements(&subset, data)?;
    Ok(())
}

/// Write the coordinates and one variable of `field` under `root`.
///
/// Can be called repeatedly with fields sharing the same coordinates to
/// add more variables to the same catalogue.
pub fn write_zarr_catalogue(root: &Path, field: &RawField) -> TestResult<()> {
    std::fs::create_dir_all(root)?;
    let store = Arc::new(FilesystemStore::new(root)?);
    GroupBuilder::new().build(store.clone(), "/")?.store_metadata()?;

    let coords = &field.coords;
    let nt = coords.time.len() as u64;
    let nlat = coords.lat.len() as u64;
    let nlon = coords.lon.len() as u64;

    let mut time_attrs = Map::new();
    time_attrs.insert("units".to_string(), json!(coords.time_units));
    time_attrs.insert("calendar".to_string(), json!(coords.calendar.as_str()));
    write_array(&store, "/time", vec![nt], vec![nt.max(1)], time_attrs, &coords.time)?;

    let mut lat_attrs = Map::new();
    if let Some(units) = &field.encoding.lat_units {
        lat_attrs.insert("units".to_string(), json!(units));
    }
    write_array(&store, "/lat", vec![nlat], vec![nlat.max(1)], lat_attrs, &coords.lat)?;

    let mut lon_attrs = Map::new();
    if let Some(units) = &field.encoding.lon_units {
        lon_attrs.insert("units".to_string(), json!(units));
    }
    write_array(&store, "/lon", vec![nlon], vec![nlon.max(1)], lon_attrs, &coords.lon)?;

    let mut attrs = Map::new();
    attrs.insert("units".to_string(), json!(field.native_unit));
    let encoding = &field.encoding;
    for (key, value) in [
        ("_FillValue", encoding.fill_value),
        ("missing_value", encoding.missing_value),
        ("scale_factor", encoding.scale_factor),
        ("add_offset", encoding.add_offset),
    ] {
        if let Some(v) = value {
            attrs.insert(key.to_string(), json!(v));
        }
    }
    // Twelve timesteps per chunk so reads span several chunks.
    write_array(
        &store,
        &format!("/{}", field.native_name),
        vec![nt, nlat, nlon],
        vec![12.min(nt).max(1), nlat.max(1), nlon.max(1)],
        attrs,
        &field.data,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyntheticField;

    #[test]
    fn test_catalogue_layout() {
        let dir = tempfile::tempdir().unwrap();
        let synth = SyntheticField {
            years: 1,
            ..SyntheticField::default()
        };
        write_zarr_catalogue(dir.path(), &synth.raw_field()).unwrap();
        for node in ["time", "lat", "lon", "tas"] {
            assert!(dir.path().join(node).join("zarr.json").exists(), "{}", node);
        }
    }
}
