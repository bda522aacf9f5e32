//! Model catalogue source backed by a Zarr hierarchy.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use zarrs::array::{Array, ArrayCreateError, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs::storage::ReadableStorageTraits;

use clim_common::{
    Calendar, EncodingMetadata, PipelineError, PipelineResult, RawCoordinates, RawField, TimeRange,
};

use crate::config::CatalogueEntry;
use crate::selection::{gather_rows, select_time_indices};
use crate::storage::{open_root, CatalogueRoot};
use crate::SourceAdapter;

/// Catalogue entry opened for reading.
pub struct ZarrCatalogueSource {
    entry: CatalogueEntry,
    root: CatalogueRoot,
}

impl ZarrCatalogueSource {
    /// Open the storage behind an entry. Arrays are opened lazily on fetch.
    pub fn open(entry: CatalogueEntry) -> PipelineResult<Self> {
        let root = open_root(&entry)?;
        info!(provider = %entry.name, root = %entry.root, "Opened catalogue");
        Ok(Self { entry, root })
    }

    pub fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.entry.timeout_secs))
    }
}

#[async_trait]
impl SourceAdapter for ZarrCatalogueSource {
    fn provider(&self) -> &str {
        &self.entry.name
    }

    /// Configured variables whose arrays exist in the catalogue.
    async fn list_variables(&self) -> PipelineResult<Vec<String>> {
        let entry = self.entry.clone();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || present_variables(&entry, &root))
            .await
            .map_err(|e| {
                PipelineError::source_unavailable(&self.entry.name, format!("listing task failed: {}", e))
            })?
    }

    #[instrument(skip(self, range), fields(provider = %self.entry.name))]
    async fn fetch(&self, native_name: &str, range: &TimeRange) -> PipelineResult<RawField> {
        if !self.entry.variables.iter().any(|v| v == native_name) {
            return Err(PipelineError::VariableNotFound {
                provider: self.entry.name.clone(),
                variable: native_name.to_string(),
            });
        }

        let entry = self.entry.clone();
        let root = self.root.clone();
        let name = native_name.to_string();
        let range = *range;

        tokio::task::spawn_blocking(move || read_variable(&entry, &root, &name, &range))
            .await
            .map_err(|e| {
                PipelineError::source_unavailable(&self.entry.name, format!("read task failed: {}", e))
            })?
    }
}

/// Open each configured array's metadata. Runs on the blocking pool.
fn present_variables(entry: &CatalogueEntry, root: &CatalogueRoot) -> PipelineResult<Vec<String>> {
    let mut present = Vec::with_capacity(entry.variables.len());
    for name in &entry.variables {
        match Array::open(root.storage.clone(), &root.node_path(name)) {
            Ok(_) => present.push(name.clone()),
            Err(ArrayCreateError::MissingMetadata) => {
                warn!(provider = %entry.name, variable = %name, "Configured variable has no array");
            }
            Err(e) => {
                return Err(PipelineError::source_unavailable(
                    &entry.name,
                    format!("cannot read metadata of '{}': {}", name, e),
                ))
            }
        }
    }
    debug!(provider = %entry.name, present = present.len(), "Listed catalogue variables");
    Ok(present)
}

/// Read one variable synchronously. Runs on the blocking pool.
fn read_variable(
    entry: &CatalogueEntry,
    root: &CatalogueRoot,
    native_name: &str,
    range: &TimeRange,
) -> PipelineResult<RawField> {
    let unavailable = |what: &str, e: String| {
        PipelineError::source_unavailable(&entry.name, format!("{} '{}': {}", what, native_name, e))
    };

    let open = |name: &str| {
        Array::open(root.storage.clone(), &root.node_path(name))
            .map_err(|e| unavailable(&format!("cannot open array {} for", name), e.to_string()))
    };

    // Time axis
    let time_array = open(&entry.coords.time)?;
    let time_values = read_all(&time_array).map_err(|e| unavailable("cannot read time of", e))?;
    let time_attrs = time_array.attributes();
    let time_units = attr_str(time_attrs, "units").unwrap_or_default();
    let calendar = attr_str(time_attrs, "calendar")
        .map(|c| c.parse::<Calendar>())
        .transpose()
        .map_err(|e| PipelineError::malformed(native_name, e.to_string()))?
        .unwrap_or_default();

    let selected = select_time_indices(native_name, &time_values, &time_units, calendar, range)?;

    // Horizontal axes
    let lat_array = open(&entry.coords.lat)?;
    let lon_array = open(&entry.coords.lon)?;
    let lat = read_all(&lat_array).map_err(|e| unavailable("cannot read latitude of", e))?;
    let lon = read_all(&lon_array).map_err(|e| unavailable("cannot read longitude of", e))?;

    // Variable
    let array = Array::open(root.storage.clone(), &root.node_path(native_name)).map_err(|e| match e {
        ArrayCreateError::MissingMetadata => PipelineError::VariableNotFound {
            provider: entry.name.clone(),
            variable: native_name.to_string(),
        },
        e => unavailable("cannot open array for", e.to_string()),
    })?;
    let shape = array.shape().to_vec();
    let cells = lat.len() * lon.len();
    let (time_dim_ok, vertical) = match shape.len() {
        3 => (shape[0] as usize == time_values.len(), None),
        4 => {
            let level = entry.vertical_index;
            if level >= shape[1] {
                return Err(PipelineError::malformed(
                    native_name,
                    format!("vertical index {} outside {} levels", level, shape[1]),
                ));
            }
            let value = match &entry.coords.vertical {
                Some(name) => {
                    let levels = read_all(&open(name)?)
                        .map_err(|e| unavailable("cannot read vertical axis of", e))?;
                    levels.get(level as usize).copied()
                }
                None => None,
            };
            (shape[0] as usize == time_values.len(), Some((level, value)))
        }
        n => {
            return Err(PipelineError::malformed(
                native_name,
                format!("expected 3 or 4 dimensions, found {}", n),
            ))
        }
    };
    let spatial_ok = shape[shape.len() - 2] as usize == lat.len()
        && shape[shape.len() - 1] as usize == lon.len();
    if !time_dim_ok || !spatial_ok {
        return Err(PipelineError::malformed(
            native_name,
            format!(
                "array shape {:?} disagrees with coordinates ({} times, {} lat, {} lon)",
                shape,
                time_values.len(),
                lat.len(),
                lon.len()
            ),
        ));
    }

    // Indices are ascending: read the block spanning them, then keep the selected rows.
    let data = match (selected.first(), selected.last()) {
        (Some(&first), Some(&last)) => {
            let n = (last - first + 1) as u64;
            let subset = match vertical {
                None => ArraySubset::new_with_start_shape(
                    vec![first as u64, 0, 0],
                    vec![n, shape[1], shape[2]],
                ),
                Some((level, _)) => ArraySubset::new_with_start_shape(
                    vec![first as u64, level, 0, 0],
                    vec![n, 1, shape[2], shape[3]],
                ),
            }
            .map_err(|e| PipelineError::malformed(native_name, e.to_string()))?;
            let block = read_subset(&array, &subset).map_err(|e| unavailable("cannot read", e))?;
            gather_rows(&block, cells, &selected, first)
        }
        _ => Vec::new(),
    };

    let attrs = array.attributes();
    let encoding = EncodingMetadata {
        fill_value: attr_f64(attrs, "_FillValue"),
        missing_value: attr_f64(attrs, "missing_value"),
        scale_factor: attr_f64(attrs, "scale_factor"),
        add_offset: attr_f64(attrs, "add_offset"),
        lat_units: attr_str(lat_array.attributes(), "units"),
        lon_units: attr_str(lon_array.attributes(), "units"),
    };

    debug!(
        provider = %entry.name,
        variable = %native_name,
        timesteps = selected.len(),
        "Read catalogue variable"
    );

    Ok(RawField {
        provider: entry.name.clone(),
        native_name: native_name.to_string(),
        native_unit: attr_str(attrs, "units").unwrap_or_default(),
        data,
        coords: RawCoordinates {
            time: selected.iter().map(|&i| time_values[i]).collect(),
            time_units,
            calendar,
            lat,
            lon,
            vertical: vertical.and_then(|(_, value)| value),
        },
        encoding,
    })
}

fn read_all<S: ?Sized + ReadableStorageTraits + 'static>(
    array: &Array<S>,
) -> Result<Vec<f64>, String> {
    let subset = ArraySubset::new_with_shape(array.shape().to_vec());
    read_subset(array, &subset)
}

/// Read a subset as f64 whatever the stored numeric type.
fn read_subset<S: ?Sized + ReadableStorageTraits + 'static>(
    array: &Array<S>,
    subset: &ArraySubset,
) -> Result<Vec<f64>, String> {
    fn widen<T: Into<f64>>(v: Vec<T>) -> Vec<f64> {
        v.into_iter().map(Into::into).collect()
    }
    let result = match array.data_type() {
        DataType::Float64 => array.retrieve_array_subset_elements::<f64>(subset),
        DataType::Float32 => array
            .retrieve_array_subset_elements::<f32>(subset)
            .map(widen),
        DataType::Int32 => array
            .retrieve_array_subset_elements::<i32>(subset)
            .map(widen),
        DataType::Int16 => array
            .retrieve_array_subset_elements::<i16>(subset)
            .map(widen),
        DataType::Int64 => array
            .retrieve_array_subset_elements::<i64>(subset)
            .map(|v| v.into_iter().map(|x| x as f64).collect()),
        other => return Err(format!("unsupported data type {:?}", other)),
    };
    result.map_err(|e| e.to_string())
}

fn attr_str(attrs: &Map<String, Value>, key: &str) -> Option<String> {
    attrs.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Numeric attribute; `"NaN"` strings are accepted since JSON has no NaN.
fn attr_f64(attrs: &Map<String, Value>, key: &str) -> Option<f64> {
    match attrs.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_helpers() {
        let mut attrs = Map::new();
        attrs.insert("units".into(), Value::from("K"));
        attrs.insert("_FillValue".into(), Value::from(1e20));
        attrs.insert("missing_value".into(), Value::from("NaN"));
        assert_eq!(attr_str(&attrs, "units").as_deref(), Some("K"));
        assert_eq!(attr_f64(&attrs, "_FillValue"), Some(1e20));
        assert!(attr_f64(&attrs, "missing_value").unwrap().is_nan());
        assert_eq!(attr_f64(&attrs, "scale_factor"), None);
    }
}
