//! Observation source reading a directory of NetCDF files.
//!
//! Files are concatenated along time in path order. They must share the
//! horizontal grid and the time units of the first file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use clim_common::{
    Calendar, EncodingMetadata, PipelineError, PipelineResult, RawCoordinates, RawField, TimeRange,
};

use crate::config::ObservationEntry;
use crate::selection::{gather_rows, select_time_indices};
use crate::SourceAdapter;

pub struct NetcdfObservationSource {
    entry: ObservationEntry,
}

impl NetcdfObservationSource {
    pub fn new(entry: ObservationEntry) -> Self {
        Self { entry }
    }

    pub fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.entry.timeout_secs))
    }

    /// Data files under the configured directory, sorted by path.
    fn files(&self) -> PipelineResult<Vec<PathBuf>> {
        if !self.entry.directory.is_dir() {
            return Err(PipelineError::source_unavailable(
                &self.entry.name,
                format!("{} is not a directory", self.entry.directory.display()),
            ));
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.entry.directory)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == self.entry.extension.as_str())
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(PipelineError::source_unavailable(
                &self.entry.name,
                format!("no .{} files in {}", self.entry.extension, self.entry.directory.display()),
            ));
        }
        Ok(files)
    }
}

#[async_trait]
impl SourceAdapter for NetcdfObservationSource {
    fn provider(&self) -> &str {
        &self.entry.name
    }

    async fn list_variables(&self) -> PipelineResult<Vec<String>> {
        let files = self.files()?;
        let entry = self.entry.clone();
        tokio::task::spawn_blocking(move || {
            let file = open(&entry, &files[0])?;
            let coords = [&entry.coords.time, &entry.coords.lat, &entry.coords.lon];
            Ok(file
                .variables()
                .filter(|v| v.dimensions().len() >= 3)
                .map(|v| v.name())
                .filter(|name| !coords.iter().any(|c| *c == name))
                .collect())
        })
        .await
        .map_err(|e| PipelineError::source_unavailable(&self.entry.name, e.to_string()))?
    }

    #[instrument(skip(self, range), fields(provider = %self.entry.name))]
    async fn fetch(&self, native_name: &str, range: &TimeRange) -> PipelineResult<RawField> {
        let files = self.files()?;
        let entry = self.entry.clone();
        let name = native_name.to_string();
        let range = *range;
        tokio::task::spawn_blocking(move || read_files(&entry, &files, &name, &range))
            .await
            .map_err(|e| PipelineError::source_unavailable(&self.entry.name, e.to_string()))?
    }
}

fn open(entry: &ObservationEntry, path: &Path) -> PipelineResult<netcdf::File> {
    netcdf::open(path).map_err(|e| {
        PipelineError::source_unavailable(&entry.name, format!("cannot open {}: {}", path.display(), e))
    })
}

fn read_files(
    entry: &ObservationEntry,
    files: &[PathBuf],
    native_name: &str,
    range: &TimeRange,
) -> PipelineResult<RawField> {
    let mut data = Vec::new();
    let mut times = Vec::new();
    let mut axes: Option<(Vec<f64>, Vec<f64>)> = None;
    let mut time_units: Option<String> = None;
    let mut calendar = Calendar::default();
    let mut native_unit = String::new();
    let mut encoding = EncodingMetadata::default();
    let mut found = false;

    for path in files {
        let file = open(entry, path)?;
        let Some(var) = file.variable(native_name) else {
            continue;
        };
        found = true;

        let read = |name: &str| -> PipelineResult<Vec<f64>> {
            let v = file.variable(name).ok_or_else(|| {
                PipelineError::malformed(
                    native_name,
                    format!("{} has no coordinate '{}'", path.display(), name),
                )
            })?;
            v.get_values::<f64, _>(..)
                .map_err(|e| PipelineError::source_unavailable(&entry.name, e.to_string()))
        };

        let time_var = file.variable(&entry.coords.time).ok_or_else(|| {
            PipelineError::malformed(native_name, format!("{} has no time axis", path.display()))
        })?;
        let file_units = string_attr(&time_var, "units").unwrap_or_default();
        match &time_units {
            None => {
                calendar = string_attr(&time_var, "calendar")
                    .map(|c| c.parse())
                    .transpose()?
                    .unwrap_or_default();
                time_units = Some(file_units.clone());
            }
            Some(units) if *units != file_units => {
                return Err(PipelineError::malformed(
                    native_name,
                    format!("{} uses time units '{}' instead of '{}'", path.display(), file_units, units),
                ));
            }
            Some(_) => {}
        }
        let file_times = read(&entry.coords.time)?;
        let lat = read(&entry.coords.lat)?;
        let lon = read(&entry.coords.lon)?;
        let cells = lat.len() * lon.len();

        match &axes {
            None => {
                native_unit = string_attr(&var, "units").unwrap_or_default();
                encoding = EncodingMetadata {
                    fill_value: f64_attr(&var, "_FillValue"),
                    missing_value: f64_attr(&var, "missing_value"),
                    scale_factor: f64_attr(&var, "scale_factor"),
                    add_offset: f64_attr(&var, "add_offset"),
                    lat_units: file.variable(&entry.coords.lat).and_then(|v| string_attr(&v, "units")),
                    lon_units: file.variable(&entry.coords.lon).and_then(|v| string_attr(&v, "units")),
                };
                axes = Some((lat, lon));
            }
            Some((a_lat, a_lon)) if *a_lat != lat || *a_lon != lon => {
                return Err(PipelineError::malformed(
                    native_name,
                    format!("{} is on a different grid", path.display()),
                ));
            }
            Some(_) => {}
        }

        let selected = select_time_indices(
            native_name,
            &file_times,
            time_units.as_deref().unwrap_or_default(),
            calendar,
            range,
        )?;
        if selected.is_empty() {
            continue;
        }

        let values: Vec<f64> = var
            .get_values::<f64, _>(..)
            .map_err(|e| PipelineError::source_unavailable(&entry.name, e.to_string()))?;
        // 4-D variables carry a single level here; extra levels are not read.
        let per_step = values.len() / file_times.len().max(1);
        if per_step != cells {
            warn!(
                provider = %entry.name,
                variable = %native_name,
                file = %path.display(),
                "Variable has more than one level, keeping the first"
            );
        }
        let first_level: Vec<f64> = values
            .chunks(per_step.max(1))
            .flat_map(|step| step[..cells.min(step.len())].iter().copied())
            .collect();
        data.extend(gather_rows(&first_level, cells, &selected, 0));
        times.extend(selected.iter().map(|&i| file_times[i]));
        debug!(file = %path.display(), timesteps = selected.len(), "Read observation file");
    }

    if !found {
        return Err(PipelineError::VariableNotFound {
            provider: entry.name.clone(),
            variable: native_name.to_string(),
        });
    }

    let (lat, lon) = axes.unwrap_or_default();
    Ok(RawField {
        provider: entry.name.clone(),
        native_name: native_name.to_string(),
        native_unit,
        data,
        coords: RawCoordinates {
            time: times,
            time_units: time_units.unwrap_or_default(),
            calendar,
            lat,
            lon,
            vertical: None,
        },
        encoding,
    })
}

fn has_attr(var: &netcdf::Variable, name: &str) -> bool {
    var.attributes().any(|attr| attr.name() == name)
}

fn string_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
    if !has_attr(var, name) {
        return None;
    }
    match var.attribute_value(name)?.ok()? {
        netcdf::AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

fn f64_attr(var: &netcdf::Variable, name: &str) -> Option<f64> {
    if !has_attr(var, name) {
        return None;
    }
    let value = var.attribute_value(name)?.ok()?;
    f64::try_from(value).ok()
}
