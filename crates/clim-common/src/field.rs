//! Raw and harmonized gridded fields.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::descriptor::VariableDescriptor;
use crate::error::{PipelineError, PipelineResult};
use crate::grid::LatLonGrid;
use crate::time::{Calendar, Frequency};

/// Coordinate axes of a raw field, in the source's own encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCoordinates {
    /// Numeric time offsets, interpreted through `time_units` and `calendar`.
    pub time: Vec<f64>,
    pub time_units: String,
    #[serde(default)]
    pub calendar: Calendar,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    /// Single vertical level the field was extracted at, if any.
    #[serde(default)]
    pub vertical: Option<f64>,
}

/// Encoding attributes carried alongside the raw values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodingMetadata {
    #[serde(default)]
    pub fill_value: Option<f64>,
    #[serde(default)]
    pub missing_value: Option<f64>,
    #[serde(default)]
    pub scale_factor: Option<f64>,
    #[serde(default)]
    pub add_offset: Option<f64>,
    /// Units attribute of the latitude axis (`degrees_north`, `radians`).
    #[serde(default)]
    pub lat_units: Option<String>,
    #[serde(default)]
    pub lon_units: Option<String>,
}

/// Output of a source adapter. Values are untouched by the adapter.
///
/// `data` is laid out `[time, lat, lon]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub provider: String,
    pub native_name: String,
    pub native_unit: String,
    pub data: Vec<f64>,
    pub coords: RawCoordinates,
    pub encoding: EncodingMetadata,
}

impl RawField {
    pub fn n_times(&self) -> usize {
        self.coords.time.len()
    }

    pub fn cells_per_step(&self) -> usize {
        self.coords.lat.len() * self.coords.lon.len()
    }

    /// Check that the data length matches the coordinate axes.
    pub fn validate_shape(&self) -> PipelineResult<()> {
        let expected = self.n_times() * self.cells_per_step();
        if self.data.len() != expected {
            return Err(PipelineError::malformed(
                &self.native_name,
                format!(
                    "data has {} values but coordinates imply {} ({} x {} x {})",
                    self.data.len(),
                    expected,
                    self.n_times(),
                    self.coords.lat.len(),
                    self.coords.lon.len()
                ),
            ));
        }
        Ok(())
    }
}

/// One applied correction, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionEntry {
    pub symptom: String,
    pub description: String,
}

impl CorrectionEntry {
    pub fn new(symptom: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            symptom: symptom.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: String,
    #[serde(default)]
    pub correction_log: Vec<CorrectionEntry>,
}

impl Provenance {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            correction_log: Vec::new(),
        }
    }

    pub fn record(&mut self, symptom: impl Into<String>, description: impl Into<String>) {
        self.correction_log
            .push(CorrectionEntry::new(symptom, description));
    }
}

/// Field in canonical name, unit and calendar. Missing values are NaN.
///
/// `data` is laid out `[time, lat, lon]` with `times` strictly ascending and
/// the grid latitudes ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonizedField {
    pub descriptor: VariableDescriptor,
    pub data: Vec<f64>,
    pub times: Vec<NaiveDateTime>,
    pub grid: LatLonGrid,
    pub frequency: Frequency,
    pub provenance: Provenance,
}

impl HarmonizedField {
    pub fn n_times(&self) -> usize {
        self.times.len()
    }

    pub fn n_cells(&self) -> usize {
        self.grid.len()
    }

    /// Values of one timestep.
    pub fn step(&self, t: usize) -> &[f64] {
        let n = self.n_cells();
        &self.data[t * n..(t + 1) * n]
    }

    /// Copy of the field restricted to the timesteps `keep` accepts.
    pub fn select_times<F>(&self, keep: F) -> HarmonizedField
    where
        F: Fn(&NaiveDateTime) -> bool,
    {
        let n = self.n_cells();
        let mut data = Vec::new();
        let mut times = Vec::new();
        for (t, time) in self.times.iter().enumerate() {
            if keep(time) {
                times.push(*time);
                data.extend_from_slice(self.step(t));
            }
        }
        debug_assert_eq!(data.len(), times.len() * n);
        HarmonizedField {
            descriptor: self.descriptor.clone(),
            data,
            times,
            grid: self.grid.clone(),
            frequency: self.frequency,
            provenance: self.provenance.clone(),
        }
    }
}
