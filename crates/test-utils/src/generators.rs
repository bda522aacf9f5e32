//! Synthetic climate fields with known statistics.
//!
//! Values follow `base + cell_offset + trend * years + seasonal cycle`, so
//! means, trends and regional averages can be checked against a reference
//! computed directly from the generator.

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use clim_common::{
    Calendar, EncodingMetadata, Frequency, HarmonizedField, LatLonGrid, Period, Provenance,
    RawCoordinates, RawField, VariableDescriptor,
};

/// Reference date of the generated time axis.
pub const TIME_UNITS: &str = "days since 1850-01-01";

/// Builder for a synthetic monthly field on a regular grid.
///
/// # Example
///
/// ```
/// use test_utils::SyntheticField;
///
/// let synth = SyntheticField::default();
/// let raw = synth.raw_field();
/// assert_eq!(raw.coords.time.len(), 240);
/// assert_eq!(raw.data.len(), 240 * 100);
/// ```
#[derive(Debug, Clone)]
pub struct SyntheticField {
    pub provider: String,
    pub native_name: String,
    pub native_unit: String,
    pub start_year: i32,
    pub years: u32,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub base: f64,
    /// Linear change per year, applied uniformly.
    pub trend_per_year: f64,
    /// Amplitude of a sine cycle over the calendar year.
    pub seasonal_amplitude: f64,
    /// A value is missing when `(cell + t) % n == 0`. With `n = 50` every
    /// timestep loses exactly 2% of a 100-cell grid.
    pub missing_every: Option<usize>,
    pub fill_value: f64,
}

impl Default for SyntheticField {
    /// 10x10 grid over (0..10E, 40..50N), 1991-2010, 2% missing.
    fn default() -> Self {
        Self {
            provider: "model".to_string(),
            native_name: "tas".to_string(),
            native_unit: "K".to_string(),
            start_year: 1991,
            years: 20,
            lat: (0..10).map(|i| 40.5 + i as f64).collect(),
            lon: (0..10).map(|i| 0.5 + i as f64).collect(),
            base: 280.0,
            trend_per_year: 0.03,
            seasonal_amplitude: 10.0,
            missing_every: Some(50),
            fill_value: 1e20,
        }
    }
}

impl SyntheticField {
    /// Noise-free linear signal with no missing values.
    pub fn linear(start_year: i32, years: u32, base: f64, trend_per_year: f64) -> Self {
        Self {
            start_year,
            years,
            base,
            trend_per_year,
            seasonal_amplitude: 0.0,
            missing_every: None,
            ..Self::default()
        }
    }

    pub fn n_times(&self) -> usize {
        self.years as usize * 12
    }

    pub fn n_cells(&self) -> usize {
        self.lat.len() * self.lon.len()
    }

    pub fn grid(&self) -> LatLonGrid {
        LatLonGrid::new(self.lat.clone(), self.lon.clone())
    }

    /// First day of the month of timestep `t`.
    pub fn time_at(&self, t: usize) -> NaiveDateTime {
        let year = self.start_year + (t / 12) as i32;
        let month = (t % 12) as u32 + 1;
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
    }

    pub fn times(&self) -> Vec<NaiveDateTime> {
        (0..self.n_times()).map(|t| self.time_at(t)).collect()
    }

    /// Times encoded as [`TIME_UNITS`] offsets.
    pub fn time_offsets(&self) -> Vec<f64> {
        let reference = NaiveDate::from_ymd_opt(1850, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        self.times()
            .iter()
            .map(|t| (*t - reference).num_days() as f64)
            .collect()
    }

    pub fn is_missing(&self, cell: usize, t: usize) -> bool {
        self.missing_every
            .map(|n| (cell + t) % n == 0)
            .unwrap_or(false)
    }

    /// Value of a cell at a timestep, before any missing mask.
    pub fn clean_value(&self, cell: usize, t: usize) -> f64 {
        let time = self.time_at(t);
        let period = Period {
            start_year: self.start_year,
            end_year: self.start_year + self.years as i32 - 1,
        };
        let years = period.fractional_years(&time);
        let phase = 2.0 * std::f64::consts::PI * (time.month0() as f64) / 12.0;
        self.base + 0.01 * cell as f64 + self.trend_per_year * years
            + self.seasonal_amplitude * phase.sin()
    }

    /// Value of a cell at a timestep, `None` where the mask removes it.
    pub fn value(&self, cell: usize, t: usize) -> Option<f64> {
        (!self.is_missing(cell, t)).then(|| self.clean_value(cell, t))
    }

    /// Raw field as a source would return it: missing values hold the
    /// declared fill value.
    pub fn raw_field(&self) -> RawField {
        let cells = self.n_cells();
        let mut data = Vec::with_capacity(self.n_times() * cells);
        for t in 0..self.n_times() {
            for cell in 0..cells {
                data.push(self.value(cell, t).unwrap_or(self.fill_value));
            }
        }
        RawField {
            provider: self.provider.clone(),
            native_name: self.native_name.clone(),
            native_unit: self.native_unit.clone(),
            data,
            coords: RawCoordinates {
                time: self.time_offsets(),
                time_units: TIME_UNITS.to_string(),
                calendar: Calendar::Standard,
                lat: self.lat.clone(),
                lon: self.lon.clone(),
                vertical: None,
            },
            encoding: EncodingMetadata {
                fill_value: Some(self.fill_value),
                lat_units: Some("degrees_north".to_string()),
                lon_units: Some("degrees_east".to_string()),
                ..Default::default()
            },
        }
    }

    /// The field as the harmonizer would emit it, with NaN for missing
    /// values and the native name and unit taken as canonical.
    pub fn harmonized_field(&self) -> HarmonizedField {
        let cells = self.n_cells();
        let mut data = Vec::with_capacity(self.n_times() * cells);
        for t in 0..self.n_times() {
            for cell in 0..cells {
                data.push(self.value(cell, t).unwrap_or(f64::NAN));
            }
        }
        HarmonizedField {
            descriptor: VariableDescriptor::new(&self.native_name, &self.native_unit),
            data,
            times: self.times(),
            grid: self.grid(),
            frequency: Frequency::Monthly,
            provenance: Provenance::new(&self.provider),
        }
    }
}

/// Ordinary least-squares slope and intercept of `(x, y)` pairs, computed
/// the textbook way. Used as an independent reference in tests.
pub fn reference_regression(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let sx: f64 = points.iter().map(|p| p.0).sum();
    let sy: f64 = points.iter().map(|p| p.1).sum();
    let sxx: f64 = points.iter().map(|p| p.0 * p.0).sum();
    let sxy: f64 = points.iter().map(|p| p.0 * p.1).sum();
    let denom = n * sxx - sx * sx;
    if denom == 0.0 {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denom;
    Some((slope, (sy - slope * sx) / n))
}
