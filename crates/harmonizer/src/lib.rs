//! Harmonization of raw provider fields.
//!
//! A raw field goes through, in order:
//! 1. name resolution against the name table,
//! 2. time decoding and relabelling onto the proleptic Gregorian calendar,
//! 3. the correction-rule registry,
//! 4. conversion into the descriptor's canonical unit,
//! 5. the invalid-timestep check.
//!
//! Corrections run before unit conversion because several of them
//! (fill values, packing, mislabelled Celsius) act on native values.

pub mod corrections;
pub mod tables;
pub mod units;

use std::path::Path;

use tracing::{debug, info, instrument};

use clim_common::{
    Frequency, HarmonizedField, LatLonGrid, PipelineError, PipelineResult, Provenance, RawField,
    SamplingError, TimeUnits,
};

pub use corrections::{CorrectionRegistry, CorrectionRule, WorkingField};
pub use tables::{NameMapping, RuleSelection, Tables, TablesFile};
pub use units::{Conversion, UnitTable};

/// Default share of invalid timesteps above which a field is rejected.
pub const DEFAULT_MAX_INVALID_FRACTION: f64 = 0.2;

pub struct Harmonizer {
    tables: Tables,
    registry: CorrectionRegistry,
    max_invalid_fraction: f64,
}

impl Harmonizer {
    /// Harmonizer using the correction rules the tables enable.
    pub fn new(tables: Tables, max_invalid_fraction: f64) -> PipelineResult<Self> {
        let registry =
            CorrectionRegistry::from_selections(tables.corrections()).map_err(PipelineError::Config)?;
        Ok(Self::with_registry(tables, registry, max_invalid_fraction))
    }

    pub fn with_registry(
        tables: Tables,
        registry: CorrectionRegistry,
        max_invalid_fraction: f64,
    ) -> Self {
        Self {
            tables,
            registry,
            max_invalid_fraction,
        }
    }

    pub fn from_path(path: &Path, max_invalid_fraction: f64) -> PipelineResult<Self> {
        Self::new(Tables::from_path(path)?, max_invalid_fraction)
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Map a raw field onto its canonical descriptor, unit and calendar.
    #[instrument(skip(self, raw), fields(provider = %raw.provider, variable = %raw.native_name))]
    pub fn harmonize(&self, raw: RawField) -> PipelineResult<HarmonizedField> {
        let mapping = self
            .tables
            .resolve(&raw.provider, &raw.native_name)
            .ok_or_else(|| PipelineError::UnknownVariable {
                provider: raw.provider.clone(),
                native_name: raw.native_name.clone(),
            })?;
        let descriptor = self
            .tables
            .descriptor(&mapping.canonical_name)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "canonical name '{}' has no descriptor",
                    mapping.canonical_name
                ))
            })?
            .clone();

        raw.validate_shape()?;
        if raw.coords.lat.is_empty() || raw.coords.lon.is_empty() {
            return Err(PipelineError::malformed(
                &raw.native_name,
                "empty latitude or longitude axis",
            ));
        }

        let mut provenance = Provenance::new(&raw.provider);
        if raw.native_name != descriptor.canonical_name {
            provenance.record(
                "name_mapping",
                format!("{} -> {}", raw.native_name, descriptor.canonical_name),
            );
        }

        // Time axis
        let units: TimeUnits = raw
            .coords
            .time_units
            .parse()
            .map_err(|e: PipelineError| PipelineError::malformed(&raw.native_name, e.to_string()))?;
        let calendar = raw.coords.calendar;
        let mut times = Vec::with_capacity(raw.n_times());
        let mut clamped = 0usize;
        for &value in &raw.coords.time {
            let (time, was_clamped) = units
                .decode(value, calendar)
                .and_then(|d| d.to_gregorian())
                .map_err(|e| PipelineError::malformed(&raw.native_name, e.to_string()))?;
            clamped += was_clamped as usize;
            times.push(time);
        }
        if !calendar.is_gregorian() {
            provenance.record(
                "calendar_relabel",
                format!(
                    "relabelled {} timestamps from {} onto proleptic_gregorian, {} clamped to month end",
                    times.len(),
                    calendar.as_str(),
                    clamped
                ),
            );
        }

        let native_unit = mapping
            .native_unit
            .clone()
            .unwrap_or_else(|| raw.native_unit.clone());
        let mut field = WorkingField {
            provider: raw.provider,
            variable: descriptor.canonical_name.clone(),
            unit: native_unit,
            data: raw.data,
            times,
            lat: raw.coords.lat,
            lon: raw.coords.lon,
            encoding: raw.encoding,
            dropped_timesteps: 0,
        };

        self.registry.apply_all(&mut field, &mut provenance);

        // Units
        let conversion = self
            .tables
            .units()
            .conversion(&field.unit, &descriptor.canonical_unit)
            .ok_or_else(|| PipelineError::IncompatibleUnit {
                variable: descriptor.canonical_name.clone(),
                native_unit: field.unit.clone(),
                canonical_unit: descriptor.canonical_unit.clone(),
            })?;
        if !conversion.is_identity() {
            field.data.iter_mut().for_each(|v| *v = conversion.apply(*v));
        }
        if !conversion.is_identity() || field.unit != descriptor.canonical_unit {
            provenance.record(
                "unit_conversion",
                format!(
                    "{} -> {} (x{} + {})",
                    field.unit, descriptor.canonical_unit, conversion.scale, conversion.offset
                ),
            );
        }

        // Validity
        let cells = field.cells();
        let empty_steps = field
            .data
            .chunks(cells)
            .filter(|step| step.iter().all(|v| v.is_nan()))
            .count();
        let total = field.n_times() + field.dropped_timesteps;
        if total == 0 {
            return Err(PipelineError::insufficient_data(
                &descriptor.canonical_name,
                "no timesteps in the requested range",
            ));
        }
        let invalid_fraction = (empty_steps + field.dropped_timesteps) as f64 / total as f64;
        if invalid_fraction > self.max_invalid_fraction {
            return Err(PipelineError::insufficient_data(
                &descriptor.canonical_name,
                format!(
                    "{:.1}% of timesteps are invalid, limit is {:.1}%",
                    invalid_fraction * 100.0,
                    self.max_invalid_fraction * 100.0
                ),
            ));
        }

        let frequency = Frequency::infer(&field.times).map_err(|err| match err {
            SamplingError::SingleTimestep => {
                PipelineError::insufficient_data(&descriptor.canonical_name, err.to_string())
            }
            SamplingError::SubDaily { .. } | SamplingError::Irregular { .. } => {
                PipelineError::malformed(&descriptor.canonical_name, err.to_string())
            }
        })?;

        debug!(
            timesteps = field.n_times(),
            invalid_fraction = invalid_fraction,
            "Validated time axis"
        );
        info!(
            canonical_name = %descriptor.canonical_name,
            frequency = ?frequency,
            corrections = provenance.correction_log.len(),
            "Harmonized field"
        );

        Ok(HarmonizedField {
            descriptor,
            data: field.data,
            times: field.times,
            grid: LatLonGrid::new(field.lat, field.lon),
            frequency,
            provenance,
        })
    }
}
