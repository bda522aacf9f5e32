//! Area-weighted regional means.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use clim_common::{HarmonizedField, PipelineError, PipelineResult, RegionSeriesRecord};
use climatology::CompensatedSum;

use crate::definitions::RegionDefinition;
use crate::mask::RegionMask;

/// Default share of a region's area that must be valid for a timestep to get a value.
pub const DEFAULT_MIN_VALID_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionAggregator {
    pub min_valid_fraction: f64,
}

impl Default for RegionAggregator {
    fn default() -> Self {
        Self {
            min_valid_fraction: DEFAULT_MIN_VALID_FRACTION,
        }
    }
}

impl RegionAggregator {
    pub fn new(min_valid_fraction: f64) -> PipelineResult<Self> {
        let aggregator = Self { min_valid_fraction };
        aggregator.validate().map_err(PipelineError::Config)?;
        Ok(aggregator)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_valid_fraction) {
            return Err(format!(
                "region_min_valid_fraction must be within [0, 1], got {}",
                self.min_valid_fraction
            ));
        }
        Ok(())
    }

    /// One record per (region, timestamp), ordered by timestamp then region.
    #[instrument(skip(self, field, regions), fields(
        variable = %field.descriptor.canonical_name,
        provider = %field.provenance.provider,
        regions = regions.len(),
    ))]
    pub fn aggregate(
        &self,
        field: &HarmonizedField,
        regions: &[RegionDefinition],
    ) -> PipelineResult<Vec<RegionSeriesRecord>> {
        let masks = RegionMask::build_all(regions, &field.grid)?;
        self.aggregate_masks(field, &masks)
    }

    /// Aggregate with prebuilt masks, for callers reusing them across fields
    /// on the same grid.
    pub fn aggregate_masks(
        &self,
        field: &HarmonizedField,
        masks: &[RegionMask],
    ) -> PipelineResult<Vec<RegionSeriesRecord>> {
        let n_cells = field.n_cells();
        if field.data.len() != field.n_times() * n_cells {
            return Err(PipelineError::malformed(
                field.descriptor.canonical_name.as_str(),
                format!(
                    "{} values for {} timesteps of {} cells",
                    field.data.len(),
                    field.n_times(),
                    n_cells
                ),
            ));
        }
        if let Some(mask) = masks.iter().find(|m| m.cells.iter().any(|&c| c >= n_cells)) {
            return Err(PipelineError::malformed(
                mask.name.as_str(),
                "mask was built for a different grid",
            ));
        }

        let mut order: Vec<usize> = (0..field.n_times()).collect();
        order.sort_by_key(|&t| field.times[t]);

        let records: Vec<RegionSeriesRecord> = order
            .par_iter()
            .flat_map_iter(|&t| {
                let step = field.step(t);
                masks.iter().map(move |mask| {
                    let (value, valid_fraction) = self.weighted_mean(step, mask);
                    RegionSeriesRecord {
                        descriptor: field.descriptor.clone(),
                        region_name: mask.name.clone(),
                        timestamp: field.times[t],
                        value,
                        valid_fraction,
                    }
                })
            })
            .collect();

        let missing = records.iter().filter(|r| r.value.is_none()).count();
        info!(
            records = records.len(),
            missing = missing,
            "Computed regional series"
        );
        Ok(records)
    }

    /// Mean over valid cells and the valid share of the region's area.
    fn weighted_mean(&self, step: &[f64], mask: &RegionMask) -> (Option<f64>, f64) {
        let mut total = CompensatedSum::new();
        let mut valid = CompensatedSum::new();
        let mut weighted = CompensatedSum::new();
        for (&cell, &weight) in mask.cells.iter().zip(&mask.weights) {
            total.add(weight);
            let v = step[cell];
            if v.is_finite() {
                valid.add(weight);
                weighted.add(weight * v);
            }
        }

        let total = total.value();
        let valid = valid.value();
        if total <= 0.0 {
            return (None, 0.0);
        }
        let valid_fraction = valid / total;
        let value = (valid > 0.0 && valid_fraction >= self.min_valid_fraction)
            .then(|| weighted.value() / valid);
        (value, valid_fraction)
    }
}
