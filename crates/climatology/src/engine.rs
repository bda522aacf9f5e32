//! Per-cell climatological means and least-squares trends.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use clim_common::{
    ClimatologyRecord, HarmonizedField, Period, PipelineError, PipelineResult, StatisticKind,
    TimeFilter, TrendRecords,
};

use crate::accumulate::CompensatedSum;
use crate::significance::slope_p_value;

/// Default share of the expected samples a cell needs to get a value.
pub const DEFAULT_MIN_COVERAGE_FRACTION: f64 = 0.5;

/// How trend slopes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendUnit {
    #[default]
    PerYear,
    PerDecade,
}

impl TrendUnit {
    fn factor(&self) -> f64 {
        match self {
            TrendUnit::PerYear => 1.0,
            TrendUnit::PerDecade => 10.0,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            TrendUnit::PerYear => "year-1",
            TrendUnit::PerDecade => "decade-1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimatologySettings {
    /// Cells with fewer valid samples than this share of the expected count
    /// are missing.
    pub min_coverage_fraction: f64,
    pub trend_unit: TrendUnit,
}

impl Default for ClimatologySettings {
    fn default() -> Self {
        Self {
            min_coverage_fraction: DEFAULT_MIN_COVERAGE_FRACTION,
            trend_unit: TrendUnit::default(),
        }
    }
}

impl ClimatologySettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_coverage_fraction) {
            return Err(format!(
                "min_coverage_fraction must be within [0, 1], got {}",
                self.min_coverage_fraction
            ));
        }
        Ok(())
    }
}

/// Computes climatology products from harmonized fields.
///
/// Both operations are pure: the selected timesteps are visited in time
/// order whatever order the field holds them in, so identical inputs give
/// bit-identical outputs.
#[derive(Debug, Clone, Default)]
pub struct ClimatologyEngine {
    settings: ClimatologySettings,
}

/// Timesteps of a field falling in a period and filter, in time order.
struct Selection {
    steps: Vec<usize>,
    expected: u32,
}

impl ClimatologyEngine {
    pub fn new(settings: ClimatologySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ClimatologySettings {
        &self.settings
    }

    fn select(
        &self,
        field: &HarmonizedField,
        decade: &Period,
        filter: TimeFilter,
    ) -> PipelineResult<Selection> {
        let name = &field.descriptor.canonical_name;
        let expected = filter.expected_samples(decade, field.frequency);
        if expected == 0 {
            return Err(PipelineError::insufficient_data(
                name,
                format!(
                    "filter {} selects nothing from {:?} data",
                    filter, field.frequency
                ),
            ));
        }
        let mut steps: Vec<usize> = (0..field.n_times())
            .filter(|&t| decade.contains(&field.times[t]) && filter.selects(&field.times[t]))
            .collect();
        steps.sort_by_key(|&t| field.times[t]);
        if steps.is_empty() {
            return Err(PipelineError::insufficient_data(
                name,
                format!("no timesteps in {} for {}", decade, filter),
            ));
        }
        Ok(Selection { steps, expected })
    }

    /// Valid samples a cell needs, never fewer than `floor`.
    fn required(&self, expected: u32, floor: u32) -> u32 {
        let required = (self.settings.min_coverage_fraction * expected as f64).ceil() as u32;
        required.max(floor)
    }

    /// Per-cell mean over the valid timesteps of a decade.
    #[instrument(
        skip(self, field, decade, filter),
        fields(variable = %field.descriptor.canonical_name, decade = %decade, filter = %filter)
    )]
    pub fn compute_climatology(
        &self,
        field: &HarmonizedField,
        decade: &Period,
        filter: TimeFilter,
    ) -> PipelineResult<ClimatologyRecord> {
        let selection = self.select(field, decade, filter)?;
        let required = self.required(selection.expected, 1);
        let n_cells = field.n_cells();

        let cells: Vec<(f64, u32)> = (0..n_cells)
            .into_par_iter()
            .map(|cell| {
                let mut sum = CompensatedSum::new();
                let mut count = 0u32;
                for &t in &selection.steps {
                    let v = field.data[t * n_cells + cell];
                    if v.is_finite() {
                        sum.add(v);
                        count += 1;
                    }
                }
                let mean = if count >= required {
                    sum.value() / count as f64
                } else {
                    f64::NAN
                };
                (mean, count)
            })
            .collect();

        let (spatial_field, sample_count): (Vec<f64>, Vec<u32>) = cells.into_iter().unzip();
        let record = ClimatologyRecord {
            descriptor: field.descriptor.clone(),
            decade: *decade,
            time_filter: filter,
            statistic_kind: StatisticKind::Mean,
            unit: field.descriptor.canonical_unit.clone(),
            spatial_field,
            sample_count,
            grid: field.grid.clone(),
            provenance: field.provenance.clone(),
        };
        debug!(
            steps = selection.steps.len(),
            required = required,
            valid_cells = record.valid_cells(),
            "Computed climatology"
        );
        Ok(record)
    }

    /// Per-cell ordinary least-squares fit of value against fractional
    /// years since the decade start.
    ///
    /// The intercept is the fitted value at the decade start. The p-value
    /// tests the slope against zero with degrees of freedom reduced for
    /// lag-1 autocorrelation of the residuals. Cells below the minimum
    /// sample count, or whose samples share one timestamp, are missing in
    /// all three records.
    #[instrument(
        skip(self, field, decade, filter),
        fields(variable = %field.descriptor.canonical_name, decade = %decade, filter = %filter)
    )]
    pub fn compute_trend(
        &self,
        field: &HarmonizedField,
        decade: &Period,
        filter: TimeFilter,
    ) -> PipelineResult<TrendRecords> {
        let selection = self.select(field, decade, filter)?;
        let required = self.required(selection.expected, 2);
        let n_cells = field.n_cells();
        let x: Vec<f64> = selection
            .steps
            .iter()
            .map(|&t| decade.fractional_years(&field.times[t]))
            .collect();
        let factor = self.settings.trend_unit.factor();

        let fits: Vec<(f64, f64, f64, u32)> = (0..n_cells)
            .into_par_iter()
            .map(|cell| {
                let y: Vec<f64> = selection
                    .steps
                    .iter()
                    .map(|&t| field.data[t * n_cells + cell])
                    .collect();
                let points = || {
                    x.iter()
                        .copied()
                        .zip(y.iter().copied())
                        .filter(|(_, v)| v.is_finite())
                };
                let (fit, count) = least_squares(points);
                match fit {
                    Some((slope, intercept)) if count >= required => {
                        let pvalue = slope_p_value(&x, &y, slope, intercept);
                        (slope * factor, intercept, pvalue, count)
                    }
                    _ => (f64::NAN, f64::NAN, f64::NAN, count),
                }
            })
            .collect();

        let mut slopes = Vec::with_capacity(n_cells);
        let mut intercepts = Vec::with_capacity(n_cells);
        let mut pvalues = Vec::with_capacity(n_cells);
        let mut counts = Vec::with_capacity(n_cells);
        for (slope, intercept, pvalue, count) in fits {
            slopes.push(slope);
            intercepts.push(intercept);
            pvalues.push(pvalue);
            counts.push(count);
        }

        let base = ClimatologyRecord {
            descriptor: field.descriptor.clone(),
            decade: *decade,
            time_filter: filter,
            statistic_kind: StatisticKind::TrendIntercept,
            unit: field.descriptor.canonical_unit.clone(),
            spatial_field: intercepts,
            sample_count: counts,
            grid: field.grid.clone(),
            provenance: field.provenance.clone(),
        };
        let slope = ClimatologyRecord {
            statistic_kind: StatisticKind::TrendSlope,
            unit: format!(
                "{} {}",
                field.descriptor.canonical_unit,
                self.settings.trend_unit.suffix()
            ),
            spatial_field: slopes,
            ..base.clone()
        };
        let pvalue = ClimatologyRecord {
            statistic_kind: StatisticKind::TrendPValue,
            unit: "1".to_string(),
            spatial_field: pvalues,
            ..base.clone()
        };
        debug!(
            steps = selection.steps.len(),
            required = required,
            valid_cells = slope.valid_cells(),
            "Computed trend"
        );
        Ok(TrendRecords {
            slope,
            intercept: base,
            pvalue,
        })
    }
}

/// Two-pass centred least squares. Returns `(slope, intercept)` and the
/// number of points; no fit when all x coincide or fewer than two points.
fn least_squares<F, I>(points: F) -> (Option<(f64, f64)>, u32)
where
    F: Fn() -> I,
    I: Iterator<Item = (f64, f64)>,
{
    let mut sx = CompensatedSum::new();
    let mut sy = CompensatedSum::new();
    let mut n = 0u32;
    for (x, y) in points() {
        sx.add(x);
        sy.add(y);
        n += 1;
    }
    if n < 2 {
        return (None, n);
    }
    let mean_x = sx.value() / n as f64;
    let mean_y = sy.value() / n as f64;

    let mut sxx = CompensatedSum::new();
    let mut sxy = CompensatedSum::new();
    for (x, y) in points() {
        let dx = x - mean_x;
        sxx.add(dx * dx);
        sxy.add(dx * (y - mean_y));
    }
    let sxx = sxx.value();
    if sxx <= 0.0 {
        return (None, n);
    }
    let slope = sxy.value() / sxx;
    (Some((slope, mean_y - slope * mean_x)), n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{assert_approx_eq, SyntheticField};

    fn decade(start: i32) -> Period {
        Period::new(start, start + 9).unwrap()
    }

    #[test]
    fn test_mean_matches_arithmetic_mean() {
        let synth = SyntheticField {
            missing_every: None,
            ..SyntheticField::default()
        };
        let field = synth.harmonized_field();
        let engine = ClimatologyEngine::default();
        let record = engine
            .compute_climatology(&field, &decade(1991), TimeFilter::Year)
            .unwrap();

        for cell in [0, 17, 99] {
            let values: Vec<f64> = (0..120).map(|t| synth.clean_value(cell, t)).collect();
            let reference = values.iter().sum::<f64>() / values.len() as f64;
            assert_approx_eq!(record.spatial_field[cell], reference, 1e-9);
            assert_eq!(record.sample_count[cell], 120);
        }
        assert_eq!(record.statistic_kind, StatisticKind::Mean);
        assert_eq!(record.unit, "K");
    }

    #[test]
    fn test_trend_recovers_linear_signal() {
        let synth = SyntheticField::linear(2001, 10, 250.0, 0.7);
        let field = synth.harmonized_field();
        let trend = ClimatologyEngine::default()
            .compute_trend(&field, &decade(2001), TimeFilter::Year)
            .unwrap();
        for cell in [0, 55] {
            assert_approx_eq!(trend.slope.spatial_field[cell], 0.7, 1e-9);
            assert_approx_eq!(
                trend.intercept.spatial_field[cell],
                250.0 + 0.01 * cell as f64,
                1e-8
            );
        }
        assert_eq!(trend.slope.unit, "K year-1");
        assert_eq!(trend.intercept.unit, "K");
    }

    #[test]
    fn test_trend_pvalue_separates_signal_from_noise() {
        let synth = SyntheticField::linear(1991, 10, 280.0, 0.0);
        let mut field = synth.harmonized_field();
        let cells = field.n_cells();
        let d = decade(1991);
        for t in 0..field.n_times() {
            let years = d.fractional_years(&field.times[t]);
            let wobble = if t % 2 == 0 { 0.5 } else { -0.5 };
            // Cell 0: no trend under alternating noise.
            field.data[t * cells] = 280.0 + wobble;
            // Cell 1: 0.3 K per year under the same noise.
            field.data[t * cells + 1] = 280.0 + 0.3 * years + wobble;
            // Cell 2: the same trend under a slow cycle of three-year period,
            // which leaves long runs of same-sign residuals.
            field.data[t * cells + 2] =
                280.0 + 0.3 * years + 2.0 * (years * std::f64::consts::TAU / 3.0).sin();
        }

        let trend = ClimatologyEngine::default()
            .compute_trend(&field, &d, TimeFilter::Year)
            .unwrap();
        let p = &trend.pvalue.spatial_field;
        assert!(p[0] > 0.5, "flat cell p = {}", p[0]);
        assert!(p[1] < 1e-6, "trending cell p = {}", p[1]);
        assert!(p[2] > p[1], "{} <= {}", p[2], p[1]);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(trend.pvalue.statistic_kind, StatisticKind::TrendPValue);
        assert_eq!(trend.pvalue.unit, "1");
    }

    #[test]
    fn test_trend_per_decade() {
        let synth = SyntheticField::linear(2001, 10, 250.0, 0.7);
        let engine = ClimatologyEngine::new(ClimatologySettings {
            trend_unit: TrendUnit::PerDecade,
            ..Default::default()
        });
        let trend = engine
            .compute_trend(&synth.harmonized_field(), &decade(2001), TimeFilter::Year)
            .unwrap();
        assert_approx_eq!(trend.slope.spatial_field[3], 7.0, 1e-8);
        assert_eq!(trend.slope.unit, "K decade-1");
    }

    #[test]
    fn test_sparse_cell_is_missing() {
        let synth = SyntheticField::linear(2001, 10, 250.0, 0.7);
        let mut field = synth.harmonized_field();
        let cells = field.n_cells();
        // Cell 5 keeps 59 of 120 samples, one short of the 60 required.
        for t in 0..61 {
            field.data[t * cells + 5] = f64::NAN;
        }
        let engine = ClimatologyEngine::default();
        let mean = engine
            .compute_climatology(&field, &decade(2001), TimeFilter::Year)
            .unwrap();
        assert!(mean.spatial_field[5].is_nan());
        assert_eq!(mean.sample_count[5], 59);
        assert!(mean.spatial_field[6].is_finite());

        let trend = engine
            .compute_trend(&field, &decade(2001), TimeFilter::Year)
            .unwrap();
        assert!(trend.slope.spatial_field[5].is_nan());
        assert!(trend.intercept.spatial_field[5].is_nan());
        assert!(trend.pvalue.spatial_field[5].is_nan());
        assert!(trend.slope.spatial_field[6].is_finite());
    }

    #[test]
    fn test_season_filter_counts() {
        let field = SyntheticField {
            missing_every: None,
            ..SyntheticField::default()
        }
        .harmonized_field();
        let record = ClimatologyEngine::default()
            .compute_climatology(
                &field,
                &decade(1991),
                TimeFilter::Season(clim_common::Season::DJF),
            )
            .unwrap();
        assert!(record.sample_count.iter().all(|&c| c == 30));
    }

    #[test]
    fn test_order_independent() {
        let synth = SyntheticField::default();
        let field = synth.harmonized_field();
        let mut shuffled = field.clone();
        let cells = field.n_cells();
        let order: Vec<usize> = (0..field.n_times()).rev().collect();
        shuffled.times = order.iter().map(|&t| field.times[t]).collect();
        shuffled.data = order
            .iter()
            .flat_map(|&t| field.data[t * cells..(t + 1) * cells].to_vec())
            .collect();

        let engine = ClimatologyEngine::default();
        let a = engine
            .compute_trend(&field, &decade(1991), TimeFilter::Year)
            .unwrap();
        let b = engine
            .compute_trend(&shuffled, &decade(1991), TimeFilter::Year)
            .unwrap();
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.slope.spatial_field), bits(&b.slope.spatial_field));
    }

    #[test]
    fn test_period_without_data() {
        let field = SyntheticField::default().harmonized_field();
        let err = ClimatologyEngine::default()
            .compute_climatology(&field, &decade(2051), TimeFilter::Year)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData { .. }));
    }
}
