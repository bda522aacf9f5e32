//! First-order conservative remapping between regular lat/lon grids.
//!
//! Every target cell takes the mean of the source cells it overlaps,
//! weighted by the spherical area of each overlap. Missing source values
//! drop out of both numerator and denominator, so a target cell is missing
//! only when none of its overlapping source cells hold a value. The
//! area-weighted mean over the whole domain is preserved.

use rayon::prelude::*;
use tracing::debug;

use clim_common::grid::EARTH_RADIUS_M;
use clim_common::{ClimatologyRecord, LatLonGrid, PipelineError, PipelineResult};

/// Precomputed overlap areas from a source grid onto a target grid.
#[derive(Debug, Clone)]
pub struct ConservativeRemap {
    source: LatLonGrid,
    target: LatLonGrid,
    /// For every target cell, `(source cell, overlap area in m²)`.
    overlaps: Vec<Vec<(usize, f64)>>,
}

/// Ascending `(low, high)` intervals between consecutive edges.
fn intervals(edges: &[f64]) -> Vec<(f64, f64)> {
    edges
        .windows(2)
        .map(|w| (w[0].min(w[1]), w[0].max(w[1])))
        .collect()
}

/// Overlap of two latitude bands as `|sin φ₂ − sin φ₁|`.
fn lat_overlap(a: (f64, f64), b: (f64, f64)) -> f64 {
    let low = a.0.max(b.0);
    let high = a.1.min(b.1);
    if high <= low {
        0.0
    } else {
        high.to_radians().sin() - low.to_radians().sin()
    }
}

/// Overlap of two longitude intervals in radians, modulo 360°.
fn lon_overlap(a: (f64, f64), b: (f64, f64)) -> f64 {
    [-360.0, 0.0, 360.0]
        .iter()
        .map(|shift| {
            let low = a.0.max(b.0 + shift);
            let high = a.1.min(b.1 + shift);
            (high - low).max(0.0)
        })
        .sum::<f64>()
        .min(a.1 - a.0)
        .to_radians()
}

impl ConservativeRemap {
    pub fn new(source: &LatLonGrid, target: &LatLonGrid) -> PipelineResult<Self> {
        if source.is_empty() || target.is_empty() {
            return Err(PipelineError::Config(
                "conservative remapping needs non-empty grids".to_string(),
            ));
        }
        let source_lat = intervals(&source.lat_edges());
        let source_lon = intervals(&source.lon_edges());
        let target_lat = intervals(&target.lat_edges());
        let target_lon = intervals(&target.lon_edges());

        // The overlap area is separable into a latitude and a longitude factor.
        let lat_pairs: Vec<Vec<(usize, f64)>> = target_lat
            .iter()
            .map(|&t| {
                source_lat
                    .iter()
                    .enumerate()
                    .map(|(i, &s)| (i, lat_overlap(t, s)))
                    .filter(|&(_, w)| w > 0.0)
                    .collect()
            })
            .collect();
        let lon_pairs: Vec<Vec<(usize, f64)>> = target_lon
            .iter()
            .map(|&t| {
                source_lon
                    .iter()
                    .enumerate()
                    .map(|(j, &s)| (j, lon_overlap(t, s)))
                    .filter(|&(_, w)| w > 0.0)
                    .collect()
            })
            .collect();

        let r2 = EARTH_RADIUS_M * EARTH_RADIUS_M;
        let overlaps: Vec<Vec<(usize, f64)>> = (0..target.len())
            .into_par_iter()
            .map(|cell| {
                let row = cell / target.nlon();
                let col = cell % target.nlon();
                let mut cell_overlaps = Vec::new();
                for &(i, lat_w) in &lat_pairs[row] {
                    for &(j, lon_w) in &lon_pairs[col] {
                        cell_overlaps.push((source.flat_index(i, j), r2 * lat_w * lon_w));
                    }
                }
                cell_overlaps
            })
            .collect();

        debug!(
            source_cells = source.len(),
            target_cells = target.len(),
            links = overlaps.iter().map(Vec::len).sum::<usize>(),
            "Built conservative remapping"
        );
        Ok(Self {
            source: source.clone(),
            target: target.clone(),
            overlaps,
        })
    }

    /// Remap a gridded field laid out on the source grid.
    ///
    /// Returns the remapped values and, per target cell, the share of its
    /// overlapped area that held a value.
    pub fn remap_values(&self, values: &[f64]) -> PipelineResult<(Vec<f64>, Vec<f64>)> {
        if values.len() != self.source.len() {
            return Err(PipelineError::Config(format!(
                "field has {} cells, remapping expects {}",
                values.len(),
                self.source.len()
            )));
        }
        Ok(self
            .overlaps
            .par_iter()
            .map(|links| {
                let mut weighted = 0.0;
                let mut valid_area = 0.0;
                let mut total_area = 0.0;
                for &(source, area) in links {
                    total_area += area;
                    let v = values[source];
                    if v.is_finite() {
                        weighted += area * v;
                        valid_area += area;
                    }
                }
                if valid_area > 0.0 {
                    (weighted / valid_area, valid_area / total_area)
                } else {
                    (f64::NAN, 0.0)
                }
            })
            .unzip())
    }

    /// Remap a record onto the target grid.
    ///
    /// Sample counts are the area-weighted mean of the overlapped source
    /// counts, rounded. The remapping is noted in the provenance log.
    pub fn apply(&self, record: &ClimatologyRecord) -> PipelineResult<ClimatologyRecord> {
        if record.grid != self.source {
            return Err(PipelineError::Config(format!(
                "{} record is not on the remapping source grid",
                record.statistic_kind.as_str()
            )));
        }
        let (spatial_field, _) = self.remap_values(&record.spatial_field)?;
        let sample_count = self
            .overlaps
            .iter()
            .map(|links| {
                let total: f64 = links.iter().map(|&(_, a)| a).sum();
                if total <= 0.0 {
                    return 0;
                }
                let weighted: f64 = links
                    .iter()
                    .map(|&(s, a)| a * record.sample_count[s] as f64)
                    .sum();
                (weighted / total).round() as u32
            })
            .collect();

        let mut provenance = record.provenance.clone();
        provenance.record(
            "conservative_remap",
            format!(
                "{}x{} grid remapped onto {}x{} grid",
                self.source.nlat(),
                self.source.nlon(),
                self.target.nlat(),
                self.target.nlon()
            ),
        );
        Ok(ClimatologyRecord {
            spatial_field,
            sample_count,
            grid: self.target.clone(),
            provenance,
            ..record.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clim_common::{Period, Provenance, StatisticKind, TimeFilter, VariableDescriptor};
    use test_utils::assert_approx_eq;

    fn area_mean(grid: &LatLonGrid, values: &[f64]) -> f64 {
        let areas = grid.cell_areas();
        let (sum, weight) = values
            .iter()
            .zip(&areas)
            .filter(|(v, _)| v.is_finite())
            .fold((0.0, 0.0), |(s, w), (v, a)| (s + v * a, w + a));
        sum / weight
    }

    #[test]
    fn test_constant_field_stays_constant() {
        let source = LatLonGrid::global(3.0);
        let target = LatLonGrid::global(2.0);
        let remap = ConservativeRemap::new(&source, &target).unwrap();
        let (values, fractions) = remap.remap_values(&vec![287.5; source.len()]).unwrap();
        assert_eq!(values.len(), target.len());
        for (v, f) in values.iter().zip(&fractions) {
            assert_approx_eq!(*v, 287.5, 1e-9);
            assert_approx_eq!(*f, 1.0, 1e-9);
        }
    }

    #[test]
    fn test_global_area_mean_is_conserved() {
        let source = LatLonGrid::global(3.0);
        let target = LatLonGrid::global(2.0);
        let values: Vec<f64> = (0..source.len())
            .map(|i| {
                let (lon, lat) = source.cell_center(i);
                250.0 + 40.0 * lat.to_radians().cos() + 5.0 * lon.to_radians().sin()
            })
            .collect();
        let remap = ConservativeRemap::new(&source, &target).unwrap();
        let (remapped, _) = remap.remap_values(&values).unwrap();
        assert_approx_eq!(area_mean(&target, &remapped), area_mean(&source, &values), 1e-6);
    }

    #[test]
    fn test_coarsening_averages_by_area() {
        // Four 1-degree bands become two 2-degree bands; the first covers 0-2N.
        let source = LatLonGrid::new(vec![0.5, 1.5, 2.5, 3.5], vec![0.5]);
        let target = LatLonGrid::new(vec![1.0, 3.0], vec![0.5]);
        let remap = ConservativeRemap::new(&source, &target).unwrap();
        let (values, _) = remap.remap_values(&[10.0, 20.0, 30.0, 40.0]).unwrap();

        let lower = 1f64.to_radians().sin();
        let upper = 2f64.to_radians().sin() - lower;
        let expected = (10.0 * lower + 20.0 * upper) / (lower + upper);
        assert_approx_eq!(values[0], expected, 1e-12);
        // The band nearer the equator is slightly larger.
        assert!(values[0] < 15.0);
    }

    #[test]
    fn test_missing_source_cells_drop_out() {
        let source = LatLonGrid::new(vec![0.5, 1.5], vec![0.5, 1.5]);
        let target = LatLonGrid::new(vec![1.0], vec![1.0]);
        let remap = ConservativeRemap::new(&source, &target).unwrap();

        let (values, fractions) = remap
            .remap_values(&[4.0, f64::NAN, 4.0, f64::NAN])
            .unwrap();
        assert_approx_eq!(values[0], 4.0, 1e-12);
        assert_approx_eq!(fractions[0], 0.5, 1e-3);

        let (values, fractions) = remap.remap_values(&[f64::NAN; 4]).unwrap();
        assert!(values[0].is_nan());
        assert_eq!(fractions[0], 0.0);
    }

    #[test]
    fn test_longitude_conventions_overlap() {
        // Source in [0, 360), target in [-180, 180).
        let source = LatLonGrid::new(vec![0.0], (0..4).map(|i| 45.0 + 90.0 * i as f64).collect());
        let target = LatLonGrid::new(vec![0.0], vec![-135.0, -45.0, 45.0, 135.0]);
        let remap = ConservativeRemap::new(&source, &target).unwrap();
        let (values, _) = remap.remap_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        // -135 is 225 and -45 is 315.
        for (value, expected) in values.iter().zip([3.0, 4.0, 1.0, 2.0]) {
            assert_approx_eq!(*value, expected, 1e-12);
        }
    }

    #[test]
    fn test_apply_moves_record_to_target_grid() {
        let source = LatLonGrid::global(3.0);
        let target = LatLonGrid::global(2.0);
        let record = ClimatologyRecord {
            descriptor: VariableDescriptor::new("tas", "K"),
            decade: Period::new(1991, 2000).unwrap(),
            time_filter: TimeFilter::Year,
            statistic_kind: StatisticKind::Mean,
            unit: "K".to_string(),
            spatial_field: vec![280.0; source.len()],
            sample_count: vec![120; source.len()],
            grid: source.clone(),
            provenance: Provenance::new("model"),
        };
        let remap = ConservativeRemap::new(&source, &target).unwrap();
        let remapped = remap.apply(&record).unwrap();
        assert_eq!(remapped.grid, target);
        assert_eq!(remapped.spatial_field.len(), target.len());
        assert!(remapped.sample_count.iter().all(|&c| c == 120));
        assert_eq!(
            remapped.provenance.correction_log.last().unwrap().symptom,
            "conservative_remap"
        );

        let foreign = ClimatologyRecord {
            grid: target.clone(),
            spatial_field: vec![280.0; target.len()],
            ..record
        };
        assert!(remap.apply(&foreign).is_err());
    }
}
