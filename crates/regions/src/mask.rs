//! Region masks over a grid.

use tracing::{debug, warn};

use clim_common::{LatLonGrid, PipelineError, PipelineResult};

use crate::definitions::{RegionDefinition, RegionShape};

/// Grid cells of one region with their area weights.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionMask {
    pub name: String,
    /// Flat cell indices, ascending.
    pub cells: Vec<usize>,
    /// Spherical area of each cell in `cells`, square metres.
    pub weights: Vec<f64>,
    /// True when the shape covered no cell centre and the nearest cell was used.
    pub fallback: bool,
}

impl RegionMask {
    /// Build the mask of `region` on `grid`.
    ///
    /// `areas` are the grid's cell areas, passed in so a run computes them once.
    pub fn build(
        region: &RegionDefinition,
        grid: &LatLonGrid,
        areas: &[f64],
    ) -> PipelineResult<Self> {
        if grid.is_empty() || areas.len() != grid.len() {
            return Err(PipelineError::malformed(
                region.name.as_str(),
                format!(
                    "grid of {} cells does not match {} cell areas",
                    grid.len(),
                    areas.len()
                ),
            ));
        }

        let mut cells: Vec<usize> = match &region.shape {
            RegionShape::Mask(points) => points
                .iter()
                .filter_map(|&[lon, lat]| grid.nearest_cell(lon, lat))
                .collect(),
            shape => (0..grid.len())
                .filter(|&idx| {
                    let (lon, lat) = grid.cell_center(idx);
                    shape.contains_point(lon, lat)
                })
                .collect(),
        };
        cells.sort_unstable();
        cells.dedup();

        let mut fallback = false;
        if cells.is_empty() {
            let (lon, lat) = region.shape.centroid().ok_or_else(|| {
                PipelineError::malformed(region.name.as_str(), "region has no vertices")
            })?;
            let nearest = grid.nearest_cell(lon, lat).ok_or_else(|| {
                PipelineError::malformed(region.name.as_str(), "grid has no cells")
            })?;
            warn!(
                region = %region.name,
                centroid_lon = lon,
                centroid_lat = lat,
                cell = nearest,
                "Region covers no cell centre, using nearest cell"
            );
            cells.push(nearest);
            fallback = true;
        }

        let weights = cells.iter().map(|&c| areas[c]).collect();
        debug!(region = %region.name, cells = cells.len(), "Built region mask");
        Ok(Self {
            name: region.name.clone(),
            cells,
            weights,
            fallback,
        })
    }

    /// Masks for every region, sharing one area computation.
    pub fn build_all(
        regions: &[RegionDefinition],
        grid: &LatLonGrid,
    ) -> PipelineResult<Vec<Self>> {
        let areas = grid.cell_areas();
        regions
            .iter()
            .map(|region| Self::build(region, grid, &areas))
            .collect()
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
