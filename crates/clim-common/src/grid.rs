//! Regular latitude/longitude grid geometry.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Check if a point is contained within this bounding box (edges inclusive).
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }
}

/// Rectilinear grid described by its cell-centre coordinates.
///
/// Data laid out on this grid is row-major: `index = row * nlon + col`,
/// row following `lat`, column following `lon`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatLonGrid {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
}

impl LatLonGrid {
    pub fn new(lat: Vec<f64>, lon: Vec<f64>) -> Self {
        Self { lat, lon }
    }

    /// Global grid with the given resolution, cell centres offset by half a cell.
    pub fn global(resolution: f64) -> Self {
        let nlat = (180.0 / resolution).round() as usize;
        let nlon = (360.0 / resolution).round() as usize;
        let lat = (0..nlat)
            .map(|i| -90.0 + resolution / 2.0 + i as f64 * resolution)
            .collect();
        let lon = (0..nlon)
            .map(|i| -180.0 + resolution / 2.0 + i as f64 * resolution)
            .collect();
        Self { lat, lon }
    }

    pub fn nlat(&self) -> usize {
        self.lat.len()
    }

    pub fn nlon(&self) -> usize {
        self.lon.len()
    }

    /// Total number of grid cells.
    pub fn len(&self) -> usize {
        self.lat.len() * self.lon.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat.is_empty() || self.lon.is_empty()
    }

    #[inline]
    pub fn flat_index(&self, row: usize, col: usize) -> usize {
        row * self.lon.len() + col
    }

    /// (lon, lat) of the centre of a flat cell index.
    pub fn cell_center(&self, index: usize) -> (f64, f64) {
        let nlon = self.lon.len();
        (self.lon[index % nlon], self.lat[index / nlon])
    }

    /// Cell edges along an axis: midpoints between centres, extrapolated at the ends.
    fn edges(centres: &[f64]) -> Vec<f64> {
        let n = centres.len();
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![centres[0] - 0.5, centres[0] + 0.5];
        }
        let mut edges = Vec::with_capacity(n + 1);
        edges.push(centres[0] - (centres[1] - centres[0]) / 2.0);
        for pair in centres.windows(2) {
            edges.push((pair[0] + pair[1]) / 2.0);
        }
        edges.push(centres[n - 1] + (centres[n - 1] - centres[n - 2]) / 2.0);
        edges
    }

    /// Latitude edges clamped to the poles.
    pub fn lat_edges(&self) -> Vec<f64> {
        Self::edges(&self.lat)
            .into_iter()
            .map(|e| e.clamp(-90.0, 90.0))
            .collect()
    }

    pub fn lon_edges(&self) -> Vec<f64> {
        Self::edges(&self.lon)
    }

    /// Spherical area of every cell in square metres, row-major.
    ///
    /// `A = R² · Δλ · |sin φ₂ − sin φ₁|`, which is exact for cells bounded by
    /// meridians and parallels.
    pub fn cell_areas(&self) -> Vec<f64> {
        let lat_edges = self.lat_edges();
        let lon_edges = self.lon_edges();
        let mut areas = Vec::with_capacity(self.len());
        for row in 0..self.nlat() {
            let band = (lat_edges[row + 1].to_radians().sin()
                - lat_edges[row].to_radians().sin())
            .abs();
            for col in 0..self.nlon() {
                let dlon = (lon_edges[col + 1] - lon_edges[col]).abs().to_radians();
                areas.push(EARTH_RADIUS_M * EARTH_RADIUS_M * dlon * band);
            }
        }
        areas
    }

    /// Flat index of the cell whose centre is nearest to a point.
    pub fn nearest_cell(&self, lon: f64, lat: f64) -> Option<usize> {
        let row = nearest(&self.lat, lat)?;
        let col = nearest(&self.lon, lon)?;
        Some(self.flat_index(row, col))
    }

    pub fn bbox(&self) -> BoundingBox {
        let lat_edges = self.lat_edges();
        let lon_edges = self.lon_edges();
        let (min_lat, max_lat) = min_max(&lat_edges);
        let (min_lon, max_lon) = min_max(&lon_edges);
        BoundingBox::new(min_lon, min_lat, max_lon, max_lat)
    }
}

fn nearest(axis: &[f64], value: f64) -> Option<usize> {
    axis.iter()
        .enumerate()
        .min_by(|a, b| {
            (a.1 - value)
                .abs()
                .partial_cmp(&(b.1 - value).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}
