//! Regional time series.
//!
//! Loads named regions (bounding boxes, polygons, point masks) from YAML or
//! GeoJSON, maps them onto a field's grid and reduces each timestep to an
//! area-weighted mean over the region's valid cells.

pub mod aggregate;
pub mod definitions;
pub mod mask;

pub use aggregate::{RegionAggregator, DEFAULT_MIN_VALID_FRACTION};
pub use definitions::{Polygon, RegionDefinition, RegionSet, RegionShape, DEFAULT_NAME_PROPERTY};
pub use mask::RegionMask;
