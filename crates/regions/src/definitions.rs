//! Named region definitions loaded from YAML or GeoJSON.
//!
//! YAML files hold a `regions` list; each entry has a `name` and exactly one
//! of `bbox: [min_lon, min_lat, max_lon, max_lat]`, `polygon: [[lon, lat], ...]`
//! or `mask: [[lon, lat], ...]` (points whose nearest grid cells form the
//! region). GeoJSON files are FeatureCollections of `Polygon` or
//! `MultiPolygon` features, named by one of their properties.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use clim_common::{BoundingBox, PipelineError, PipelineResult};

/// Property naming GeoJSON features when none is configured.
pub const DEFAULT_NAME_PROPERTY: &str = "name";

/// A polygon with an exterior ring and optional holes, in (lon, lat) degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holes: Vec<Vec<[f64; 2]>>,
}

impl Polygon {
    pub fn new(exterior: Vec<[f64; 2]>) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    /// Check if a point is inside the exterior ring and outside every hole.
    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        ring_contains(&self.exterior, lon, lat)
            && !self.holes.iter().any(|hole| ring_contains(hole, lon, lat))
    }

    /// Vertex average of the exterior ring, ignoring a closing vertex.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let ring = open_ring(&self.exterior);
        if ring.is_empty() {
            return None;
        }
        let n = ring.len() as f64;
        let (lon, lat) = ring
            .iter()
            .fold((0.0, 0.0), |(x, y), p| (x + p[0], y + p[1]));
        Some((lon / n, lat / n))
    }
}

/// Ray casting; rings may be open or closed.
fn ring_contains(ring: &[[f64; 2]], lon: f64, lat: f64) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if ((yi > lat) != (yj > lat)) && (lon < (xj - xi) * (lat - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn open_ring(ring: &[[f64; 2]]) -> &[[f64; 2]] {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() > 1 && first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

/// Geometry of a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionShape {
    Bbox(BoundingBox),
    Polygons(Vec<Polygon>),
    /// Points selecting their nearest grid cells.
    Mask(Vec<[f64; 2]>),
}

impl RegionShape {
    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        match self {
            RegionShape::Bbox(bbox) => bbox.contains(lon, lat),
            RegionShape::Polygons(polygons) => {
                polygons.iter().any(|p| p.contains_point(lon, lat))
            }
            RegionShape::Mask(_) => false,
        }
    }

    /// Representative point used when the shape covers no cell centre.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        match self {
            RegionShape::Bbox(bbox) => Some(bbox.center()),
            RegionShape::Polygons(polygons) => {
                let centres: Vec<_> = polygons.iter().filter_map(Polygon::centroid).collect();
                mean_point(centres.iter().map(|&(lon, lat)| [lon, lat]))
            }
            RegionShape::Mask(points) => mean_point(points.iter().copied()),
        }
    }
}

fn mean_point(points: impl Iterator<Item = [f64; 2]>) -> Option<(f64, f64)> {
    let (mut lon, mut lat, mut n) = (0.0, 0.0, 0usize);
    for [x, y] in points {
        lon += x;
        lat += y;
        n += 1;
    }
    (n > 0).then(|| (lon / n as f64, lat / n as f64))
}

/// A named region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RegionEntry")]
pub struct RegionDefinition {
    pub name: String,
    pub shape: RegionShape,
}

impl RegionDefinition {
    pub fn new(name: impl Into<String>, shape: RegionShape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    pub fn bbox(name: impl Into<String>, bbox: BoundingBox) -> Self {
        Self::new(name, RegionShape::Bbox(bbox))
    }

    pub fn polygon(name: impl Into<String>, exterior: Vec<[f64; 2]>) -> Self {
        Self::new(name, RegionShape::Polygons(vec![Polygon::new(exterior)]))
    }
}

/// YAML form of a region entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionEntry {
    name: String,
    #[serde(default)]
    bbox: Option<[f64; 4]>,
    #[serde(default)]
    polygon: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    mask: Option<Vec<[f64; 2]>>,
}

impl TryFrom<RegionEntry> for RegionDefinition {
    type Error = String;

    fn try_from(entry: RegionEntry) -> Result<Self, Self::Error> {
        let shape = match (entry.bbox, entry.polygon, entry.mask) {
            (Some([min_lon, min_lat, max_lon, max_lat]), None, None) => {
                if min_lon > max_lon || min_lat > max_lat {
                    return Err(format!("region '{}': inverted bbox", entry.name));
                }
                RegionShape::Bbox(BoundingBox::new(min_lon, min_lat, max_lon, max_lat))
            }
            (None, Some(ring), None) => {
                if open_ring(&ring).len() < 3 {
                    return Err(format!(
                        "region '{}': polygon needs at least 3 vertices",
                        entry.name
                    ));
                }
                RegionShape::Polygons(vec![Polygon::new(ring)])
            }
            (None, None, Some(points)) => {
                if points.is_empty() {
                    return Err(format!("region '{}': empty mask", entry.name));
                }
                RegionShape::Mask(points)
            }
            _ => {
                return Err(format!(
                    "region '{}': expected exactly one of bbox, polygon or mask",
                    entry.name
                ))
            }
        };
        Ok(RegionDefinition {
            name: entry.name,
            shape,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegionFile {
    regions: Vec<RegionDefinition>,
}

// ============================================================================
// GeoJSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon {
        coordinates: Vec<Vec<[f64; 2]>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<[f64; 2]>>>,
    },
}

fn polygon_from_rings(mut rings: Vec<Vec<[f64; 2]>>) -> Option<Polygon> {
    if rings.is_empty() {
        return None;
    }
    let exterior = rings.remove(0);
    Some(Polygon {
        exterior,
        holes: rings,
    })
}

// ============================================================================
// Region sets
// ============================================================================

/// The region table of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSet {
    regions: Vec<RegionDefinition>,
}

impl RegionSet {
    /// Build a set, rejecting empty tables and duplicate names.
    pub fn new(regions: Vec<RegionDefinition>) -> PipelineResult<Self> {
        if regions.is_empty() {
            return Err(PipelineError::Config("region table is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for region in &regions {
            if !seen.insert(region.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate region name '{}'",
                    region.name
                )));
            }
        }
        Ok(Self { regions })
    }

    pub fn from_yaml_str(yaml: &str) -> PipelineResult<Self> {
        let file: RegionFile = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Config(format!("invalid region YAML: {}", e)))?;
        Self::new(file.regions)
    }

    /// Parse a FeatureCollection, naming regions by `name_property`.
    pub fn from_geojson_str(json: &str, name_property: &str) -> PipelineResult<Self> {
        let collection: FeatureCollection = serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(format!("invalid region GeoJSON: {}", e)))?;

        let mut regions = Vec::with_capacity(collection.features.len());
        for (i, feature) in collection.features.into_iter().enumerate() {
            let name = feature
                .properties
                .as_ref()
                .and_then(|p| p.get(name_property))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or_else(|| {
                    PipelineError::Config(format!(
                        "feature {} has no '{}' property",
                        i, name_property
                    ))
                })?;

            let polygons: Vec<Polygon> = match feature.geometry {
                Geometry::Polygon { coordinates } => {
                    polygon_from_rings(coordinates).into_iter().collect()
                }
                Geometry::MultiPolygon { coordinates } => coordinates
                    .into_iter()
                    .filter_map(polygon_from_rings)
                    .collect(),
            };
            if polygons.is_empty() {
                return Err(PipelineError::Config(format!(
                    "region '{}' has an empty geometry",
                    name
                )));
            }
            regions.push(RegionDefinition::new(name, RegionShape::Polygons(polygons)));
        }
        Self::new(regions)
    }

    /// Load a region file, choosing the format from its extension.
    pub fn load(path: impl AsRef<Path>, name_property: &str) -> PipelineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read region file {}: {}", path.display(), e))
        })?;
        let is_geojson = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("geojson") | Some("json")
        );
        let set = if is_geojson {
            Self::from_geojson_str(&contents, name_property)?
        } else {
            Self::from_yaml_str(&contents)?
        };
        info!(
            path = %path.display(),
            regions = set.len(),
            format = if is_geojson { "geojson" } else { "yaml" },
            "Loaded region definitions"
        );
        Ok(set)
    }

    pub fn regions(&self) -> &[RegionDefinition] {
        &self.regions
    }

    pub fn get(&self, name: &str) -> Option<&RegionDefinition> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
