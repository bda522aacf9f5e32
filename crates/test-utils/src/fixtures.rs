//! Configuration fixtures shared across the test suite.

/// Descriptor, name and unit tables covering the synthetic providers.
pub const TABLES_YAML: &str = r#"
descriptors:
  - canonical_name: tas
    canonical_unit: K
    standard_name: air_temperature
    long_name: Near-surface air temperature
  - canonical_name: pr
    canonical_unit: kg m-2 s-1
    standard_name: precipitation_flux
    long_name: Precipitation
names:
  - native_name: tas
    canonical_name: tas
  - native_name: pr
    canonical_name: pr
  - provider: era5
    native_name: t2m
    canonical_name: tas
  - provider: era5
    native_name: tp
    canonical_name: pr
    native_unit: m day-1
  - provider: eerie
    native_name: mean2t
    canonical_name: tas
  - provider: eerie
    native_name: tprate
    canonical_name: pr
"#;

/// Regions over the default synthetic grid (0..10E, 40..50N).
pub const REGIONS_YAML: &str = r#"
regions:
  - name: domain
    bbox: [0.0, 40.0, 10.0, 50.0]
  - name: north
    bbox: [0.0, 45.0, 10.0, 50.0]
  - name: west_triangle
    polygon: [[0.0, 40.0], [5.0, 40.0], [0.0, 50.0], [0.0, 40.0]]
  - name: single_point
    polygon: [[3.1, 44.1], [3.2, 44.1], [3.2, 44.2], [3.1, 44.2]]
"#;

/// The same `domain` and `north` regions as a GeoJSON FeatureCollection.
pub const REGIONS_GEOJSON: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature",
      "properties": {"name": "domain"},
      "geometry": {
        "type": "Polygon",
        "coordinates": [[[0.0, 40.0], [10.0, 40.0], [10.0, 50.0], [0.0, 50.0], [0.0, 40.0]]]
      }
    },
    {
      "type": "Feature",
      "properties": {"name": "north"},
      "geometry": {
        "type": "MultiPolygon",
        "coordinates": [
          [[[0.0, 45.0], [5.0, 45.0], [5.0, 50.0], [0.0, 50.0], [0.0, 45.0]]],
          [[[5.0, 45.0], [10.0, 45.0], [10.0, 50.0], [5.0, 50.0], [5.0, 45.0]]]
        ]
      }
    }
  ]
}"#;
