//! Provider configuration entries.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Names of the coordinate arrays/variables inside a provider's dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateNames {
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default = "default_lat")]
    pub lat: String,
    #[serde(default = "default_lon")]
    pub lon: String,
    /// Vertical coordinate, for 4-D variables.
    #[serde(default)]
    pub vertical: Option<String>,
}

fn default_time() -> String {
    "time".to_string()
}

fn default_lat() -> String {
    "lat".to_string()
}

fn default_lon() -> String {
    "lon".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for CoordinateNames {
    fn default() -> Self {
        Self {
            time: default_time(),
            lat: default_lat(),
            lon: default_lon(),
            vertical: None,
        }
    }
}

/// Model output held in a Zarr hierarchy, local or in an S3 bucket.
///
/// Each variable is an array at `/<native_name>` shaped `[time, lat, lon]`
/// or `[time, level, lat, lon]`; coordinates are 1-D arrays at the paths
/// named in `coords`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueEntry {
    pub name: String,
    /// Local directory, or `s3://bucket/prefix`.
    pub root: String,
    /// S3-compatible endpoint for `s3://` roots. Credentials come from the
    /// standard `AWS_*` environment variables.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    /// Variables offered by this entry.
    pub variables: Vec<String>,
    #[serde(default)]
    pub coords: CoordinateNames,
    /// Level index extracted from 4-D variables.
    #[serde(default)]
    pub vertical_index: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// A directory of NetCDF files concatenated along time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEntry {
    pub name: String,
    pub directory: PathBuf,
    /// File extension to pick up while walking `directory`.
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub coords: CoordinateNames,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_extension() -> String {
    "nc".to_string()
}

/// One provider in the pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Catalogue(CatalogueEntry),
    Observation(ObservationEntry),
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::Catalogue(e) => &e.name,
            ProviderConfig::Observation(e) => &e.name,
        }
    }
}
