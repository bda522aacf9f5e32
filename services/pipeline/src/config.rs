//! Run configuration.
//!
//! One YAML file describes a run: providers, variables, periods, thresholds,
//! table and region files, and where outputs go. `${VAR}` and
//! `${VAR:-default}` are substituted from the environment before parsing.
//! Relative paths resolve against the directory holding the file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use clim_common::{LatLonGrid, Period, TimeFilter, TimeRange};
use climatology::{ClimatologySettings, TrendUnit, DEFAULT_MIN_COVERAGE_FRACTION};
use harmonizer::DEFAULT_MAX_INVALID_FRACTION;
use product_store::{PublishConfig, StoreConfig};
use regions::{DEFAULT_MIN_VALID_FRACTION, DEFAULT_NAME_PROPERTY};
use sources::ProviderConfig;

// ============================================================================
// Configuration types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub providers: Vec<ProviderConfig>,
    /// Canonical variable names to process.
    pub variables: Vec<String>,
    pub periods: PeriodsConfig,
    #[serde(default = "TimeFilter::defaults")]
    pub time_filters: Vec<TimeFilter>,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Name, unit and descriptor tables.
    pub tables: PathBuf,
    pub regions: RegionsConfig,
    /// Parent directory of per-run output directories.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    /// Publication target; the store stays local when absent.
    #[serde(default)]
    pub publish: Option<PublishConfig>,
    /// (provider, variable) jobs processed concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub trend_unit: TrendUnit,
    #[serde(default)]
    pub series_frequency: SeriesFrequency,
    /// Common grid for gridded products; they stay on the native grid when absent.
    #[serde(default)]
    pub regrid: Option<RegridConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodsConfig {
    /// Baseline for anomalies. No anomalies are produced without one.
    #[serde(default)]
    pub reference: Option<Period>,
    /// Analysis windows, e.g. `["1991-2000", "2001-2010"]`.
    pub decades: Vec<Period>,
}

impl PeriodsConfig {
    /// Time range covering every configured period.
    pub fn time_range(&self) -> Option<TimeRange> {
        let mut all = self.decades.clone();
        all.extend(self.reference);
        TimeRange::spanning(&all)
    }
}

/// Minimum-coverage thresholds, all fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Share of a decade's expected samples a cell needs for a mean or trend.
    pub min_coverage_fraction: f64,
    /// Share of invalid timesteps above which a field is rejected.
    pub max_invalid_fraction: f64,
    /// Share of a region's area that must be valid at a timestep.
    pub region_min_valid_fraction: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_coverage_fraction: DEFAULT_MIN_COVERAGE_FRACTION,
            max_invalid_fraction: DEFAULT_MAX_INVALID_FRACTION,
            region_min_valid_fraction: DEFAULT_MIN_VALID_FRACTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionsConfig {
    /// YAML region table, or GeoJSON when the extension is `.geojson`/`.json`.
    pub path: PathBuf,
    /// GeoJSON feature property holding the region name.
    #[serde(default = "default_name_property")]
    pub name_property: String,
}

/// Time axis of the regional series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesFrequency {
    /// Native timesteps the time filter selects.
    #[default]
    Native,
    /// One value per year or season, averaged before aggregation.
    Resampled,
}

/// Global target grid for conservative remapping of gridded products.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegridConfig {
    /// Cell size in degrees, e.g. `0.25`.
    pub resolution: f64,
}

impl RegridConfig {
    pub fn target_grid(&self) -> LatLonGrid {
        LatLonGrid::global(self.resolution)
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_name_property() -> String {
    DEFAULT_NAME_PROPERTY.to_string()
}

// ============================================================================
// Loading
// ============================================================================

impl PipelineConfig {
    /// Load, expand, resolve and validate a configuration file.
    ///
    /// Store tunables can be overridden through `STORE_ROOT` and `ZARR_*`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config from {:?}", path))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&content, base)
            .with_context(|| format!("Invalid pipeline config {:?}", path))
    }

    /// Parse a configuration whose relative paths are relative to `base`.
    pub fn from_yaml_str(content: &str, base: &Path) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        let mut config: PipelineConfig =
            serde_yaml::from_str(&expanded).context("Failed to parse pipeline config YAML")?;
        config.resolve_paths(base);
        config.store = config.store.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.tables);
        resolve(&mut self.regions.path);
        resolve(&mut self.output_dir);
        resolve(&mut self.store.root);
        for provider in &mut self.providers {
            match provider {
                ProviderConfig::Catalogue(entry) => {
                    let is_remote = entry.root.contains("://");
                    if !is_remote && Path::new(&entry.root).is_relative() {
                        entry.root = base.join(&entry.root).display().to_string();
                    }
                }
                ProviderConfig::Observation(entry) => resolve(&mut entry.directory),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.providers.is_empty(), "At least one provider is required");
        anyhow::ensure!(!self.variables.is_empty(), "At least one variable is required");
        anyhow::ensure!(
            !self.periods.decades.is_empty(),
            "At least one analysis decade is required"
        );
        anyhow::ensure!(!self.time_filters.is_empty(), "At least one time filter is required");
        anyhow::ensure!(self.parallelism > 0, "parallelism must be > 0");

        let mut names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("Provider '{}' is configured more than once", w[0]);
        }

        for (name, value) in [
            ("min_coverage_fraction", self.thresholds.min_coverage_fraction),
            ("max_invalid_fraction", self.thresholds.max_invalid_fraction),
            ("region_min_valid_fraction", self.thresholds.region_min_valid_fraction),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&value),
                "Threshold {} must be within [0, 1], got {}",
                name,
                value
            );
        }

        if let Some(regrid) = &self.regrid {
            let r = regrid.resolution;
            anyhow::ensure!(
                r.is_finite() && r > 0.0 && r <= 90.0,
                "regrid resolution must be within (0, 90] degrees, got {}",
                r
            );
            let cells = 180.0 / r;
            anyhow::ensure!(
                (cells - cells.round()).abs() < 1e-9,
                "regrid resolution {} does not divide 180 degrees",
                r
            );
        }

        self.store.validate().map_err(anyhow::Error::msg)?;
        if let Some(publish) = &self.publish {
            publish.validate().map_err(anyhow::Error::msg)?;
        }
        Ok(())
    }

    /// Keep only the named providers and variables.
    ///
    /// Fails when a name is not in the configuration, so a typo on the
    /// command line never turns into an empty run.
    pub fn restrict(&mut self, providers: &[String], variables: &[String]) -> Result<()> {
        for name in providers {
            anyhow::ensure!(
                self.providers.iter().any(|p| p.name() == name),
                "Unknown provider '{}'",
                name
            );
        }
        for name in variables {
            anyhow::ensure!(self.variables.contains(name), "Unknown variable '{}'", name);
        }
        if !providers.is_empty() {
            self.providers.retain(|p| providers.iter().any(|n| n == p.name()));
        }
        if !variables.is_empty() {
            self.variables.retain(|v| variables.contains(v));
        }
        Ok(())
    }

    pub fn climatology_settings(&self) -> ClimatologySettings {
        ClimatologySettings {
            min_coverage_fraction: self.thresholds.min_coverage_fraction,
            trend_unit: self.trend_unit,
        }
    }
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` in configuration text.
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => expr.push(c),
                    None => anyhow::bail!("Unclosed variable substitution: ${{{}", expr),
                }
            }
            result.push_str(&resolve_var_expr(&expr)?);
        } else {
            result.push(ch);
        }
    }
    Ok(result)
}

fn resolve_var_expr(expr: &str) -> Result<String> {
    if let Some((name, default)) = expr.split_once(":-") {
        match std::env::var(name.trim()) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Ok(default.to_string()),
        }
    } else {
        std::env::var(expr.trim()).with_context(|| format!("Environment variable {} not set", expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
providers:
  - kind: catalogue
    name: model
    root: catalogues/model
    variables: [tas]
variables: [tas]
periods:
  reference: 1991-2000
  decades: [1991-2000, 2001-2010]
tables: tables.yaml
regions:
  path: regions.geojson
output_dir: runs
store:
  root: store
"#;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("CLIM_TEST_BUCKET", "products");
        std::env::remove_var("CLIM_TEST_UNSET");
        let out = expand_env_vars("a: ${CLIM_TEST_BUCKET}\nb: ${CLIM_TEST_UNSET:-fallback}").unwrap();
        assert_eq!(out, "a: products\nb: fallback");
        assert!(expand_env_vars("${CLIM_TEST_UNSET}").is_err());
        assert!(expand_env_vars("${UNCLOSED").is_err());
    }

    #[test]
    fn test_minimal_config_defaults_and_paths() {
        let config = PipelineConfig::from_yaml_str(MINIMAL, Path::new("/etc/clim")).unwrap();
        assert_eq!(config.time_filters, TimeFilter::defaults());
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.thresholds.max_invalid_fraction, 0.2);
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.series_frequency, SeriesFrequency::Native);
        assert_eq!(config.tables, PathBuf::from("/etc/clim/tables.yaml"));
        assert_eq!(config.regions.name_property, "name");
        assert!(config.publish.is_none());
        assert!(config.regrid.is_none());
        match &config.providers[0] {
            ProviderConfig::Catalogue(entry) => assert_eq!(entry.root, "/etc/clim/catalogues/model"),
            other => panic!("unexpected provider {:?}", other),
        }

        let range = config.periods.time_range().unwrap();
        assert_eq!(range.start, Period::new(1991, 1991).unwrap().start());
        assert_eq!(range.end, Period::new(2010, 2010).unwrap().time_range().end);
    }

    #[test]
    fn test_remote_catalogue_root_is_kept() {
        let yaml = MINIMAL.replace("root: catalogues/model", "root: s3://bucket/model");
        let config = PipelineConfig::from_yaml_str(&yaml, Path::new("/etc/clim")).unwrap();
        match &config.providers[0] {
            ProviderConfig::Catalogue(entry) => assert_eq!(entry.root, "s3://bucket/model"),
            other => panic!("unexpected provider {:?}", other),
        }
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let yaml = format!("{}thresholds:\n  region_min_valid_fraction: 1.5\n", MINIMAL);
        let err = PipelineConfig::from_yaml_str(&yaml, Path::new(".")).unwrap_err();
        assert!(format!("{:#}", err).contains("region_min_valid_fraction"));
    }

    #[test]
    fn test_regrid_resolution() {
        let yaml = format!("{}regrid:\n  resolution: 0.25\n", MINIMAL);
        let config = PipelineConfig::from_yaml_str(&yaml, Path::new(".")).unwrap();
        let grid = config.regrid.unwrap().target_grid();
        assert_eq!((grid.nlat(), grid.nlon()), (720, 1440));

        for bad in ["0", "-1", "0.7"] {
            let yaml = format!("{}regrid:\n  resolution: {}\n", MINIMAL, bad);
            let err = PipelineConfig::from_yaml_str(&yaml, Path::new(".")).unwrap_err();
            assert!(format!("{:#}", err).contains("regrid resolution"), "{}", bad);
        }
    }

    #[test]
    fn test_shipped_config_files_load() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/pipeline.yaml");
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.providers.len(), 3);
        assert_eq!(config.periods.decades.len(), 3);
        assert_eq!(config.trend_unit, TrendUnit::PerDecade);
        assert_eq!(config.series_frequency, SeriesFrequency::Resampled);
        assert!(config.publish.is_some());
        assert_eq!(config.regrid.map(|r| r.resolution), Some(0.25));

        let tables = harmonizer::Tables::from_path(&config.tables).unwrap();
        for variable in &config.variables {
            assert!(tables.descriptor(variable).is_some(), "no descriptor for {}", variable);
        }
        harmonizer::Harmonizer::new(tables, config.thresholds.max_invalid_fraction).unwrap();
        let regions =
            regions::RegionSet::load(&config.regions.path, &config.regions.name_property).unwrap();
        assert!(regions.get("europe").is_some());
    }

    #[test]
    fn test_restrict() {
        let mut config = PipelineConfig::from_yaml_str(MINIMAL, Path::new(".")).unwrap();
        assert!(config.restrict(&["era5".to_string()], &[]).is_err());
        assert!(config.restrict(&[], &["pr".to_string()]).is_err());
        config.restrict(&["model".to_string()], &["tas".to_string()]).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.variables, vec!["tas".to_string()]);
    }
}
