//! Per-run product files.
//!
//! Every unit of a run writes one self-contained Zarr group per store key
//! under the run directory, laid out exactly as the key will appear in the
//! consolidated store. Group attributes follow the input conventions
//! (`units`, `standard_name`, `long_name`) and carry the correction log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::{Group, GroupBuilder};
use zarrs_filesystem::FilesystemStore;

use clim_common::time::to_epoch_seconds;
use clim_common::{ClimatologyRecord, Provenance, RegionSeriesRecord, VariableDescriptor};

use crate::config::{StoreConfig, ZarrCompression};
use crate::error::{StoreError, StoreResult};
use crate::key::StoreKey;

/// Time encoding of regional series.
pub const SERIES_TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00";

/// A product written for one key during this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub key: StoreKey,
    /// Directory holding the key's Zarr group.
    pub path: PathBuf,
}

/// Writes run outputs with the configured chunking and compression.
pub struct OutputWriter {
    config: StoreConfig,
    run_dir: PathBuf,
}

impl OutputWriter {
    pub fn new(config: StoreConfig, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write a climatology, trend or anomaly record.
    pub fn write_record(&self, record: &ClimatologyRecord) -> StoreResult<RunOutput> {
        let key = StoreKey::for_record(record);
        let (store, path) = self.create_key_dir(&key)?;

        let mut attrs = descriptor_attrs(&record.descriptor, &record.provenance)?;
        attrs.insert("product".to_string(), json!(key.product.as_str()));
        attrs.insert("decade".to_string(), json!(record.decade_label()));
        attrs.insert("time_filter".to_string(), json!(record.time_filter.label()));
        attrs.insert("statistic".to_string(), json!(record.statistic_kind.as_str()));
        attrs.insert("units".to_string(), json!(record.unit));
        write_group(&store, "/", attrs)?;

        let nlat = record.grid.nlat() as u64;
        let nlon = record.grid.nlon() as u64;
        self.write_coordinate(&store, "/lat", "degrees_north", &record.grid.lat)?;
        self.write_coordinate(&store, "/lon", "degrees_east", &record.grid.lon)?;

        let chunk = self.config.zarr_chunk_size as u64;
        let chunks = vec![nlat.min(chunk).max(1), nlon.min(chunk).max(1)];

        let mut value_attrs = Map::new();
        value_attrs.insert("units".to_string(), json!(record.unit));
        value_attrs.insert("statistic".to_string(), json!(record.statistic_kind.as_str()));
        value_attrs.insert("_ARRAY_DIMENSIONS".to_string(), json!(["lat", "lon"]));
        let values = self.build_array(
            &store,
            &format!("/{}", record.descriptor.canonical_name),
            vec![nlat, nlon],
            chunks.clone(),
            DataType::Float64,
            8,
            FillValue::from(f64::NAN),
            value_attrs,
        )?;
        store_f64(&values, &record.spatial_field)?;

        let mut count_attrs = Map::new();
        count_attrs.insert("_ARRAY_DIMENSIONS".to_string(), json!(["lat", "lon"]));
        let counts = self.build_array(
            &store,
            "/sample_count",
            vec![nlat, nlon],
            chunks,
            DataType::UInt32,
            4,
            FillValue::from(0u32),
            count_attrs,
        )?;
        store_u32(&counts, &record.sample_count)?;

        debug!(key = %key, path = %path.display(), "Wrote gridded product");
        Ok(RunOutput { key, path })
    }

    /// Write the series of one region; `records` must all belong to it.
    pub fn write_series(
        &self,
        key: StoreKey,
        descriptor: &VariableDescriptor,
        provenance: &Provenance,
        records: &[RegionSeriesRecord],
    ) -> StoreResult<RunOutput> {
        if let Some(other) = records.iter().find(|r| r.region_name != key.selector) {
            return Err(StoreError::Conflict(format!(
                "series for region '{}' written under key {}",
                other.region_name, key
            )));
        }
        let (store, path) = self.create_key_dir(&key)?;

        let mut attrs = descriptor_attrs(descriptor, provenance)?;
        attrs.insert("product".to_string(), json!(key.product.as_str()));
        attrs.insert("region".to_string(), json!(key.selector));
        attrs.insert("time_filter".to_string(), json!(key.time_filter));
        attrs.insert("units".to_string(), json!(descriptor.canonical_unit));
        write_group(&store, "/", attrs)?;

        let n = records.len() as u64;
        let chunks = vec![n.min(self.config.zarr_time_chunk as u64).max(1)];
        let dims = json!(["time"]);

        let mut time_attrs = Map::new();
        time_attrs.insert("units".to_string(), json!(SERIES_TIME_UNITS));
        time_attrs.insert("calendar".to_string(), json!("proleptic_gregorian"));
        time_attrs.insert("_ARRAY_DIMENSIONS".to_string(), dims.clone());
        let times: Vec<f64> = records
            .iter()
            .map(|r| to_epoch_seconds(&r.timestamp) as f64)
            .collect();
        let time = self.build_array(
            &store,
            "/time",
            vec![n],
            chunks.clone(),
            DataType::Float64,
            8,
            FillValue::from(f64::NAN),
            time_attrs,
        )?;
        store_f64(&time, &times)?;

        let mut value_attrs = Map::new();
        value_attrs.insert("units".to_string(), json!(descriptor.canonical_unit));
        value_attrs.insert("_ARRAY_DIMENSIONS".to_string(), dims.clone());
        let values: Vec<f64> = records.iter().map(|r| r.value.unwrap_or(f64::NAN)).collect();
        let value = self.build_array(
            &store,
            &format!("/{}", descriptor.canonical_name),
            vec![n],
            chunks.clone(),
            DataType::Float64,
            8,
            FillValue::from(f64::NAN),
            value_attrs,
        )?;
        store_f64(&value, &values)?;

        let mut fraction_attrs = Map::new();
        fraction_attrs.insert("units".to_string(), json!("1"));
        fraction_attrs.insert("_ARRAY_DIMENSIONS".to_string(), dims);
        let fractions: Vec<f64> = records.iter().map(|r| r.valid_fraction).collect();
        let fraction = self.build_array(
            &store,
            "/valid_fraction",
            vec![n],
            chunks,
            DataType::Float64,
            8,
            FillValue::from(f64::NAN),
            fraction_attrs,
        )?;
        store_f64(&fraction, &fractions)?;

        debug!(key = %key, path = %path.display(), records = records.len(), "Wrote regional series");
        Ok(RunOutput { key, path })
    }

    /// Fresh directory for a key, replacing output from an earlier attempt.
    fn create_key_dir(&self, key: &StoreKey) -> StoreResult<(Arc<FilesystemStore>, PathBuf)> {
        let path = self.run_dir.join(key.path());
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        let store = Arc::new(FilesystemStore::new(&path).map_err(StoreError::zarr)?);
        Ok((store, path))
    }

    fn write_coordinate(
        &self,
        store: &Arc<FilesystemStore>,
        path: &str,
        units: &str,
        values: &[f64],
    ) -> StoreResult<()> {
        let n = values.len() as u64;
        let mut attrs = Map::new();
        attrs.insert("units".to_string(), json!(units));
        attrs.insert(
            "_ARRAY_DIMENSIONS".to_string(),
            json!([path.trim_start_matches('/')]),
        );
        let array = self.build_array(
            store,
            path,
            vec![n],
            vec![n.max(1)],
            DataType::Float64,
            8,
            FillValue::from(f64::NAN),
            attrs,
        )?;
        store_f64(&array, values)
    }

    /// Build an array with the configured settings and store its metadata.
    #[allow(clippy::too_many_arguments)]
    fn build_array(
        &self,
        store: &Arc<FilesystemStore>,
        path: &str,
        shape: Vec<u64>,
        chunks: Vec<u64>,
        data_type: DataType,
        typesize: usize,
        fill_value: FillValue,
        attrs: Map<String, Value>,
    ) -> StoreResult<Array<FilesystemStore>> {
        let chunk_grid: zarrs::array::ChunkGrid = chunks
            .try_into()
            .map_err(|e| StoreError::Config(format!("{:?}", e)))?;

        let mut binding = ArrayBuilder::new(shape, data_type, chunk_grid, fill_value);
        let mut builder = binding.attributes(attrs);

        if self.config.zarr_compression != ZarrCompression::None {
            let codec = self.create_compression_codec(typesize)?;
            builder = builder.bytes_to_bytes_codecs(vec![codec]);
        }

        let array = builder.build(store.clone(), path).map_err(StoreError::zarr)?;
        array.store_metadata().map_err(StoreError::zarr)?;
        Ok(array)
    }

    /// Create the compression codec based on configuration.
    fn create_compression_codec(
        &self,
        typesize: usize,
    ) -> StoreResult<Arc<dyn BytesToBytesCodecTraits>> {
        let level = BloscCompressionLevel::try_from(self.config.zarr_compression_level)
            .map_err(|_| StoreError::Config("Invalid compression level".to_string()))?;

        let shuffle = if self.config.zarr_shuffle {
            BloscShuffleMode::Shuffle
        } else {
            BloscShuffleMode::NoShuffle
        };

        // typesize is required when shuffle is enabled
        let typesize = self.config.zarr_shuffle.then_some(typesize);

        let compressor = match self.config.zarr_compression {
            ZarrCompression::None => {
                return Err(StoreError::Config("No compression configured".to_string()))
            }
            ZarrCompression::Lz4 | ZarrCompression::BloscLz4 => BloscCompressor::LZ4,
            ZarrCompression::Zstd | ZarrCompression::BloscZstd => BloscCompressor::Zstd,
        };

        let codec = BloscCodec::new(compressor, level, None, shuffle, typesize)
            .map_err(|e| StoreError::Config(e.to_string()))?;
        Ok(Arc::new(codec))
    }
}

fn descriptor_attrs(
    descriptor: &VariableDescriptor,
    provenance: &Provenance,
) -> StoreResult<Map<String, Value>> {
    let mut attrs = Map::new();
    attrs.insert("variable".to_string(), json!(descriptor.canonical_name));
    attrs.insert("provider".to_string(), json!(provenance.provider));
    if let Some(standard_name) = &descriptor.standard_name {
        attrs.insert("standard_name".to_string(), json!(standard_name));
    }
    if let Some(long_name) = &descriptor.long_name {
        attrs.insert("long_name".to_string(), json!(long_name));
    }
    attrs.insert("descriptor".to_string(), serde_json::to_value(descriptor)?);
    attrs.insert(
        "correction_log".to_string(),
        serde_json::to_value(&provenance.correction_log)?,
    );
    Ok(attrs)
}

fn write_group(
    store: &Arc<FilesystemStore>,
    path: &str,
    attrs: Map<String, Value>,
) -> StoreResult<()> {
    GroupBuilder::new()
        .attributes(attrs)
        .build(store.clone(), path)
        .map_err(StoreError::zarr)?
        .store_metadata()
        .map_err(StoreError::zarr)
}

fn whole(array: &Array<FilesystemStore>) -> StoreResult<Option<ArraySubset>> {
    let shape = array.shape().to_vec();
    if shape.iter().any(|&d| d == 0) {
        return Ok(None);
    }
    ArraySubset::new_with_start_shape(vec![0; shape.len()], shape)
        .map(Some)
        .map_err(StoreError::zarr)
}

fn store_f64(array: &Array<FilesystemStore>, data: &[f64]) -> StoreResult<()> {
    match whole(array)? {
        Some(subset) => array
            .store_array_subset_elements(&subset, data)
            .map_err(StoreError::zarr),
        None => Ok(()),
    }
}

fn store_u32(array: &Array<FilesystemStore>, data: &[u32]) -> StoreResult<()> {
    match whole(array)? {
        Some(subset) => array
            .store_array_subset_elements(&subset, data)
            .map_err(StoreError::zarr),
        None => Ok(()),
    }
}

// ============================================================================
// Reading products back
// ============================================================================

/// Attributes of the group at the root of a product directory.
pub fn read_attributes(dir: &Path) -> StoreResult<Map<String, Value>> {
    let store = Arc::new(FilesystemStore::new(dir).map_err(StoreError::zarr)?);
    let group = Group::open(store, "/").map_err(StoreError::zarr)?;
    Ok(group.attributes().clone())
}

/// All values of a `float64` array inside a product directory.
pub fn read_f64(dir: &Path, name: &str) -> StoreResult<Vec<f64>> {
    let store = Arc::new(FilesystemStore::new(dir).map_err(StoreError::zarr)?);
    let array = Array::open(store, &format!("/{}", name)).map_err(StoreError::zarr)?;
    if array.shape().iter().any(|&d| d == 0) {
        return Ok(Vec::new());
    }
    array
        .retrieve_array_subset_elements::<f64>(&array.subset_all())
        .map_err(StoreError::zarr)
}

/// All values of a `uint32` array inside a product directory.
pub fn read_u32(dir: &Path, name: &str) -> StoreResult<Vec<u32>> {
    let store = Arc::new(FilesystemStore::new(dir).map_err(StoreError::zarr)?);
    let array = Array::open(store, &format!("/{}", name)).map_err(StoreError::zarr)?;
    array
        .retrieve_array_subset_elements::<u32>(&array.subset_all())
        .map_err(StoreError::zarr)
}
