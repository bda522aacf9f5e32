//! Configuration for product files, the consolidated store and publication.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Layout and encoding of the Zarr arrays written for every key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the consolidated store.
    pub root: PathBuf,

    /// Chunk edge along latitude and longitude for gridded products.
    pub zarr_chunk_size: usize,

    /// Chunk length along time for regional series.
    pub zarr_time_chunk: usize,

    /// Compression codec for Zarr arrays.
    pub zarr_compression: ZarrCompression,

    /// Compression level (1-9).
    pub zarr_compression_level: u8,

    /// Enable byte shuffle filter for better compression.
    pub zarr_shuffle: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./store"),
            zarr_chunk_size: 256,
            zarr_time_chunk: 120,
            zarr_compression: ZarrCompression::BloscZstd,
            zarr_compression_level: 1,
            zarr_shuffle: true,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `ZARR_*` and `STORE_ROOT` overrides on top of this configuration.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("STORE_ROOT") {
            self.root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ZARR_CHUNK_SIZE") {
            if let Ok(size) = val.parse() {
                self.zarr_chunk_size = size;
            }
        }

        if let Ok(val) = std::env::var("ZARR_TIME_CHUNK") {
            if let Ok(size) = val.parse() {
                self.zarr_time_chunk = size;
            }
        }

        if let Ok(val) = std::env::var("ZARR_COMPRESSION") {
            self.zarr_compression = ZarrCompression::from_str(&val);
        }

        if let Ok(val) = std::env::var("ZARR_COMPRESSION_LEVEL") {
            if let Ok(level) = val.parse() {
                self.zarr_compression_level = level;
            }
        }

        if let Ok(val) = std::env::var("ZARR_SHUFFLE") {
            self.zarr_shuffle = val.to_lowercase() == "true" || val == "1";
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.zarr_chunk_size == 0 {
            return Err("zarr_chunk_size must be > 0".to_string());
        }

        if self.zarr_time_chunk == 0 {
            return Err("zarr_time_chunk must be > 0".to_string());
        }

        if self.zarr_compression_level == 0 || self.zarr_compression_level > 9 {
            return Err("zarr_compression_level must be 1-9".to_string());
        }

        Ok(())
    }
}

/// Compression codec for Zarr arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZarrCompression {
    None,
    Lz4,
    Zstd,
    BloscLz4,
    #[default]
    BloscZstd,
}

impl ZarrCompression {
    /// Parse from string (case-insensitive), falling back to Blosc/Zstd.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => Self::None,
            "lz4" => Self::Lz4,
            "zstd" => Self::Zstd,
            "blosc_lz4" => Self::BloscLz4,
            _ => Self::BloscZstd,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::BloscLz4 => "blosc_lz4",
            Self::BloscZstd => "blosc_zstd",
        }
    }
}

impl std::fmt::Display for ZarrCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Publication
// ============================================================================

/// Where and how the consolidated store is published.
///
/// Credentials are never part of this struct; the S3 client reads
/// `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// S3-compatible endpoint URL; AWS when unset.
    pub endpoint: Option<String>,
    pub bucket: String,
    /// Key prefix of the store inside the bucket.
    pub prefix: String,
    pub region: String,
    /// Allow HTTP (for local MinIO).
    pub allow_http: bool,
    /// Attempts per key before it is reported failed.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub retry_base_ms: u64,
    /// Keys uploaded concurrently.
    pub concurrency: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: "climate-products".to_string(),
            prefix: "store".to_string(),
            region: "us-east-1".to_string(),
            allow_http: false,
            max_attempts: 3,
            retry_base_ms: 500,
            concurrency: 8,
        }
    }
}

impl PublishConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.is_empty() {
            return Err("publish bucket must not be empty".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if self.concurrency == 0 {
            return Err("publish concurrency must be > 0".to_string());
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor))
    }

    /// Build the S3 client for this configuration.
    pub fn build_object_store(&self) -> StoreResult<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region);

        if let Some(endpoint) = &self.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        if self.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            StoreError::Config(format!("Failed to create S3 client: {}", e))
        })?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_store_config_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_compression_level_bounds() {
        let config = StoreConfig {
            zarr_compression_level: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!(ZarrCompression::from_str("NONE"), ZarrCompression::None);
        assert_eq!(ZarrCompression::from_str("blosc_lz4"), ZarrCompression::BloscLz4);
        assert_eq!(ZarrCompression::from_str("unknown"), ZarrCompression::BloscZstd);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = PublishConfig {
            retry_base_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn test_publish_config_rejects_zero_attempts() {
        let config = PublishConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
