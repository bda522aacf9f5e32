//! Source adapters.
//!
//! Every provider, whether a model catalogue or a set of observation files,
//! is accessed through the same two operations: list the native variables it
//! offers and fetch one of them over a time range as a [`RawField`].
//! Adapters never transform values; that is the harmonizer's job.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use clim_common::{PipelineError, PipelineResult, RawField, TimeRange};

pub mod catalogue;
pub mod config;
pub mod memory;
#[cfg(feature = "netcdf")]
pub mod observation;
pub mod selection;
pub mod storage;

pub use catalogue::ZarrCatalogueSource;
pub use config::{CatalogueEntry, CoordinateNames, ObservationEntry, ProviderConfig};
pub use memory::MemorySource;
#[cfg(feature = "netcdf")]
pub use observation::NetcdfObservationSource;

/// Uniform access contract for a data provider.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Provider name, as used in name tables and store keys.
    fn provider(&self) -> &str;

    /// Native variable names this provider offers.
    async fn list_variables(&self) -> PipelineResult<Vec<String>>;

    /// Fetch one variable restricted to `range`.
    ///
    /// Fails with `SourceUnavailable` when the backing data cannot be opened
    /// and with `VariableNotFound` when the name is absent.
    async fn fetch(&self, native_name: &str, range: &TimeRange) -> PipelineResult<RawField>;
}

/// The closed set of provider kinds the pipeline knows how to read.
pub enum Source {
    Catalogue(ZarrCatalogueSource),
    #[cfg(feature = "netcdf")]
    Observation(NetcdfObservationSource),
    Memory(MemorySource),
}

impl Source {
    /// Build the adapter described by a provider configuration entry.
    pub fn from_config(config: &ProviderConfig) -> PipelineResult<Self> {
        match config {
            ProviderConfig::Catalogue(entry) => {
                Ok(Source::Catalogue(ZarrCatalogueSource::open(entry.clone())?))
            }
            #[cfg(feature = "netcdf")]
            ProviderConfig::Observation(entry) => Ok(Source::Observation(
                NetcdfObservationSource::new(entry.clone()),
            )),
            #[cfg(not(feature = "netcdf"))]
            ProviderConfig::Observation(entry) => Err(PipelineError::source_unavailable(
                &entry.name,
                "observation files need the `netcdf` feature",
            )),
        }
    }

    fn adapter(&self) -> &dyn SourceAdapter {
        match self {
            Source::Catalogue(s) => s,
            #[cfg(feature = "netcdf")]
            Source::Observation(s) => s,
            Source::Memory(s) => s,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self {
            Source::Catalogue(s) => s.timeout(),
            #[cfg(feature = "netcdf")]
            Source::Observation(s) => s.timeout(),
            Source::Memory(_) => None,
        }
    }
}

#[async_trait]
impl SourceAdapter for Source {
    fn provider(&self) -> &str {
        self.adapter().provider()
    }

    async fn list_variables(&self) -> PipelineResult<Vec<String>> {
        with_timeout(self.provider(), self.timeout(), self.adapter().list_variables()).await
    }

    #[instrument(skip(self, range), fields(provider = %self.provider()))]
    async fn fetch(&self, native_name: &str, range: &TimeRange) -> PipelineResult<RawField> {
        with_timeout(
            self.provider(),
            self.timeout(),
            self.adapter().fetch(native_name, range),
        )
        .await
    }
}

/// Bound an I/O future by the provider's timeout, surfacing expiry as
/// `SourceUnavailable`.
async fn with_timeout<T, F>(provider: &str, timeout: Option<Duration>, fut: F) -> PipelineResult<T>
where
    F: std::future::Future<Output = PipelineResult<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(provider = %provider, timeout_secs = limit.as_secs(), "Source timed out");
                Err(PipelineError::source_unavailable(
                    provider,
                    format!("timed out after {}s", limit.as_secs()),
                ))
            }
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_source_unavailable() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, PipelineError>(1)
        };
        let err = with_timeout("slow-provider", Some(Duration::from_millis(10)), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_no_timeout_passes_through() {
        let value = with_timeout("p", None, async { Ok::<_, PipelineError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
