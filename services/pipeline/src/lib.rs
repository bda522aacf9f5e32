//! Climate product pipeline service.
//!
//! Wires the stages together for one run: source adapters feed the
//! harmonizer, harmonized fields feed the climatology engine and the region
//! aggregator, per-run outputs are merged into the consolidated store, and
//! the store is published. The `clim-pipeline` binary is a thin CLI over
//! [`Pipeline`].

pub mod config;
pub mod manifest;
pub mod pipeline;

pub use config::{PeriodsConfig, PipelineConfig, RegionsConfig, SeriesFrequency, Thresholds};
pub use manifest::{FailedKey, FailedUnit, PublicationSummary, RunManifest};
pub use pipeline::Pipeline;
