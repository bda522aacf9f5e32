//! Climatology and trend engine.
//!
//! Turns harmonized gridded series into per-cell statistics over a decade
//! and time filter:
//! - [`ClimatologyEngine::compute_climatology`]: mean and sample count
//! - [`ClimatologyEngine::compute_trend`]: least-squares slope, intercept
//!   and the slope's p-value
//! - [`compute_anomaly`]: difference against a reference-period mean
//! - [`resample`]: yearly or seasonal bins for regional series
//! - [`ConservativeRemap`]: area-conserving remapping onto a common grid
//!
//! All arithmetic is `f64` with compensated sums. The work is CPU-bound and
//! parallel over grid cells; async callers should run it on the blocking
//! pool.

pub mod accumulate;
pub mod anomaly;
pub mod engine;
pub mod regrid;
pub mod resample;
pub mod significance;

pub use accumulate::{finite_mean, CompensatedSum};
pub use anomaly::compute_anomaly;
pub use engine::{ClimatologyEngine, ClimatologySettings, TrendUnit, DEFAULT_MIN_COVERAGE_FRACTION};
pub use regrid::ConservativeRemap;
pub use resample::resample;
pub use significance::{slope_p_value, student_t_two_sided};
