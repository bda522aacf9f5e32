//! Shared types for the climate product pipeline.
//!
//! Every stage (sources, harmonizer, climatology, regions, product store)
//! exchanges the types defined here.

pub mod descriptor;
pub mod error;
pub mod field;
pub mod grid;
pub mod records;
pub mod time;

pub use descriptor::{DimensionRoles, VariableDescriptor};
pub use error::{ErrorScope, PipelineError, PipelineResult};
pub use field::{
    CorrectionEntry, EncodingMetadata, HarmonizedField, Provenance, RawCoordinates, RawField,
};
pub use grid::{BoundingBox, LatLonGrid};
pub use records::{ClimatologyRecord, RegionSeriesRecord, StatisticKind, TrendRecords};
pub use time::{
    Calendar, CalendarDate, Frequency, Period, SamplingError, Season, TimeFilter, TimeRange,
    TimeUnits,
};
