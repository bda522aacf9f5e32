//! Products emitted by the climatology engine and the region aggregator.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::descriptor::VariableDescriptor;
use crate::field::Provenance;
use crate::grid::LatLonGrid;
use crate::time::{Period, TimeFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    Mean,
    TrendSlope,
    TrendIntercept,
    /// Two-sided p-value of the trend slope.
    TrendPValue,
    Anomaly,
}

impl StatisticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticKind::Mean => "mean",
            StatisticKind::TrendSlope => "trend_slope",
            StatisticKind::TrendIntercept => "trend_intercept",
            StatisticKind::TrendPValue => "trend_pvalue",
            StatisticKind::Anomaly => "anomaly",
        }
    }
}

/// A per-cell statistic over one period.
///
/// Cells without enough valid samples hold NaN in `spatial_field`; their
/// `sample_count` still records how many samples were seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimatologyRecord {
    pub descriptor: VariableDescriptor,
    pub decade: Period,
    pub time_filter: TimeFilter,
    pub statistic_kind: StatisticKind,
    /// Unit of the values, which differs from the canonical unit for slopes.
    pub unit: String,
    pub spatial_field: Vec<f64>,
    pub sample_count: Vec<u32>,
    pub grid: LatLonGrid,
    pub provenance: Provenance,
}

impl ClimatologyRecord {
    pub fn decade_label(&self) -> String {
        self.decade.label()
    }

    /// Number of cells holding a value.
    pub fn valid_cells(&self) -> usize {
        self.spatial_field.iter().filter(|v| v.is_finite()).count()
    }
}

/// Slope, intercept and slope significance of a per-cell linear fit.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendRecords {
    pub slope: ClimatologyRecord,
    pub intercept: ClimatologyRecord,
    pub pvalue: ClimatologyRecord,
}

/// Area-weighted regional value at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSeriesRecord {
    pub descriptor: VariableDescriptor,
    pub region_name: String,
    pub timestamp: NaiveDateTime,
    /// `None` when too few valid cells contributed.
    pub value: Option<f64>,
    pub valid_fraction: f64,
}
