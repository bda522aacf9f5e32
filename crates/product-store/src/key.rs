//! Consolidated store keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use clim_common::{ClimatologyRecord, StatisticKind, TimeFilter, VariableDescriptor};

/// Kind of product held under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Climatology,
    TrendSlope,
    TrendIntercept,
    TrendPValue,
    Anomaly,
    RegionSeries,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Climatology => "climatology",
            ProductKind::TrendSlope => "trend_slope",
            ProductKind::TrendIntercept => "trend_intercept",
            ProductKind::TrendPValue => "trend_pvalue",
            ProductKind::Anomaly => "anomaly",
            ProductKind::RegionSeries => "region_series",
        }
    }

    pub fn from_statistic(kind: StatisticKind) -> Self {
        match kind {
            StatisticKind::Mean => ProductKind::Climatology,
            StatisticKind::TrendSlope => ProductKind::TrendSlope,
            StatisticKind::TrendIntercept => ProductKind::TrendIntercept,
            StatisticKind::TrendPValue => ProductKind::TrendPValue,
            StatisticKind::Anomaly => ProductKind::Anomaly,
        }
    }
}

/// Address of one logical array in the consolidated store:
/// `{product}/{variable}/{provider}/{decade|region}/{time_filter}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    pub product: ProductKind,
    pub variable: String,
    pub provider: String,
    /// Decade label for gridded products, region name for series.
    pub selector: String,
    pub time_filter: String,
}

impl StoreKey {
    pub fn new(
        product: ProductKind,
        variable: impl Into<String>,
        provider: impl Into<String>,
        selector: impl Into<String>,
        time_filter: &TimeFilter,
    ) -> Self {
        Self {
            product,
            variable: variable.into(),
            provider: provider.into(),
            selector: selector.into(),
            time_filter: time_filter.label(),
        }
    }

    pub fn for_record(record: &ClimatologyRecord) -> Self {
        Self::new(
            ProductKind::from_statistic(record.statistic_kind),
            record.descriptor.canonical_name.as_str(),
            record.provenance.provider.as_str(),
            record.decade_label(),
            &record.time_filter,
        )
    }

    pub fn for_series(
        descriptor: &VariableDescriptor,
        provider: &str,
        region: &str,
        time_filter: &TimeFilter,
    ) -> Self {
        Self::new(
            ProductKind::RegionSeries,
            descriptor.canonical_name.as_str(),
            provider,
            region,
            time_filter,
        )
    }

    /// Relative path of the key inside a store, `/`-separated.
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.product.as_str(),
            encode_component(&self.variable),
            encode_component(&self.provider),
            encode_component(&self.selector),
            encode_component(&self.time_filter),
        )
    }

    /// Parse a path produced by [`StoreKey::path`].
    pub fn parse(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        let [product, variable, provider, selector, time_filter] = parts.as_slice() else {
            return None;
        };
        let product = match *product {
            "climatology" => ProductKind::Climatology,
            "trend_slope" => ProductKind::TrendSlope,
            "trend_intercept" => ProductKind::TrendIntercept,
            "trend_pvalue" => ProductKind::TrendPValue,
            "anomaly" => ProductKind::Anomaly,
            "region_series" => ProductKind::RegionSeries,
            _ => return None,
        };
        Some(Self {
            product,
            variable: decode_component(variable)?,
            provider: decode_component(provider)?,
            selector: decode_component(selector)?,
            time_filter: decode_component(time_filter)?,
        })
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Path-safe, reversible form of a key component.
///
/// Bytes outside `[A-Za-z0-9._-]` are written as `%XX`, so distinct
/// components never share a directory. A component made only of dots has
/// every byte escaped; the empty component is a lone `%`.
fn encode_component(component: &str) -> String {
    if component.is_empty() {
        return "%".to_string();
    }
    let escape_all = component.bytes().all(|b| b == b'.');
    let mut encoded = String::with_capacity(component.len());
    for b in component.bytes() {
        if !escape_all && (b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')) {
            encoded.push(char::from(b));
        } else {
            encoded.push_str(&format!("%{:02X}", b));
        }
    }
    encoded
}

fn decode_component(encoded: &str) -> Option<String> {
    if encoded == "%" {
        return Some(String::new());
    }
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}
