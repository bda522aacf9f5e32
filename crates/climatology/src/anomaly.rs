//! Differences against a reference climatology.

use clim_common::{ClimatologyRecord, PipelineError, PipelineResult, StatisticKind};

/// Subtract a reference-period mean from a mean record, cell by cell.
///
/// A cell missing in either operand is missing in the result. Both records
/// must share variable, unit, time filter and grid.
pub fn compute_anomaly(
    record: &ClimatologyRecord,
    reference: &ClimatologyRecord,
) -> PipelineResult<ClimatologyRecord> {
    let name = &record.descriptor.canonical_name;
    let mismatch = |what: &str| {
        PipelineError::malformed(
            name,
            format!(
                "cannot subtract {} reference from {}: {} differs",
                reference.decade_label(),
                record.decade_label(),
                what
            ),
        )
    };
    if record.statistic_kind != StatisticKind::Mean || reference.statistic_kind != StatisticKind::Mean
    {
        return Err(mismatch("statistic kind"));
    }
    if record.descriptor.canonical_name != reference.descriptor.canonical_name
        || record.unit != reference.unit
    {
        return Err(mismatch("variable"));
    }
    if record.time_filter != reference.time_filter {
        return Err(mismatch("time filter"));
    }
    if record.grid != reference.grid {
        return Err(mismatch("grid"));
    }

    let spatial_field = record
        .spatial_field
        .iter()
        .zip(&reference.spatial_field)
        .map(|(a, b)| a - b)
        .collect();

    Ok(ClimatologyRecord {
        statistic_kind: StatisticKind::Anomaly,
        spatial_field,
        ..record.clone()
    })
}
