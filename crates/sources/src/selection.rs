//! Time-range selection on raw, still-encoded time axes.

use clim_common::{Calendar, PipelineError, PipelineResult, TimeRange, TimeUnits};

/// Indices of the timesteps whose decoded date falls inside `range`, in
/// their original order.
///
/// Decoding here is only used to decide membership; the raw offsets are
/// passed on unchanged.
pub fn select_time_indices(
    variable: &str,
    values: &[f64],
    units: &str,
    calendar: Calendar,
    range: &TimeRange,
) -> PipelineResult<Vec<usize>> {
    let units: TimeUnits = units
        .parse()
        .map_err(|e: PipelineError| PipelineError::malformed(variable, e.to_string()))?;

    let mut selected = Vec::new();
    for (i, value) in values.iter().enumerate() {
        let date = units
            .decode(*value, calendar)
            .map_err(|e| PipelineError::malformed(variable, e.to_string()))?;
        let (t, _) = date
            .to_gregorian()
            .map_err(|e| PipelineError::malformed(variable, e.to_string()))?;
        if range.contains(&t) {
            selected.push(i);
        }
    }
    Ok(selected)
}

/// Gather the rows listed in `indices` from a `[time, cells]` buffer.
pub fn gather_rows(data: &[f64], cells: usize, indices: &[usize], offset: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(indices.len() * cells);
    for &i in indices {
        let start = (i - offset) * cells;
        out.extend_from_slice(&data[start..start + cells]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clim_common::Period;

    #[test]
    fn test_select_months_of_one_year() {
        // Mid-month offsets for 1999-2001 in a noleap calendar.
        let lengths = [31.0, 28.0, 31.0, 30.0, 31.0, 30.0, 31.0, 31.0, 30.0, 31.0, 30.0, 31.0];
        let mut values = Vec::new();
        let mut start = 0.0;
        for _ in 0..3 {
            for len in lengths {
                values.push(start + len / 2.0);
                start += len;
            }
        }
        let range = Period::new(2000, 2000).unwrap().time_range();
        let idx = select_time_indices(
            "tas",
            &values,
            "days since 1999-01-01",
            Calendar::NoLeap,
            &range,
        )
        .unwrap();
        assert_eq!(idx, (12..24).collect::<Vec<_>>());
    }

    #[test]
    fn test_bad_units_is_malformed() {
        let range = Period::new(2000, 2000).unwrap().time_range();
        let err = select_time_indices("tas", &[0.0], "fortnights", Calendar::Standard, &range)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedField { .. }));
    }

    #[test]
    fn test_gather_rows() {
        let data = vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1];
        assert_eq!(gather_rows(&data, 2, &[0, 2], 0), vec![0.0, 0.1, 2.0, 2.1]);
        assert_eq!(gather_rows(&data[2..], 2, &[2], 1), vec![2.0, 2.1]);
    }
}
