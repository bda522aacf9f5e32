//! Temporal resampling of a field into yearly or seasonal bins.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rayon::prelude::*;
use tracing::debug;

use clim_common::{Frequency, HarmonizedField, PipelineError, PipelineResult, TimeFilter};

use crate::accumulate::CompensatedSum;

/// Average the timesteps a filter selects into one value per bin.
///
/// Year and month filters bin by calendar year; season filters bin by
/// season, with December counting towards the following DJF. Bins are
/// labelled by [`TimeFilter::bin_start`]. A cell with fewer than
/// `min_values` valid samples in a bin is NaN in that bin.
pub fn resample(
    field: &HarmonizedField,
    filter: TimeFilter,
    min_values: u32,
) -> PipelineResult<HarmonizedField> {
    let mut bins: BTreeMap<NaiveDateTime, Vec<usize>> = BTreeMap::new();
    for (t, time) in field.times.iter().enumerate() {
        if filter.selects(time) {
            bins.entry(filter.bin_start(time)).or_default().push(t);
        }
    }
    if bins.is_empty() {
        return Err(PipelineError::insufficient_data(
            &field.descriptor.canonical_name,
            format!("filter {} selects no timesteps", filter),
        ));
    }

    let n_cells = field.n_cells();
    let min_values = min_values.max(1);
    let times: Vec<NaiveDateTime> = bins.keys().copied().collect();
    let steps: Vec<Vec<usize>> = bins.into_values().collect();

    let data: Vec<f64> = steps
        .par_iter()
        .flat_map_iter(|members| {
            (0..n_cells).map(move |cell| {
                let mut sum = CompensatedSum::new();
                let mut count = 0u32;
                for &t in members {
                    let v = field.data[t * n_cells + cell];
                    if v.is_finite() {
                        sum.add(v);
                        count += 1;
                    }
                }
                if count >= min_values {
                    sum.value() / count as f64
                } else {
                    f64::NAN
                }
            })
        })
        .collect();

    debug!(
        variable = %field.descriptor.canonical_name,
        filter = %filter,
        bins = times.len(),
        "Resampled field"
    );

    Ok(HarmonizedField {
        descriptor: field.descriptor.clone(),
        data,
        times,
        grid: field.grid.clone(),
        frequency: Frequency::Yearly,
        provenance: field.provenance.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use clim_common::Season;
    use test_utils::{assert_approx_eq, SyntheticField};

    fn ymd(y: i32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_yearly_means() {
        let synth = SyntheticField {
            years: 3,
            missing_every: None,
            ..SyntheticField::default()
        };
        let field = synth.harmonized_field();
        let yearly = resample(&field, TimeFilter::Year, 12).unwrap();
        assert_eq!(yearly.times, vec![ymd(1991, 1), ymd(1992, 1), ymd(1993, 1)]);
        assert_eq!(yearly.frequency, Frequency::Yearly);
        let reference = (12..24).map(|t| synth.clean_value(4, t)).sum::<f64>() / 12.0;
        assert_approx_eq!(yearly.step(1)[4], reference, 1e-9);
    }

    #[test]
    fn test_djf_uses_previous_december() {
        let synth = SyntheticField {
            years: 2,
            missing_every: None,
            ..SyntheticField::default()
        };
        let field = synth.harmonized_field();
        let djf = resample(&field, TimeFilter::Season(Season::DJF), 3).unwrap();
        // Jan-Feb 1991 alone, Dec 1991 + Jan-Feb 1992, Dec 1992 alone.
        assert_eq!(djf.times, vec![ymd(1990, 12), ymd(1991, 12), ymd(1992, 12)]);
        assert!(djf.step(0)[0].is_nan());
        assert!(djf.step(2)[0].is_nan());
        let reference = [11, 12, 13].iter().map(|&t| synth.clean_value(0, t)).sum::<f64>() / 3.0;
        assert_approx_eq!(djf.step(1)[0], reference, 1e-9);
    }

    #[test]
    fn test_month_filter_keeps_single_month() {
        let field = SyntheticField {
            years: 2,
            ..SyntheticField::default()
        }
        .harmonized_field();
        let july = resample(&field, TimeFilter::Month(7), 1).unwrap();
        assert_eq!(july.times, vec![ymd(1991, 7), ymd(1992, 7)]);
        assert_eq!(july.step(0)[3], field.step(6)[3]);
    }
}
