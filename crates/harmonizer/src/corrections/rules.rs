//! Built-in correction rules.

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use clim_common::time::gregorian_days_in_month;
use clim_common::Frequency;

use super::{CorrectionRule, WorkingField};
use crate::units::is_celsius;

/// Magnitude at and above which a value is treated as an undeclared fill.
const IMPLICIT_FILL_MAGNITUDE: f64 = 1e20;

fn matches_fill(value: f64, fill: f64) -> bool {
    if fill.is_nan() {
        return false;
    }
    value == fill || (value - fill).abs() <= fill.abs() * 1e-6
}

// ============================================================================
// Value encoding
// ============================================================================

/// Values equal to the declared `_FillValue`/`missing_value`, or of absurd
/// magnitude, become NaN.
pub struct FillValueMismatch;

impl CorrectionRule for FillValueMismatch {
    fn symptom(&self) -> &'static str {
        "fill_value_mismatch"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        let declared: Vec<f64> = [field.encoding.fill_value, field.encoding.missing_value]
            .into_iter()
            .flatten()
            .collect();
        let mut replaced = 0usize;
        for v in field.data.iter_mut() {
            if v.is_nan() {
                continue;
            }
            if v.abs() >= IMPLICIT_FILL_MAGNITUDE || declared.iter().any(|f| matches_fill(*v, *f)) {
                *v = f64::NAN;
                replaced += 1;
            }
        }
        (replaced > 0).then(|| format!("replaced {} fill values with NaN", replaced))
    }
}

/// Applies `scale_factor`/`add_offset` packing and clears them.
pub struct PackedValues;

impl CorrectionRule for PackedValues {
    fn symptom(&self) -> &'static str {
        "packed_values"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        let scale = field.encoding.scale_factor.take();
        let offset = field.encoding.add_offset.take();
        let (s, o) = (scale.unwrap_or(1.0), offset.unwrap_or(0.0));
        if s == 1.0 && o == 0.0 {
            return None;
        }
        for v in field.data.iter_mut() {
            *v = *v * s + o;
        }
        Some(format!("unpacked with scale_factor={} add_offset={}", s, o))
    }
}

/// Temperatures declared in Celsius whose mean is clearly in Kelvin.
pub struct KelvinLabelledCelsius;

impl CorrectionRule for KelvinLabelledCelsius {
    fn symptom(&self) -> &'static str {
        "kelvin_labelled_celsius"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        if !is_celsius(&field.unit) {
            return None;
        }
        let (sum, n) = field
            .data
            .iter()
            .filter(|v| v.is_finite())
            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        if n == 0 {
            return None;
        }
        let mean = sum / n as f64;
        if mean <= 200.0 {
            return None;
        }
        let previous = std::mem::replace(&mut field.unit, "K".to_string());
        Some(format!(
            "mean {:.2} is implausible in '{}', relabelled unit to K",
            mean, previous
        ))
    }
}

// ============================================================================
// Horizontal coordinates
// ============================================================================

fn is_radians(units: Option<&str>) -> bool {
    units
        .map(|u| {
            let u = u.trim().to_ascii_lowercase();
            u == "rad" || u == "radian" || u == "radians"
        })
        .unwrap_or(false)
}

/// Latitude/longitude axes declared in radians.
pub struct RadianCoordinates;

impl CorrectionRule for RadianCoordinates {
    fn symptom(&self) -> &'static str {
        "radian_coordinates"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        let mut axes = Vec::new();
        if is_radians(field.encoding.lat_units.as_deref()) {
            field.lat.iter_mut().for_each(|v| *v = v.to_degrees());
            field.encoding.lat_units = Some("degrees_north".to_string());
            axes.push("lat");
        }
        if is_radians(field.encoding.lon_units.as_deref()) {
            field.lon.iter_mut().for_each(|v| *v = v.to_degrees());
            field.encoding.lon_units = Some("degrees_east".to_string());
            axes.push("lon");
        }
        (!axes.is_empty()).then(|| format!("converted {} from radians to degrees", axes.join(", ")))
    }
}

/// Longitudes in [0, 360) are wrapped to [-180, 180) and columns reordered.
pub struct Longitude0To360;

impl CorrectionRule for Longitude0To360 {
    fn symptom(&self) -> &'static str {
        "longitude_0_360"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        let max = field.lon.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = field.lon.iter().cloned().fold(f64::INFINITY, f64::min);
        if field.lon.is_empty() || max <= 180.0 || min < 0.0 {
            return None;
        }

        let wrapped: Vec<f64> = field
            .lon
            .iter()
            .map(|&l| if l >= 180.0 { l - 360.0 } else { l })
            .collect();
        let mut order: Vec<usize> = (0..wrapped.len()).collect();
        order.sort_by(|&a, &b| {
            wrapped[a]
                .partial_cmp(&wrapped[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let nlon = field.lon.len();
        let rows = field.data.len() / nlon;
        let mut data = Vec::with_capacity(field.data.len());
        for r in 0..rows {
            let row = &field.data[r * nlon..(r + 1) * nlon];
            data.extend(order.iter().map(|&c| row[c]));
        }
        field.data = data;
        field.lon = order.iter().map(|&c| wrapped[c]).collect();
        Some(format!(
            "wrapped {} longitudes from [0, 360) to [-180, 180)",
            nlon
        ))
    }
}

/// Latitude running north to south is flipped to ascending.
pub struct DescendingLatitude;

impl CorrectionRule for DescendingLatitude {
    fn symptom(&self) -> &'static str {
        "descending_latitude"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        let n = field.lat.len();
        if n < 2 || field.lat[0] <= field.lat[n - 1] {
            return None;
        }
        let nlon = field.lon.len();
        let cells = field.cells();
        let mut data = Vec::with_capacity(field.data.len());
        for step in field.data.chunks(cells) {
            for row in (0..n).rev() {
                data.extend_from_slice(&step[row * nlon..(row + 1) * nlon]);
            }
        }
        field.data = data;
        field.lat.reverse();
        Some(format!("flipped {} latitude rows to ascending order", n))
    }
}

// ============================================================================
// Time axis
// ============================================================================

/// Repeated or unsorted timestamps: stable sort, keep the first occurrence.
pub struct DuplicateTimestamps;

impl CorrectionRule for DuplicateTimestamps {
    fn symptom(&self) -> &'static str {
        "duplicate_timestamps"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        if field.times.windows(2).all(|w| w[0] < w[1]) {
            return None;
        }
        let mut order: Vec<usize> = (0..field.times.len()).collect();
        order.sort_by_key(|&i| field.times[i]);
        order.dedup_by_key(|i| field.times[*i]);

        let cells = field.cells();
        let dropped = field.times.len() - order.len();
        let mut data = Vec::with_capacity(order.len() * cells);
        for &i in &order {
            data.extend_from_slice(&field.data[i * cells..(i + 1) * cells]);
        }
        field.times = order.iter().map(|&i| field.times[i]).collect();
        field.data = data;
        field.dropped_timesteps += dropped;
        Some(format!(
            "sorted time axis, dropped {} duplicate timesteps",
            dropped
        ))
    }
}

fn is_month_end(t: &NaiveDateTime) -> bool {
    t.day() == gregorian_days_in_month(t.year(), t.month())
}

/// Monthly means labelled on the last day of the month move to day 1.
pub struct MonthEndTimeLabel;

impl CorrectionRule for MonthEndTimeLabel {
    fn symptom(&self) -> &'static str {
        "month_end_time_label"
    }

    fn apply(&self, field: &mut WorkingField) -> Option<String> {
        if Frequency::infer(&field.times) != Ok(Frequency::Monthly)
            || !field.times.iter().all(is_month_end)
        {
            return None;
        }
        for t in field.times.iter_mut() {
            if let Some(first) =
                NaiveDate::from_ymd_opt(t.year(), t.month(), 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            {
                *t = first;
            }
        }
        Some(format!(
            "relabelled {} month-end timestamps to the first of the month",
            field.times.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::field;
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Apply twice; the second application must change nothing.
    fn assert_idempotent(rule: &dyn CorrectionRule, mut f: WorkingField) -> WorkingField {
        assert!(rule.apply(&mut f).is_some(), "{} did not fire", rule.symptom());
        let once = f.clone();
        assert!(rule.apply(&mut f).is_none(), "{} fired twice", rule.symptom());
        assert_eq!(format!("{:?}", f), format!("{:?}", once));
        f
    }

    #[test]
    fn test_fill_value_mismatch() {
        let mut f = field(
            vec![280.0, -999.0, 1.0e20_f32 as f64, 281.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
        );
        f.encoding.missing_value = Some(-999.0);
        let f = assert_idempotent(&FillValueMismatch, f);
        assert_eq!(f.data.iter().filter(|v| v.is_nan()).count(), 2);
        assert_eq!(f.data[0], 280.0);
    }

    #[test]
    fn test_packed_values() {
        let mut f = field(vec![0.0, 10.0], vec![0.0], vec![0.0, 1.0]);
        f.encoding.scale_factor = Some(0.5);
        f.encoding.add_offset = Some(200.0);
        let f = assert_idempotent(&PackedValues, f);
        assert_eq!(f.data, vec![200.0, 205.0]);
    }

    #[test]
    fn test_kelvin_labelled_celsius() {
        let mut f = field(vec![285.0, 290.0], vec![0.0], vec![0.0, 1.0]);
        f.unit = "degC".to_string();
        let f = assert_idempotent(&KelvinLabelledCelsius, f);
        assert_eq!(f.unit, "K");
        assert_eq!(f.data, vec![285.0, 290.0]);

        let mut cold = field(vec![12.0, 15.0], vec![0.0], vec![0.0, 1.0]);
        cold.unit = "degC".to_string();
        assert!(KelvinLabelledCelsius.apply(&mut cold).is_none());
    }

    #[test]
    fn test_radian_coordinates() {
        let half_pi = std::f64::consts::FRAC_PI_2;
        let mut f = field(vec![1.0, 2.0], vec![-half_pi, half_pi], vec![0.0]);
        f.encoding.lat_units = Some("radians".to_string());
        let f = assert_idempotent(&RadianCoordinates, f);
        assert!((f.lat[1] - 90.0).abs() < 1e-12);
        assert_eq!(f.lon, vec![0.0]);
    }

    #[test]
    fn test_longitude_wrap_reorders_columns() {
        // Two timesteps, one row, lon 0..270 by 90.
        let f = field(
            vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0],
            vec![0.0],
            vec![0.0, 90.0, 180.0, 270.0],
        );
        let f = assert_idempotent(&Longitude0To360, f);
        assert_eq!(f.lon, vec![-180.0, -90.0, 0.0, 90.0]);
        assert_eq!(f.data, vec![2.0, 3.0, 0.0, 1.0, 12.0, 13.0, 10.0, 11.0]);
    }

    #[test]
    fn test_descending_latitude() {
        let f = field(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![10.0, 0.0, -10.0], vec![0.0, 1.0]);
        let f = assert_idempotent(&DescendingLatitude, f);
        assert_eq!(f.lat, vec![-10.0, 0.0, 10.0]);
        assert_eq!(f.data, vec![5.0, 6.0, 3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_duplicate_timestamps_keep_first() {
        let mut f = field(vec![1.0, 2.0, 3.0, 4.0], vec![0.0], vec![0.0]);
        f.times = vec![ymd(2000, 2, 1), ymd(2000, 1, 1), ymd(2000, 2, 1), ymd(2000, 3, 1)];
        let f = assert_idempotent(&DuplicateTimestamps, f);
        assert_eq!(f.times, vec![ymd(2000, 1, 1), ymd(2000, 2, 1), ymd(2000, 3, 1)]);
        assert_eq!(f.data, vec![2.0, 1.0, 4.0]);
        assert_eq!(f.dropped_timesteps, 1);
    }

    #[test]
    fn test_month_end_labels() {
        let mut f = field(vec![1.0, 2.0, 3.0], vec![0.0], vec![0.0]);
        f.times = vec![ymd(2000, 1, 31), ymd(2000, 2, 29), ymd(2000, 3, 31)];
        let f = assert_idempotent(&MonthEndTimeLabel, f);
        assert_eq!(f.times, vec![ymd(2000, 1, 1), ymd(2000, 2, 1), ymd(2000, 3, 1)]);

        let mut daily = field(vec![1.0, 2.0], vec![0.0], vec![0.0]);
        daily.times = vec![ymd(2000, 1, 30), ymd(2000, 1, 31)];
        assert!(MonthEndTimeLabel.apply(&mut daily).is_none());
    }
}
