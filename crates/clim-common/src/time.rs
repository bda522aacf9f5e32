//! Calendars, analysis periods and time filters.
//!
//! Sources encode time as numeric offsets (`days since 1850-01-01`) in one of
//! several model calendars. Everything downstream of the harmonizer works in
//! proleptic Gregorian `NaiveDateTime`.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};

// ============================================================================
// Calendars
// ============================================================================

/// Calendar a source encodes its time axis in (CF conventions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calendar {
    /// Mixed Julian/Gregorian. Handled as proleptic Gregorian; dates before
    /// the 1582 switch are not reproduced in the Julian sense.
    #[serde(alias = "gregorian")]
    Standard,
    ProlepticGregorian,
    #[serde(rename = "noleap", alias = "365_day")]
    NoLeap,
    #[serde(alias = "366_day")]
    AllLeap,
    #[serde(rename = "360_day")]
    Day360,
}

impl Calendar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Calendar::Standard => "standard",
            Calendar::ProlepticGregorian => "proleptic_gregorian",
            Calendar::NoLeap => "noleap",
            Calendar::AllLeap => "all_leap",
            Calendar::Day360 => "360_day",
        }
    }

    pub fn is_gregorian(&self) -> bool {
        matches!(self, Calendar::Standard | Calendar::ProlepticGregorian)
    }

    /// Number of days in a month of this calendar.
    pub fn days_in_month(&self, year: i32, month: u32) -> u32 {
        match self {
            Calendar::Standard | Calendar::ProlepticGregorian => gregorian_days_in_month(year, month),
            Calendar::NoLeap => NOLEAP_MONTH_DAYS[(month - 1) as usize],
            Calendar::AllLeap => {
                if month == 2 {
                    29
                } else {
                    NOLEAP_MONTH_DAYS[(month - 1) as usize]
                }
            }
            Calendar::Day360 => 30,
        }
    }

    /// Fixed year length for the non-Gregorian calendars.
    fn fixed_year_days(&self) -> Option<i64> {
        match self {
            Calendar::NoLeap => Some(365),
            Calendar::AllLeap => Some(366),
            Calendar::Day360 => Some(360),
            Calendar::Standard | Calendar::ProlepticGregorian => None,
        }
    }
}

impl FromStr for Calendar {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "gregorian" | "" => Ok(Calendar::Standard),
            "proleptic_gregorian" => Ok(Calendar::ProlepticGregorian),
            "noleap" | "365_day" => Ok(Calendar::NoLeap),
            "all_leap" | "366_day" => Ok(Calendar::AllLeap),
            "360_day" => Ok(Calendar::Day360),
            other => Err(PipelineError::Config(format!("unsupported calendar '{}'", other))),
        }
    }
}

impl Default for Calendar {
    fn default() -> Self {
        Calendar::Standard
    }
}

const NOLEAP_MONTH_DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

pub fn gregorian_days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 if is_gregorian_leap(year) => 29,
        m => NOLEAP_MONTH_DAYS[((m.clamp(1, 12)) - 1) as usize],
    }
}

fn is_gregorian_leap(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// A date expressed in a source's native calendar. May not exist in the
/// Gregorian calendar (e.g. 30 February in a 360-day calendar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalendarDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub second_of_day: u32,
}

impl CalendarDate {
    /// Relabel onto the proleptic Gregorian calendar.
    ///
    /// Days that do not exist in the target month are clamped to its last
    /// day. The second value reports whether clamping happened.
    pub fn to_gregorian(&self) -> PipelineResult<(NaiveDateTime, bool)> {
        let last = gregorian_days_in_month(self.year, self.month);
        let day = self.day.min(last);
        let date = NaiveDate::from_ymd_opt(self.year, self.month, day).ok_or_else(|| {
            PipelineError::Config(format!(
                "date {:04}-{:02}-{:02} is out of range",
                self.year, self.month, self.day
            ))
        })?;
        let secs = self.second_of_day;
        let datetime = date
            .and_hms_opt(secs / 3600, (secs % 3600) / 60, secs % 60)
            .ok_or_else(|| PipelineError::Config(format!("invalid second of day {}", secs)))?;
        Ok((datetime, day != self.day))
    }
}

/// Parsed CF time units, `<unit> since <reference>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeUnits {
    pub seconds_per_unit: f64,
    pub reference: CalendarDate,
}

impl FromStr for TimeUnits {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PipelineError::Config(format!("unparseable time units '{}'", s));
        let (unit, reference) = s.split_once(" since ").ok_or_else(bad)?;
        let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
            "seconds" | "second" | "s" => 1.0,
            "minutes" | "minute" | "min" => 60.0,
            "hours" | "hour" | "h" => 3600.0,
            "days" | "day" | "d" => 86_400.0,
            _ => return Err(bad()),
        };

        let reference = reference.trim().replace('T', " ");
        let mut parts = reference.split_whitespace();
        let date_part = parts.next().ok_or_else(bad)?;
        let mut ymd = date_part.split('-').map(|p| p.parse::<i64>());
        let year = ymd.next().and_then(|r| r.ok()).ok_or_else(bad)?;
        let month = ymd.next().and_then(|r| r.ok()).unwrap_or(1);
        let day = ymd.next().and_then(|r| r.ok()).unwrap_or(1);

        let mut second_of_day = 0u32;
        if let Some(time_part) = parts.next() {
            let mut hms = time_part.split(':').map(|p| p.parse::<f64>());
            let h = hms.next().and_then(|r| r.ok()).unwrap_or(0.0);
            let m = hms.next().and_then(|r| r.ok()).unwrap_or(0.0);
            let sec = hms.next().and_then(|r| r.ok()).unwrap_or(0.0);
            second_of_day = (h * 3600.0 + m * 60.0 + sec).round() as u32;
        }

        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(bad());
        }

        Ok(Self {
            seconds_per_unit,
            reference: CalendarDate {
                year: year as i32,
                month: month as u32,
                day: day as u32,
                second_of_day,
            },
        })
    }
}

impl TimeUnits {
    /// Decode a numeric offset into a native calendar date.
    pub fn decode(&self, value: f64, calendar: Calendar) -> PipelineResult<CalendarDate> {
        if !value.is_finite() {
            return Err(PipelineError::Config(format!("non-finite time value {}", value)));
        }
        let offset = (value * self.seconds_per_unit).round() as i64
            + self.reference.second_of_day as i64;
        let days = offset.div_euclid(86_400);
        let second_of_day = offset.rem_euclid(86_400) as u32;

        let (year, month, day) = match calendar.fixed_year_days() {
            None => {
                let start = NaiveDate::from_ymd_opt(
                    self.reference.year,
                    self.reference.month,
                    self.reference.day,
                )
                .ok_or_else(|| PipelineError::Config("invalid reference date".to_string()))?;
                let date = start
                    .checked_add_signed(chrono::Duration::days(days))
                    .ok_or_else(|| PipelineError::Config(format!("time value {} overflows", value)))?;
                (date.year(), date.month(), date.day())
            }
            Some(year_days) => {
                let doy = day_of_year(calendar, &self.reference) as i64;
                let absolute = self.reference.year as i64 * year_days + doy + days;
                let year = absolute.div_euclid(year_days) as i32;
                let mut remaining = absolute.rem_euclid(year_days) as u32;
                let mut month = 1;
                while remaining >= calendar.days_in_month(year, month) {
                    remaining -= calendar.days_in_month(year, month);
                    month += 1;
                }
                (year, month, remaining + 1)
            }
        };

        Ok(CalendarDate {
            year,
            month,
            day,
            second_of_day,
        })
    }
}

/// Zero-based day of year of a date in a fixed-length calendar.
fn day_of_year(calendar: Calendar, date: &CalendarDate) -> u32 {
    (1..date.month)
        .map(|m| calendar.days_in_month(date.year, m))
        .sum::<u32>()
        + date.day.saturating_sub(1)
}

// ============================================================================
// Periods
// ============================================================================

/// Inclusive range of calendar years, e.g. a decade `1991-2000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    pub start_year: i32,
    pub end_year: i32,
}

impl Period {
    pub fn new(start_year: i32, end_year: i32) -> PipelineResult<Self> {
        if end_year < start_year {
            return Err(PipelineError::Config(format!(
                "period end {} precedes start {}",
                end_year, start_year
            )));
        }
        Ok(Self {
            start_year,
            end_year,
        })
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.start_year, self.end_year)
    }

    pub fn n_years(&self) -> u32 {
        (self.end_year - self.start_year + 1) as u32
    }

    pub fn contains(&self, t: &NaiveDateTime) -> bool {
        (self.start_year..=self.end_year).contains(&t.year())
    }

    /// First instant of the period.
    pub fn start(&self) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(self.start_year, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
    }

    pub fn time_range(&self) -> TimeRange {
        let end = NaiveDate::from_ymd_opt(self.end_year, 12, 31)
            .and_then(|d| d.and_hms_opt(23, 59, 59))
            .unwrap_or_default();
        TimeRange {
            start: self.start(),
            end,
        }
    }

    /// Time as fractional years since the start of the period.
    pub fn fractional_years(&self, t: &NaiveDateTime) -> f64 {
        let year = t.year();
        let year_start = NaiveDate::from_ymd_opt(year, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        let year_len = if is_gregorian_leap(year) { 366.0 } else { 365.0 };
        let elapsed = (*t - year_start).num_seconds() as f64 / 86_400.0;
        (year - self.start_year) as f64 + elapsed / year_len
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_year, self.end_year)
    }
}

impl FromStr for Period {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PipelineError::Config(format!("invalid period '{}', expected YYYY-YYYY", s));
        let (a, b) = s.trim().split_once('-').ok_or_else(bad)?;
        let start = a.trim().parse().map_err(|_| bad())?;
        let end = b.trim().parse().map_err(|_| bad())?;
        Period::new(start, end)
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Closed interval of timestamps requested from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn contains(&self, t: &NaiveDateTime) -> bool {
        *t >= self.start && *t <= self.end
    }

    /// Smallest range covering a set of periods.
    pub fn spanning(periods: &[Period]) -> Option<Self> {
        let start = periods.iter().map(|p| p.start_year).min()?;
        let end = periods.iter().map(|p| p.end_year).max()?;
        Period::new(start, end).ok().map(|p| p.time_range())
    }
}

// ============================================================================
// Sampling frequency and time filters
// ============================================================================

/// Native sampling frequency of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Monthly,
    Yearly,
}

/// Why a time axis has no supported sampling frequency.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SamplingError {
    #[error("a single timestep has no sampling frequency")]
    SingleTimestep,
    #[error("sub-daily sampling every {hours:.1} h is not supported, aggregate to daily means first")]
    SubDaily { hours: f64 },
    #[error("irregular time axis with a median spacing of {days:.2} days")]
    Irregular { days: f64 },
}

impl Frequency {
    /// Shortest median spacing, in days, still counted as daily.
    const MIN_DAILY_SPACING: f64 = 0.9;

    /// Infer the frequency from the median spacing of a sorted time axis.
    ///
    /// Sub-daily axes are rejected rather than treated as daily, since every
    /// expected-sample count assumes at most one value per day.
    pub fn infer(times: &[NaiveDateTime]) -> Result<Self, SamplingError> {
        if times.len() < 2 {
            return Err(SamplingError::SingleTimestep);
        }
        let mut gaps: Vec<f64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).num_seconds() as f64 / 86_400.0)
            .collect();
        gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = gaps[gaps.len() / 2];
        match median {
            m if m > 0.0 && m < Self::MIN_DAILY_SPACING => {
                Err(SamplingError::SubDaily { hours: m * 24.0 })
            }
            m if (Self::MIN_DAILY_SPACING..2.0).contains(&m) => Ok(Frequency::Daily),
            m if (25.0..=35.0).contains(&m) => Ok(Frequency::Monthly),
            m if (300.0..=370.0).contains(&m) => Ok(Frequency::Yearly),
            m => Err(SamplingError::Irregular { days: m }),
        }
    }
}

/// Meteorological season.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Season {
    DJF,
    MAM,
    JJA,
    SON,
}

impl Season {
    pub const ALL: [Season; 4] = [Season::MAM, Season::JJA, Season::SON, Season::DJF];

    pub fn months(&self) -> [u32; 3] {
        match self {
            Season::DJF => [12, 1, 2],
            Season::MAM => [3, 4, 5],
            Season::JJA => [6, 7, 8],
            Season::SON => [9, 10, 11],
        }
    }

    pub fn first_month(&self) -> u32 {
        self.months()[0]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::DJF => "DJF",
            Season::MAM => "MAM",
            Season::JJA => "JJA",
            Season::SON => "SON",
        }
    }
}

const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Subset of the year a product is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeFilter {
    Year,
    Season(Season),
    Month(u32),
}

impl TimeFilter {
    /// Default filter set: the whole year and the four seasons.
    pub fn defaults() -> Vec<TimeFilter> {
        std::iter::once(TimeFilter::Year)
            .chain(Season::ALL.iter().map(|s| TimeFilter::Season(*s)))
            .collect()
    }

    pub fn label(&self) -> String {
        match self {
            TimeFilter::Year => "year".to_string(),
            TimeFilter::Season(s) => s.as_str().to_string(),
            TimeFilter::Month(m) => MONTH_NAMES[(*m as usize).clamp(1, 12) - 1].to_string(),
        }
    }

    pub fn selects(&self, t: &NaiveDateTime) -> bool {
        match self {
            TimeFilter::Year => true,
            TimeFilter::Season(s) => s.months().contains(&t.month()),
            TimeFilter::Month(m) => t.month() == *m,
        }
    }

    /// Minimum number of valid native samples for a resampled bin.
    pub fn min_values(&self, frequency: Frequency) -> u32 {
        match (frequency, self) {
            (Frequency::Daily, TimeFilter::Month(_)) => 28,
            (Frequency::Daily, TimeFilter::Season(_)) => 80,
            (Frequency::Daily, TimeFilter::Year) => 354,
            (Frequency::Monthly, TimeFilter::Month(_)) => 1,
            (Frequency::Monthly, TimeFilter::Season(_)) => 3,
            (Frequency::Monthly, TimeFilter::Year) => 12,
            (Frequency::Yearly, _) => 1,
        }
    }

    /// Timestamp labelling the resampled bin a native timestep falls into.
    ///
    /// December belongs to the following year's DJF, which is labelled by
    /// its first month.
    pub fn bin_start(&self, t: &NaiveDateTime) -> NaiveDateTime {
        let (year, month) = match self {
            TimeFilter::Year | TimeFilter::Month(_) => (t.year(), 1),
            TimeFilter::Season(s) => {
                let year = if t.month() <= 2 { t.year() - 1 } else { t.year() };
                (year, s.first_month())
            }
        };
        let month = match self {
            TimeFilter::Month(m) => *m,
            _ => month,
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
    }

    /// Number of native samples the filter selects from a full period.
    pub fn expected_samples(&self, period: &Period, frequency: Frequency) -> u32 {
        match frequency {
            Frequency::Yearly => match self {
                TimeFilter::Year => period.n_years(),
                _ => 0,
            },
            Frequency::Monthly => {
                let per_year = match self {
                    TimeFilter::Year => 12,
                    TimeFilter::Season(_) => 3,
                    TimeFilter::Month(_) => 1,
                };
                per_year * period.n_years()
            }
            Frequency::Daily => {
                let mut count = 0;
                for year in period.start_year..=period.end_year {
                    for month in 1..=12 {
                        let t = NaiveDate::from_ymd_opt(year, month, 1)
                            .and_then(|d| d.and_hms_opt(0, 0, 0))
                            .unwrap_or_default();
                        if self.selects(&t) {
                            count += gregorian_days_in_month(year, month);
                        }
                    }
                }
                count
            }
        }
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for TimeFilter {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("year") {
            return Ok(TimeFilter::Year);
        }
        for season in Season::ALL {
            if trimmed.eq_ignore_ascii_case(season.as_str()) {
                return Ok(TimeFilter::Season(season));
            }
        }
        if let Some(i) = MONTH_NAMES
            .iter()
            .position(|m| trimmed.eq_ignore_ascii_case(m))
        {
            return Ok(TimeFilter::Month(i as u32 + 1));
        }
        Err(PipelineError::Config(format!("unknown time filter '{}'", s)))
    }
}

impl Serialize for TimeFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for TimeFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Seconds since the Unix epoch, the on-disk encoding of timestamps.
pub fn to_epoch_seconds(t: &NaiveDateTime) -> i64 {
    t.and_utc().timestamp()
}

pub fn from_epoch_seconds(secs: i64) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

/// True when a timestamp sits exactly on midnight of the first of a month.
pub fn is_month_start(t: &NaiveDateTime) -> bool {
    t.day() == 1 && t.num_seconds_from_midnight() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_decode_standard_days() {
        let units: TimeUnits = "days since 1850-01-01".parse().unwrap();
        let date = units.decode(365.0, Calendar::Standard).unwrap();
        assert_eq!((date.year, date.month, date.day), (1851, 1, 1));
    }

    #[test]
    fn test_decode_noleap_skips_feb_29() {
        let units: TimeUnits = "days since 2000-01-01 00:00:00".parse().unwrap();
        // Day 59 is 1 March in a 365-day calendar.
        let date = units.decode(59.0, Calendar::NoLeap).unwrap();
        assert_eq!((date.year, date.month, date.day), (2000, 3, 1));
        let date = units.decode(365.0, Calendar::NoLeap).unwrap();
        assert_eq!((date.year, date.month, date.day), (2001, 1, 1));
    }

    #[test]
    fn test_360_day_clamps_on_relabel() {
        let units: TimeUnits = "days since 2001-01-01".parse().unwrap();
        // 30 Jan + 29 days = 30 Feb in a 360-day calendar.
        let date = units.decode(59.0, Calendar::Day360).unwrap();
        assert_eq!((date.month, date.day), (2, 30));
        let (t, clamped) = date.to_gregorian().unwrap();
        assert!(clamped);
        assert_eq!(t, ymd(2001, 2, 28));
    }

    #[test]
    fn test_hours_units() {
        let units: TimeUnits = "hours since 1900-01-01 00:00:0.0".parse().unwrap();
        let date = units.decode(36.0, Calendar::ProlepticGregorian).unwrap();
        assert_eq!((date.day, date.second_of_day), (2, 12 * 3600));
    }

    #[test]
    fn test_period_parse_and_fractional_years() {
        let period: Period = "1991-2000".parse().unwrap();
        assert_eq!(period.n_years(), 10);
        assert_eq!(period.fractional_years(&ymd(1991, 1, 1)), 0.0);
        assert!((period.fractional_years(&ymd(1993, 7, 2)) - 2.5).abs() < 0.01);
        assert!("2000-1991".parse::<Period>().is_err());
    }

    #[test]
    fn test_time_filter_labels() {
        assert_eq!(TimeFilter::Season(Season::DJF).label(), "DJF");
        assert_eq!(TimeFilter::Month(3).label(), "Mar");
        assert_eq!("jja".parse::<TimeFilter>().unwrap(), TimeFilter::Season(Season::JJA));
        assert_eq!("Oct".parse::<TimeFilter>().unwrap(), TimeFilter::Month(10));
        assert_eq!(TimeFilter::defaults().len(), 5);
    }

    #[test]
    fn test_djf_december_belongs_to_next_winter() {
        let djf = TimeFilter::Season(Season::DJF);
        assert_eq!(djf.bin_start(&ymd(2000, 12, 1)), ymd(2000, 12, 1));
        assert_eq!(djf.bin_start(&ymd(2001, 2, 1)), ymd(2000, 12, 1));
        assert_eq!(TimeFilter::Year.bin_start(&ymd(2001, 7, 1)), ymd(2001, 1, 1));
    }

    #[test]
    fn test_expected_samples() {
        let decade = Period::new(1991, 2000).unwrap();
        assert_eq!(TimeFilter::Year.expected_samples(&decade, Frequency::Monthly), 120);
        assert_eq!(
            TimeFilter::Season(Season::JJA).expected_samples(&decade, Frequency::Monthly),
            30
        );
        assert_eq!(TimeFilter::Year.expected_samples(&decade, Frequency::Daily), 3653);
    }

    #[test]
    fn test_infer_frequency() {
        let monthly: Vec<_> = (1..=12).map(|m| ymd(2000, m, 1)).collect();
        assert_eq!(Frequency::infer(&monthly), Ok(Frequency::Monthly));
        let daily: Vec<_> = (1..=10).map(|d| ymd(2000, 1, d)).collect();
        assert_eq!(Frequency::infer(&daily), Ok(Frequency::Daily));
        let yearly: Vec<_> = (1991..=2000).map(|y| ymd(y, 7, 1)).collect();
        assert_eq!(Frequency::infer(&yearly), Ok(Frequency::Yearly));
    }

    #[test]
    fn test_infer_rejects_unsupported_axes() {
        assert_eq!(Frequency::infer(&[]), Err(SamplingError::SingleTimestep));
        assert_eq!(Frequency::infer(&[ymd(2000, 1, 1)]), Err(SamplingError::SingleTimestep));

        let six_hourly: Vec<_> = (0..40)
            .map(|i| ymd(2000, 1, 1) + chrono::Duration::hours(6 * i))
            .collect();
        match Frequency::infer(&six_hourly) {
            Err(SamplingError::SubDaily { hours }) => assert!((hours - 6.0).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }

        let weekly: Vec<_> = (0..10)
            .map(|i| ymd(2000, 1, 1) + chrono::Duration::days(7 * i))
            .collect();
        assert_eq!(Frequency::infer(&weekly), Err(SamplingError::Irregular { days: 7.0 }));
        let repeated = vec![ymd(2000, 1, 1); 3];
        assert_eq!(Frequency::infer(&repeated), Err(SamplingError::Irregular { days: 0.0 }));
    }
}
