//! Registry of encoding-anomaly corrections.
//!
//! Each rule targets one named symptom and is keyed by a provider pattern.
//! Rules must be idempotent: running a rule on data it already fixed changes
//! nothing and returns `None`, so nothing is logged.

use chrono::NaiveDateTime;
use tracing::info;

use clim_common::{EncodingMetadata, Provenance};

use crate::tables::{RuleSelection, ANY_PROVIDER};

mod rules;

pub use rules::{
    DescendingLatitude, DuplicateTimestamps, FillValueMismatch, KelvinLabelledCelsius,
    Longitude0To360, MonthEndTimeLabel, PackedValues, RadianCoordinates,
};

/// A field mid-way through harmonization: decoded onto Gregorian
/// timestamps but not yet in canonical units.
///
/// `data` is `[time, lat, lon]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingField {
    pub provider: String,
    pub variable: String,
    pub unit: String,
    pub data: Vec<f64>,
    pub times: Vec<NaiveDateTime>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub encoding: EncodingMetadata,
    /// Timesteps removed as duplicates so far.
    pub dropped_timesteps: usize,
}

impl WorkingField {
    pub fn cells(&self) -> usize {
        self.lat.len() * self.lon.len()
    }

    pub fn n_times(&self) -> usize {
        self.times.len()
    }
}

/// A single named, idempotent fix.
pub trait CorrectionRule: Send + Sync {
    /// Symptom name recorded in the correction log.
    fn symptom(&self) -> &'static str;

    /// Fix the field in place. Returns a description when something changed.
    fn apply(&self, field: &mut WorkingField) -> Option<String>;
}

struct Registered {
    provider: String,
    rule: Box<dyn CorrectionRule>,
}

/// Ordered set of rules. Rules run in registration order.
#[derive(Default)]
pub struct CorrectionRegistry {
    rules: Vec<Registered>,
}

impl CorrectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in rules for every provider, in the order they must run.
    ///
    /// Fill values are compared against packed values, so fill detection
    /// precedes unpacking; coordinate fixes precede time fixes so that row
    /// reordering happens on a clean axis.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for rule in builtin_rules() {
            registry.register(ANY_PROVIDER, rule);
        }
        registry
    }

    /// Registry restricted to the given selections, keeping built-in order.
    /// An empty selection enables every rule for every provider.
    pub fn from_selections(selections: &[RuleSelection]) -> Result<Self, String> {
        if selections.is_empty() {
            return Ok(Self::with_defaults());
        }
        for sel in selections {
            if !builtin_rules().iter().any(|r| r.symptom() == sel.symptom) {
                return Err(format!("unknown correction symptom '{}'", sel.symptom));
            }
        }
        let mut registry = Self::new();
        for symptom in builtin_rules().iter().map(|r| r.symptom()) {
            for sel in selections.iter().filter(|s| s.symptom == symptom) {
                if let Some(rule) = rule_by_symptom(symptom) {
                    registry.register(&sel.provider, rule);
                }
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: &str, rule: Box<dyn CorrectionRule>) {
        self.rules.push(Registered {
            provider: provider.to_string(),
            rule,
        });
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn symptoms(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.rule.symptom()).collect()
    }

    /// Run every rule matching the field's provider, logging each change.
    pub fn apply_all(&self, field: &mut WorkingField, provenance: &mut Provenance) {
        for entry in &self.rules {
            if entry.provider != ANY_PROVIDER && entry.provider != field.provider {
                continue;
            }
            if let Some(description) = entry.rule.apply(field) {
                info!(
                    provider = %field.provider,
                    variable = %field.variable,
                    symptom = entry.rule.symptom(),
                    detail = %description,
                    "Applied correction"
                );
                provenance.record(entry.rule.symptom(), description);
            }
        }
    }
}

fn builtin_rules() -> Vec<Box<dyn CorrectionRule>> {
    vec![
        Box::new(FillValueMismatch),
        Box::new(PackedValues),
        Box::new(RadianCoordinates),
        Box::new(Longitude0To360),
        Box::new(DescendingLatitude),
        Box::new(KelvinLabelledCelsius),
        Box::new(DuplicateTimestamps),
        Box::new(MonthEndTimeLabel),
    ]
}

fn rule_by_symptom(symptom: &str) -> Option<Box<dyn CorrectionRule>> {
    builtin_rules().into_iter().find(|r| r.symptom() == symptom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn field(data: Vec<f64>, lat: Vec<f64>, lon: Vec<f64>) -> WorkingField {
        let cells = lat.len() * lon.len();
        let n = data.len() / cells.max(1);
        WorkingField {
            provider: "model".to_string(),
            variable: "tas".to_string(),
            unit: "K".to_string(),
            data,
            times: (0..n)
                .map(|i| {
                    NaiveDate::from_ymd_opt(2000, 1 + i as u32 % 12, 1)
                        .unwrap()
                        .and_hms_opt(0, 0, 0)
                        .unwrap()
                })
                .collect(),
            lat,
            lon,
            encoding: EncodingMetadata::default(),
            dropped_timesteps: 0,
        }
    }

    #[test]
    fn test_defaults_register_every_symptom() {
        let registry = CorrectionRegistry::with_defaults();
        let symptoms = registry.symptoms();
        for expected in [
            "fill_value_mismatch",
            "duplicate_timestamps",
            "month_end_time_label",
            "kelvin_labelled_celsius",
            "longitude_0_360",
            "radian_coordinates",
            "descending_latitude",
        ] {
            assert!(symptoms.contains(&expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_selection_restricts_provider() {
        let selections = vec![RuleSelection {
            provider: "era5".to_string(),
            symptom: "descending_latitude".to_string(),
        }];
        let registry = CorrectionRegistry::from_selections(&selections).unwrap();
        assert_eq!(registry.len(), 1);

        let mut f = field(vec![1.0, 2.0], vec![10.0, -10.0], vec![0.0]);
        let mut prov = Provenance::new("model");
        registry.apply_all(&mut f, &mut prov);
        assert!(prov.correction_log.is_empty());
        assert_eq!(f.lat, vec![10.0, -10.0]);

        f.provider = "era5".to_string();
        registry.apply_all(&mut f, &mut prov);
        assert_eq!(f.lat, vec![-10.0, 10.0]);
        assert_eq!(prov.correction_log.len(), 1);
        assert_eq!(prov.correction_log[0].symptom, "descending_latitude");
    }

    #[test]
    fn test_unknown_symptom_rejected() {
        let selections = vec![RuleSelection {
            provider: "*".to_string(),
            symptom: "cosmic_rays".to_string(),
        }];
        assert!(CorrectionRegistry::from_selections(&selections).is_err());
    }

    #[test]
    fn test_registry_pass_is_idempotent() {
        let registry = CorrectionRegistry::with_defaults();
        let mut f = field(
            vec![1e20, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            vec![1.0, -1.0],
            vec![90.0, 270.0],
        );
        f.encoding.fill_value = Some(1e20);
        let mut prov = Provenance::new("model");
        registry.apply_all(&mut f, &mut prov);
        let once = f.clone();
        let logged = prov.correction_log.len();
        assert!(logged >= 3);

        registry.apply_all(&mut f, &mut prov);
        assert_eq!(prov.correction_log.len(), logged);
        assert_eq!(f.lat, once.lat);
        assert_eq!(f.lon, once.lon);
        assert_eq!(f.times, once.times);
        assert_eq!(
            f.data.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            once.data.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }
}
