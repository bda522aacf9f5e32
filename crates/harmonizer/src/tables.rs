//! Name, descriptor and unit tables loaded from configuration.
//!
//! Supporting a new provider means adding rows here, never touching the
//! harmonizer logic.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use clim_common::{PipelineError, PipelineResult, VariableDescriptor};

use crate::units::{CustomUnit, UnitTable};

/// Wildcard provider pattern.
pub const ANY_PROVIDER: &str = "*";

/// One row of the name table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMapping {
    /// Exact provider name or `*`.
    #[serde(default = "any_provider")]
    pub provider: String,
    pub native_name: String,
    pub canonical_name: String,
    /// Unit to assume instead of the one the provider declares.
    #[serde(default)]
    pub native_unit: Option<String>,
}

fn any_provider() -> String {
    ANY_PROVIDER.to_string()
}

/// Enables one correction rule for a provider pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSelection {
    #[serde(default = "any_provider")]
    pub provider: String,
    pub symptom: String,
}

/// On-disk layout of the tables file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TablesFile {
    pub descriptors: Vec<VariableDescriptor>,
    #[serde(default)]
    pub names: Vec<NameMapping>,
    #[serde(default)]
    pub units: Vec<CustomUnit>,
    /// Correction rules to enable. Empty means every registered rule for
    /// every provider.
    #[serde(default)]
    pub corrections: Vec<RuleSelection>,
}

/// Validated lookup tables.
#[derive(Debug, Clone)]
pub struct Tables {
    descriptors: HashMap<String, VariableDescriptor>,
    names: HashMap<(String, String), NameMapping>,
    units: UnitTable,
    corrections: Vec<RuleSelection>,
}

impl Tables {
    /// Load and validate a tables YAML file.
    pub fn from_path(path: &Path) -> PipelineResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Cannot read tables {:?}: {}", path, e))
        })?;
        Self::from_yaml_str(&contents).map_err(|e| match e {
            PipelineError::Config(msg) => PipelineError::Config(format!("{:?}: {}", path, msg)),
            other => other,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> PipelineResult<Self> {
        let file: TablesFile = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Config(format!("Invalid tables YAML: {}", e)))?;
        Self::from_file(file)
    }

    /// Build tables from parsed rows, rejecting duplicates and dangling names.
    pub fn from_file(file: TablesFile) -> PipelineResult<Self> {
        let units = UnitTable::new().with_custom(&file.units);

        let mut descriptors = HashMap::new();
        for desc in file.descriptors {
            if !units.is_known(&desc.canonical_unit) {
                return Err(PipelineError::Config(format!(
                    "Descriptor '{}' uses unknown unit '{}'",
                    desc.canonical_name, desc.canonical_unit
                )));
            }
            let name = desc.canonical_name.clone();
            if descriptors.insert(name.clone(), desc).is_some() {
                return Err(PipelineError::Config(format!(
                    "Duplicate canonical name '{}'",
                    name
                )));
            }
        }

        let mut names = HashMap::new();
        for mapping in file.names {
            if !descriptors.contains_key(&mapping.canonical_name) {
                return Err(PipelineError::Config(format!(
                    "Name mapping {}:{} targets unknown canonical name '{}'",
                    mapping.provider, mapping.native_name, mapping.canonical_name
                )));
            }
            let key = (mapping.provider.clone(), mapping.native_name.clone());
            if names.insert(key, mapping.clone()).is_some() {
                return Err(PipelineError::Config(format!(
                    "Duplicate name mapping {}:{}",
                    mapping.provider, mapping.native_name
                )));
            }
        }

        debug!(
            descriptors = descriptors.len(),
            names = names.len(),
            "Loaded harmonization tables"
        );

        Ok(Self {
            descriptors,
            names,
            units,
            corrections: file.corrections,
        })
    }

    /// Mapping for a native name, provider-specific rows first.
    pub fn resolve(&self, provider: &str, native_name: &str) -> Option<&NameMapping> {
        self.names
            .get(&(provider.to_string(), native_name.to_string()))
            .or_else(|| {
                self.names
                    .get(&(ANY_PROVIDER.to_string(), native_name.to_string()))
            })
    }

    pub fn descriptor(&self, canonical_name: &str) -> Option<&VariableDescriptor> {
        self.descriptors.get(canonical_name)
    }

    /// Native names a provider may publish a canonical variable under.
    pub fn native_names(&self, provider: &str, canonical_name: &str) -> Vec<String> {
        let mut specific: Vec<String> = Vec::new();
        let mut generic: Vec<String> = Vec::new();
        for ((p, native), mapping) in &self.names {
            if mapping.canonical_name != canonical_name {
                continue;
            }
            if p == provider {
                specific.push(native.clone());
            } else if p == ANY_PROVIDER {
                generic.push(native.clone());
            }
        }
        specific.sort();
        generic.sort();
        // A provider-specific row shadows a wildcard row for the same native name.
        generic.retain(|n| {
            !specific.contains(n)
                && self.resolve(provider, n).map(|m| m.canonical_name.as_str())
                    == Some(canonical_name)
        });
        specific.extend(generic);
        specific
    }

    pub fn units(&self) -> &UnitTable {
        &self.units
    }

    pub fn corrections(&self) -> &[RuleSelection] {
        &self.corrections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLES: &str = r#"
descriptors:
  - canonical_name: tas
    canonical_unit: K
    long_name: Near-surface air temperature
  - canonical_name: pr
    canonical_unit: kg m-2 s-1
names:
  - native_name: tas
    canonical_name: tas
  - provider: era5
    native_name: t2m
    canonical_name: tas
  - provider: era5
    native_name: tp
    canonical_name: pr
    native_unit: m day-1
  - provider: eerie
    native_name: mean2t
    canonical_name: tas
"#;

    #[test]
    fn test_resolve_prefers_provider_rows() {
        let tables = Tables::from_yaml_str(TABLES).unwrap();
        assert_eq!(tables.resolve("era5", "t2m").unwrap().canonical_name, "tas");
        assert_eq!(tables.resolve("anything", "tas").unwrap().canonical_name, "tas");
        assert!(tables.resolve("anything", "t2m").is_none());
        assert_eq!(
            tables.resolve("era5", "tp").unwrap().native_unit.as_deref(),
            Some("m day-1")
        );
    }

    #[test]
    fn test_native_names_for_provider() {
        let tables = Tables::from_yaml_str(TABLES).unwrap();
        assert_eq!(tables.native_names("era5", "tas"), vec!["t2m", "tas"]);
        assert_eq!(tables.native_names("eerie", "tas"), vec!["mean2t", "tas"]);
        assert_eq!(tables.native_names("other", "tas"), vec!["tas"]);
        assert!(tables.native_names("other", "pr").is_empty());
    }

    #[test]
    fn test_duplicate_canonical_name_rejected() {
        let yaml = r#"
descriptors:
  - {canonical_name: tas, canonical_unit: K}
  - {canonical_name: tas, canonical_unit: degC}
"#;
        let err = Tables::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate canonical name"));
    }

    #[test]
    fn test_dangling_mapping_rejected() {
        let yaml = r#"
descriptors:
  - {canonical_name: tas, canonical_unit: K}
names:
  - {native_name: pr, canonical_name: pr}
"#;
        assert!(Tables::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_canonical_unit_rejected() {
        let yaml = r#"
descriptors:
  - {canonical_name: tas, canonical_unit: furlongs}
"#;
        assert!(Tables::from_yaml_str(yaml).is_err());
    }
}
