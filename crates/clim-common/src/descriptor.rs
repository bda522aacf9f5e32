//! Canonical identity of a physical quantity.

use serde::{Deserialize, Serialize};

/// Names of the coordinate dimensions a variable is laid out on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionRoles {
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default)]
    pub vertical: Option<String>,
    #[serde(default = "default_lat")]
    pub lat: String,
    #[serde(default = "default_lon")]
    pub lon: String,
}

fn default_time() -> String {
    "time".to_string()
}

fn default_lat() -> String {
    "lat".to_string()
}

fn default_lon() -> String {
    "lon".to_string()
}

impl Default for DimensionRoles {
    fn default() -> Self {
        Self {
            time: default_time(),
            vertical: None,
            lat: default_lat(),
            lon: default_lon(),
        }
    }
}

/// Canonical variable description.
///
/// `canonical_name` is unique across the pipeline; the descriptor table
/// rejects duplicates when it is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub canonical_name: String,
    pub canonical_unit: String,
    #[serde(default)]
    pub standard_name: Option<String>,
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(default)]
    pub dimension_roles: DimensionRoles,
}

impl VariableDescriptor {
    pub fn new(canonical_name: impl Into<String>, canonical_unit: impl Into<String>) -> Self {
        Self {
            canonical_name: canonical_name.into(),
            canonical_unit: canonical_unit.into(),
            standard_name: None,
            long_name: None,
            dimension_roles: DimensionRoles::default(),
        }
    }

    pub fn with_names(
        mut self,
        standard_name: impl Into<String>,
        long_name: impl Into<String>,
    ) -> Self {
        self.standard_name = Some(standard_name.into());
        self.long_name = Some(long_name.into());
        self
    }

    /// Long name, falling back to the canonical name.
    pub fn display_name(&self) -> &str {
        self.long_name.as_deref().unwrap_or(&self.canonical_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_yaml_defaults() {
        let json = r#"{"canonical_name": "tas", "canonical_unit": "K"}"#;
        let desc: VariableDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.dimension_roles.time, "time");
        assert_eq!(desc.dimension_roles.lat, "lat");
        assert!(desc.dimension_roles.vertical.is_none());
        assert_eq!(desc.display_name(), "tas");
    }
}
