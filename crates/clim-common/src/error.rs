//! Error taxonomy for the product pipeline.

use thiserror::Error;

/// Result type alias using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// One (provider, variable, decade|region) unit. Skip it and continue.
    Unit,
    /// One consolidated store key. Retry or skip that key only.
    Key,
    /// Shared setup. No partial-success interpretation exists.
    Fatal,
}

/// Primary error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    // === Source errors ===
    #[error("source unavailable for provider '{provider}': {reason}")]
    SourceUnavailable { provider: String, reason: String },

    #[error("variable '{variable}' not found in provider '{provider}'")]
    VariableNotFound { provider: String, variable: String },

    // === Data-quality errors ===
    #[error("no canonical mapping for '{native_name}' from provider '{provider}'")]
    UnknownVariable { provider: String, native_name: String },

    #[error("unit '{native_unit}' is incompatible with canonical unit '{canonical_unit}' for '{variable}'")]
    IncompatibleUnit {
        variable: String,
        native_unit: String,
        canonical_unit: String,
    },

    #[error("insufficient data for '{variable}': {reason}")]
    InsufficientData { variable: String, reason: String },

    #[error("malformed field '{variable}': {reason}")]
    MalformedField { variable: String, reason: String },

    // === Store errors ===
    #[error("conflicting writes for store key '{key}': {reason}")]
    StoreWriteConflict { key: String, reason: String },

    #[error("failed to write store key '{key}': {reason}")]
    StoreWriteFailure { key: String, reason: String },

    #[error("failed to publish store key '{key}' after {attempts} attempt(s): {reason}")]
    StorePublishFailure {
        key: String,
        attempts: u32,
        reason: String,
    },

    // === Setup errors ===
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Scope at which this failure must be contained.
    pub fn scope(&self) -> ErrorScope {
        match self {
            PipelineError::SourceUnavailable { .. }
            | PipelineError::VariableNotFound { .. }
            | PipelineError::UnknownVariable { .. }
            | PipelineError::IncompatibleUnit { .. }
            | PipelineError::InsufficientData { .. }
            | PipelineError::MalformedField { .. } => ErrorScope::Unit,

            PipelineError::StoreWriteConflict { .. }
            | PipelineError::StoreWriteFailure { .. }
            | PipelineError::StorePublishFailure { .. } => ErrorScope::Key,

            PipelineError::Config(_) | PipelineError::Io(_) => ErrorScope::Fatal,
        }
    }

    /// Whether the caller may skip the affected unit or key and continue.
    pub fn is_recoverable(&self) -> bool {
        self.scope() != ErrorScope::Fatal
    }

    /// Short machine-readable name used in manifests and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::VariableNotFound { .. } => "variable_not_found",
            PipelineError::UnknownVariable { .. } => "unknown_variable",
            PipelineError::IncompatibleUnit { .. } => "incompatible_unit",
            PipelineError::InsufficientData { .. } => "insufficient_data",
            PipelineError::MalformedField { .. } => "malformed_field",
            PipelineError::StoreWriteConflict { .. } => "store_write_conflict",
            PipelineError::StoreWriteFailure { .. } => "store_write_failure",
            PipelineError::StorePublishFailure { .. } => "store_publish_failure",
            PipelineError::Config(_) => "config",
            PipelineError::Io(_) => "io",
        }
    }

    pub fn source_unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn insufficient_data(variable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            variable: variable.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(variable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedField {
            variable: variable.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes() {
        assert_eq!(
            PipelineError::source_unavailable("era5", "timeout").scope(),
            ErrorScope::Unit
        );
        assert_eq!(
            PipelineError::StorePublishFailure {
                key: "clim/tas".into(),
                attempts: 3,
                reason: "503".into()
            }
            .scope(),
            ErrorScope::Key
        );
        assert_eq!(PipelineError::Config("bad".into()).scope(), ErrorScope::Fatal);
        assert!(!PipelineError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_kind_names() {
        let err = PipelineError::IncompatibleUnit {
            variable: "rsds".into(),
            native_unit: "kg m-2 s-1".into(),
            canonical_unit: "W m-2".into(),
        };
        assert_eq!(err.kind(), "incompatible_unit");
        assert!(err.to_string().contains("kg m-2 s-1"));
    }
}
