//! In-memory source, used by tests and for pre-loaded fields.

use std::collections::BTreeMap;

use async_trait::async_trait;

use clim_common::{PipelineError, PipelineResult, RawField, TimeRange};

use crate::selection::{gather_rows, select_time_indices};
use crate::SourceAdapter;

pub struct MemorySource {
    provider: String,
    fields: BTreeMap<String, RawField>,
}

impl MemorySource {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Register a field under its native name.
    pub fn with_field(mut self, field: RawField) -> Self {
        self.fields.insert(field.native_name.clone(), field);
        self
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn list_variables(&self) -> PipelineResult<Vec<String>> {
        Ok(self.fields.keys().cloned().collect())
    }

    async fn fetch(&self, native_name: &str, range: &TimeRange) -> PipelineResult<RawField> {
        let field = self
            .fields
            .get(native_name)
            .ok_or_else(|| PipelineError::VariableNotFound {
                provider: self.provider.clone(),
                variable: native_name.to_string(),
            })?;
        field.validate_shape()?;

        let selected = select_time_indices(
            native_name,
            &field.coords.time,
            &field.coords.time_units,
            field.coords.calendar,
            range,
        )?;

        let mut out = field.clone();
        out.data = gather_rows(&field.data, field.cells_per_step(), &selected, 0);
        out.coords.time = selected.iter().map(|&i| field.coords.time[i]).collect();
        Ok(out)
    }
}
