use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use enrich_types::{AttributeId, EnrichError, Result, StepOutcome};

use super::as_text;
use crate::module::{settings_mismatch, ModuleKind, ModuleSettings, PipelineModule, StepContext};

// ---------------------------------------------------------------------------
// ValueMapModule — lookup-table translation (processor)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueMapSettings {
    pub mapping: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub case_insensitive: bool,
    /// Input key to translate. When unset the previous step's value is used.
    #[serde(default)]
    pub input: Option<String>,
}

pub struct ValueMapModule;

impl ValueMapModule {
    fn settings<'a>(&self, settings: &'a ModuleSettings) -> Result<&'a ValueMapSettings> {
        match settings {
            ModuleSettings::ValueMap(s) => Ok(s),
            other => Err(settings_mismatch(self.module_type(), other)),
        }
    }
}

fn lookup<'a>(s: &'a ValueMapSettings, key: &str) -> Option<&'a serde_json::Value> {
    if s.case_insensitive {
        s.mapping
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    } else {
        s.mapping.get(key)
    }
}

#[async_trait]
impl PipelineModule for ValueMapModule {
    fn module_type(&self) -> &str {
        "value_map"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Processor
    }

    fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        let s = self.settings(settings)?;
        if s.mapping.is_empty() {
            return Err(EnrichError::Validation {
                module: self.module_type().to_string(),
                message: "mapping must contain at least one entry".into(),
            });
        }
        Ok(())
    }

    fn input_attributes(&self, settings: &ModuleSettings) -> BTreeSet<AttributeId> {
        self.settings(settings)
            .ok()
            .and_then(|s| s.input.clone())
            .into_iter()
            .collect()
    }

    async fn process(&self, context: &StepContext) -> Result<StepOutcome> {
        let s = self.settings(context.settings())?;
        let source = match &s.input {
            Some(key) => context.lookup(key),
            None => context.previous_value(),
        };
        let Some(source) = source.filter(|v| !v.is_null()) else {
            return Ok(StepOutcome::skipped("no value to map"));
        };

        let key = as_text(source);
        match lookup(s, key.trim()).or(s.default.as_ref()) {
            Some(mapped) => Ok(StepOutcome::ok(mapped.clone())
                .with_confidence(1.0)
                .with_justification(format!("mapped '{key}'"))),
            None => Ok(StepOutcome::skipped(format!("no mapping for '{key}'"))),
        }
    }
}
