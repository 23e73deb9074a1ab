use std::collections::BTreeSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use enrich_types::{AttributeId, EnrichError, Result, StepOutcome};

use super::as_text;
use crate::module::{
    settings_mismatch, ModuleKind, ModuleSettings, PipelineModule, StepContext, PREVIOUS_VALUE_KEY,
};

// ---------------------------------------------------------------------------
// TemplateModule — renders `{{key}}` placeholders (processor)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSettings {
    pub template: String,
    /// Skip the entity instead of failing when a placeholder has no value.
    #[serde(default)]
    pub skip_if_missing: bool,
}

pub struct TemplateModule;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap())
}

/// Placeholder keys in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for cap in placeholder_regex().captures_iter(template) {
        let key = cap[1].to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Substitute every placeholder using `lookup`; returns the missing keys on failure.
pub fn render<'a>(
    template: &str,
    lookup: impl Fn(&str) -> Option<&'a serde_json::Value>,
) -> std::result::Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let rendered = placeholder_regex().replace_all(template, |cap: &regex::Captures<'_>| {
        match lookup(&cap[1]).filter(|v| !v.is_null()) {
            Some(value) => as_text(value),
            None => {
                if !missing.iter().any(|m| m == &cap[1]) {
                    missing.push(cap[1].to_string());
                }
                String::new()
            }
        }
    });
    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(missing)
    }
}

impl TemplateModule {
    fn settings<'a>(&self, settings: &'a ModuleSettings) -> Result<&'a TemplateSettings> {
        match settings {
            ModuleSettings::Template(s) => Ok(s),
            other => Err(settings_mismatch(self.module_type(), other)),
        }
    }
}

#[async_trait]
impl PipelineModule for TemplateModule {
    fn module_type(&self) -> &str {
        "template"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Processor
    }

    fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        let s = self.settings(settings)?;
        if s.template.trim().is_empty() {
            return Err(EnrichError::Validation {
                module: self.module_type().to_string(),
                message: "template is empty".into(),
            });
        }
        let opens = s.template.matches("{{").count();
        if opens != placeholder_regex().find_iter(&s.template).count() {
            return Err(EnrichError::Validation {
                module: self.module_type().to_string(),
                message: format!("template '{}' has a malformed placeholder", s.template),
            });
        }
        Ok(())
    }

    fn input_attributes(&self, settings: &ModuleSettings) -> BTreeSet<AttributeId> {
        self.settings(settings)
            .map(|s| {
                placeholders(&s.template)
                    .into_iter()
                    .filter(|k| k != PREVIOUS_VALUE_KEY)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn process(&self, context: &StepContext) -> Result<StepOutcome> {
        let s = self.settings(context.settings())?;
        match render(&s.template, |key| context.lookup(key)) {
            Ok(text) => Ok(StepOutcome::ok(serde_json::Value::String(text)).with_confidence(1.0)),
            Err(missing) => {
                let reason = format!("missing template values: {}", missing.join(", "));
                if s.skip_if_missing {
                    Ok(StepOutcome::skipped(reason))
                } else {
                    Ok(StepOutcome::error(reason))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tests::make_context;
    use enrich_types::StepStatus;
    use serde_json::json;

    fn settings(template: &str, skip_if_missing: bool) -> ModuleSettings {
        ModuleSettings::Template(TemplateSettings {
            template: template.to_string(),
            skip_if_missing,
        })
    }

    #[test]
    fn placeholders_are_deduplicated_in_order() {
        assert_eq!(
            placeholders("{{brand}} {{ name }} by {{brand}}"),
            vec!["brand".to_string(), "name".to_string()]
        );
    }

    #[tokio::test]
    async fn renders_inputs_and_previous_value() {
        let ctx = make_context(
            settings("{{brand}} {{name}} ({{_previous_value}})", false),
            &[("brand", json!("Acme")), ("name", json!("Anvil"))],
            Some(json!(40)),
        );
        let outcome = TemplateModule.process(&ctx).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Ok);
        assert_eq!(outcome.value, Some(json!("Acme Anvil (40)")));
    }

    #[tokio::test]
    async fn missing_value_errors_or_skips() {
        let ctx = make_context(settings("{{brand}}", false), &[("brand", json!(null))], None);
        let outcome = TemplateModule.process(&ctx).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Error);
        assert!(outcome.error_message().contains("brand"));

        let ctx = make_context(settings("{{brand}}", true), &[], None);
        let outcome = TemplateModule.process(&ctx).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Skipped);
    }

    #[test]
    fn input_attributes_exclude_previous_value() {
        let attrs = TemplateModule.input_attributes(&settings("{{title}} {{_previous_value}}", false));
        assert_eq!(attrs.into_iter().collect::<Vec<_>>(), vec!["title".to_string()]);
    }

    #[test]
    fn validate_rejects_empty_and_malformed() {
        assert!(TemplateModule.validate_settings(&settings("  ", false)).is_err());
        assert!(TemplateModule.validate_settings(&settings("{{ bad key }}", false)).is_err());
        assert!(TemplateModule.validate_settings(&settings("Hello {{name}}", false)).is_ok());
    }
}
