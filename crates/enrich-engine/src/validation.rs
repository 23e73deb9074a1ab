//! Catalog validation: lint rules and diagnostics.
//!
//! Checks module settings, chain structure, target attributes, and the
//! cross-pipeline dependency graph of a [`Catalog`]. Call [`validate`] for all
//! diagnostics or [`validate_or_raise`] to fail on the first `Error`-severity
//! issue.

use std::collections::{BTreeMap, BTreeSet};

use enrich_types::{EnrichError, Result};

use crate::module::ModuleRegistry;
use crate::pipeline::{Catalog, Pipeline};
use crate::resolver::DependencyResolver;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub pipeline_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{level}[{}]", self.rule)?;
        if let Some(p) = &self.pipeline_id {
            write!(f, " {p}")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(fix) = &self.fix {
            write!(f, " (fix: {fix})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, catalog: &Catalog, registry: &ModuleRegistry) -> Vec<Diagnostic>;
}

fn diagnostic(
    rule: &dyn LintRule,
    severity: Severity,
    pipeline: Option<&Pipeline>,
    message: String,
    fix: Option<&str>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        pipeline_id: pipeline.map(|p| p.id.clone()),
        fix: fix.map(String::from),
    }
}

// ---------------------------------------------------------------------------
// Built-in rules
// ---------------------------------------------------------------------------

struct ModuleSettingsRule;
impl LintRule for ModuleSettingsRule {
    fn name(&self) -> &str { "module_settings" }
    fn apply(&self, catalog: &Catalog, registry: &ModuleRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in &catalog.pipelines {
            for instance in &pipeline.modules {
                if let Err(e) = registry.validate(instance) {
                    diags.push(diagnostic(
                        self,
                        Severity::Error,
                        Some(pipeline),
                        format!("module at order {}: {e}", instance.order),
                        None,
                    ));
                }
            }
        }
        diags
    }
}

struct ChainStructureRule;
impl LintRule for ChainStructureRule {
    fn name(&self) -> &str { "chain_structure" }
    fn apply(&self, catalog: &Catalog, registry: &ModuleRegistry) -> Vec<Diagnostic> {
        catalog
            .pipelines
            .iter()
            .filter_map(|pipeline| match pipeline.resolve_chain(registry) {
                Err(e @ EnrichError::Structural { .. }) => Some(diagnostic(
                    self,
                    Severity::Error,
                    Some(pipeline),
                    e.to_string(),
                    Some("start with one source module followed by at least one processor"),
                )),
                _ => None,
            })
            .collect()
    }
}

struct TargetAttributeRule;
impl LintRule for TargetAttributeRule {
    fn name(&self) -> &str { "target_attribute" }
    fn apply(&self, catalog: &Catalog, _registry: &ModuleRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in &catalog.pipelines {
            match catalog.attribute(&pipeline.target_attribute) {
                None => diags.push(diagnostic(
                    self,
                    Severity::Error,
                    Some(pipeline),
                    format!("target attribute '{}' is not declared", pipeline.target_attribute),
                    Some("declare the attribute in the catalog's attributes list"),
                )),
                Some(attr) if attr.entity_type != pipeline.entity_type => diags.push(diagnostic(
                    self,
                    Severity::Warning,
                    Some(pipeline),
                    format!(
                        "target attribute '{}' belongs to entity type '{}', pipeline runs on '{}'",
                        attr.id, attr.entity_type, pipeline.entity_type
                    ),
                    None,
                )),
                Some(_) => {}
            }
        }
        diags
    }
}

struct DuplicateTargetRule;
impl LintRule for DuplicateTargetRule {
    fn name(&self) -> &str { "duplicate_target" }
    fn apply(&self, catalog: &Catalog, _registry: &ModuleRegistry) -> Vec<Diagnostic> {
        let mut owners: BTreeMap<(&str, &str), &Pipeline> = BTreeMap::new();
        let mut diags = Vec::new();
        for pipeline in catalog.pipelines.iter().filter(|p| p.active) {
            let key = (pipeline.entity_type.as_str(), pipeline.target_attribute.as_str());
            if let Some(first) = owners.get(&key) {
                diags.push(diagnostic(
                    self,
                    Severity::Error,
                    Some(pipeline),
                    format!(
                        "attribute '{}' is already computed by pipeline '{}'",
                        pipeline.target_attribute, first.id
                    ),
                    Some("deactivate one of the pipelines"),
                ));
            } else {
                owners.insert(key, pipeline);
            }
        }
        diags
    }
}

struct DependencyCycleRule;
impl LintRule for DependencyCycleRule {
    fn name(&self) -> &str { "dependency_cycle" }
    fn apply(&self, catalog: &Catalog, registry: &ModuleRegistry) -> Vec<Diagnostic> {
        let resolver = DependencyResolver::new(catalog, registry);
        let entity_types: BTreeSet<&str> = catalog
            .pipelines
            .iter()
            .filter(|p| p.active)
            .map(|p| p.entity_type.as_str())
            .collect();
        entity_types
            .into_iter()
            .filter_map(|entity_type| {
                resolver.compute_execution_order(entity_type).err().map(|e| {
                    diagnostic(
                        self,
                        Severity::Error,
                        None,
                        format!("entity type '{entity_type}': {e}"),
                        Some("remove one of the inputs that closes the loop"),
                    )
                })
            })
            .collect()
    }
}

struct UndeclaredInputRule;
impl LintRule for UndeclaredInputRule {
    fn name(&self) -> &str { "undeclared_input" }
    fn apply(&self, catalog: &Catalog, registry: &ModuleRegistry) -> Vec<Diagnostic> {
        let known: BTreeSet<&str> = catalog
            .attributes
            .iter()
            .map(|a| a.id.as_str())
            .chain(catalog.entities.iter().flat_map(|e| e.values.keys().map(String::as_str)))
            .collect();
        let mut diags = Vec::new();
        for pipeline in &catalog.pipelines {
            for dependency in pipeline.dependencies(registry) {
                if !known.contains(dependency.as_str()) {
                    diags.push(diagnostic(
                        self,
                        Severity::Warning,
                        Some(pipeline),
                        format!("input '{dependency}' is neither declared nor present on any entity"),
                        None,
                    ));
                }
            }
        }
        diags
    }
}

struct FilterOperatorRule;
impl LintRule for FilterOperatorRule {
    fn name(&self) -> &str { "filter_operator" }
    fn apply(&self, catalog: &Catalog, _registry: &ModuleRegistry) -> Vec<Diagnostic> {
        catalog
            .pipelines
            .iter()
            .filter_map(|pipeline| {
                let filter = pipeline.filter.as_ref()?;
                filter.operator().is_none().then(|| {
                    diagnostic(
                        self,
                        Severity::Warning,
                        Some(pipeline),
                        format!("unknown filter operator '{}'; filter will not apply", filter.operator),
                        Some("use one of = != > >= < <= in not_in null not_null contains"),
                    )
                })
            })
            .collect()
    }
}

struct EvalReferenceRule;
impl LintRule for EvalReferenceRule {
    fn name(&self) -> &str { "eval_reference" }
    fn apply(&self, catalog: &Catalog, _registry: &ModuleRegistry) -> Vec<Diagnostic> {
        catalog
            .evals
            .iter()
            .filter(|e| catalog.pipeline(&e.pipeline_id).is_none())
            .map(|e| {
                diagnostic(
                    self,
                    Severity::Warning,
                    None,
                    format!("eval '{}' references unknown pipeline '{}'", e.id, e.pipeline_id),
                    None,
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(catalog: &Catalog, registry: &ModuleRegistry) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(ModuleSettingsRule),
        Box::new(ChainStructureRule),
        Box::new(TargetAttributeRule),
        Box::new(DuplicateTargetRule),
        Box::new(DependencyCycleRule),
        Box::new(UndeclaredInputRule),
        Box::new(FilterOperatorRule),
        Box::new(EvalReferenceRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(catalog, registry));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(catalog: &Catalog, registry: &ModuleRegistry) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(catalog, registry);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(EnrichError::Other(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::default_registry;
    use serde_json::json;

    fn catalog(pipelines: serde_json::Value) -> Catalog {
        Catalog::from_json(
            &json!({
                "attributes": [
                    {"id": "price", "name": "Price", "entity_type": "product"},
                    {"id": "cost", "name": "Cost", "entity_type": "product"},
                    {"id": "margin", "name": "Margin", "entity_type": "product"},
                    {"id": "band", "name": "Band", "entity_type": "product"}
                ],
                "pipelines": pipelines
            })
            .to_string(),
        )
        .unwrap()
    }

    fn pipeline(id: &str, target: &str, inputs: &[&str]) -> serde_json::Value {
        json!({
            "id": id,
            "entity_type": "product",
            "target_attribute": target,
            "modules": [
                {"order": 1, "settings": {"type": "attribute_source", "attributes": inputs}},
                {"order": 2, "settings": {"type": "template", "template": "{{price}}"}}
            ]
        })
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn valid_catalog_passes() {
        let cat = catalog(json!([
            pipeline("margin", "margin", &["price", "cost"]),
            pipeline("band", "band", &["margin"])
        ]));
        let diags = validate(&cat, &default_registry());
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        assert!(validate_or_raise(&cat, &default_registry()).is_ok());
    }

    #[test]
    fn cycle_is_an_error() {
        let cat = catalog(json!([
            pipeline("margin", "margin", &["band"]),
            pipeline("band", "band", &["margin"])
        ]));
        let diags = validate(&cat, &default_registry());
        assert_eq!(rules_hit(&diags), vec!["dependency_cycle"]);
        assert!(diags[0].message.contains("band"));
        assert!(diags[0].message.contains("margin"));
        assert!(validate_or_raise(&cat, &default_registry()).is_err());
    }

    #[test]
    fn structure_settings_and_targets() {
        let cat = catalog(json!([
            {
                "id": "broken",
                "entity_type": "product",
                "target_attribute": "undeclared",
                "modules": [{"order": 1, "settings": {"type": "attribute_source", "attributes": []}}]
            }
        ]));
        let diags = validate(&cat, &default_registry());
        let rules = rules_hit(&diags);
        assert!(rules.contains(&"module_settings"));
        assert!(rules.contains(&"target_attribute"));
        assert!(diags.iter().all(|d| d.pipeline_id.as_deref() == Some("broken")));
    }

    #[test]
    fn missing_processor_is_structural() {
        let cat = catalog(json!([{
            "id": "lonely",
            "entity_type": "product",
            "target_attribute": "margin",
            "modules": [{"order": 1, "settings": {"type": "attribute_source", "attributes": ["price"]}}]
        }]));
        let diags = validate(&cat, &default_registry());
        assert_eq!(rules_hit(&diags), vec!["chain_structure"]);
        assert!(diags[0].to_string().starts_with("error[chain_structure] lonely:"));
    }

    #[test]
    fn duplicate_targets_and_warnings() {
        let mut cat = catalog(json!([
            pipeline("m1", "margin", &["price", "weight"]),
            pipeline("m2", "margin", &["price"])
        ]));
        cat.pipelines[1].filter = Some(crate::filter::EntityFilter {
            attribute: "price".into(),
            operator: "like".into(),
            value: json!("x"),
        });
        let diags = validate(&cat, &default_registry());
        let rules = rules_hit(&diags);
        assert!(rules.contains(&"duplicate_target"));
        assert!(rules.contains(&"undeclared_input"));
        assert!(rules.contains(&"filter_operator"));
        let warnings = diags.iter().filter(|d| d.severity == Severity::Warning).count();
        assert_eq!(warnings, 2);
    }
}
