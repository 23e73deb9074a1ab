//! Module contract, typed settings, step context, and the module registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use enrich_types::{AttributeId, EnrichError, EntityId, Inputs, Result, StepOutcome};

use crate::modules::{
    ArithmeticModule, ArithmeticSettings, AttributeSourceModule, AttributeSourceSettings,
    CommandModule, CommandSettings, StaticSourceModule, StaticSourceSettings, TemplateModule,
    TemplateSettings, ValueMapModule, ValueMapSettings,
};
use crate::store::AttributeStore;

/// Input key under which the prior step's value is visible to the next step.
pub const PREVIOUS_VALUE_KEY: &str = "_previous_value";

// ---------------------------------------------------------------------------
// Module kinds and settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Source,
    Processor,
}

/// Per-type module configuration, decoded by the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleSettings {
    AttributeSource(AttributeSourceSettings),
    StaticSource(StaticSourceSettings),
    Arithmetic(ArithmeticSettings),
    Template(TemplateSettings),
    ValueMap(ValueMapSettings),
    Command(CommandSettings),
}

impl ModuleSettings {
    /// The registry key of the module these settings belong to.
    pub fn module_type(&self) -> &'static str {
        match self {
            ModuleSettings::AttributeSource(_) => "attribute_source",
            ModuleSettings::StaticSource(_) => "static_source",
            ModuleSettings::Arithmetic(_) => "arithmetic",
            ModuleSettings::Template(_) => "template",
            ModuleSettings::ValueMap(_) => "value_map",
            ModuleSettings::Command(_) => "command",
        }
    }
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInstance {
    pub order: u32,
    pub settings: ModuleSettings,
}

/// Error for a module handed settings of another type.
pub(crate) fn settings_mismatch(expected: &str, got: &ModuleSettings) -> EnrichError {
    EnrichError::Validation {
        module: expected.to_string(),
        message: format!("received settings for '{}'", got.module_type()),
    }
}

// ---------------------------------------------------------------------------
// StepContext — immutable per-step view threaded through the chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StepContext {
    entity_id: EntityId,
    target_attribute: AttributeId,
    inputs: Arc<Inputs>,
    settings: ModuleSettings,
    previous_value: Option<serde_json::Value>,
}

impl StepContext {
    /// Context for the first processor of a chain.
    pub fn new(
        entity_id: impl Into<String>,
        target_attribute: impl Into<String>,
        inputs: Arc<Inputs>,
        settings: ModuleSettings,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            target_attribute: target_attribute.into(),
            inputs,
            settings,
            previous_value: None,
        }
    }

    /// Copy of this context for the next step, carrying `previous_value` forward.
    pub fn next_step(&self, settings: ModuleSettings, previous_value: Option<serde_json::Value>) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            target_attribute: self.target_attribute.clone(),
            inputs: Arc::clone(&self.inputs),
            settings,
            previous_value,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn target_attribute(&self) -> &str {
        &self.target_attribute
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    pub fn previous_value(&self) -> Option<&serde_json::Value> {
        self.previous_value.as_ref()
    }

    /// Look up an input by key; `_previous_value` resolves to the prior step's output.
    pub fn lookup(&self, key: &str) -> Option<&serde_json::Value> {
        if key == PREVIOUS_VALUE_KEY {
            self.previous_value.as_ref()
        } else {
            self.inputs.get(key)
        }
    }

    /// JSON document describing this step, handed to external processors.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "entity_id": self.entity_id,
            "target_attribute": self.target_attribute,
            "inputs": &*self.inputs,
            "_previous_value": self.previous_value,
        })
    }
}

// ---------------------------------------------------------------------------
// PipelineModule trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PipelineModule: Send + Sync {
    /// The registry key (e.g. "attribute_source", "arithmetic").
    fn module_type(&self) -> &str;

    fn kind(&self) -> ModuleKind;

    /// Check settings against this module's own rules.
    fn validate_settings(&self, settings: &ModuleSettings) -> Result<()>;

    /// Attribute ids this module reads.
    fn input_attributes(&self, settings: &ModuleSettings) -> BTreeSet<AttributeId>;

    /// Load flat inputs for every entity. Only source modules implement this.
    async fn load_inputs(
        &self,
        _settings: &ModuleSettings,
        _entity_ids: &[EntityId],
        _store: &AttributeStore,
    ) -> Result<HashMap<EntityId, Inputs>> {
        Err(EnrichError::Other(format!(
            "module '{}' is not a source",
            self.module_type()
        )))
    }

    /// Transform a value for one entity. Only processor modules implement this.
    async fn process(&self, _context: &StepContext) -> Result<StepOutcome> {
        Ok(StepOutcome::error(format!(
            "module '{}' is not a processor",
            self.module_type()
        )))
    }
}

// ---------------------------------------------------------------------------
// DynModule — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynModule(Box<dyn PipelineModule>);

impl DynModule {
    pub fn new(module: impl PipelineModule + 'static) -> Self {
        Self(Box::new(module))
    }

    pub fn module_type(&self) -> &str {
        self.0.module_type()
    }

    pub fn kind(&self) -> ModuleKind {
        self.0.kind()
    }

    pub fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        self.0.validate_settings(settings)
    }

    pub fn input_attributes(&self, settings: &ModuleSettings) -> BTreeSet<AttributeId> {
        self.0.input_attributes(settings)
    }

    pub async fn load_inputs(
        &self,
        settings: &ModuleSettings,
        entity_ids: &[EntityId],
        store: &AttributeStore,
    ) -> Result<HashMap<EntityId, Inputs>> {
        self.0.load_inputs(settings, entity_ids, store).await
    }

    pub async fn process(&self, context: &StepContext) -> Result<StepOutcome> {
        self.0.process(context).await
    }
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

pub struct ModuleRegistry {
    modules: HashMap<String, DynModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    pub fn register(&mut self, module: impl PipelineModule + 'static) {
        let t = module.module_type().to_string();
        self.modules.insert(t, DynModule::new(module));
    }

    pub fn get(&self, module_type: &str) -> Option<&DynModule> {
        self.modules.get(module_type)
    }

    pub fn has(&self, module_type: &str) -> bool {
        self.modules.contains_key(module_type)
    }

    /// Registered module types in ascending order.
    pub fn module_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.modules.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Resolve the module implementing `settings`.
    pub fn resolve(&self, settings: &ModuleSettings) -> Result<&DynModule> {
        let module_type = settings.module_type();
        self.get(module_type)
            .ok_or_else(|| EnrichError::UnknownModule {
                module_type: module_type.to_string(),
            })
    }

    /// Resolve and validate one module instance.
    pub fn validate(&self, instance: &ModuleInstance) -> Result<&DynModule> {
        let module = self.resolve(&instance.settings)?;
        module.validate_settings(&instance.settings)?;
        Ok(module)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

pub fn default_registry() -> ModuleRegistry {
    let mut reg = ModuleRegistry::new();
    reg.register(AttributeSourceModule);
    reg.register(StaticSourceModule);
    reg.register(ArithmeticModule);
    reg.register(TemplateModule);
    reg.register(ValueMapModule);
    reg.register(CommandModule);
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
