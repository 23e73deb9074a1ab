//! Pipelines, entities and the catalog that declares them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use enrich_types::{Attribute, AttributeId, EnrichError, EntityId, Result};

use crate::config::EngineConfig;
use crate::evals::EvalRecord;
use crate::filter::EntityFilter;
use crate::module::{DynModule, ModuleInstance, ModuleKind, ModuleRegistry};
use crate::store::AttributeStore;

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

/// An ordered chain of modules computing one target attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub entity_type: String,
    pub target_attribute: AttributeId,
    /// Bumped whenever the configuration changes meaningfully.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    pub modules: Vec<ModuleInstance>,
    #[serde(default)]
    pub filter: Option<EntityFilter>,
}

/// A pipeline's modules resolved against a registry: one source, then processors.
pub struct ResolvedChain<'a> {
    pub source: (&'a DynModule, &'a ModuleInstance),
    pub processors: Vec<(&'a DynModule, &'a ModuleInstance)>,
}

impl Pipeline {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Modules sorted by ascending `order`; ties keep declaration order.
    pub fn ordered_modules(&self) -> Vec<&ModuleInstance> {
        let mut modules: Vec<_> = self.modules.iter().collect();
        modules.sort_by_key(|m| m.order);
        modules
    }

    /// Union of every module's declared input attributes.
    ///
    /// Modules missing from the registry contribute nothing.
    pub fn dependencies(&self, registry: &ModuleRegistry) -> BTreeSet<AttributeId> {
        self.modules
            .iter()
            .filter_map(|m| {
                registry
                    .get(m.settings.module_type())
                    .map(|module| module.input_attributes(&m.settings))
            })
            .flatten()
            .collect()
    }

    fn structural(&self, message: impl Into<String>) -> EnrichError {
        EnrichError::Structural {
            pipeline: self.id.clone(),
            message: message.into(),
        }
    }

    /// Resolve and validate the chain: a source first, then at least one
    /// processor, and nothing but processors after the source.
    pub fn resolve_chain<'a>(&'a self, registry: &'a ModuleRegistry) -> Result<ResolvedChain<'a>> {
        let ordered = self.ordered_modules();
        let Some((first, rest)) = ordered.split_first() else {
            return Err(self.structural("pipeline has no modules"));
        };

        let source = registry.validate(first)?;
        if source.kind() != ModuleKind::Source {
            return Err(self.structural(format!(
                "first module '{}' is not a source",
                source.module_type()
            )));
        }
        if rest.is_empty() {
            return Err(self.structural("no processor follows the source"));
        }

        let mut processors = Vec::with_capacity(rest.len());
        for instance in rest {
            let module = registry.validate(instance)?;
            if module.kind() != ModuleKind::Processor {
                return Err(self.structural(format!(
                    "module '{}' at order {} is not a processor",
                    module.module_type(),
                    instance.order
                )));
            }
            processors.push((module, *instance));
        }

        Ok(ResolvedChain {
            source: (source, *first),
            processors,
        })
    }
}

/// A catalog item with its raw attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub entity_type: String,
    #[serde(default)]
    pub values: BTreeMap<AttributeId, serde_json::Value>,
}

/// Everything the engine is configured with, loaded from one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub evals: Vec<EvalRecord>,
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let catalog = Self::from_json(&json)?;
        tracing::debug!(
            path = %path.display(),
            attributes = catalog.attributes.len(),
            pipelines = catalog.pipelines.len(),
            entities = catalog.entities.len(),
            "Catalog loaded"
        );
        Ok(catalog)
    }

    pub fn attribute(&self, id: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.id == id)
    }

    pub fn pipeline(&self, id: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    /// Active pipelines of an entity type, in declaration order.
    pub fn pipelines_for(&self, entity_type: &str) -> Vec<&Pipeline> {
        self.pipelines
            .iter()
            .filter(|p| p.active && p.entity_type == entity_type)
            .collect()
    }

    pub fn entity_ids(&self, entity_type: &str) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn evals_for(&self, pipeline_id: &str) -> Vec<&EvalRecord> {
        self.evals
            .iter()
            .filter(|e| e.pipeline_id == pipeline_id)
            .collect()
    }

    /// Import every entity's raw values into the store.
    pub async fn seed(&self, store: &AttributeStore) -> Result<usize> {
        let mut imported = 0;
        for entity in &self.entities {
            for (attribute_id, value) in &entity.values {
                store.import_value(&entity.id, attribute_id, value.clone()).await?;
                imported += 1;
            }
        }
        tracing::debug!(values = imported, "Catalog values imported");
        Ok(imported)
    }
}
