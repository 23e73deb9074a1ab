use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use enrich_types::{AttributeId, EntityId, Inputs, Result};

use crate::module::{settings_mismatch, ModuleKind, ModuleSettings, PipelineModule};
use crate::store::AttributeStore;

// ---------------------------------------------------------------------------
// StaticSourceModule — same constant inputs for every entity (source)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StaticSourceSettings {
    #[serde(default)]
    pub values: Inputs,
}

pub struct StaticSourceModule;

#[async_trait]
impl PipelineModule for StaticSourceModule {
    fn module_type(&self) -> &str {
        "static_source"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Source
    }

    fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        match settings {
            ModuleSettings::StaticSource(_) => Ok(()),
            other => Err(settings_mismatch(self.module_type(), other)),
        }
    }

    fn input_attributes(&self, _settings: &ModuleSettings) -> BTreeSet<AttributeId> {
        BTreeSet::new()
    }

    async fn load_inputs(
        &self,
        settings: &ModuleSettings,
        entity_ids: &[EntityId],
        _store: &AttributeStore,
    ) -> Result<HashMap<EntityId, Inputs>> {
        let values = match settings {
            ModuleSettings::StaticSource(s) => &s.values,
            other => return Err(settings_mismatch(self.module_type(), other)),
        };
        Ok(entity_ids
            .iter()
            .map(|id| (id.clone(), values.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn every_entity_gets_the_same_inputs() {
        let mut values = Inputs::new();
        values.insert("currency".into(), json!("EUR"));
        let settings = ModuleSettings::StaticSource(StaticSourceSettings { values });

        let store = AttributeStore::in_memory();
        let ids = vec!["a".to_string(), "b".to_string()];
        let loaded = StaticSourceModule
            .load_inputs(&settings, &ids, &store)
            .await
            .unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a"], loaded["b"]);
        assert_eq!(loaded["a"]["currency"], json!("EUR"));
        assert!(StaticSourceModule.input_attributes(&settings).is_empty());
    }
}
