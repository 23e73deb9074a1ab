use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use enrich_types::{AttributeId, EnrichError, EntityId, Inputs, Result};

use crate::module::{settings_mismatch, ModuleKind, ModuleSettings, PipelineModule};
use crate::store::AttributeStore;

// ---------------------------------------------------------------------------
// AttributeSourceModule — reads stored attribute values (source)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeSourceSettings {
    pub attributes: Vec<AttributeId>,
}

pub struct AttributeSourceModule;

impl AttributeSourceModule {
    fn settings<'a>(&self, settings: &'a ModuleSettings) -> Result<&'a AttributeSourceSettings> {
        match settings {
            ModuleSettings::AttributeSource(s) => Ok(s),
            other => Err(settings_mismatch(self.module_type(), other)),
        }
    }
}

#[async_trait]
impl PipelineModule for AttributeSourceModule {
    fn module_type(&self) -> &str {
        "attribute_source"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Source
    }

    fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        let s = self.settings(settings)?;
        let invalid = |message: String| EnrichError::Validation {
            module: self.module_type().to_string(),
            message,
        };
        if s.attributes.is_empty() {
            return Err(invalid("at least one attribute is required".into()));
        }
        let mut seen = BTreeSet::new();
        for attr in &s.attributes {
            if attr.trim().is_empty() {
                return Err(invalid("attribute ids must not be empty".into()));
            }
            if !seen.insert(attr.as_str()) {
                return Err(invalid(format!("attribute '{attr}' is listed twice")));
            }
        }
        Ok(())
    }

    fn input_attributes(&self, settings: &ModuleSettings) -> BTreeSet<AttributeId> {
        self.settings(settings)
            .map(|s| s.attributes.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn load_inputs(
        &self,
        settings: &ModuleSettings,
        entity_ids: &[EntityId],
        store: &AttributeStore,
    ) -> Result<HashMap<EntityId, Inputs>> {
        let s = self.settings(settings)?;
        let mut loaded: HashMap<EntityId, Inputs> = entity_ids
            .iter()
            .map(|id| (id.clone(), Inputs::new()))
            .collect();

        for attr in &s.attributes {
            let rows = store.get_many(entity_ids, attr).await?;
            for (entity_id, inputs) in loaded.iter_mut() {
                let value = rows
                    .get(entity_id)
                    .and_then(|row| row.effective_value())
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                inputs.insert(attr.clone(), value);
            }
        }

        tracing::debug!(
            attributes = s.attributes.len(),
            entities = loaded.len(),
            "Loaded attribute inputs"
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(attrs: &[&str]) -> ModuleSettings {
        ModuleSettings::AttributeSource(AttributeSourceSettings {
            attributes: attrs.iter().map(|a| a.to_string()).collect(),
        })
    }

    #[test]
    fn validate_rejects_empty_and_duplicate_lists() {
        let module = AttributeSourceModule;
        assert!(module.validate_settings(&settings(&[])).is_err());
        assert!(module.validate_settings(&settings(&["price", "price"])).is_err());
        assert!(module.validate_settings(&settings(&["price", "cost"])).is_ok());
    }

    #[test]
    fn input_attributes_are_the_listed_set() {
        let module = AttributeSourceModule;
        let attrs = module.input_attributes(&settings(&["price", "cost"]));
        assert_eq!(
            attrs.into_iter().collect::<Vec<_>>(),
            vec!["cost".to_string(), "price".to_string()]
        );
    }

    #[tokio::test]
    async fn load_inputs_reads_effective_values() {
        let store = AttributeStore::in_memory();
        store.import_value("sku-1", "price", json!(100)).await.unwrap();
        store.import_value("sku-1", "cost", json!(60)).await.unwrap();
        store
            .set_override("sku-1", "cost", Some(json!(55)))
            .await
            .unwrap();

        let module = AttributeSourceModule;
        let ids = vec!["sku-1".to_string(), "sku-2".to_string()];
        let loaded = module
            .load_inputs(&settings(&["price", "cost"]), &ids, &store)
            .await
            .unwrap();

        assert_eq!(loaded["sku-1"]["price"], json!(100));
        assert_eq!(loaded["sku-1"]["cost"], json!(55));
        // Entities without stored values still get every key, as null.
        assert_eq!(loaded["sku-2"]["price"], json!(null));
        assert_eq!(loaded["sku-2"].len(), 2);
    }
}
