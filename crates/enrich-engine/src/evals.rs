//! Regression evals: run a pipeline for a labeled entity and compare the
//! output with the expected value. Failures are reported, never raised, and
//! nothing is written to the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use enrich_types::{EntityId, Inputs, Result};

use crate::engine::{ChainOutcome, ExecutionEngine};
use crate::pipeline::Pipeline;

const NUMERIC_TOLERANCE: f64 = 1e-9;

/// A labeled test case for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub id: String,
    pub pipeline_id: String,
    pub entity_id: EntityId,
    /// Explicit inputs bypass the pipeline's source module.
    #[serde(default)]
    pub inputs: Option<Inputs>,
    pub expected_output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub eval_id: String,
    /// The chain ran to completion (including a processor skip).
    pub success: bool,
    pub passing: bool,
    pub actual_output: Option<serde_json::Value>,
    pub justification: Option<String>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

impl EvalResult {
    fn failure(eval_id: &str, error: impl Into<String>) -> Self {
        Self {
            eval_id: eval_id.to_string(),
            success: false,
            passing: false,
            actual_output: None,
            justification: None,
            confidence: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub passing: usize,
    pub failing: usize,
    pub total: usize,
    pub results: Vec<EvalResult>,
}

/// Numbers within tolerance, strings ignoring surrounding whitespace, anything else exactly.
pub fn outputs_match(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match (actual, expected) {
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= NUMERIC_TOLERANCE,
            _ => a == b,
        },
        (serde_json::Value::String(a), serde_json::Value::String(b)) => a.trim() == b.trim(),
        _ => actual == expected,
    }
}

impl ExecutionEngine {
    async fn eval_inputs(&self, pipeline: &Pipeline, record: &EvalRecord) -> Result<Option<Inputs>> {
        if let Some(inputs) = &record.inputs {
            return Ok(Some(inputs.clone()));
        }
        let chain = pipeline.resolve_chain(self.registry())?;
        let (source, instance) = chain.source;
        let mut loaded = source
            .load_inputs(&instance.settings, &[record.entity_id.clone()], self.store())
            .await?;
        Ok(loaded.remove(&record.entity_id))
    }

    /// Run one eval. Every failure is folded into the result.
    pub async fn execute_single_eval(&self, record: &EvalRecord) -> EvalResult {
        let pipeline = match self.pipeline(&record.pipeline_id) {
            Ok(p) => p,
            Err(e) => return EvalResult::failure(&record.id, e.to_string()),
        };
        let chain = match pipeline.resolve_chain(self.registry()) {
            Ok(chain) => chain,
            Err(e) => return EvalResult::failure(&record.id, e.to_string()),
        };
        let inputs = match self.eval_inputs(pipeline, record).await {
            Ok(Some(inputs)) => inputs,
            Ok(None) => {
                return EvalResult::failure(
                    &record.id,
                    format!("no inputs for entity '{}'", record.entity_id),
                )
            }
            Err(e) => return EvalResult::failure(&record.id, e.to_string()),
        };

        let outcome = self
            .run_chain(
                &chain,
                &record.entity_id,
                &pipeline.target_attribute,
                Arc::new(inputs),
            )
            .await;

        let result = match outcome {
            ChainOutcome::Failed(message) => EvalResult::failure(&record.id, message),
            ChainOutcome::Skipped(reason) => EvalResult {
                eval_id: record.id.clone(),
                success: true,
                passing: record.expected_output.is_null(),
                actual_output: None,
                justification: Some(reason),
                confidence: None,
                error: None,
            },
            ChainOutcome::Completed { outcome, .. } => {
                let actual = outcome.value.unwrap_or(serde_json::Value::Null);
                EvalResult {
                    eval_id: record.id.clone(),
                    success: true,
                    passing: outputs_match(&actual, &record.expected_output),
                    actual_output: Some(actual),
                    justification: outcome.justification,
                    confidence: outcome.confidence,
                    error: None,
                }
            }
        };

        tracing::debug!(
            eval = %record.id,
            pipeline = %record.pipeline_id,
            passing = result.passing,
            "Eval finished"
        );
        result
    }

    /// Run every eval recorded for `pipeline`.
    pub async fn execute_evals(&self, pipeline: &Pipeline) -> EvalSummary {
        let mut summary = EvalSummary::default();
        for record in self.catalog().evals_for(&pipeline.id) {
            let result = self.execute_single_eval(record).await;
            if result.passing {
                summary.passing += 1;
            } else {
                summary.failing += 1;
            }
            summary.total += 1;
            summary.results.push(result);
        }
        tracing::info!(
            pipeline = %pipeline.id,
            passing = summary.passing,
            failing = summary.failing,
            "Evals complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{default_registry, ModuleInstance, ModuleSettings};
    use crate::modules::{ArithmeticSettings, AttributeSourceSettings, Operand, Operation};
    use crate::pipeline::Catalog;
    use crate::store::AttributeStore;
    use enrich_types::{Attribute, ReviewPolicy};
    use serde_json::json;

    #[test]
    fn match_rules() {
        assert!(outputs_match(&json!(0.30000000000000004), &json!(0.3)));
        assert!(outputs_match(&json!(40), &json!(40.0)));
        assert!(!outputs_match(&json!(40), &json!(41)));
        assert!(outputs_match(&json!(" Blue\n"), &json!("Blue")));
        assert!(!outputs_match(&json!("40"), &json!(40)));
        assert!(outputs_match(&json!({"a": [1]}), &json!({"a": [1]})));
    }

    fn engine(evals: Vec<EvalRecord>) -> ExecutionEngine {
        let pipeline = Pipeline {
            id: "margin".into(),
            name: "Margin".into(),
            entity_type: "product".into(),
            target_attribute: "margin".into(),
            version: 1,
            active: true,
            modules: vec![
                ModuleInstance {
                    order: 1,
                    settings: ModuleSettings::AttributeSource(AttributeSourceSettings {
                        attributes: vec!["price".into(), "cost".into()],
                    }),
                },
                ModuleInstance {
                    order: 2,
                    settings: ModuleSettings::Arithmetic(ArithmeticSettings {
                        operation: Operation::Divide,
                        left: Operand::Input("price".into()),
                        right: Operand::Input("cost".into()),
                        round: Some(2),
                    }),
                },
            ],
            filter: None,
        };
        let catalog = Catalog {
            attributes: vec![Attribute {
                id: "margin".into(),
                name: "Margin".into(),
                entity_type: "product".into(),
                data_type: Default::default(),
                review_policy: ReviewPolicy::NoReview,
            }],
            pipelines: vec![pipeline],
            evals,
            ..Default::default()
        };
        ExecutionEngine::new(
            Arc::new(default_registry()),
            Arc::new(AttributeStore::in_memory()),
            Arc::new(catalog),
        )
    }

    fn record(id: &str, inputs: Option<serde_json::Value>, expected: serde_json::Value) -> EvalRecord {
        EvalRecord {
            id: id.into(),
            pipeline_id: "margin".into(),
            entity_id: "sku-1".into(),
            inputs: inputs.map(|v| serde_json::from_value(v).unwrap()),
            expected_output: expected,
        }
    }

    #[tokio::test]
    async fn explicit_inputs_bypass_source() {
        let engine = engine(vec![]);
        let result = engine
            .execute_single_eval(&record("e1", Some(json!({"price": 10, "cost": 4})), json!(2.5)))
            .await;
        assert!(result.success);
        assert!(result.passing);
        assert_eq!(result.actual_output, Some(json!(2.5)));
        assert_eq!(result.confidence, Some(1.0));
    }

    #[tokio::test]
    async fn source_loads_labeled_entity() {
        let engine = engine(vec![]);
        engine.store().import_value("sku-1", "price", json!(9)).await.unwrap();
        engine.store().import_value("sku-1", "cost", json!(3)).await.unwrap();
        let result = engine.execute_single_eval(&record("e1", None, json!(3))).await;
        assert!(result.passing, "{result:?}");
        // Evals never write results.
        assert_eq!(engine.store().get("sku-1", "margin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn processor_errors_are_captured() {
        let engine = engine(vec![]);
        let result = engine
            .execute_single_eval(&record("e1", Some(json!({"price": 1, "cost": 0})), json!(1)))
            .await;
        assert!(!result.success);
        assert!(!result.passing);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn unknown_pipeline_is_a_failure_result() {
        let engine = engine(vec![]);
        let mut r = record("e1", None, json!(1));
        r.pipeline_id = "nope".into();
        let result = engine.execute_single_eval(&r).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn summary_counts_partial_failures() {
        let evals = vec![
            record("pass", Some(json!({"price": 10, "cost": 5})), json!(2)),
            record("wrong", Some(json!({"price": 10, "cost": 5})), json!(3)),
            record("error", Some(json!({"price": 10, "cost": 0})), json!(0)),
        ];
        let engine = engine(evals);
        let pipeline = engine.pipeline("margin").unwrap().clone();
        let summary = engine.execute_evals(&pipeline).await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passing, 1);
        assert_eq!(summary.failing, 2);
        assert_eq!(summary.results[1].actual_output, Some(json!(2)));
    }
}
