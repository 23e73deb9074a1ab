use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use enrich_types::{AttributeId, EnrichError, Result, StepOutcome};

use super::{as_number, number_to_json};
use crate::module::{settings_mismatch, ModuleKind, ModuleSettings, PipelineModule, StepContext};

// ---------------------------------------------------------------------------
// ArithmeticModule — binary numeric operation over inputs (processor)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Where an operand's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// A resolved input, by key.
    Input(String),
    /// The value produced by the previous step.
    Previous,
    Literal(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArithmeticSettings {
    pub operation: Operation,
    pub left: Operand,
    pub right: Operand,
    /// Decimal places to round the result to.
    #[serde(default)]
    pub round: Option<u32>,
}

pub struct ArithmeticModule;

impl ArithmeticModule {
    fn settings<'a>(&self, settings: &'a ModuleSettings) -> Result<&'a ArithmeticSettings> {
        match settings {
            ModuleSettings::Arithmetic(s) => Ok(s),
            other => Err(settings_mismatch(self.module_type(), other)),
        }
    }
}

fn resolve_operand(operand: &Operand, context: &StepContext) -> std::result::Result<f64, String> {
    match operand {
        Operand::Literal(n) => Ok(*n),
        Operand::Previous => context
            .previous_value()
            .and_then(as_number)
            .ok_or_else(|| "previous value is missing or not numeric".to_string()),
        Operand::Input(key) => context
            .lookup(key)
            .and_then(as_number)
            .ok_or_else(|| format!("input '{key}' is missing or not numeric")),
    }
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

#[async_trait]
impl PipelineModule for ArithmeticModule {
    fn module_type(&self) -> &str {
        "arithmetic"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Processor
    }

    fn validate_settings(&self, settings: &ModuleSettings) -> Result<()> {
        let s = self.settings(settings)?;
        for operand in [&s.left, &s.right] {
            match operand {
                Operand::Input(key) if key.trim().is_empty() => {
                    return Err(EnrichError::Validation {
                        module: self.module_type().to_string(),
                        message: "input operand must name a key".into(),
                    });
                }
                Operand::Literal(n) if !n.is_finite() => {
                    return Err(EnrichError::Validation {
                        module: self.module_type().to_string(),
                        message: "literal operand must be finite".into(),
                    });
                }
                _ => {}
            }
        }
        if s.operation == Operation::Divide && s.right == Operand::Literal(0.0) {
            return Err(EnrichError::Validation {
                module: self.module_type().to_string(),
                message: "division by a literal zero".into(),
            });
        }
        if s.round.is_some_and(|places| places > 12) {
            return Err(EnrichError::Validation {
                module: self.module_type().to_string(),
                message: "round must be at most 12 decimal places".into(),
            });
        }
        Ok(())
    }

    fn input_attributes(&self, settings: &ModuleSettings) -> BTreeSet<AttributeId> {
        let Ok(s) = self.settings(settings) else {
            return BTreeSet::new();
        };
        [&s.left, &s.right]
            .into_iter()
            .filter_map(|operand| match operand {
                Operand::Input(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    async fn process(&self, context: &StepContext) -> Result<StepOutcome> {
        let s = self.settings(context.settings())?;

        let (left, right) = match (
            resolve_operand(&s.left, context),
            resolve_operand(&s.right, context),
        ) {
            (Ok(l), Ok(r)) => (l, r),
            (Err(reason), _) | (_, Err(reason)) => return Ok(StepOutcome::skipped(reason)),
        };

        let result = match s.operation {
            Operation::Add => left + right,
            Operation::Subtract => left - right,
            Operation::Multiply => left * right,
            Operation::Divide => {
                if right == 0.0 {
                    return Ok(StepOutcome::error(format!(
                        "division by zero for entity '{}'",
                        context.entity_id()
                    )));
                }
                left / right
            }
        };
        let result = match s.round {
            Some(places) => round_to(result, places),
            None => result,
        };

        Ok(StepOutcome::ok(number_to_json(result)).with_confidence(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tests::make_context;
    use enrich_types::StepStatus;
    use serde_json::json;

    fn settings(operation: Operation, left: Operand, right: Operand) -> ModuleSettings {
        ModuleSettings::Arithmetic(ArithmeticSettings {
            operation,
            left,
            right,
            round: None,
        })
    }

    fn margin() -> ModuleSettings {
        settings(
            Operation::Subtract,
            Operand::Input("price".into()),
            Operand::Input("cost".into()),
        )
    }

    #[tokio::test]
    async fn subtract_computes_margin() {
        let ctx = make_context(margin(), &[("price", json!(100)), ("cost", json!(60))], None);
        let outcome = ArithmeticModule.process(&ctx).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Ok);
        assert_eq!(outcome.value, Some(json!(40)));
        assert_eq!(outcome.confidence, Some(1.0));
    }

    #[tokio::test]
    async fn missing_operand_skips() {
        let ctx = make_context(margin(), &[("price", json!(100)), ("cost", json!(null))], None);
        let outcome = ArithmeticModule.process(&ctx).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Skipped);
        assert!(outcome.skip_reason.unwrap().contains("cost"));
    }

    #[tokio::test]
    async fn divide_by_zero_input_is_an_error() {
        let s = settings(
            Operation::Divide,
            Operand::Input("a".into()),
            Operand::Input("b".into()),
        );
        let ctx = make_context(s, &[("a", json!(1)), ("b", json!(0))], None);
        let outcome = ArithmeticModule.process(&ctx).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Error);
    }

    #[tokio::test]
    async fn previous_value_and_rounding() {
        let s = ModuleSettings::Arithmetic(ArithmeticSettings {
            operation: Operation::Divide,
            left: Operand::Previous,
            right: Operand::Literal(3.0),
            round: Some(2),
        });
        let ctx = make_context(s, &[], Some(json!(10)));
        let outcome = ArithmeticModule.process(&ctx).await.unwrap();
        assert_eq!(outcome.value, Some(json!(3.33)));
    }

    #[test]
    fn input_attributes_are_referenced_inputs() {
        let attrs = ArithmeticModule.input_attributes(&margin());
        assert!(attrs.contains("price"));
        assert!(attrs.contains("cost"));
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn validate_rejects_literal_zero_divisor() {
        let s = settings(Operation::Divide, Operand::Previous, Operand::Literal(0.0));
        assert!(ArithmeticModule.validate_settings(&s).is_err());
        assert!(ArithmeticModule.validate_settings(&margin()).is_ok());
    }

    #[test]
    fn operands_decode_from_json() {
        let s: ModuleSettings = serde_json::from_value(json!({
            "type": "arithmetic",
            "operation": "multiply",
            "left": {"input": "price"},
            "right": {"literal": 1.2}
        }))
        .unwrap();
        assert_eq!(
            s,
            settings(
                Operation::Multiply,
                Operand::Input("price".into()),
                Operand::Literal(1.2)
            )
        );
    }
}
