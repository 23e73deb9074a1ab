//! Built-in source and processor modules.

pub mod arithmetic;
pub mod attribute_source;
pub mod command;
pub mod static_source;
pub mod template;
pub mod value_map;

pub use arithmetic::{ArithmeticModule, ArithmeticSettings, Operand, Operation};
pub use attribute_source::{AttributeSourceModule, AttributeSourceSettings};
pub use command::{CommandModule, CommandSettings};
pub use static_source::{StaticSourceModule, StaticSourceSettings};
pub use template::{TemplateModule, TemplateSettings};
pub use value_map::{ValueMapModule, ValueMapSettings};

/// Read a JSON value as a number, accepting numeric strings.
pub(crate) fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Render a JSON value as plain text: strings unquoted, everything else as JSON.
pub(crate) fn as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Convert a float back to JSON, keeping integral results as integers.
pub(crate) fn number_to_json(value: f64) -> serde_json::Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() < MAX_EXACT {
        serde_json::json!(value as i64)
    } else {
        serde_json::json!(value)
    }
}
