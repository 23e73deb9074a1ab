//! Content hash gating recomputation.

use sha2::{Digest, Sha256};

use enrich_types::Inputs;

const SEPARATOR: u8 = 0x1f;

/// Digest over the resolved inputs (sorted by key) followed by the pipeline version.
///
/// Values are hashed by their compact JSON text, so `1` and `"1"` differ.
pub fn input_hash(inputs: &Inputs, pipeline_version: u32) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in inputs {
        hasher.update(key.as_bytes());
        hasher.update([SEPARATOR]);
        hasher.update(value.to_string().as_bytes());
        hasher.update([SEPARATOR]);
    }
    hasher.update(b"pipeline_version");
    hasher.update([SEPARATOR]);
    hasher.update(pipeline_version.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, serde_json::Value)]) -> Inputs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let a = inputs(&[("price", json!(100)), ("cost", json!(60))]);
        let b = inputs(&[("cost", json!(60)), ("price", json!(100))]);
        assert_eq!(input_hash(&a, 1), input_hash(&b, 1));
        assert_eq!(input_hash(&a, 1).len(), 64);
    }

    #[test]
    fn hash_changes_with_values_and_version() {
        let base = inputs(&[("price", json!(100)), ("cost", json!(60))]);
        let changed = inputs(&[("price", json!(101)), ("cost", json!(60))]);
        assert_ne!(input_hash(&base, 1), input_hash(&changed, 1));
        assert_ne!(input_hash(&base, 1), input_hash(&base, 2));
        let stringly = inputs(&[("price", json!("100")), ("cost", json!(60))]);
        assert_ne!(input_hash(&base, 1), input_hash(&stringly, 1));
    }

    #[test]
    fn key_value_boundaries_are_unambiguous() {
        let a = inputs(&[("ab", json!("c"))]);
        let b = inputs(&[("a", json!("bc"))]);
        assert_ne!(input_hash(&a, 1), input_hash(&b, 1));
    }
}
