//! Optional per-pipeline entity filter evaluated against stored `current` values.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use enrich_types::{AttributeId, EntityId, Result};

use crate::modules::{as_number, as_text};
use crate::store::AttributeStore;

/// `attribute operator value`, e.g. `status = "active"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub attribute: AttributeId,
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Null,
    NotNull,
    Contains,
}

impl FilterOperator {
    pub fn parse(s: &str) -> Option<Self> {
        let op = match s.trim() {
            "=" => FilterOperator::Eq,
            "!=" => FilterOperator::NotEq,
            ">" => FilterOperator::Gt,
            ">=" => FilterOperator::Gte,
            "<" => FilterOperator::Lt,
            "<=" => FilterOperator::Lte,
            "in" => FilterOperator::In,
            "not_in" => FilterOperator::NotIn,
            "null" => FilterOperator::Null,
            "not_null" => FilterOperator::NotNull,
            "contains" => FilterOperator::Contains,
            _ => return None,
        };
        Some(op)
    }
}

/// Entities kept by a filter and how many were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    pub kept: Vec<EntityId>,
    pub dropped: usize,
}

/// Numbers compare numerically (numeric strings included), everything else as text.
fn loose_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b || as_text(a) == as_text(b),
    }
}

fn loose_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(as_text(a).cmp(&as_text(b))),
    }
}

/// Members of an `in` list: a JSON array, or a comma-separated string.
fn list_members(value: &serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::String(s) => s
            .split(',')
            .map(|part| serde_json::Value::String(part.trim().to_string()))
            .collect(),
        other => vec![other.clone()],
    }
}

impl EntityFilter {
    pub fn operator(&self) -> Option<FilterOperator> {
        FilterOperator::parse(&self.operator)
    }

    /// Whether an entity whose stored value is `current` passes.
    ///
    /// An unrecognised operator matches everything.
    pub fn matches(&self, current: Option<&serde_json::Value>) -> bool {
        let Some(op) = self.operator() else {
            return true;
        };
        let current = current.filter(|v| !v.is_null());
        match op {
            FilterOperator::Null => current.is_none(),
            FilterOperator::NotNull => current.is_some(),
            FilterOperator::Eq => current.is_some_and(|v| loose_eq(v, &self.value)),
            FilterOperator::NotEq => !current.is_some_and(|v| loose_eq(v, &self.value)),
            FilterOperator::Gt => self.ordered(current, Ordering::is_gt),
            FilterOperator::Gte => self.ordered(current, Ordering::is_ge),
            FilterOperator::Lt => self.ordered(current, Ordering::is_lt),
            FilterOperator::Lte => self.ordered(current, Ordering::is_le),
            FilterOperator::In => self.in_list(current),
            FilterOperator::NotIn => !self.in_list(current),
            FilterOperator::Contains => match current {
                Some(serde_json::Value::Array(items)) => {
                    items.iter().any(|item| loose_eq(item, &self.value))
                }
                Some(v) => as_text(v).contains(&as_text(&self.value)),
                None => false,
            },
        }
    }

    fn ordered(&self, current: Option<&serde_json::Value>, accept: fn(Ordering) -> bool) -> bool {
        current
            .and_then(|v| loose_cmp(v, &self.value))
            .is_some_and(accept)
    }

    fn in_list(&self, current: Option<&serde_json::Value>) -> bool {
        current.is_some_and(|v| list_members(&self.value).iter().any(|m| loose_eq(v, m)))
    }

    /// Split `entity_ids` into those that pass and a count of those that don't.
    pub async fn apply(&self, entity_ids: &[EntityId], store: &AttributeStore) -> Result<FilterResult> {
        if self.operator().is_none() {
            tracing::warn!(
                attribute = %self.attribute,
                operator = %self.operator,
                "Unknown filter operator, filter ignored"
            );
            return Ok(FilterResult {
                kept: entity_ids.to_vec(),
                dropped: 0,
            });
        }

        let rows = store.get_many(entity_ids, &self.attribute).await?;
        let mut result = FilterResult::default();
        for id in entity_ids {
            let current = rows.get(id).and_then(|row| row.current.as_ref());
            if self.matches(current) {
                result.kept.push(id.clone());
            } else {
                result.dropped += 1;
            }
        }
        Ok(result)
    }
}
