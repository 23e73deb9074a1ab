//! Shared types, errors, versioned values, and step outcomes for the enrichment engine.
//!
//! This crate provides the foundational types used across the other crates:
//! - `EnrichError` — unified error taxonomy
//! - `Attribute` / `ReviewPolicy` — attribute definitions and their approval rules
//! - `StepOutcome` — result of running one processor step for one entity
//! - `BatchStats` — counters for one batch run
//! - `VersionedValue` — the per-(entity, attribute) record with its four value slots
//! - `Clock` — injectable time source

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque entity identifier.
pub type EntityId = String;

/// Attribute identifier. Also used as the key of resolved inputs.
pub type AttributeId = String;

/// Flat key/value inputs resolved for one entity by a source module.
/// Keys are kept sorted so hashing and rendering are deterministic.
pub type Inputs = BTreeMap<String, serde_json::Value>;

/// Open key/value metadata bag attached to outcomes and stored values.
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// Unified error type for all enrichment subsystems.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    // === Configuration Errors ===
    #[error("Invalid settings for module '{module}': {message}")]
    Validation { module: String, message: String },

    #[error("Dependency cycle detected among attributes: {}", attributes.join(", "))]
    DependencyCycle { attributes: Vec<String> },

    #[error("Pipeline '{pipeline}' is malformed: {message}")]
    Structural { pipeline: String, message: String },

    #[error("No module registered for type '{module_type}'")]
    UnknownModule { module_type: String },

    // === Execution Errors ===
    #[error(
        "Pipeline '{pipeline}' failed on entity '{entity}' ({processed} processed, {not_processed} not processed): {message}"
    )]
    Execution {
        pipeline: String,
        entity: String,
        message: String,
        processed: usize,
        not_processed: usize,
        /// Counters up to and including the failing entity.
        stats: Box<BatchStats>,
    },

    #[error("Module '{module}' timed out after {timeout_ms}ms")]
    StepTimeout { module: String, timeout_ms: u64 },

    // === Store Errors ===
    #[error("No versioned value for entity '{entity}', attribute '{attribute}'")]
    NotFound { entity: String, attribute: String },

    #[error("Store error: {0}")]
    Store(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EnrichError {
    /// Returns `true` if re-dispatching the same work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnrichError::Execution { .. } | EnrichError::StepTimeout { .. } | EnrichError::Store(_)
        )
    }

    /// Returns `true` if the error is a configuration problem that no retry will fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrichError::Validation { .. }
                | EnrichError::DependencyCycle { .. }
                | EnrichError::Structural { .. }
                | EnrichError::UnknownModule { .. }
        )
    }
}

/// A convenience alias for `Result<T, EnrichError>`.
pub type Result<T> = std::result::Result<T, EnrichError>;

// ---------------------------------------------------------------------------
// Attribute definitions
// ---------------------------------------------------------------------------

/// Controls whether freshly computed values are promoted to `approved` automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPolicy {
    #[default]
    AlwaysReview,
    LowConfidenceReview,
    NoReview,
}

impl ReviewPolicy {
    /// Decide whether a write with the given confidence is auto-approved.
    pub fn auto_approves(&self, confidence: Option<f64>, threshold: f64) -> bool {
        match self {
            ReviewPolicy::AlwaysReview => false,
            ReviewPolicy::LowConfidenceReview => confidence.is_some_and(|c| c >= threshold),
            ReviewPolicy::NoReview => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Text,
    Number,
    Integer,
    Boolean,
    Json,
}

/// A named field definition on an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: AttributeId,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub review_policy: ReviewPolicy,
}

// ---------------------------------------------------------------------------
// BatchStats — counters for one batch run
// ---------------------------------------------------------------------------

/// Counters for one batch run. A completed batch always has `failed == 0`;
/// an aborted one reports its partial counters through
/// [`EnrichError::Execution`] with `failed == 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub processed: usize,
    pub failed: usize,
    /// Filtered out, skipped by a processor, or already up to date.
    pub skipped: usize,
    pub skipped_up_to_date: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

// ---------------------------------------------------------------------------
// StepOutcome — result of one processor step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub value: Option<serde_json::Value>,
    pub confidence: Option<f64>,
    pub justification: Option<String>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub errors: Vec<String>,
    pub skip_reason: Option<String>,
}

impl StepOutcome {
    /// Create a successful outcome carrying `value`.
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Ok,
            value: Some(value),
            confidence: None,
            justification: None,
            meta: Meta::new(),
            errors: Vec::new(),
            skip_reason: None,
        }
    }

    /// Create a failed outcome with a single message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::errors(vec![message.into()])
    }

    /// Create a failed outcome with several messages.
    pub fn errors(messages: Vec<String>) -> Self {
        Self {
            status: StepStatus::Error,
            value: None,
            confidence: None,
            justification: None,
            meta: Meta::new(),
            errors: messages,
            skip_reason: None,
        }
    }

    /// Create an outcome that ends the current entity's chain without failing the batch.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            value: None,
            confidence: None,
            justification: None,
            meta: Meta::new(),
            errors: Vec::new(),
            skip_reason: Some(reason.into()),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Token counters reported in `meta` as `tokens_in` / `tokens_out`.
    pub fn token_usage(&self) -> (u64, u64) {
        let read = |key: &str| self.meta.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        (read("tokens_in"), read("tokens_out"))
    }

    /// Error messages joined for display.
    pub fn error_message(&self) -> String {
        if self.errors.is_empty() {
            "processor returned an error without a message".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

// ---------------------------------------------------------------------------
// VersionedValue — per-(entity, attribute) record
// ---------------------------------------------------------------------------

/// Review state derived from the combination of value slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueState {
    Unset,
    PendingReview,
    Approved,
    Overridden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub entity_id: EntityId,
    pub attribute_id: AttributeId,
    pub current: Option<serde_json::Value>,
    pub approved: Option<serde_json::Value>,
    /// Last value confirmed pushed to an external system. Written by the
    /// sync collaborator only.
    pub live: Option<serde_json::Value>,
    #[serde(rename = "override")]
    pub override_value: Option<serde_json::Value>,
    pub input_hash: Option<String>,
    pub pipeline_version: Option<u32>,
    pub justification: Option<String>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub meta: Meta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionedValue {
    /// An empty row for the pair, stamped with `now`.
    pub fn new(entity_id: impl Into<String>, attribute_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute_id: attribute_id.into(),
            current: None,
            approved: None,
            live: None,
            override_value: None,
            input_hash: None,
            pipeline_version: None,
            justification: None,
            confidence: None,
            meta: Meta::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Value used for display and export: override, then approved, then current.
    pub fn effective_value(&self) -> Option<&serde_json::Value> {
        self.override_value
            .as_ref()
            .or(self.approved.as_ref())
            .or(self.current.as_ref())
    }

    /// Value an explicit approval promotes: override if set, else current.
    pub fn pending_value(&self) -> Option<&serde_json::Value> {
        self.override_value.as_ref().or(self.current.as_ref())
    }

    pub fn state(&self) -> ValueState {
        if self.override_value.is_some() {
            ValueState::Overridden
        } else if self.current.is_none() {
            ValueState::Unset
        } else if self.approved == self.current {
            ValueState::Approved
        } else {
            ValueState::PendingReview
        }
    }
}

// ---------------------------------------------------------------------------
// Clock — injected time source
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant; tests advance it explicitly.
#[derive(Debug)]
pub struct FixedClock {
    at: std::sync::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at: std::sync::Mutex::new(at),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.at.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.at.lock().unwrap_or_else(|e| e.into_inner())
    }
}
