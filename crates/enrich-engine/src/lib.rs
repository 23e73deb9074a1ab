//! Pipeline execution engine, module registry, dependency resolver, and
//! versioned attribute store.
//!
//! This crate computes derived attributes for catalog entities: a source
//! module gathers inputs, processor modules transform them, and results land
//! in a store that keeps computed, approved, published and overridden values
//! apart. Inputs are hashed so unchanged entities are not recomputed, and
//! pipelines of one entity type run in dependency order.

pub mod config;
pub mod engine;
pub mod evals;
pub mod filter;
pub mod hashing;
pub mod module;
pub mod modules;
pub mod pipeline;
pub mod resolver;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod tracker;
pub mod validation;

pub use config::EngineConfig;
pub use engine::ExecutionEngine;
pub use enrich_types::BatchStats;
pub use evals::{outputs_match, EvalRecord, EvalResult, EvalSummary};
pub use filter::{EntityFilter, FilterOperator, FilterResult};
pub use hashing::input_hash;
pub use module::{
    default_registry, DynModule, ModuleInstance, ModuleKind, ModuleRegistry, ModuleSettings,
    PipelineModule, StepContext, PREVIOUS_VALUE_KEY,
};
pub use modules::{
    ArithmeticModule, ArithmeticSettings, AttributeSourceModule, AttributeSourceSettings,
    CommandModule, CommandSettings, Operand, Operation, StaticSourceModule, StaticSourceSettings,
    TemplateModule, TemplateSettings, ValueMapModule, ValueMapSettings,
};
pub use pipeline::{Catalog, EntityRecord, Pipeline, ResolvedChain};
pub use resolver::DependencyResolver;
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteRecordStore;
pub use store::{AttributeStore, MemoryRecordStore, RecordStore, UpsertOptions, UpsertOutcome};
pub use tracker::{EventEmitter, RunEvent, RunTracker};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
