//! Pipeline execution engine.
//!
//! A batch runs in five phases: structural check, entity filter, source load,
//! hash gating, then the processor chain per entity with the result committed
//! to the versioned store. The first processor error aborts the rest of the
//! batch; entities already committed stay committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use enrich_types::{Attribute, BatchStats, EnrichError, EntityId, Inputs, Result, StepOutcome, StepStatus};

use crate::config::EngineConfig;
use crate::hashing::input_hash;
use crate::module::{ModuleRegistry, StepContext};
use crate::pipeline::{Catalog, Pipeline, ResolvedChain};
use crate::resolver::DependencyResolver;
use crate::store::{AttributeStore, UpsertOptions};
use crate::tracker::{RunEvent, RunTracker};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a processor chain ended for one entity.
#[derive(Debug, Clone)]
pub(crate) enum ChainOutcome {
    Completed {
        outcome: StepOutcome,
        tokens_in: u64,
        tokens_out: u64,
    },
    Skipped(String),
    Failed(String),
}

/// Runs pipelines against the versioned store.
pub struct ExecutionEngine {
    registry: Arc<ModuleRegistry>,
    store: Arc<AttributeStore>,
    catalog: Arc<Catalog>,
    config: EngineConfig,
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

impl ExecutionEngine {
    /// Engine configured from the catalog's `engine` section.
    pub fn new(registry: Arc<ModuleRegistry>, store: Arc<AttributeStore>, catalog: Arc<Catalog>) -> Self {
        let config = catalog.engine.clone();
        Self {
            registry,
            store,
            catalog,
            config,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn store(&self) -> &AttributeStore {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> DependencyResolver<'_> {
        DependencyResolver::new(&self.catalog, &self.registry)
    }

    /// Look up a pipeline by id.
    pub fn pipeline(&self, id: &str) -> Result<&Pipeline> {
        self.catalog
            .pipeline(id)
            .ok_or_else(|| EnrichError::Other(format!("Unknown pipeline '{id}'")))
    }

    fn target_attribute(&self, pipeline: &Pipeline) -> Result<&Attribute> {
        self.catalog
            .attribute(&pipeline.target_attribute)
            .ok_or_else(|| EnrichError::Structural {
                pipeline: pipeline.id.clone(),
                message: format!(
                    "target attribute '{}' is not declared",
                    pipeline.target_attribute
                ),
            })
    }

    /// Run `pipeline` over `entity_ids`.
    ///
    /// Without `force`, entities whose stored hash and pipeline version
    /// already match their inputs are skipped.
    pub async fn execute_batch(
        &self,
        pipeline: &Pipeline,
        entity_ids: &[EntityId],
        tracker: Option<&dyn RunTracker>,
        force: bool,
    ) -> Result<BatchStats> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let report = |event: RunEvent| {
            if let Some(t) = tracker {
                t.report(event);
            }
        };
        let mut stats = BatchStats::default();

        // Phase 1: structure. Nothing is read before the chain is known to be sound.
        let chain = pipeline.resolve_chain(&self.registry)?;
        let attribute = self.target_attribute(pipeline)?;

        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.id,
            entities = entity_ids.len(),
            force,
            "Batch started"
        );
        report(RunEvent::BatchStarted {
            run_id: run_id.clone(),
            pipeline_id: pipeline.id.clone(),
            entity_count: entity_ids.len(),
        });

        // Phase 2: filter.
        let entity_ids: Vec<EntityId> = match &pipeline.filter {
            Some(filter) => {
                let result = filter.apply(entity_ids, &self.store).await?;
                stats.skipped += result.dropped;
                result.kept
            }
            None => entity_ids.to_vec(),
        };

        // Phase 3: source load.
        let (source, source_instance) = chain.source;
        let mut loaded = source
            .load_inputs(&source_instance.settings, &entity_ids, &self.store)
            .await?;

        // Phase 4: hash gating.
        let stored = if force {
            HashMap::new()
        } else {
            self.store.get_many(&entity_ids, &attribute.id).await?
        };
        let mut work: Vec<(EntityId, Arc<Inputs>, String)> = Vec::with_capacity(entity_ids.len());
        for entity_id in &entity_ids {
            let Some(inputs) = loaded.remove(entity_id) else {
                stats.skipped += 1;
                report(RunEvent::EntitySkipped {
                    run_id: run_id.clone(),
                    entity_id: entity_id.clone(),
                    reason: "source returned no inputs".into(),
                });
                continue;
            };
            let hash = input_hash(&inputs, pipeline.version);
            let up_to_date = stored.get(entity_id).is_some_and(|row| {
                row.input_hash.as_deref() == Some(hash.as_str())
                    && row.pipeline_version.is_some_and(|v| v >= pipeline.version)
            });
            if up_to_date {
                stats.skipped += 1;
                stats.skipped_up_to_date += 1;
                continue;
            }
            work.push((entity_id.clone(), Arc::new(inputs), hash));
        }

        tracing::debug!(
            pipeline = %pipeline.id,
            to_process = work.len(),
            up_to_date = stats.skipped_up_to_date,
            "Hash gating complete"
        );

        // Phase 5: run and commit.
        let total = work.len();
        for (index, (entity_id, inputs, hash)) in work.into_iter().enumerate() {
            match self.run_chain(&chain, &entity_id, &pipeline.target_attribute, inputs).await {
                ChainOutcome::Failed(message) => {
                    stats.failed += 1;
                    let not_processed = total - index;
                    tracing::error!(
                        run_id = %run_id,
                        pipeline = %pipeline.id,
                        entity = %entity_id,
                        processed = stats.processed,
                        not_processed,
                        error = %message,
                        "Batch aborted"
                    );
                    report(RunEvent::BatchFailed {
                        run_id: run_id.clone(),
                        entity_id: entity_id.clone(),
                        error: message.clone(),
                    });
                    return Err(EnrichError::Execution {
                        pipeline: pipeline.id.clone(),
                        entity: entity_id,
                        message,
                        processed: stats.processed,
                        not_processed,
                        stats: Box::new(stats),
                    });
                }
                ChainOutcome::Skipped(reason) => {
                    tracing::debug!(pipeline = %pipeline.id, entity = %entity_id, reason = %reason, "Entity skipped");
                    stats.skipped += 1;
                    report(RunEvent::EntitySkipped {
                        run_id: run_id.clone(),
                        entity_id,
                        reason,
                    });
                }
                ChainOutcome::Completed {
                    outcome,
                    tokens_in,
                    tokens_out,
                } => {
                    let Some(value) = outcome.value.filter(|v| !v.is_null()) else {
                        stats.skipped += 1;
                        report(RunEvent::EntitySkipped {
                            run_id: run_id.clone(),
                            entity_id,
                            reason: "chain produced no value".into(),
                        });
                        continue;
                    };
                    let opts = UpsertOptions {
                        input_hash: Some(hash),
                        pipeline_version: Some(pipeline.version),
                        justification: outcome.justification,
                        confidence: outcome.confidence,
                        meta: outcome.meta,
                    };
                    self.store
                        .upsert_versioned(&entity_id, attribute, value, opts)
                        .await?;
                    stats.processed += 1;
                    stats.tokens_in += tokens_in;
                    stats.tokens_out += tokens_out;
                    report(RunEvent::EntityProcessed {
                        run_id: run_id.clone(),
                        entity_id,
                        processed: stats.processed,
                        total,
                    });
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.id,
            processed = stats.processed,
            skipped = stats.skipped,
            up_to_date = stats.skipped_up_to_date,
            duration_ms,
            "Batch completed"
        );
        report(RunEvent::BatchCompleted {
            run_id,
            stats: stats.clone(),
            duration_ms,
        });
        Ok(stats)
    }

    /// [`execute_batch`](Self::execute_batch) for one entity.
    pub async fn execute_for_single_entity(
        &self,
        pipeline: &Pipeline,
        entity_id: &str,
        tracker: Option<&dyn RunTracker>,
        force: bool,
    ) -> Result<BatchStats> {
        self.execute_batch(pipeline, &[entity_id.to_string()], tracker, force)
            .await
    }

    /// Run every active pipeline of `entity_type` in dependency order.
    ///
    /// `entity_ids` defaults to the catalog's entities of that type. Stops at
    /// the first failing pipeline.
    pub async fn execute_entity_type(
        &self,
        entity_type: &str,
        entity_ids: Option<&[EntityId]>,
        tracker: Option<&dyn RunTracker>,
        force: bool,
    ) -> Result<Vec<(String, BatchStats)>> {
        let order = self.resolver().compute_execution_order(entity_type)?;
        let ids = match entity_ids {
            Some(ids) => ids.to_vec(),
            None => self.catalog.entity_ids(entity_type),
        };

        let mut results = Vec::with_capacity(order.len());
        for pipeline in order {
            let stats = self.execute_batch(pipeline, &ids, tracker, force).await?;
            results.push((pipeline.id.clone(), stats));
        }
        Ok(results)
    }

    /// Thread one entity through the processors, each step under the step deadline.
    pub(crate) async fn run_chain(
        &self,
        chain: &ResolvedChain<'_>,
        entity_id: &str,
        target_attribute: &str,
        inputs: Arc<Inputs>,
    ) -> ChainOutcome {
        let timeout = self.config.step_timeout();
        let mut context: Option<StepContext> = None;
        let mut last: Option<StepOutcome> = None;
        let (mut tokens_in, mut tokens_out) = (0, 0);

        for (module, instance) in &chain.processors {
            let step = match &context {
                None => StepContext::new(
                    entity_id,
                    target_attribute,
                    Arc::clone(&inputs),
                    instance.settings.clone(),
                ),
                Some(prev) => prev.next_step(
                    instance.settings.clone(),
                    last.as_ref().and_then(|o| o.value.clone()),
                ),
            };

            let outcome = match tokio::time::timeout(timeout, module.process(&step)).await {
                Err(_) => StepOutcome::error(
                    EnrichError::StepTimeout {
                        module: module.module_type().to_string(),
                        timeout_ms: self.config.step_timeout_ms,
                    }
                    .to_string(),
                ),
                Ok(Err(e)) => StepOutcome::error(e.to_string()),
                Ok(Ok(outcome)) => outcome,
            };

            let (step_in, step_out) = outcome.token_usage();
            tokens_in += step_in;
            tokens_out += step_out;

            match outcome.status {
                StepStatus::Error => {
                    return ChainOutcome::Failed(format!(
                        "{} (order {}): {}",
                        module.module_type(),
                        instance.order,
                        outcome.error_message()
                    ))
                }
                StepStatus::Skipped => {
                    return ChainOutcome::Skipped(
                        outcome
                            .skip_reason
                            .unwrap_or_else(|| format!("skipped by {}", module.module_type())),
                    )
                }
                StepStatus::Ok => {}
            }
            context = Some(step);
            last = Some(outcome);
        }

        match last {
            Some(outcome) => ChainOutcome::Completed {
                outcome,
                tokens_in,
                tokens_out,
            },
            None => ChainOutcome::Skipped("no processors".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{default_registry, ModuleInstance, ModuleKind, ModuleSettings, PipelineModule};
    use crate::modules::{
        ArithmeticSettings, CommandSettings, Operand, Operation, StaticSourceSettings,
        TemplateSettings, ValueMapSettings,
    };
    use async_trait::async_trait;
    use enrich_types::{AttributeId, ReviewPolicy};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn attribute(id: &str) -> Attribute {
        Attribute {
            id: id.into(),
            name: id.into(),
            entity_type: "product".into(),
            data_type: Default::default(),
            review_policy: ReviewPolicy::NoReview,
        }
    }

    fn static_source(values: serde_json::Value) -> ModuleInstance {
        let values: Inputs = serde_json::from_value(values).unwrap();
        ModuleInstance {
            order: 1,
            settings: ModuleSettings::StaticSource(StaticSourceSettings { values }),
        }
    }

    fn step(order: u32, settings: ModuleSettings) -> ModuleInstance {
        ModuleInstance { order, settings }
    }

    fn pipeline(modules: Vec<ModuleInstance>) -> Pipeline {
        Pipeline {
            id: "p".into(),
            name: String::new(),
            entity_type: "product".into(),
            target_attribute: "out".into(),
            version: 1,
            active: true,
            modules,
            filter: None,
        }
    }

    fn engine_for(p: &Pipeline, registry: ModuleRegistry) -> ExecutionEngine {
        let catalog = Catalog {
            attributes: vec![attribute("out")],
            pipelines: vec![p.clone()],
            ..Default::default()
        };
        ExecutionEngine::new(
            Arc::new(registry),
            Arc::new(AttributeStore::in_memory()),
            Arc::new(catalog),
        )
    }

    fn ids(n: usize) -> Vec<EntityId> {
        (1..=n).map(|i| format!("sku-{i}")).collect()
    }

    #[tokio::test]
    async fn previous_value_threads_through_chain() {
        let p = pipeline(vec![
            static_source(json!({"color": "red"})),
            step(
                2,
                ModuleSettings::Template(TemplateSettings {
                    template: "{{color}}".into(),
                    skip_if_missing: false,
                }),
            ),
            step(
                3,
                ModuleSettings::ValueMap(ValueMapSettings {
                    mapping: BTreeMap::from([("red".to_string(), json!("Rouge"))]),
                    default: None,
                    case_insensitive: false,
                    input: None,
                }),
            ),
        ]);
        let engine = engine_for(&p, default_registry());
        let stats = engine.execute_batch(&p, &ids(1), None, false).await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(
            engine.store().effective_value("sku-1", "out").await.unwrap(),
            Some(json!("Rouge"))
        );
    }

    #[tokio::test]
    async fn skipped_step_stops_only_that_entity() {
        let p = pipeline(vec![
            static_source(json!({"color": "green"})),
            step(
                2,
                ModuleSettings::ValueMap(ValueMapSettings {
                    mapping: BTreeMap::from([("red".to_string(), json!("Rouge"))]),
                    default: None,
                    case_insensitive: false,
                    input: Some("color".into()),
                }),
            ),
        ]);
        let engine = engine_for(&p, default_registry());
        let stats = engine.execute_batch(&p, &ids(2), None, false).await.unwrap();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.skipped_up_to_date, 0);
        assert_eq!(engine.store().get("sku-1", "out").await.unwrap(), None);
    }

    #[tokio::test]
    async fn structural_error_touches_nothing() {
        let p = pipeline(vec![static_source(json!({"a": 1}))]);
        let engine = engine_for(&p, default_registry());
        let err = engine.execute_batch(&p, &ids(2), None, false).await.unwrap_err();
        assert!(matches!(err, EnrichError::Structural { .. }));
        assert!(engine.store().records().all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undeclared_target_attribute_is_structural() {
        let mut p = pipeline(vec![
            static_source(json!({"a": 1})),
            step(
                2,
                ModuleSettings::Arithmetic(ArithmeticSettings {
                    operation: Operation::Add,
                    left: Operand::Input("a".into()),
                    right: Operand::Literal(1.0),
                    round: None,
                }),
            ),
        ]);
        let engine = engine_for(&p, default_registry());
        p.target_attribute = "missing".into();
        let err = engine.execute_batch(&p, &ids(1), None, false).await.unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }

    struct SlowModule;

    #[async_trait]
    impl PipelineModule for SlowModule {
        fn module_type(&self) -> &str {
            "template"
        }
        fn kind(&self) -> ModuleKind {
            ModuleKind::Processor
        }
        fn validate_settings(&self, _settings: &ModuleSettings) -> Result<()> {
            Ok(())
        }
        fn input_attributes(&self, _settings: &ModuleSettings) -> BTreeSet<AttributeId> {
            BTreeSet::new()
        }
        async fn process(&self, _context: &StepContext) -> Result<StepOutcome> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(StepOutcome::ok(json!("late")))
        }
    }

    #[tokio::test]
    async fn step_timeout_aborts_batch() {
        let p = pipeline(vec![
            static_source(json!({"a": 1})),
            step(
                2,
                ModuleSettings::Template(TemplateSettings {
                    template: "x".into(),
                    skip_if_missing: false,
                }),
            ),
        ]);
        let mut registry = default_registry();
        registry.register(SlowModule);
        let engine = engine_for(&p, registry).with_config(EngineConfig {
            step_timeout_ms: 20,
            ..Default::default()
        });
        let err = engine.execute_batch(&p, &ids(2), None, false).await.unwrap_err();
        match err {
            EnrichError::Execution {
                entity,
                processed,
                not_processed,
                message,
                ..
            } => {
                assert_eq!(entity, "sku-1");
                assert_eq!(processed, 0);
                assert_eq!(not_processed, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_tokens_are_summed() {
        let p = pipeline(vec![
            static_source(json!({"a": 1})),
            step(
                2,
                ModuleSettings::Command(CommandSettings {
                    command: r#"echo '{"value": "ok", "confidence": 0.9, "meta": {"tokens_in": 7, "tokens_out": 2}}'"#.into(),
                    timeout_ms: 5_000,
                }),
            ),
        ]);
        let engine = engine_for(&p, default_registry());
        let stats = engine.execute_batch(&p, &ids(2), None, false).await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.tokens_in, 14);
        assert_eq!(stats.tokens_out, 4);
        let row = engine.store().get("sku-2", "out").await.unwrap().unwrap();
        assert_eq!(row.confidence, Some(0.9));
        assert_eq!(row.meta["tokens_in"], json!(7));
    }

    #[tokio::test]
    async fn batch_leaves_no_row_locks_behind() {
        let p = pipeline(vec![
            static_source(json!({"a": 3})),
            step(
                2,
                ModuleSettings::Arithmetic(ArithmeticSettings {
                    operation: Operation::Add,
                    left: Operand::Input("a".into()),
                    right: Operand::Literal(1.0),
                    round: None,
                }),
            ),
        ]);
        let engine = engine_for(&p, default_registry());
        let stats = engine.execute_batch(&p, &ids(50), None, false).await.unwrap();
        assert_eq!(stats.processed, 50);
        assert_eq!(engine.store().held_lock_count(), 0);
    }

    #[tokio::test]
    async fn single_entity_wrapper() {
        let p = pipeline(vec![
            static_source(json!({"a": 2})),
            step(
                2,
                ModuleSettings::Arithmetic(ArithmeticSettings {
                    operation: Operation::Multiply,
                    left: Operand::Input("a".into()),
                    right: Operand::Literal(21.0),
                    round: None,
                }),
            ),
        ]);
        let engine = engine_for(&p, default_registry());
        let stats = engine
            .execute_for_single_entity(&p, "sku-9", None, false)
            .await
            .unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(
            engine.store().effective_value("sku-9", "out").await.unwrap(),
            Some(json!(42))
        );
    }
}
