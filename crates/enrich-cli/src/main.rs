//! CLI binary for validating, ordering and running enrichment pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use enrich_engine::{
    default_registry, AttributeStore, Catalog, ExecutionEngine, MemoryRecordStore, RecordStore,
    RunEvent, RunTracker, Severity,
};
use enrich_types::SystemClock;

#[derive(Parser)]
#[command(name = "enrich", version, about = "Derived-attribute pipelines for catalog entities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check module settings, chain structure and dependency cycles
    Validate {
        /// Path to the catalog JSON file
        catalog: PathBuf,
    },

    /// Print the execution order of an entity type's pipelines
    Order {
        catalog: PathBuf,

        #[arg(long)]
        entity_type: String,
    },

    /// Run one pipeline, or every pipeline of an entity type in dependency order
    Run {
        catalog: PathBuf,

        /// State file holding versioned values
        #[arg(long)]
        state: PathBuf,

        #[arg(long, conflicts_with = "entity_type", required_unless_present = "entity_type")]
        pipeline: Option<String>,

        #[arg(long)]
        entity_type: Option<String>,

        /// Entities to run (default: every catalog entity of the type)
        #[arg(long = "entity")]
        entities: Vec<String>,

        /// Recompute even when inputs are unchanged
        #[arg(long)]
        force: bool,
    },

    /// Run a pipeline's eval records
    Evals {
        catalog: PathBuf,

        #[arg(long)]
        pipeline: String,

        /// State file used when evals load inputs from the store
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Promote the pending value of one attribute into `approved`
    Approve {
        catalog: PathBuf,

        #[arg(long)]
        state: PathBuf,

        #[arg(long)]
        entity: String,

        #[arg(long)]
        attribute: String,
    },

    /// Set or clear a human override
    Override {
        catalog: PathBuf,

        #[arg(long)]
        state: PathBuf,

        #[arg(long)]
        entity: String,

        #[arg(long)]
        attribute: String,

        /// JSON value; plain text is stored as a string
        #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
        value: Option<String>,

        #[arg(long)]
        clear: bool,
    },

    /// List pipelines to re-run after attributes change
    Dependents {
        catalog: PathBuf,

        #[arg(long, num_args = 1.., required = true)]
        changed: Vec<String>,
    },

    /// Print stored versioned values
    Show {
        #[arg(long)]
        state: PathBuf,

        #[arg(long)]
        entity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Validate { catalog } => cmd_validate(&catalog).await?,
        Commands::Order {
            catalog,
            entity_type,
        } => cmd_order(&catalog, &entity_type).await?,
        Commands::Run {
            catalog,
            state,
            pipeline,
            entity_type,
            entities,
            force,
        } => {
            cmd_run(
                &catalog,
                &state,
                pipeline.as_deref(),
                entity_type.as_deref(),
                &entities,
                force,
            )
            .await?
        }
        Commands::Evals {
            catalog,
            pipeline,
            state,
        } => cmd_evals(&catalog, &pipeline, state.as_deref()).await?,
        Commands::Approve {
            catalog,
            state,
            entity,
            attribute,
        } => cmd_approve(&catalog, &state, &entity, &attribute).await?,
        Commands::Override {
            catalog,
            state,
            entity,
            attribute,
            value,
            clear,
        } => {
            let value = if clear { None } else { value.as_deref().map(parse_value) };
            cmd_override(&catalog, &state, &entity, &attribute, value).await?
        }
        Commands::Dependents { catalog, changed } => cmd_dependents(&catalog, &changed).await?,
        Commands::Show { state, entity } => cmd_show(&state, entity.as_deref()).await?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// State handling
// ---------------------------------------------------------------------------

/// Where versioned values live between invocations.
enum StateFile {
    Snapshot {
        path: PathBuf,
        records: Arc<MemoryRecordStore>,
    },
    #[cfg(feature = "sqlite")]
    Sqlite(Arc<enrich_engine::SqliteRecordStore>),
}

impl StateFile {
    /// `.db` / `.sqlite` paths open a database when built with `sqlite`;
    /// anything else is a JSON snapshot.
    async fn open(path: &Path) -> anyhow::Result<Self> {
        #[cfg(feature = "sqlite")]
        if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("db" | "sqlite")
        ) {
            let url = format!("sqlite:{}", path.display());
            let store = enrich_engine::SqliteRecordStore::connect(&url).await?;
            return Ok(StateFile::Sqlite(Arc::new(store)));
        }
        let records = MemoryRecordStore::load_snapshot(path).await?;
        Ok(StateFile::Snapshot {
            path: path.to_path_buf(),
            records: Arc::new(records),
        })
    }

    fn records(&self) -> Arc<dyn RecordStore> {
        match self {
            StateFile::Snapshot { records, .. } => records.clone(),
            #[cfg(feature = "sqlite")]
            StateFile::Sqlite(store) => store.clone(),
        }
    }

    async fn persist(&self) -> anyhow::Result<()> {
        match self {
            StateFile::Snapshot { path, records } => records.save_snapshot(path).await?,
            #[cfg(feature = "sqlite")]
            StateFile::Sqlite(_) => {}
        }
        Ok(())
    }
}

async fn load_catalog(path: &Path) -> anyhow::Result<Catalog> {
    Catalog::load(path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load catalog {}: {e}", path.display()))
}

/// Catalog, engine and state for commands that touch the store.
async fn open_engine(
    catalog_path: &Path,
    state: Option<&StateFile>,
) -> anyhow::Result<ExecutionEngine> {
    let catalog = load_catalog(catalog_path).await?;
    let records: Arc<dyn RecordStore> = match state {
        Some(s) => s.records(),
        None => Arc::new(MemoryRecordStore::new()),
    };
    let store = AttributeStore::new(
        records,
        Arc::new(SystemClock),
        catalog.engine.auto_approve_threshold,
    );
    catalog.seed(&store).await?;
    Ok(ExecutionEngine::new(
        Arc::new(default_registry()),
        Arc::new(store),
        Arc::new(catalog),
    ))
}

/// Parse a CLI value as JSON, falling back to a plain string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Prints batch progress to the terminal.
struct ConsoleTracker;

impl RunTracker for ConsoleTracker {
    fn report(&self, event: RunEvent) {
        match event {
            RunEvent::BatchStarted {
                pipeline_id,
                entity_count,
                ..
            } => println!("Running {pipeline_id} over {entity_count} entities"),
            RunEvent::EntityProcessed {
                entity_id,
                processed,
                total,
                ..
            } => println!("  [{processed}/{total}] {entity_id}"),
            RunEvent::EntitySkipped {
                entity_id, reason, ..
            } => println!("  skipped {entity_id}: {reason}"),
            RunEvent::BatchFailed {
                entity_id, error, ..
            } => println!("  FAILED {entity_id}: {error}"),
            RunEvent::BatchCompleted {
                stats, duration_ms, ..
            } => println!(
                "  done in {duration_ms}ms: processed={} skipped={} (up to date {}) tokens={}/{}",
                stats.processed,
                stats.skipped,
                stats.skipped_up_to_date,
                stats.tokens_in,
                stats.tokens_out
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let catalog = load_catalog(path).await?;
    let diagnostics = enrich_engine::validate(&catalog, &default_registry());

    if diagnostics.is_empty() {
        println!("Catalog is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        if diag.severity == Severity::Error {
            has_error = true;
        }
        println!("{diag}");
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_order(path: &Path, entity_type: &str) -> anyhow::Result<()> {
    let catalog = load_catalog(path).await?;
    let registry = default_registry();
    let resolver = enrich_engine::DependencyResolver::new(&catalog, &registry);
    let order = resolver.compute_execution_order(entity_type)?;

    if order.is_empty() {
        println!("No active pipelines for entity type '{entity_type}'");
        return Ok(());
    }
    for (i, pipeline) in order.iter().enumerate() {
        println!(
            "{}. {} -> {} (v{})",
            i + 1,
            pipeline.id,
            pipeline.target_attribute,
            pipeline.version
        );
    }
    Ok(())
}

async fn cmd_run(
    catalog_path: &Path,
    state_path: &Path,
    pipeline_id: Option<&str>,
    entity_type: Option<&str>,
    entities: &[String],
    force: bool,
) -> anyhow::Result<()> {
    let state = StateFile::open(state_path).await?;
    let engine = open_engine(catalog_path, Some(&state)).await?;
    let tracker = ConsoleTracker;

    let result = match (pipeline_id, entity_type) {
        (Some(id), _) => {
            let pipeline = engine.pipeline(id)?.clone();
            let ids = if entities.is_empty() {
                engine.catalog().entity_ids(&pipeline.entity_type)
            } else {
                entities.to_vec()
            };
            engine
                .execute_batch(&pipeline, &ids, Some(&tracker), force)
                .await
                .map(|stats| vec![(pipeline.id.clone(), stats)])
        }
        (None, Some(entity_type)) => {
            let ids = (!entities.is_empty()).then_some(entities);
            engine
                .execute_entity_type(entity_type, ids, Some(&tracker), force)
                .await
        }
        (None, None) => anyhow::bail!("Must specify either --pipeline or --entity-type"),
    };

    // Committed entities stay committed even when the batch aborts.
    state.persist().await?;
    tracing::debug!(state = %state_path.display(), "State saved");
    let results = result?;

    println!("\nRun complete");
    for (pipeline, stats) in &results {
        println!(
            "  {pipeline}: processed={} skipped={} up_to_date={}",
            stats.processed, stats.skipped, stats.skipped_up_to_date
        );
    }
    Ok(())
}

async fn cmd_evals(catalog_path: &Path, pipeline_id: &str, state_path: Option<&Path>) -> anyhow::Result<()> {
    let state = match state_path {
        Some(p) => Some(StateFile::open(p).await?),
        None => None,
    };
    let engine = open_engine(catalog_path, state.as_ref()).await?;
    let pipeline = engine.pipeline(pipeline_id)?.clone();
    let summary = engine.execute_evals(&pipeline).await;

    for result in &summary.results {
        let mark = if result.passing { "PASS" } else { "FAIL" };
        let actual = result
            .actual_output
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".into());
        match &result.error {
            Some(error) => println!("[{mark}] {}: {error}", result.eval_id),
            None => println!("[{mark}] {}: actual={actual}", result.eval_id),
        }
    }
    println!(
        "\n{} passing, {} failing, {} total",
        summary.passing, summary.failing, summary.total
    );

    if summary.failing > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_approve(catalog_path: &Path, state_path: &Path, entity: &str, attribute: &str) -> anyhow::Result<()> {
    let state = StateFile::open(state_path).await?;
    let engine = open_engine(catalog_path, Some(&state)).await?;
    let row = engine.store().approve_versioned(entity, attribute).await?;
    state.persist().await?;

    let approved = row
        .approved
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".into());
    println!("Approved {entity}.{attribute} = {approved}");
    Ok(())
}

async fn cmd_override(
    catalog_path: &Path,
    state_path: &Path,
    entity: &str,
    attribute: &str,
    value: Option<serde_json::Value>,
) -> anyhow::Result<()> {
    let state = StateFile::open(state_path).await?;
    let engine = open_engine(catalog_path, Some(&state)).await?;
    let row = engine.store().set_override(entity, attribute, value).await?;
    state.persist().await?;

    match row.override_value {
        Some(v) => println!("Override {entity}.{attribute} = {v}"),
        None => println!("Override cleared for {entity}.{attribute}"),
    }
    Ok(())
}

async fn cmd_dependents(catalog_path: &Path, changed: &[String]) -> anyhow::Result<()> {
    let catalog = load_catalog(catalog_path).await?;
    let registry = default_registry();
    let resolver = enrich_engine::DependencyResolver::new(&catalog, &registry);
    let pipelines = resolver.trigger_dependents(changed);

    if pipelines.is_empty() {
        println!("No pipelines depend on {}", changed.join(", "));
    }
    for pipeline in pipelines {
        println!("{} ({})", pipeline.id, pipeline.display_name());
    }
    Ok(())
}

async fn cmd_show(state_path: &Path, entity: Option<&str>) -> anyhow::Result<()> {
    let state = StateFile::open(state_path).await?;
    let rows = state.records().all().await?;

    let render = |v: &Option<serde_json::Value>| v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into());
    let wanted = |entity_id: &str| match entity {
        Some(e) => entity_id == e,
        None => true,
    };
    for row in rows.iter().filter(|r| wanted(&r.entity_id)) {
        println!(
            "{}.{} [{:?}] current={} approved={} override={} effective={}",
            row.entity_id,
            row.attribute_id,
            row.state(),
            render(&row.current),
            render(&row.approved),
            render(&row.override_value),
            row.effective_value()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}
