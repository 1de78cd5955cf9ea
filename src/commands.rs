//! CLI command bodies.
//!
//! Each `run_*` function loads what it needs from the [`Config`], performs
//! one command, and prints to stdout. Retrieval commands print JSON so
//! their output can be piped; migration and lint commands print tables.

use anyhow::Result;
use second_brain_core::drift::{detect_drift, pending_migrations};
use second_brain_core::knowledge::{ChunkStatus, KnowledgeType, SourceOrigin};
use second_brain_core::lifecycle::ChunkLifecycleService;
use second_brain_core::models::{Branch, Mode, Provider, RetrievalRequest};
use second_brain_core::provider::Embedder;

use crate::config::Config;
use crate::db;
use crate::ingest::{self, IngestOptions};
use crate::knowledge_store::SqliteKnowledgeStore;
use crate::migrate::{MigrationExecutor, MigrationResult, MigrationRunner};
use crate::policy;
use crate::recall::RunOptions;
use crate::schema::SchemaManager;
use crate::services::Services;
use crate::sqlite_executor::SqliteMigrationExecutor;
use crate::validation;
use crate::voyage::VoyageClient;

/// Options of `brain recall`.
pub struct RecallArgs {
    pub query: String,
    pub mode: Option<String>,
    pub top_k: Option<usize>,
    pub threshold: Option<f64>,
    pub provider: Option<String>,
    pub force_branch: Option<String>,
    pub trace: bool,
}

pub async fn run_recall(config: &Config, args: RecallArgs) -> Result<()> {
    let services = Services::from_config(config)?;
    let mode: Mode = match &args.mode {
        Some(m) => m.parse()?,
        None => config.retrieval.default_mode,
    };
    let mut request = RetrievalRequest::new(
        args.query,
        mode,
        args.top_k.unwrap_or(config.retrieval.top_k),
        args.threshold.unwrap_or(config.retrieval.threshold),
    )?;
    if let Some(p) = &args.provider {
        request = request.with_provider_override(p.parse::<Provider>()?);
    }
    let options = match &args.force_branch {
        Some(b) => RunOptions::forced(b.parse::<Branch>()?),
        None => RunOptions::default(),
    };

    let response = services.recall.run_with(&request, options).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if args.trace {
        let trace = response
            .routing_metadata
            .trace_id
            .as_deref()
            .zip(services.traces.as_ref())
            .and_then(|(id, traces)| traces.get_by_id(id));
        match trace {
            Some(trace) => println!("{}", serde_json::to_string_pretty(&trace)?),
            None => eprintln!("No trace recorded (tracing disabled in config)."),
        }
    }
    Ok(())
}

pub async fn run_chat(config: &Config, query: &str, session: Option<&str>) -> Result<()> {
    let services = Services::from_config(config)?;
    let reply = services
        .planner
        .chat(
            query,
            session,
            config.retrieval.default_mode,
            config.retrieval.top_k,
            config.retrieval.threshold,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

/// Options of `brain ingest`.
pub struct IngestArgs {
    pub dir: std::path::PathBuf,
    pub dry_run: bool,
    pub knowledge_type: Option<String>,
    pub origin: Option<String>,
}

/// Returns whether every file and chunk went through without error.
pub async fn run_ingest(config: &Config, args: IngestArgs) -> Result<bool> {
    let mut options = IngestOptions {
        dry_run: args.dry_run,
        ..Default::default()
    };
    if let Some(t) = &args.knowledge_type {
        options.knowledge_type = t.parse::<KnowledgeType>()?;
    }
    if let Some(o) = &args.origin {
        options.source_origin = o.parse::<SourceOrigin>()?;
    }

    let store = if args.dry_run {
        None
    } else {
        Some(SqliteKnowledgeStore::new(db::connect(config).await?))
    };
    let voyage = match (&config.voyage.api_key, args.dry_run) {
        (Some(key), false) if !key.is_empty() => {
            Some(VoyageClient::new(&config.voyage)?.with_embedding_enabled())
        }
        _ => None,
    };
    let embedder = voyage.as_ref().map(|v| v as &dyn Embedder);

    let report = ingest::ingest_markdown_dir(&args.dir, store.as_ref(), embedder, &options).await?;

    if report.dry_run {
        println!("ingest {} (dry-run)", args.dir.display());
    } else {
        println!("ingest {}", args.dir.display());
    }
    println!("  files: {}", report.files);
    println!("  chunks: {}", report.chunks);
    if !report.dry_run {
        println!("  documents created: {}", report.documents_created);
        println!("  chunks embedded: {}", report.chunks_embedded);
        println!("  chunks stored: {}", report.chunks_stored);
        println!("  duplicates: {}", report.duplicates);
    }
    if !report.errors.is_empty() {
        println!("  errors: {}", report.errors.len());
        for error in &report.errors {
            println!("    {}", error);
        }
    }
    println!("ok");

    if let Some(store) = store {
        store.pool().close().await;
    }
    Ok(report.errors.is_empty())
}

/// Move one chunk through the lifecycle.
pub async fn run_chunk_status(config: &Config, chunk_id: &str, status: &str) -> Result<()> {
    let to: ChunkStatus = status.parse()?;
    let store = SqliteKnowledgeStore::new(db::connect(config).await?);
    let outcome = ChunkLifecycleService::new(&store).transition(chunk_id, to).await?;
    println!("chunk {}: {} -> {}", outcome.chunk_id, outcome.from, outcome.to);
    Ok(())
}

async fn runner(config: &Config) -> Result<MigrationRunner<SqliteMigrationExecutor>> {
    let pool = db::connect(config).await?;
    let executor = SqliteMigrationExecutor::new(pool).await?;
    Ok(MigrationRunner::new(
        SchemaManager::new(config.migrations.dir.clone()),
        executor,
    ))
}

pub async fn run_migrate_status(config: &Config) -> Result<()> {
    let runner = runner(config).await?;
    let applied = runner.executor().applied_migrations().await?;
    let expected = runner.schema().scan_migrations()?;
    let pending = pending_migrations(&expected, &applied);
    let drift = detect_drift(&expected, &applied);

    println!("Second Brain — Migration Status");
    println!("===============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Migrations:  {}", config.migrations.dir.display());
    println!("  On disk:     {}", expected.len());
    println!("  Applied:     {}", applied.len());
    println!("  Pending:     {}", pending.len());

    if !pending.is_empty() {
        println!();
        println!("  Pending:");
        for m in &pending {
            println!("    {:>4}  {}", m.version, m.filename);
        }
    }

    if !drift.is_empty() {
        println!();
        println!("  Drift:");
        for item in &drift {
            let level = if item.drift_type.is_critical() {
                "CRITICAL"
            } else {
                "warning"
            };
            println!("    [{}] {}", level, item.message);
        }
    }
    Ok(())
}

fn print_migration_result(result: &MigrationResult) {
    let verb = if result.dry_run { "Would apply" } else { "Applied" };
    for m in &result.applied {
        println!("  {} {:>4}  {}", verb, m.version, m.filename);
    }
    for m in &result.rolled_back {
        println!("  Rolled back {:>4}  {}", m.version, m.filename);
    }
    match &result.error {
        Some(error) => eprintln!("Error: {}", error),
        None if result.applied.is_empty() && result.rolled_back.is_empty() => {
            println!("Nothing to do.")
        }
        None => {}
    }
}

/// Returns whether the apply succeeded.
pub async fn run_migrate_apply(config: &Config, dry_run: bool) -> Result<bool> {
    let result = runner(config).await?.apply_pending(dry_run).await?;
    print_migration_result(&result);
    Ok(result.success)
}

pub async fn run_migrate_rollback(config: &Config) -> Result<bool> {
    let result = runner(config).await?.rollback_last().await?;
    print_migration_result(&result);
    Ok(result.success)
}

/// Lint one file, or every migration in the configured directory.
/// Returns whether every file passed.
pub fn run_lint(config: &Config, file: Option<&std::path::Path>) -> Result<bool> {
    let reports = match file {
        Some(path) => vec![policy::lint_file(path)?],
        None => policy::lint_dir(&config.migrations.dir)?,
    };

    let mut passed = true;
    for report in &reports {
        let status = if report.passed() { "ok" } else { "FAIL" };
        println!("{:<6} {}", status, report.path.display());
        for finding in &report.findings {
            println!(
                "       line {:>4}  {:?}  {}: {}",
                finding.line, finding.severity, finding.rule, finding.message
            );
        }
        passed &= report.passed();
    }
    println!();
    println!(
        "{} file(s), {} failure(s), {} warning(s)",
        reports.len(),
        reports.iter().map(|r| r.failures().count()).sum::<usize>(),
        reports.iter().map(|r| r.warnings().count()).sum::<usize>()
    );
    Ok(passed)
}

/// Returns whether every selected scenario passed.
pub async fn run_scenarios(tag: Option<&str>) -> Result<bool> {
    let scenarios = match tag {
        Some(tag) => validation::scenarios_by_tag(tag),
        None => validation::all_scenarios(),
    };

    let mut passed = 0;
    println!(
        "{:<6} {:<46} {:<18} {:<10} {}",
        "ID", "DESCRIPTION", "BRANCH", "ACTION", "RESULT"
    );
    println!("{}", "-".repeat(92));
    for scenario in &scenarios {
        let outcome = validation::run_scenario(scenario).await?;
        if outcome.passed {
            passed += 1;
        }
        println!(
            "{:<6} {:<46} {:<18} {:<10} {}",
            outcome.id,
            scenario.description,
            outcome.branch.as_str(),
            outcome.action.as_str(),
            if outcome.passed { "pass" } else { "FAIL" }
        );
        for mismatch in &outcome.mismatches {
            println!("       {}", mismatch);
        }
    }
    println!();
    println!("{}/{} scenarios passed", passed, scenarios.len());
    Ok(passed == scenarios.len())
}
