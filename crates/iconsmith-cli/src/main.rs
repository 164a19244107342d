use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iconsmith_contracts::events::{EventJournal, JournalEventKind};
use iconsmith_contracts::request::{GenerationRequest, Quality, DEFAULT_SIZE, DEFAULT_STYLE};
use iconsmith_contracts::task::ProgressUpdate;
use iconsmith_engine::{
    BatchCoordinator, BatchMode, BatchSummary, EngineConfig, GenerationContext, JournalSink,
    ProgressSink, TaskResult,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_PARTIAL_FAILURE: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Serialize)]
struct BatchStarted<'a> {
    prompt: &'a str,
    count: usize,
    out_dir: String,
}

#[derive(Debug, Serialize)]
struct BatchFinished<'a> {
    summary: BatchSummary,
    files: &'a [String],
}

#[derive(Debug, Parser)]
#[command(name = "iconsmith", version, about = "Generate app icons through remote image backends")]
struct Cli {
    /// JSON config file layered over ICONSMITH_* environment settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use the offline dry-run backend instead of remote providers.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Quota,
    Providers,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = DEFAULT_STYLE)]
    style: String,
    #[arg(long, default_value_t = DEFAULT_SIZE)]
    size: u32,
    #[arg(long, default_value = "standard")]
    quality: Quality,
    #[arg(long)]
    color_scheme: Option<String>,
    #[arg(long = "symbol")]
    symbols: Vec<String>,
    #[arg(long)]
    remove_background: bool,
    /// Number of variants to generate.
    #[arg(long, default_value_t = 1)]
    count: usize,
    /// Run up to N variants at once; defaults to the configured batch mode.
    #[arg(long)]
    parallel: Option<usize>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("iconsmith error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iconsmith=info,iconsmith_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(path) = &cli.config {
        config.apply_file(path)?;
    }
    if cli.dry_run {
        config.dry_run = true;
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::Generate(args) => run_generate(&config, args).await,
            Command::Quota => run_quota(&config).await,
            Command::Providers => run_providers(&config),
        }
    })
}

async fn run_generate(config: &EngineConfig, args: GenerateArgs) -> Result<i32> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let context = GenerationContext::from_config(config)?.into_shared();

    let mut request = GenerationRequest::new(args.prompt.clone())
        .with_style(args.style.clone())
        .with_size(args.size)
        .with_quality(args.quality)
        .with_symbols(args.symbols.clone())
        .with_remove_background(args.remove_background);
    if let Some(scheme) = &args.color_scheme {
        request = request.with_color_scheme(scheme.clone());
    }
    let requests = vec![request; args.count.max(1)];

    let mut coordinator = BatchCoordinator::new(context);
    if let Some(parallel) = args.parallel {
        coordinator = coordinator.with_mode(BatchMode::with_parallelism(parallel));
    }
    let journal = args
        .events
        .as_ref()
        .map(|path| EventJournal::new(path, coordinator.batch_id()));
    let mut coordinator = coordinator.with_sink(progress_printer(journal.clone()));
    if let Some(journal) = &journal {
        coordinator = coordinator.with_task_sink(Arc::new(JournalSink::new(journal.clone())));
        journal.record(
            JournalEventKind::BatchStarted,
            &BatchStarted {
                prompt: &args.prompt,
                count: requests.len(),
                out_dir: args.out.display().to_string(),
            },
        )?;
    }

    let cancel = coordinator.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling generation");
            cancel.cancel();
        }
    });
    let results = coordinator.run_batch(&requests).await;
    interrupt.abort();

    let written = write_results(&args.out, &results)?;
    let summary = BatchSummary::from_results(&results);
    if let Some(journal) = &journal {
        journal.record(
            JournalEventKind::BatchFinished,
            &BatchFinished {
                summary,
                files: &written,
            },
        )?;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "summary": summary,
            "files": written,
            "results": results.iter().map(result_json).collect::<Vec<Value>>(),
        }))?
    );

    if summary.cancelled > 0 {
        return Ok(EXIT_CANCELLED);
    }
    if summary.failed > 0 {
        return Ok(EXIT_PARTIAL_FAILURE);
    }
    Ok(0)
}

async fn run_quota(config: &EngineConfig) -> Result<i32> {
    let context = GenerationContext::from_config(config)?;
    let quota = context.quota().fetch().await?;
    println!("{}", serde_json::to_string_pretty(&quota)?);
    Ok(if quota.is_exhausted() { EXIT_PARTIAL_FAILURE } else { 0 })
}

fn run_providers(config: &EngineConfig) -> Result<i32> {
    let context = GenerationContext::from_config(config)?;
    let selector = context.selector();
    let routes = selector
        .routes()
        .map(|(style, provider)| {
            json!({
                "style": style,
                "provider": provider,
                "registered": context.client(provider).is_some(),
            })
        })
        .collect::<Vec<Value>>();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "registered": context.clients().ids(),
            "default": selector.default_provider(),
            "routes": routes,
        }))?
    );
    Ok(0)
}

fn progress_printer(journal: Option<EventJournal>) -> Arc<dyn ProgressSink> {
    let journal = journal.map(JournalSink::batch);
    Arc::new(move |update: &ProgressUpdate| {
        if let Some(journal) = &journal {
            journal.report(update);
        }
        let slot = update.slot.map(|slot| slot + 1).unwrap_or(1);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{slot}] {:>3.0}% {}",
            update.progress_fraction * 100.0,
            update.phase_label
        );
    })
}

fn write_results(out_dir: &Path, results: &[TaskResult]) -> Result<Vec<String>> {
    let mut written = Vec::new();
    for result in results.iter().filter_map(|result| result.as_ref().ok()) {
        let path = out_dir.join(result.file_name());
        fs::write(&path, &result.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), width = result.width, height = result.height, "icon written");
        written.push(path.display().to_string());
    }
    Ok(written)
}

fn result_json(result: &TaskResult) -> Value {
    match result {
        Ok(result) => json!({"status": "completed", "result": result}),
        Err(err) => json!({"status": err.code(), "error": err.to_string()}),
    }
}
