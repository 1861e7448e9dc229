//! RootCause - LLM-driven root cause analysis for bug reports
//!
//! A CLI tool that investigates a git repository with a tool-calling Ollama
//! model, has a second agent critique each finding, and refines it until the
//! critique approves or the refinement budget runs out.
//!
//! Exit codes:
//!   0 - Every result was approved or left unreviewed
//!   1 - Runtime or configuration error (bad config, clone failure, etc.)
//!   2 - At least one result was rejected after its refinement budget ran out

mod agent;
mod cli;
mod config;
mod error;
mod message;
mod models;
mod repo;
mod report;

use agent::{
    Agent, AnalysisAgent, ChatModel, CritiqueAgent, OllamaClient, Orchestrator, ToolRegistry,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use cli::Args;
use config::{Config, CONFIG_FILE_NAME};
use models::{BugAnalysis, BugReport, Report, ReportMetadata, ReviewStatus};
use repo::{ContentCache, GitInspector, RepositoryInspector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    let (mut config, config_source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(&args, config.general.verbose);

    info!("RootCause v{}", env!("CARGO_PKG_VERSION"));
    match &config_source {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => debug!("No config file found, using defaults"),
    }
    debug!("Arguments: {:?}", args);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        eprintln!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .rootcause.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    std::fs::write(path, Config::default_toml())
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Set [repository] url or local_path, then edit the model and agent limits.");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over the verbosity flags.
fn init_logging(args: &Args, verbose_by_default: bool) {
    let level = if verbose_by_default && !args.quiet {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Load configuration from an explicit path, the default location, or defaults.
fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    if let Some(ref config_path) = args.config {
        return Ok((Config::load(config_path)?, Some(config_path.clone())));
    }

    match Config::load_default() {
        Ok(Some(config)) => Ok((config, Some(PathBuf::from(CONFIG_FILE_NAME)))),
        Ok(None) => Ok((Config::default(), None)),
        Err(e) => {
            eprintln!("⚠️  Ignoring {}: {:#}", CONFIG_FILE_NAME, e);
            Ok((Config::default(), None))
        }
    }
}

/// Run the whole workflow. Returns the exit code (0 or 2).
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let bugs = load_bug_reports(&args.bug_report)?;
    info!("Loaded {} bug report(s)", bugs.len());

    // Step 1: Get the repository. The checkout must outlive every session.
    let checkout = match (&config.repository.local_path, &config.repository.url) {
        (Some(local), _) => {
            println!("📂 Using local repository: {}", local.display());
            repo::open_local_repository(local)?
        }
        (None, Some(url)) => {
            println!("📥 Cloning repository: {}", url);
            repo::clone_repository(url, config.clone_options(!args.quiet))?
        }
        (None, None) => bail!("no repository configured"),
    };
    let repository_label = checkout
        .web_url()
        .or_else(|| config.repository.url.clone())
        .unwrap_or_else(|| checkout.path().display().to_string());

    // Step 2: Pin the ref the tools read from
    let cache = Arc::new(ContentCache::new(config.repository.cache_capacity));
    let git = GitInspector::open(
        checkout.path(),
        &config.repository.branch,
        cache,
        config.repository.max_file_bytes,
    )
    .with_context(|| format!("Cannot read ref '{}'", config.repository.branch))?;
    let commit_id = git.commit_id();
    let reference = format!(
        "{} ({})",
        git.reference(),
        commit_id.get(..7).unwrap_or(&commit_id)
    );
    info!("Tools read from {}", reference);
    let inspector: Arc<dyn RepositoryInspector> = Arc::new(git);

    // Step 3: Wire the agents
    let model: Arc<dyn ChatModel> = Arc::new(
        OllamaClient::new(config.model_settings(), config.retry_policy())
            .context("Failed to create the model client")?,
    );
    let analyst: Arc<dyn Agent> = Arc::new(AnalysisAgent::new(
        model.clone(),
        ToolRegistry::new(inspector.clone()),
        config.analysis_config(),
    ));
    let critic: Arc<dyn Agent> = Arc::new(CritiqueAgent::new(
        model,
        inspector,
        config.critique_config(),
    ));
    let orchestrator = Orchestrator::new(analyst, critic, config.orchestrator_config());

    // Step 4: Analyse
    println!(
        "🤖 Analysing {} bug report(s) with {} (critique {})",
        bugs.len(),
        config.model.name,
        if config.agent.critique_enabled {
            "on"
        } else {
            "off"
        }
    );
    let outcomes = orchestrator.run_batch(&bugs).await;

    let analyses: Vec<BugAnalysis> = bugs
        .into_iter()
        .zip(outcomes)
        .map(|(bug_report, outcome)| match outcome {
            Ok(result) => BugAnalysis {
                bug_report,
                result: Some(result),
                error: None,
            },
            Err(e) => {
                warn!("'{}' failed: {}", bug_report.title, e);
                BugAnalysis {
                    bug_report,
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect();

    for analysis in &analyses {
        print_result_line(analysis);
    }

    // Step 5: Write the report
    let duration = start_time.elapsed().as_secs_f64();
    let metadata = ReportMetadata {
        repository: repository_label,
        reference,
        analysis_date: Utc::now(),
        model_used: config.model.name.clone(),
        critique_enabled: config.agent.critique_enabled,
        duration_seconds: duration,
    };
    let report = Report::new(metadata, analyses);

    let output = PathBuf::from(&config.general.output);
    report::write_report(&report, args.format, &output)?;

    let summary = &report.summary;
    println!("\n📊 Analysis Summary:");
    println!(
        "   ✅ Approved: {} | ❌ Rejected: {} | ⚪ Unreviewed: {} | ⚠️ Failed: {}",
        summary.approved, summary.rejected, summary.unreviewed, summary.failed
    );
    println!("   Duration: {:.1}s", duration);
    println!("\n✅ Report saved to: {}", output.display());

    match summary.exit_code() {
        1 => bail!("{} bug report(s) could not be analysed", summary.failed),
        2 => {
            eprintln!(
                "\n⛔ {} result(s) were not approved within the refinement budget (exit code 2).",
                summary.rejected
            );
            Ok(2)
        }
        code => Ok(code),
    }
}

fn load_bug_reports(paths: &[PathBuf]) -> Result<Vec<BugReport>> {
    if paths.is_empty() {
        bail!("no bug reports given: pass --bug-report <FILE>");
    }
    paths.iter().map(|path| BugReport::from_json_file(path)).collect()
}

fn print_result_line(analysis: &BugAnalysis) {
    let title = &analysis.bug_report.title;
    match &analysis.result {
        Some(result) => {
            let icon = match result.review_status {
                ReviewStatus::Approved => "✅",
                ReviewStatus::Rejected => "❌",
                ReviewStatus::Unreviewed => "⚪",
            };
            println!(
                "   {} {}: {} ({}, confidence {:.2}, {} attempt(s))",
                icon,
                title,
                result.root_cause.file_path,
                result.review_status,
                result.confidence_score,
                result.iterations
            );
        }
        None => println!("   ⚠️  {}: failed", title),
    }
}
