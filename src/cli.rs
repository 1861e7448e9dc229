//! Command-line interface argument parsing.
//!
//! Flags left unset fall through to `.rootcause.toml` and then to built-in
//! defaults, so most options here are `Option`s.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// RootCause - LLM-driven root cause analysis for bug reports
///
/// Reads one or more JSON bug reports, investigates the repository with a
/// local Ollama model using read-only git tools, has a second agent critique
/// the finding and refines it until approved or out of budget.
///
/// Examples:
///   rootcause --bug-report bug.json --repo https://github.com/owner/repo.git
///   rootcause -b bug.json --local ./my-project --branch main
///   rootcause -b a.json -b b.json --local . --format json -o rca.json
///   rootcause -b bug.json --local . --no-critique --max-rca-iterations 8
///   rootcause --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Bug report JSON file to analyze (repeat for batch mode)
    #[arg(
        short,
        long = "bug-report",
        value_name = "FILE",
        required_unless_present = "init_config"
    )]
    pub bug_report: Vec<PathBuf>,

    /// Repository URL to clone and investigate
    #[arg(short, long, value_name = "URL", env = "REPO_URL")]
    pub repo: Option<String>,

    /// Investigate an existing local checkout instead of cloning
    #[arg(long, value_name = "DIR")]
    pub local: Option<PathBuf>,

    /// Branch, tag or commit the tools read from
    #[arg(long, value_name = "REF", env = "DEFAULT_BRANCH")]
    pub branch: Option<String>,

    /// Ollama model to use
    ///
    /// The model must support tool calling (llama3.1+, qwen2.5, mistral-nemo).
    #[arg(short, long, env = "ROOTCAUSE_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, value_name = "URL", env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format for the report
    #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
    pub format: OutputFormat,

    /// Path to a config file (defaults to ./.rootcause.toml when present)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Model turns per analysis session
    #[arg(long, value_name = "COUNT", env = "MAX_RCA_ITERATIONS")]
    pub max_rca_iterations: Option<usize>,

    /// Critique rounds per bug report
    #[arg(long, value_name = "COUNT", env = "MAX_REFINEMENT_ITERATIONS")]
    pub max_refinement_iterations: Option<u32>,

    /// Skip the critique and refinement loop
    #[arg(long)]
    pub no_critique: bool,

    /// Temperature for generation (0.0 - 1.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Timeout for a single model request, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Wall-clock limit for one analysis session, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub session_timeout: Option<u64>,

    /// Bug reports analysed at once in batch mode
    #[arg(long, value_name = "COUNT")]
    pub concurrency: Option<usize>,

    /// Write a default .rootcause.toml and exit
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Markdown,
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check argument combinations that clap cannot express.
    ///
    /// Numeric bounds are checked later by `Config::validate`, after file
    /// values are merged in.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(repo) = self.repo.as_deref() {
            if self.local.is_none() && !repo.starts_with("https://") && !repo.starts_with("git@")
            {
                return Err("Repository URL must start with 'https://' or 'git@'".to_string());
            }
        }

        if let Some(ref local_path) = self.local {
            if !local_path.exists() {
                return Err(format!(
                    "Local directory does not exist: {}",
                    local_path.display()
                ));
            }
            if !local_path.is_dir() {
                return Err(format!(
                    "Local path is not a directory: {}",
                    local_path.display()
                ));
            }
        }

        for path in &self.bug_report {
            if !path.is_file() {
                return Err(format!("Bug report file not found: {}", path.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
