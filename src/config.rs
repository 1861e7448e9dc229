//! Configuration file handling.
//!
//! Settings come from `.rootcause.toml` and are overridden by command-line
//! flags. [`Config::validate`] runs before any analysis starts; a failure there
//! is the only error that stops the process before a session begins.

use crate::agent::{AnalysisConfig, CritiqueConfig, ModelSettings, OrchestratorConfig, RetryPolicy};
use crate::error::ConfigError;
use crate::repo::CloneOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".rootcause.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Analysis, critique and refinement settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Repository under investigation.
    #[serde(default)]
    pub repository: RepositoryConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Bug reports analysed at once in batch mode.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            concurrency: default_concurrency(),
        }
    }
}

fn default_output() -> String {
    "rootcause_report.md".to_string()
}

fn default_concurrency() -> usize {
    2
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Ollama model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Timeout for a single model request, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Retries for a failed model request.
    #[serde(default = "default_retries")]
    pub max_api_retries: u32,

    /// First retry delay; later delays grow exponentially.
    #[serde(default = "default_retry_delay")]
    pub retry_base_delay_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            max_api_retries: default_retries(),
            retry_base_delay_ms: default_retry_delay(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    300
}

fn default_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    1000
}

/// Agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model turns per analysis session.
    #[serde(default = "default_rca_iterations")]
    pub max_rca_iterations: usize,

    /// Critique rounds per bug report.
    #[serde(default = "default_refinement_iterations")]
    pub max_refinement_iterations: u32,

    #[serde(default = "default_true")]
    pub critique_enabled: bool,

    /// Adjusted confidence a critique needs before approving.
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,

    /// Repository calls the critique may make to check a claim.
    #[serde(default = "default_verification_calls")]
    pub max_verification_calls: usize,

    /// Conversation messages kept in the sliding window.
    #[serde(default = "default_context_messages")]
    pub max_context_messages: usize,

    /// Wall-clock limit for one analysis session, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timeout_seconds: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rca_iterations: default_rca_iterations(),
            max_refinement_iterations: default_refinement_iterations(),
            critique_enabled: true,
            approval_threshold: default_approval_threshold(),
            max_verification_calls: default_verification_calls(),
            max_context_messages: default_context_messages(),
            session_timeout_seconds: None,
        }
    }
}

fn default_rca_iterations() -> usize {
    15
}

fn default_refinement_iterations() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_approval_threshold() -> f64 {
    0.7
}

fn default_verification_calls() -> usize {
    2
}

fn default_context_messages() -> usize {
    20
}

/// Repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Remote URL to clone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Existing checkout to inspect in place. Wins over `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,

    /// Branch, tag or commit the tools read from.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// File contents kept in the shared read cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Largest file returned by `get_file_content`, in bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    /// Clone depth. Unset clones the full history, which blame needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_depth: Option<i32>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: None,
            local_path: None,
            branch: default_branch(),
            cache_capacity: default_cache_capacity(),
            max_file_bytes: default_max_file_bytes(),
            history_depth: None,
        }
    }
}

fn default_branch() -> String {
    "HEAD".to_string()
}

fn default_cache_capacity() -> usize {
    256
}

fn default_max_file_bytes() -> usize {
    100 * 1024
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load `.rootcause.toml` from the current directory, if present.
    pub fn load_default() -> Result<Option<Self>> {
        let path = Path::new(CONFIG_FILE_NAME);
        if path.exists() {
            Ok(Some(Self::load(path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge command-line arguments into the configuration.
    ///
    /// Only flags the user actually set (or whose environment variable is
    /// set) override file values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(model) = &args.model {
            self.model.name = model.clone();
        }
        if let Some(url) = &args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }

        if let Some(output) = &args.output {
            self.general.output = output.to_string_lossy().to_string();
        }
        if args.verbose {
            self.general.verbose = true;
        }
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }

        if let Some(iterations) = args.max_rca_iterations {
            self.agent.max_rca_iterations = iterations;
        }
        if let Some(iterations) = args.max_refinement_iterations {
            self.agent.max_refinement_iterations = iterations;
        }
        if args.no_critique {
            self.agent.critique_enabled = false;
        }
        if let Some(seconds) = args.session_timeout {
            self.agent.session_timeout_seconds = Some(seconds);
        }

        if let Some(url) = &args.repo {
            self.repository.url = Some(url.clone());
        }
        if let Some(local) = &args.local {
            self.repository.local_path = Some(local.clone());
        }
        if let Some(branch) = &args.branch {
            self.repository.branch = branch.clone();
        }
    }

    /// Check the merged configuration before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_url = self
            .repository
            .url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        if !has_url && self.repository.local_path.is_none() {
            return Err(ConfigError::MissingRepository);
        }

        let url = &self.model.ollama_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::InvalidModelUrl(url.clone()));
        }

        if !(0.0..=1.0).contains(&self.model.temperature) {
            return Err(out_of_range("model.temperature", "between 0.0 and 1.0"));
        }
        if self.model.timeout_seconds == 0 {
            return Err(out_of_range("model.timeout_seconds", "at least 1"));
        }
        if self.agent.max_rca_iterations == 0 {
            return Err(out_of_range("agent.max_rca_iterations", "at least 1"));
        }
        if !(0.0..=1.0).contains(&self.agent.approval_threshold) {
            return Err(out_of_range("agent.approval_threshold", "between 0.0 and 1.0"));
        }
        if self.agent.max_context_messages < 2 {
            return Err(out_of_range("agent.max_context_messages", "at least 2"));
        }
        if self.agent.session_timeout_seconds == Some(0) {
            return Err(out_of_range("agent.session_timeout_seconds", "at least 1"));
        }
        if self.general.concurrency == 0 {
            return Err(out_of_range("general.concurrency", "at least 1"));
        }
        if self.repository.cache_capacity == 0 {
            return Err(out_of_range("repository.cache_capacity", "at least 1"));
        }
        if self.repository.max_file_bytes == 0 {
            return Err(out_of_range("repository.max_file_bytes", "at least 1"));
        }
        if matches!(self.repository.history_depth, Some(depth) if depth < 1) {
            return Err(out_of_range("repository.history_depth", "at least 1"));
        }

        Ok(())
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            ollama_url: self.model.ollama_url.clone(),
            model_name: self.model.name.clone(),
            temperature: self.model.temperature,
            timeout_seconds: self.model.timeout_seconds,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.model.max_api_retries,
            Duration::from_millis(self.model.retry_base_delay_ms),
        )
    }

    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            max_iterations: self.agent.max_rca_iterations,
            max_context_messages: self.agent.max_context_messages,
            session_timeout: self.agent.session_timeout_seconds.map(Duration::from_secs),
        }
    }

    pub fn critique_config(&self) -> CritiqueConfig {
        CritiqueConfig {
            approval_threshold: self.agent.approval_threshold,
            max_verification_calls: self.agent.max_verification_calls,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            critique_enabled: self.agent.critique_enabled,
            max_refinement_iterations: self.agent.max_refinement_iterations,
            concurrency: self.general.concurrency,
        }
    }

    pub fn clone_options(&self, show_progress: bool) -> CloneOptions {
        let branch = match self.repository.branch.as_str() {
            "HEAD" => None,
            other => Some(other.to_string()),
        };
        CloneOptions {
            branch,
            depth: self.repository.history_depth,
            show_progress,
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn out_of_range(field: &'static str, constraint: &'static str) -> ConfigError {
    ConfigError::OutOfRange { field, constraint }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::tests::make_args;

    fn with_repository() -> Config {
        let mut config = Config::default();
        config.repository.url = Some("https://github.com/acme/stats".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.concurrency, 2);
        assert_eq!(config.model.max_api_retries, 5);
        assert_eq!(config.agent.max_rca_iterations, 15);
        assert_eq!(config.agent.max_refinement_iterations, 2);
        assert!(config.agent.critique_enabled);
        assert_eq!(config.repository.branch, "HEAD");
        assert_eq!(config.repository.max_file_bytes, 102_400);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[model]
name = "qwen2.5-coder:14b"
retry_base_delay_ms = 250

[agent]
max_rca_iterations = 8
critique_enabled = false
session_timeout_seconds = 600

[repository]
url = "https://github.com/acme/stats"
branch = "release-1.2"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.model.name, "qwen2.5-coder:14b");
        assert_eq!(config.model.retry_base_delay_ms, 250);
        assert_eq!(config.model.timeout_seconds, 300);
        assert_eq!(config.agent.max_rca_iterations, 8);
        assert!(!config.agent.critique_enabled);
        assert_eq!(
            config.analysis_config().session_timeout,
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.repository.branch, "release-1.2");
        assert_eq!(
            config.clone_options(false).branch.as_deref(),
            Some("release-1.2")
        );
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[model]"));
        assert!(toml_str.contains("[agent]"));
        assert!(toml_str.contains("max_rca_iterations = 15"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.agent.approval_threshold, 0.7);
    }

    #[test]
    fn test_validate_requires_repository() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingRepository)
        ));
        assert!(with_repository().validate().is_ok());

        let mut local = Config::default();
        local.repository.local_path = Some(PathBuf::from("."));
        assert!(local.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds() {
        let mut config = with_repository();
        config.model.ollama_url = "localhost:11434".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidModelUrl(_))
        ));

        let mut config = with_repository();
        config.agent.max_rca_iterations = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "agent.max_rca_iterations",
                ..
            })
        ));

        let mut config = with_repository();
        config.model.temperature = 1.5;
        assert!(config.validate().is_err());

        // Zero refinement iterations is a valid setting.
        let mut config = with_repository();
        config.agent.max_refinement_iterations = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_with_args() {
        let mut config = Config::default();
        config.agent.max_rca_iterations = 8;

        let mut args = make_args();
        args.no_critique = true;
        args.max_refinement_iterations = Some(4);
        args.branch = Some("main".to_string());
        config.merge_with_args(&args);

        // Unset flags leave file values alone.
        assert_eq!(config.agent.max_rca_iterations, 8);
        assert_eq!(config.model.name, "llama3.2:latest");
        assert!(!config.agent.critique_enabled);
        assert_eq!(config.agent.max_refinement_iterations, 4);
        assert_eq!(config.repository.branch, "main");
        assert_eq!(
            config.repository.url.as_deref(),
            Some("https://github.com/acme/stats")
        );

        let orchestrator = config.orchestrator_config();
        assert!(!orchestrator.critique_enabled);
        assert_eq!(orchestrator.max_refinement_iterations, 4);
    }
}
