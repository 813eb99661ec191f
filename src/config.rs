use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::analysis::EnabledChecks;
use crate::quality::QualityThresholds;

/// Default config file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = ".merge-gate.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration loaded once per run.
///
/// Every table rejects unknown keys, so a typo fails the load instead of
/// silently falling back to a default. All tables are optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Which quality checks the Analysis collaborator runs and the aggregator scores
    #[serde(default)]
    pub checks: EnabledChecks,

    #[serde(default)]
    pub thresholds: QualityThresholds,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubConfig {
    /// GitHub API token. If None, falls back to GITHUB_TOKEN env var.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_github_api")]
    pub api_base_url: String,

    /// File-content requests in flight at once while downloading one PR
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base_url: default_github_api(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_max_concurrent_requests() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Base URL of the code-quality service
    #[serde(default = "default_analysis_url")]
    pub base_url: String,

    /// File extensions (without the dot) that are sent for analysis
    #[serde(default = "default_analyzable_extensions")]
    pub analyzable_extensions: Vec<String>,

    /// Files larger than this are skipped
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_analysis_url(),
            analyzable_extensions: default_analyzable_extensions(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_analysis_url() -> String {
    "http://localhost:8032".to_string()
}

fn default_analyzable_extensions() -> Vec<String> {
    vec!["py".to_string()]
}

fn default_max_file_bytes() -> usize {
    5 * 1024 * 1024
}

/// Parameters for the eligibility predicates.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
    pub require_quality_pass: bool,
    pub min_description_length: usize,
    pub max_changed_files: usize,
    pub require_tests: bool,
    /// Regexes matched against changed file paths
    pub test_path_patterns: Vec<String>,
    pub min_approvals: Option<u32>,
    pub max_open_comments: Option<u32>,
    pub no_changes_requested: bool,
    pub require_mergeable: bool,
    pub reject_drafts: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            require_quality_pass: true,
            min_description_length: 50,
            max_changed_files: 20,
            require_tests: true,
            test_path_patterns: vec![
                r"(^|/)tests?/".to_string(),
                r"(^|/)test_[^/]*\.py$".to_string(),
                r"_test\.py$".to_string(),
            ],
            min_approvals: None,
            max_open_comments: None,
            no_changes_requested: false,
            require_mergeable: false,
            reject_drafts: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    /// Total attempts per collaborator call, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Timeout applied to every individual collaborator call
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            call_timeout_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConcurrencyConfig {
    /// Worker pool size for the batch scheduler
    pub workers: usize,
    /// Concurrent file analyses per PR
    pub fan_out: usize,
    /// Bound of the pooled PR work queue
    pub queue_capacity: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            fan_out: 4,
            queue_capacity: 64,
        }
    }
}

impl Config {
    /// Load configuration from `.merge-gate.toml` in the current directory,
    /// or the defaults if that file doesn't exist.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Path::new(DEFAULT_CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Config::default()
        };

        if config.github.token.is_none() {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                config.github.token = Some(token);
            }
        }

        Ok(config)
    }

    /// Load from a specific path. The file must exist.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate a TOML document.
    pub fn parse(contents: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but can't drive a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(0.0..=10.0).contains(&self.thresholds.min_pylint_score) {
            return invalid("thresholds.min_pylint_score must be within 0..=10");
        }
        if self.thresholds.max_avg_complexity < 0.0 {
            return invalid("thresholds.max_avg_complexity must not be negative");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if self.retry.call_timeout_ms == 0 {
            return invalid("retry.call_timeout_ms must be positive");
        }
        if self.github.max_concurrent_requests == 0 {
            return invalid("github.max_concurrent_requests must be at least 1");
        }
        if self.concurrency.workers == 0 {
            return invalid("concurrency.workers must be at least 1");
        }
        if self.concurrency.fan_out == 0 {
            return invalid("concurrency.fan_out must be at least 1");
        }
        if self.concurrency.queue_capacity == 0 {
            return invalid("concurrency.queue_capacity must be at least 1");
        }
        if self.policy.require_tests && self.policy.test_path_patterns.is_empty() {
            return invalid("policy.require_tests needs at least one test_path_patterns entry");
        }
        for pattern in &self.policy.test_path_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::Invalid(format!(
                    "policy.test_path_patterns entry {pattern:?} is not a valid regex: {e}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve the GitHub token: config file value takes precedence,
    /// falls back to GITHUB_TOKEN env var.
    pub fn github_token(&self) -> Option<String> {
        self.github
            .token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
    }
}
