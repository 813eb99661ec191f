pub mod client;

pub use client::QualityServiceClient;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Transient;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The service has no analyzers for this file type. Not a hard failure:
    /// the pipeline records an all-null signal for the file.
    #[error("Unsupported language for {path}")]
    UnsupportedLanguage { path: String },

    /// The service refused the request itself (4xx). Retrying won't help.
    #[error("Quality service rejected {path}: {detail}")]
    Rejected { path: String, detail: String },

    #[error("Quality service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Quality service call timed out after {0:?}")]
    Timeout(Duration),
}

impl Transient for AnalysisError {
    fn is_transient(&self) -> bool {
        matches!(self, AnalysisError::ServiceUnavailable(_) | AnalysisError::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        AnalysisError::Timeout(after)
    }
}

/// The independently toggleable quality checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EnabledChecks {
    pub pylint: bool,
    pub flake8: bool,
    pub mypy: bool,
    pub complexity: bool,
    pub secrets: bool,
}

impl Default for EnabledChecks {
    fn default() -> Self {
        Self::all()
    }
}

impl EnabledChecks {
    pub fn all() -> Self {
        Self {
            pylint: true,
            flake8: true,
            mypy: true,
            complexity: true,
            secrets: true,
        }
    }
}

/// Per-file quality signals.
///
/// `None` means the metric was not evaluated for this file; `Some(0)` means
/// it was evaluated and found nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileQualitySignal {
    pub path: String,
    /// Pylint score, 0 to 10
    pub pylint_score: Option<f64>,
    pub flake8_violations: Option<u32>,
    pub mypy_errors: Option<u32>,
    /// Average cyclomatic complexity of the file's functions
    pub complexity: Option<f64>,
    pub secret_exposures: Option<u32>,
    /// Why the file has no signals, when analysis didn't produce any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl FileQualitySignal {
    /// An all-null signal carrying the reason analysis produced nothing.
    pub fn unevaluated(path: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            diagnostic: Some(diagnostic.into()),
            ..Self::default()
        }
    }

    pub fn is_unevaluated(&self) -> bool {
        self.pylint_score.is_none()
            && self.flake8_violations.is_none()
            && self.mypy_errors.is_none()
            && self.complexity.is_none()
            && self.secret_exposures.is_none()
    }
}

/// The Analysis collaborator: runs the enabled checks on one file.
#[async_trait]
pub trait FileAnalyzer: Send + Sync {
    /// Human-readable name of this analyzer, used in logs.
    fn name(&self) -> &str;

    /// Analyze one file's content. Checks not in `checks` must come back as `None`.
    async fn analyze_file(
        &self,
        path: &str,
        content: &str,
        checks: &EnabledChecks,
    ) -> Result<FileQualitySignal, AnalysisError>;
}
