use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{AnalysisError, EnabledChecks, FileAnalyzer, FileQualitySignal};

/// HTTP adapter for the code-quality service (`POST /analyze-code-quality`).
///
/// The service only understands Python; anything else is reported as
/// [`AnalysisError::UnsupportedLanguage`] without a request.
pub struct QualityServiceClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    code: &'a str,
    evaluate_pylint: bool,
    evaluate_flake8: bool,
    evaluate_mypy: bool,
    evaluate_complexity: bool,
    evaluate_secrets: bool,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    pylint_score: f64,
    flake8_score: u32,
    mypy_score: u32,
    complexity_score: f64,
    #[serde(default)]
    secret_exposures: Vec<serde_json::Value>,
}

impl QualityServiceClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn is_supported(path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("py"))
    }
}

fn unavailable(err: reqwest::Error) -> AnalysisError {
    AnalysisError::ServiceUnavailable(err.to_string())
}

#[async_trait]
impl FileAnalyzer for QualityServiceClient {
    fn name(&self) -> &str {
        "quality-service"
    }

    #[instrument(skip(self, content, checks), fields(bytes = content.len()))]
    async fn analyze_file(
        &self,
        path: &str,
        content: &str,
        checks: &EnabledChecks,
    ) -> Result<FileQualitySignal, AnalysisError> {
        if !Self::is_supported(path) {
            return Err(AnalysisError::UnsupportedLanguage { path: path.to_string() });
        }

        let request = AnalyzeRequest {
            code: content,
            evaluate_pylint: checks.pylint,
            evaluate_flake8: checks.flake8,
            evaluate_mypy: checks.mypy,
            evaluate_complexity: checks.complexity,
            evaluate_secrets: checks.secrets,
        };

        debug!("posting file to quality service");
        let response = self
            .client
            .post(format!("{}/analyze-code-quality", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            let detail = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Rejected {
                path: path.to_string(),
                detail: format!("{status}: {}", detail.trim()),
            });
        }
        if !status.is_success() {
            return Err(AnalysisError::ServiceUnavailable(format!(
                "quality service returned {status}"
            )));
        }

        let body = response.json::<AnalyzeResponse>().await.map_err(unavailable)?;
        debug!(pylint = body.pylint_score, flake8 = body.flake8_score, "received quality signals");

        // The service fills disabled checks with neutral values; report them as not evaluated.
        Ok(FileQualitySignal {
            path: path.to_string(),
            pylint_score: checks.pylint.then_some(body.pylint_score),
            flake8_violations: checks.flake8.then_some(body.flake8_score),
            mypy_errors: checks.mypy.then_some(body.mypy_score),
            complexity: checks.complexity.then_some(body.complexity_score),
            secret_exposures: checks.secrets.then_some(body.secret_exposures.len() as u32),
            diagnostic: None,
        })
    }
}
