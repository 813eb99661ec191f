//! Quality Aggregator: folds per-file signals into one PR-level report.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::{EnabledChecks, FileQualitySignal};
use crate::pr::PullRequestRef;

/// Per-metric limits a PR must meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QualityThresholds {
    /// Mean pylint score must be at least this
    pub min_pylint_score: f64,
    /// Total flake8 violations must not exceed this
    pub max_violations: u32,
    /// Total mypy errors must not exceed this
    pub max_errors: u32,
    /// Mean complexity must not exceed this
    pub max_avg_complexity: f64,
    /// Total exposed secrets must not exceed this
    pub max_exposures: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_pylint_score: 7.0,
            max_violations: 10,
            max_errors: 3,
            max_avg_complexity: 5.0,
            max_exposures: 2,
        }
    }
}

/// Pass/fail per metric. Disabled metrics and metrics with no contributing
/// files always pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricChecks {
    pub pylint_pass: bool,
    pub flake8_pass: bool,
    pub mypy_pass: bool,
    pub complexity_pass: bool,
    pub secrets_pass: bool,
}

impl MetricChecks {
    pub fn all_pass(&self) -> bool {
        self.pylint_pass
            && self.flake8_pass
            && self.mypy_pass
            && self.complexity_pass
            && self.secrets_pass
    }

    /// Names of failing metrics, in a fixed order.
    pub fn failing(&self) -> Vec<&'static str> {
        [
            ("pylint", self.pylint_pass),
            ("flake8", self.flake8_pass),
            ("mypy", self.mypy_pass),
            ("complexity", self.complexity_pass),
            ("secrets", self.secrets_pass),
        ]
        .into_iter()
        .filter(|(_, passed)| !passed)
        .map(|(name, _)| name)
        .collect()
    }
}

/// PR-level quality summary.
///
/// An aggregate is `None` when its metric is disabled or no file contributed
/// a value for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedQualityReport {
    pub pr: PullRequestRef,
    /// Files that produced at least one signal
    pub files_analyzed: usize,
    /// Files that produced no signal at all
    pub files_unevaluated: usize,
    pub pylint_mean: Option<f64>,
    pub flake8_total: Option<u64>,
    pub mypy_total: Option<u64>,
    pub complexity_mean: Option<f64>,
    pub secrets_total: Option<u64>,
    pub thresholds: MetricChecks,
    pub overall_pass: bool,
}

/// Mean of the values, summed in a canonical order so the result does not
/// depend on the order files were analyzed in.
fn order_independent_mean(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let sum: f64 = values.iter().sum();
    Some(sum / values.len() as f64)
}

fn total<I: Iterator<Item = Option<u32>>>(values: I) -> Option<u64> {
    values
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0) + u64::from(v)))
}

/// Combine per-file signals into one report for `pr`.
pub fn aggregate(
    pr: &PullRequestRef,
    signals: &[FileQualitySignal],
    thresholds: &QualityThresholds,
    checks: &EnabledChecks,
) -> AggregatedQualityReport {
    let pylint_mean = checks
        .pylint
        .then(|| order_independent_mean(signals.iter().filter_map(|s| s.pylint_score).collect()))
        .flatten();
    let flake8_total = checks
        .flake8
        .then(|| total(signals.iter().map(|s| s.flake8_violations)))
        .flatten();
    let mypy_total = checks
        .mypy
        .then(|| total(signals.iter().map(|s| s.mypy_errors)))
        .flatten();
    let complexity_mean = checks
        .complexity
        .then(|| order_independent_mean(signals.iter().filter_map(|s| s.complexity).collect()))
        .flatten();
    let secrets_total = checks
        .secrets
        .then(|| total(signals.iter().map(|s| s.secret_exposures)))
        .flatten();

    let metric_checks = MetricChecks {
        pylint_pass: pylint_mean.map_or(true, |m| m >= thresholds.min_pylint_score),
        flake8_pass: flake8_total.map_or(true, |t| t <= u64::from(thresholds.max_violations)),
        mypy_pass: mypy_total.map_or(true, |t| t <= u64::from(thresholds.max_errors)),
        complexity_pass: complexity_mean.map_or(true, |m| m <= thresholds.max_avg_complexity),
        secrets_pass: secrets_total.map_or(true, |t| t <= u64::from(thresholds.max_exposures)),
    };

    let files_unevaluated = signals.iter().filter(|s| s.is_unevaluated()).count();
    let report = AggregatedQualityReport {
        pr: pr.clone(),
        files_analyzed: signals.len() - files_unevaluated,
        files_unevaluated,
        pylint_mean,
        flake8_total,
        mypy_total,
        complexity_mean,
        secrets_total,
        thresholds: metric_checks,
        overall_pass: metric_checks.all_pass(),
    };
    debug!(
        pr = %pr,
        overall_pass = report.overall_pass,
        failing = ?metric_checks.failing(),
        "aggregated quality signals"
    );
    report
}
