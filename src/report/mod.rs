pub mod types;

pub use types::{BatchSummary, Decision};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use colored::Colorize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::eligibility::EligibilityVerdict;
use crate::scheduler::{BatchJob, EntryOutcome, RepoStatus};

/// File name of the per-PR JSON evaluation.
pub const EVALUATION_FILE: &str = "merge_evaluation.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    FileWrite(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The Report Sink collaborator: receives each verdict as it is produced.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, verdict: &EligibilityVerdict) -> Result<(), ReportError>;
}

/// Prints a colored block per PR to stdout.
#[derive(Debug, Default)]
pub struct TerminalSink;

#[async_trait]
impl ReportSink for TerminalSink {
    async fn deliver(&self, verdict: &EligibilityVerdict) -> Result<(), ReportError> {
        print!("{}", format_verdict(verdict));
        Ok(())
    }
}

/// Writes `{root}/{owner}/{repo}/{number}/merge_evaluation.json` per PR.
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root: PathBuf,
}

impl JsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, verdict: &EligibilityVerdict) -> PathBuf {
        let pr = &verdict.pr;
        self.root
            .join(&pr.repo.owner)
            .join(&pr.repo.name)
            .join(pr.number.to_string())
            .join(EVALUATION_FILE)
    }
}

#[async_trait]
impl ReportSink for JsonDirSink {
    #[instrument(skip_all, fields(pr = %verdict.pr))]
    async fn deliver(&self, verdict: &EligibilityVerdict) -> Result<(), ReportError> {
        let path = self.path_for(verdict);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(verdict)?;
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "wrote evaluation");
        Ok(())
    }
}

/// Delivers to several sinks in order; the first error wins, later sinks still run.
pub struct FanOutSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Box<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ReportSink for FanOutSink {
    async fn deliver(&self, verdict: &EligibilityVerdict) -> Result<(), ReportError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(verdict).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Discards every verdict.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl ReportSink for NullSink {
    async fn deliver(&self, _verdict: &EligibilityVerdict) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Output the batch summary to the terminal (default) or to a markdown file.
#[instrument(skip(job), fields(entries = job.entries.len()))]
pub fn output(job: &BatchJob, output_path: Option<&Path>) -> Result<(), ReportError> {
    match output_path {
        None => {
            debug!("writing summary to terminal");
            print_batch_summary(job);
            Ok(())
        }
        Some(path) => {
            debug!(path = %path.display(), "writing summary to file");
            write_batch_summary(job, path)
        }
    }
}

/// Terminal block for one verdict:
///
/// org/repo#42: "Add login flow"
/// Author: alice | Files analyzed: 3
/// Quality: pylint 8.50 | flake8 12 | mypy 0 | complexity 4.00 | secrets 0
/// ═══ INELIGIBLE ═══
///   • Code quality checks failed: flake8
fn format_verdict(verdict: &EligibilityVerdict) -> String {
    let report = &verdict.report;
    let decision = if verdict.eligible {
        Decision::Eligible
    } else {
        Decision::Ineligible
    };

    let mut out = String::new();
    out.push('\n');
    out.push_str(&format!("{}: \"{}\"\n", verdict.pr, verdict.pr.title));
    out.push_str(&format!(
        "Author: {} | Files analyzed: {}",
        verdict.pr.author, report.files_analyzed
    ));
    if report.files_unevaluated > 0 {
        out.push_str(&format!(" ({} without signals)", report.files_unevaluated));
    }
    out.push('\n');
    out.push_str(&format!(
        "Quality: pylint {} | flake8 {} | mypy {} | complexity {} | secrets {}\n",
        fmt_mean(report.pylint_mean),
        fmt_total(report.flake8_total),
        fmt_total(report.mypy_total),
        fmt_mean(report.complexity_mean),
        fmt_total(report.secrets_total),
    ));
    out.push_str(&format!("═══ {} ═══\n", colorize_decision(decision)));
    for reason in &verdict.reasons {
        out.push_str(&format!("  • {reason}\n"));
    }
    out
}

fn fmt_mean(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"))
}

fn fmt_total(value: Option<u64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

/// Print counts, failed repositories and failed PRs.
pub fn print_batch_summary(job: &BatchJob) {
    let summary = BatchSummary::from(job);

    println!();
    println!("═══ Batch Summary ═══");
    println!(
        "Repositories: {} ({} failed, {} interrupted, {} not started)",
        summary.repositories,
        summary.repositories_failed,
        summary.repositories_interrupted,
        summary.repositories_pending
    );
    println!(
        "PRs: {} | {}: {} | {}: {} | {}: {} | {}: {}",
        summary.prs,
        colorize_decision(Decision::Eligible),
        summary.eligible,
        colorize_decision(Decision::Ineligible),
        summary.ineligible,
        colorize_decision(Decision::Failed),
        summary.failed,
        colorize_decision(Decision::Cancelled),
        summary.cancelled
    );

    for repo in job.repositories.iter().filter(|r| r.status == RepoStatus::Failed) {
        println!("  • {}: {}", repo.repo, repo.error.as_deref().unwrap_or("failed"));
    }
    for entry in &job.entries {
        if let EntryOutcome::Failed { kind, reason } = &entry.outcome {
            println!("  • {} [{}] {}", entry.pr, kind, reason);
        }
    }
    if job.cancelled {
        println!("{}", "Batch was cancelled before completion".yellow());
    }
    println!();
}

/// Write the batch summary as a markdown file.
pub fn write_batch_summary(job: &BatchJob, path: &Path) -> Result<(), ReportError> {
    std::fs::write(path, render_markdown(job))?;
    Ok(())
}

fn render_markdown(job: &BatchJob) -> String {
    let summary = BatchSummary::from(job);
    let mut md = String::new();

    md.push_str("# Merge Eligibility Summary\n\n");
    md.push_str(&format!(
        "**PRs:** {} | **Eligible:** {} | **Ineligible:** {} \
         | **Failed:** {} | **Cancelled:** {}\n\n",
        summary.prs, summary.eligible, summary.ineligible, summary.failed, summary.cancelled
    ));
    if job.cancelled {
        md.push_str("> Batch was cancelled before completion.\n\n");
    }

    for repo in &job.repositories {
        md.push_str(&format!("## {}\n\n", repo.repo));
        md.push_str(&format!(
            "**Status: {:?}** | discovered {} | completed {}",
            repo.status, repo.discovered, repo.completed
        ));
        if repo.cancelled > 0 {
            md.push_str(&format!(" | cancelled {}", repo.cancelled));
        }
        md.push_str("\n\n");
        if let Some(error) = &repo.error {
            md.push_str(&format!("- **[error]** {error}\n\n"));
            continue;
        }

        let mut entries: Vec<_> = job.entries_for(&repo.repo).collect();
        if entries.is_empty() {
            md.push_str("No PRs evaluated.\n\n");
            continue;
        }
        entries.sort_by_key(|e| e.pr.number);
        for entry in entries {
            let decision = Decision::of(entry);
            md.push_str(&format!("- **[{}]** #{} {}\n", decision, entry.pr.number, entry.pr.title));
            match &entry.outcome {
                EntryOutcome::Verdict(verdict) => {
                    for reason in &verdict.reasons {
                        md.push_str(&format!("  - {reason}\n"));
                    }
                }
                EntryOutcome::Failed { kind, reason } => {
                    md.push_str(&format!("  - `{kind}`: {reason}\n"));
                }
            }
        }
        md.push('\n');
    }
    md
}

/// Helper to colorize a decision for terminal output.
fn colorize_decision(decision: Decision) -> colored::ColoredString {
    match decision {
        Decision::Eligible => decision.to_string().green().bold(),
        Decision::Ineligible => decision.to_string().red().bold(),
        Decision::Failed => decision.to_string().magenta().bold(),
        Decision::Cancelled => decision.to_string().yellow().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{EnabledChecks, FileQualitySignal};
    use crate::pipeline::FailureKind;
    use crate::pr::RepoRef;
    use crate::quality::tests::sample_pr;
    use crate::quality::{aggregate, QualityThresholds};
    use crate::scheduler::{BatchEntry, RepoProgress};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn verdict(eligible: bool) -> EligibilityVerdict {
        let signals = vec![FileQualitySignal {
            path: "app.py".to_string(),
            pylint_score: Some(8.5),
            flake8_violations: Some(12),
            mypy_errors: Some(0),
            complexity: Some(4.0),
            secret_exposures: Some(0),
            diagnostic: None,
        }];
        let report = aggregate(
            &sample_pr(),
            &signals,
            &QualityThresholds::default(),
            &EnabledChecks::all(),
        );
        EligibilityVerdict {
            pr: sample_pr(),
            eligible,
            reasons: if eligible {
                vec![]
            } else {
                vec!["Code quality checks failed: flake8".to_string()]
            },
            passed: vec![],
            report,
        }
    }

    fn sample_job() -> BatchJob {
        let repo = sample_pr().repo;
        let broken = RepoRef::new("org", "broken");
        let mut failed_pr = sample_pr();
        failed_pr.number = 7;
        BatchJob {
            repositories: vec![
                RepoProgress {
                    repo: repo.clone(),
                    status: RepoStatus::Done,
                    discovered: 2,
                    completed: 2,
                    cancelled: 0,
                    error: None,
                },
                RepoProgress {
                    repo: broken,
                    status: RepoStatus::Failed,
                    discovered: 0,
                    completed: 0,
                    cancelled: 0,
                    error: Some("DiscoveryFailure: Repository not found: org/broken".to_string()),
                },
            ],
            entries: vec![
                BatchEntry {
                    pr: sample_pr(),
                    outcome: EntryOutcome::Verdict(verdict(false)),
                },
                BatchEntry {
                    pr: failed_pr,
                    outcome: EntryOutcome::Failed {
                        kind: FailureKind::DownloadFailure,
                        reason: "PR not found".to_string(),
                    },
                },
            ],
            cancelled: false,
        }
    }

    #[test]
    fn test_format_verdict_lists_reasons() {
        let text = format_verdict(&verdict(false));
        assert!(text.contains("org/repo#42: \"Add login flow\""));
        assert!(text.contains("pylint 8.50"));
        assert!(text.contains("flake8 12"));
        assert!(text.contains("INELIGIBLE"));
        assert!(text.contains("• Code quality checks failed: flake8"));
    }

    #[test]
    fn test_format_verdict_marks_missing_metrics() {
        let mut v = verdict(true);
        v.report.mypy_total = None;
        let text = format_verdict(&v);
        assert!(text.contains("mypy n/a"));
        assert!(text.contains("ELIGIBLE"));
        assert!(!text.contains("INELIGIBLE"));
        assert!(!text.contains('•'));
    }

    #[test]
    fn test_summary_counts() {
        let summary = BatchSummary::from(&sample_job());
        assert_eq!(summary.repositories, 2);
        assert_eq!(summary.repositories_failed, 1);
        assert_eq!(summary.prs, 2);
        assert_eq!(summary.ineligible, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.eligible, 0);
    }

    #[test]
    fn test_write_batch_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.md");
        write_batch_summary(&sample_job(), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# Merge Eligibility Summary"));
        assert!(content.contains("**Ineligible:** 1"));
        assert!(content.contains("## org/repo"));
        assert!(content.contains("- **[INELIGIBLE]** #42 Add login flow"));
        assert!(content.contains("`DownloadFailure`: PR not found"));
        assert!(content.contains("## org/broken"));
        assert!(content.contains("Repository not found"));
    }

    #[test]
    fn test_summary_marks_interrupted_repository() {
        let mut job = sample_job();
        let mut stopped = sample_pr();
        stopped.number = 43;
        job.entries.push(BatchEntry {
            pr: stopped,
            outcome: EntryOutcome::Failed {
                kind: FailureKind::Cancelled,
                reason: "cancelled before it started".to_string(),
            },
        });
        let repo = &mut job.repositories[0];
        repo.discovered = 3;
        repo.completed = 3;
        repo.cancelled = 1;
        repo.status = RepoStatus::Running;
        job.cancelled = true;

        let summary = BatchSummary::from(&job);
        assert_eq!(summary.repositories_interrupted, 1);
        assert_eq!(summary.cancelled, 1);

        let md = render_markdown(&job);
        assert!(md.contains("**Status: Running** | discovered 3 | completed 3 | cancelled 1"));
        assert!(md.contains("- **[CANCELLED]** #43"));
        assert!(md.contains("> Batch was cancelled before completion."));
    }

    #[test]
    fn test_output_to_terminal() {
        // Should not panic
        output(&sample_job(), None).unwrap();
    }

    #[tokio::test]
    async fn test_json_dir_sink_writes_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonDirSink::new(dir.path());
        let v = verdict(false);

        sink.deliver(&v).await.unwrap();

        let path = dir.path().join("org/repo/42").join(EVALUATION_FILE);
        assert_eq!(sink.path_for(&v), path);
        let raw = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["eligible"], false);
        assert_eq!(json["reasons"][0], "Code quality checks failed: flake8");
        assert_eq!(json["report"]["thresholds"]["flake8_pass"], false);
        assert_eq!(json["report"]["flake8_total"], 12);
    }

    #[tokio::test]
    async fn test_json_dir_sink_reports_write_errors() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = JsonDirSink::new(&blocker).deliver(&verdict(true)).await.unwrap_err();
        assert!(matches!(err, ReportError::FileWrite(_)));
    }

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl ReportSink for CountingSink {
        async fn deliver(&self, _verdict: &EligibilityVerdict) -> Result<(), ReportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fan_out_sink_continues_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = FanOutSink::new(vec![
            Box::new(JsonDirSink::new(&blocker)),
            Box::new(CountingSink(count.clone())),
        ]);

        assert!(sink.deliver(&verdict(true)).await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
