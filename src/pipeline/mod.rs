//! PR Pipeline: download → analyze → aggregate → evaluate → report, for one PR.

pub mod state;

pub use state::PipelineState;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::analysis::{AnalysisError, EnabledChecks, FileAnalyzer, FileQualitySignal};
use crate::config::Config;
use crate::eligibility::{self, EligibilityVerdict, Policy, PrMetadata};
use crate::github::{DownloadError, PrSource};
use crate::pr::{ChangeType, ChangedFile, PullRequestRef};
use crate::quality::{self, QualityThresholds};
use crate::report::ReportSink;
use crate::retry::{BackoffPolicy, RetryError};
use crate::scheduler::CancelSignal;

/// Failure category recorded in batch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    DiscoveryFailure,
    DownloadFailure,
    AnalysisFailure,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::DiscoveryFailure => "DiscoveryFailure",
            FailureKind::DownloadFailure => "DownloadFailure",
            FailureKind::AnalysisFailure => "AnalysisFailure",
            FailureKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Download failed for {pr} after {attempts} attempt(s): {source}")]
    DownloadFailure {
        pr: PullRequestRef,
        attempts: u32,
        #[source]
        source: DownloadError,
    },

    #[error("Analysis failed for all {failed_files} file(s) of {pr}: {last_error}")]
    AnalysisFailure {
        pr: PullRequestRef,
        failed_files: usize,
        last_error: String,
    },

    #[error("Processing of {pr} was cancelled")]
    Cancelled { pr: PullRequestRef },
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::DownloadFailure { .. } => FailureKind::DownloadFailure,
            PipelineError::AnalysisFailure { .. } => FailureKind::AnalysisFailure,
            PipelineError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}

/// Static knobs of a pipeline, loaded once per run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub checks: EnabledChecks,
    pub thresholds: QualityThresholds,
    pub backoff: BackoffPolicy,
    /// Concurrent file analyses per PR
    pub fan_out: usize,
    /// Lowercase extensions sent for analysis; empty means every file
    pub analyzable_extensions: Vec<String>,
    pub max_file_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            checks: config.checks,
            thresholds: config.thresholds.clone(),
            backoff: BackoffPolicy::from_config(&config.retry),
            fan_out: config.concurrency.fan_out.max(1),
            analyzable_extensions: config
                .analysis
                .analyzable_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_file_bytes: config.analysis.max_file_bytes,
        }
    }

    fn should_analyze(&self, file: &ChangedFile) -> bool {
        if file.change_type == ChangeType::Removed || file.content.is_empty() {
            return false;
        }
        if file.content.len() > self.max_file_bytes {
            warn!(
                path = %file.path,
                bytes = file.content.len(),
                "file too large, skipping analysis"
            );
            return false;
        }
        if self.analyzable_extensions.is_empty() {
            return true;
        }
        Path::new(&file.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.analyzable_extensions.iter().any(|allowed| *allowed == ext)
            })
    }
}

/// Result of analyzing one file.
enum FileOutcome {
    Analyzed(FileQualitySignal),
    /// Unsupported language: all-null signal, not a failure
    Skipped(FileQualitySignal),
    /// Service failure after retries: all-null signal, counts as failed
    Failed(FileQualitySignal),
    Cancelled,
}

/// Per-PR bookkeeping: current state plus every state visited.
struct PipelineRun {
    pr: PullRequestRef,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl PipelineRun {
    fn new(pr: PullRequestRef) -> Self {
        Self {
            pr,
            state: PipelineState::Discovered,
            history: vec![PipelineState::Discovered],
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid pipeline transition {} -> {}",
            self.state,
            next
        );
        debug!(pr = %self.pr, from = %self.state, to = %next, "pipeline transition");
        self.state = next;
        self.history.push(next);
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        self.transition(PipelineState::Failed);
        match &err {
            PipelineError::Cancelled { .. } => info!(pr = %self.pr, "pipeline cancelled"),
            other => error!(pr = %self.pr, kind = %other.kind(), error = %other, "pipeline failed"),
        }
        err
    }

    fn cancelled(&mut self) -> PipelineError {
        let pr = self.pr.clone();
        self.fail(PipelineError::Cancelled { pr })
    }
}

/// Drives PRs through the collaborators and the decision engine.
///
/// Shared by all workers of a batch; each [`process`](Self::process) call
/// owns its own intermediate artifacts.
pub struct PrPipeline {
    source: Arc<dyn PrSource>,
    analyzer: Arc<dyn FileAnalyzer>,
    sink: Arc<dyn ReportSink>,
    policy: Arc<Policy>,
    settings: PipelineSettings,
    cancel: CancelSignal,
}

impl PrPipeline {
    pub fn new(
        source: Arc<dyn PrSource>,
        analyzer: Arc<dyn FileAnalyzer>,
        sink: Arc<dyn ReportSink>,
        policy: Arc<Policy>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            analyzer,
            sink,
            policy,
            settings,
            cancel: CancelSignal::never(),
        }
    }

    /// Observe `cancel` between collaborator calls.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Evaluate one PR end to end.
    pub async fn process(&self, pr: PullRequestRef) -> Result<EligibilityVerdict, PipelineError> {
        self.process_traced(pr).await.0
    }

    /// Like [`process`](Self::process), also returning every state visited.
    pub async fn process_traced(
        &self,
        pr: PullRequestRef,
    ) -> (Result<EligibilityVerdict, PipelineError>, Vec<PipelineState>) {
        let span = info_span!("pipeline", pr = %pr);
        let mut run = PipelineRun::new(pr);
        let result = self.drive(&mut run).instrument(span).await;
        (result, run.history)
    }

    async fn drive(&self, run: &mut PipelineRun) -> Result<EligibilityVerdict, PipelineError> {
        let pr = run.pr.clone();

        run.transition(PipelineState::Downloading);
        let download = match self
            .settings
            .backoff
            .run("download_pr_files", &self.cancel, || self.source.download_pr_files(&pr))
            .await
        {
            Ok(download) => download,
            Err(RetryError::Cancelled) => return Err(run.cancelled()),
            Err(RetryError::Permanent(source)) => {
                return Err(run.fail(PipelineError::DownloadFailure { pr, attempts: 1, source }))
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                return Err(run.fail(PipelineError::DownloadFailure {
                    pr,
                    attempts,
                    source: last,
                }))
            }
        };
        if self.cancel.is_cancelled() {
            return Err(run.cancelled());
        }
        run.transition(PipelineState::Downloaded);
        info!(files = download.files.len(), "downloaded changed files");

        let metadata = PrMetadata::from_download(&download);

        run.transition(PipelineState::Analyzing);
        let signals = self.analyze_files(run, download.files).await?;
        if self.cancel.is_cancelled() {
            return Err(run.cancelled());
        }
        run.transition(PipelineState::Analyzed);

        let report =
            quality::aggregate(&pr, &signals, &self.settings.thresholds, &self.settings.checks);
        run.transition(PipelineState::Aggregated);

        let verdict = eligibility::evaluate(report, &metadata, &self.policy);
        run.transition(PipelineState::Evaluated);

        if let Err(e) = self.sink.deliver(&verdict).await {
            warn!(error = %e, "report sink rejected verdict");
        }
        run.transition(PipelineState::Done);
        Ok(verdict)
    }

    /// Analyze every eligible file with at most `fan_out` calls in flight.
    async fn analyze_files(
        &self,
        run: &mut PipelineRun,
        files: Vec<ChangedFile>,
    ) -> Result<Vec<FileQualitySignal>, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.fan_out));
        let mut join_set = JoinSet::new();
        let mut paths = Vec::new();

        for file in files.into_iter().filter(|f| self.settings.should_analyze(f)) {
            let index = paths.len();
            paths.push(file.path.clone());

            let analyzer = Arc::clone(&self.analyzer);
            let semaphore = Arc::clone(&semaphore);
            let backoff = self.settings.backoff.clone();
            let cancel = self.cancel.clone();
            let checks = self.settings.checks;

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome =
                    analyze_one(analyzer.as_ref(), &backoff, &cancel, file, &checks).await;
                (index, outcome)
            });
        }

        let attempted = paths.len();
        debug!(attempted, "analyzing files");

        let mut slots: Vec<Option<FileQualitySignal>> = vec![None; attempted];
        let mut failed = 0usize;
        let mut cancelled = false;
        let mut last_error = String::new();

        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "file analysis task panicked");
                    failed += 1;
                    last_error = e.to_string();
                    continue;
                }
            };
            match outcome {
                FileOutcome::Analyzed(signal) | FileOutcome::Skipped(signal) => {
                    slots[index] = Some(signal)
                }
                FileOutcome::Failed(signal) => {
                    failed += 1;
                    last_error = signal.diagnostic.clone().unwrap_or_default();
                    slots[index] = Some(signal);
                }
                FileOutcome::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            return Err(run.cancelled());
        }
        if attempted > 0 && failed == attempted {
            let pr = run.pr.clone();
            return Err(run.fail(PipelineError::AnalysisFailure {
                pr,
                failed_files: failed,
                last_error,
            }));
        }

        // A panicked task leaves its slot empty; record it like any other failed file.
        Ok(slots
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| {
                    FileQualitySignal::unevaluated(path, "analysis task aborted")
                })
            })
            .collect())
    }
}

async fn analyze_one(
    analyzer: &dyn FileAnalyzer,
    backoff: &BackoffPolicy,
    cancel: &CancelSignal,
    file: ChangedFile,
    checks: &EnabledChecks,
) -> FileOutcome {
    let result = backoff
        .run("analyze_file", cancel, || {
            analyzer.analyze_file(&file.path, &file.content, checks)
        })
        .await;

    match result {
        Ok(signal) => {
            debug!(path = %file.path, analyzer = analyzer.name(), "file analyzed");
            FileOutcome::Analyzed(signal)
        }
        Err(RetryError::Permanent(AnalysisError::UnsupportedLanguage { .. })) => {
            debug!(path = %file.path, "unsupported language, recording null signal");
            FileOutcome::Skipped(FileQualitySignal::unevaluated(file.path, "unsupported language"))
        }
        Err(RetryError::Cancelled) => FileOutcome::Cancelled,
        Err(err) => {
            warn!(
                path = %file.path,
                error = %err,
                "file analysis failed, continuing with remaining files"
            );
            FileOutcome::Failed(FileQualitySignal::unevaluated(file.path, err.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::pr::{DownloadResult, RepoRef};
    use crate::quality::tests::sample_pr;
    use crate::report::{NullSink, ReportError};
    use crate::scheduler::CancelHandle;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub fn fast_settings() -> PipelineSettings {
        PipelineSettings {
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 2.0,
                max_delay: Duration::from_millis(5),
                call_timeout: Duration::from_secs(5),
            },
            ..PipelineSettings::default()
        }
    }

    pub fn lenient_policy() -> Arc<Policy> {
        let config = PolicyConfig {
            min_description_length: 0,
            require_tests: false,
            ..PolicyConfig::default()
        };
        Arc::new(Policy::from_config(&config).unwrap())
    }

    pub fn py_file(path: &str) -> ChangedFile {
        ChangedFile {
            path: path.to_string(),
            content: "def f():\n    return 1\n".to_string(),
            change_type: ChangeType::Modified,
        }
    }

    /// Serves a fixed file list for every PR, failing downloads on request.
    pub struct StubSource {
        pub prs: HashMap<String, Vec<PullRequestRef>>,
        pub files: Vec<ChangedFile>,
        /// PR numbers whose download fails permanently
        pub missing: Vec<u64>,
        /// Transient failures served before a download succeeds
        pub flaky_downloads: AtomicUsize,
        pub download_calls: AtomicUsize,
        /// Delay per download, to keep work in flight
        pub delay: Duration,
    }

    impl StubSource {
        pub fn new(files: Vec<ChangedFile>) -> Self {
            Self {
                prs: HashMap::new(),
                files,
                missing: Vec::new(),
                flaky_downloads: AtomicUsize::new(0),
                download_calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl PrSource for StubSource {
        async fn discover_open_prs(
            &self,
            repo: &RepoRef,
        ) -> Result<Vec<PullRequestRef>, DownloadError> {
            self.prs
                .get(&repo.to_string())
                .cloned()
                .ok_or_else(|| DownloadError::RepoNotFound(repo.to_string()))
        }

        async fn download_pr_files(
            &self,
            pr: &PullRequestRef,
        ) -> Result<DownloadResult, DownloadError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.missing.contains(&pr.number) {
                return Err(DownloadError::PrNotFound(pr.to_string()));
            }
            let flaky = self
                .flaky_downloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if flaky {
                return Err(DownloadError::RateLimited);
            }
            Ok(DownloadResult {
                pr: pr.clone(),
                files: self.files.clone(),
                review: None,
            })
        }
    }

    /// Returns a clean signal, except for configured paths.
    pub struct StubAnalyzer {
        pub unavailable: Vec<String>,
        pub unsupported: Vec<String>,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub delay: Duration,
    }

    impl StubAnalyzer {
        pub fn clean() -> Self {
            Self {
                unavailable: Vec::new(),
                unsupported: Vec::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl FileAnalyzer for StubAnalyzer {
        fn name(&self) -> &str {
            "stub"
        }

        async fn analyze_file(
            &self,
            path: &str,
            _content: &str,
            _checks: &EnabledChecks,
        ) -> Result<FileQualitySignal, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.unavailable.iter().any(|p| p == path) {
                return Err(AnalysisError::ServiceUnavailable("503".to_string()));
            }
            if self.unsupported.iter().any(|p| p == path) {
                return Err(AnalysisError::UnsupportedLanguage { path: path.to_string() });
            }
            Ok(FileQualitySignal {
                path: path.to_string(),
                pylint_score: Some(9.0),
                flake8_violations: Some(1),
                mypy_errors: Some(0),
                complexity: Some(2.0),
                secret_exposures: Some(0),
                diagnostic: None,
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Mutex<Vec<EligibilityVerdict>>,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn deliver(&self, verdict: &EligibilityVerdict) -> Result<(), ReportError> {
            self.delivered.lock().unwrap().push(verdict.clone());
            Ok(())
        }
    }

    fn pipeline(
        source: StubSource,
        analyzer: StubAnalyzer,
    ) -> (PrPipeline, Arc<StubSource>, Arc<StubAnalyzer>) {
        let source = Arc::new(source);
        let analyzer = Arc::new(analyzer);
        let pipeline = PrPipeline::new(
            source.clone(),
            analyzer.clone(),
            Arc::new(NullSink),
            lenient_policy(),
            fast_settings(),
        );
        (pipeline, source, analyzer)
    }

    #[tokio::test]
    async fn test_happy_path_visits_every_state() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = PrPipeline::new(
            Arc::new(StubSource::new(vec![py_file("a.py"), py_file("b.py")])),
            Arc::new(StubAnalyzer::clean()),
            sink.clone(),
            lenient_policy(),
            fast_settings(),
        );

        let (result, history) = pipeline.process_traced(sample_pr()).await;
        let verdict = result.unwrap();

        assert!(verdict.eligible);
        assert_eq!(verdict.report.files_analyzed, 2);
        assert_eq!(verdict.report.flake8_total, Some(2));
        use PipelineState::*;
        assert_eq!(
            history,
            vec![
                Discovered,
                Downloading,
                Downloaded,
                Analyzing,
                Analyzed,
                Aggregated,
                Evaluated,
                Done,
            ]
        );
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_download_error_fails_immediately() {
        let mut source = StubSource::new(vec![py_file("a.py")]);
        source.missing = vec![42];
        let (pipeline, source, _) = pipeline(source, StubAnalyzer::clean());

        let (result, history) = pipeline.process_traced(sample_pr()).await;
        let err = result.unwrap_err();

        assert_eq!(err.kind(), FailureKind::DownloadFailure);
        assert!(matches!(err, PipelineError::DownloadFailure { attempts: 1, .. }));
        assert_eq!(source.download_calls.load(Ordering::SeqCst), 1);
        assert_eq!(history.last(), Some(&PipelineState::Failed));
    }

    #[tokio::test]
    async fn test_transient_download_error_is_retried() {
        let source = StubSource::new(vec![py_file("a.py")]);
        source.flaky_downloads.store(2, Ordering::SeqCst);
        let (pipeline, source, _) = pipeline(source, StubAnalyzer::clean());

        let verdict = pipeline.process(sample_pr()).await.unwrap();
        assert!(verdict.eligible);
        assert_eq!(source.download_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_download_retries_fail() {
        let source = StubSource::new(vec![py_file("a.py")]);
        source.flaky_downloads.store(10, Ordering::SeqCst);
        let (pipeline, source, _) = pipeline(source, StubAnalyzer::clean());

        let err = pipeline.process(sample_pr()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DownloadFailure { attempts: 3, source: DownloadError::RateLimited, .. }
        ));
        assert_eq!(source.download_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_file_failure_is_absorbed() {
        let mut analyzer = StubAnalyzer::clean();
        analyzer.unavailable = vec!["b.py".to_string()];
        let (pipeline, _, _) = pipeline(
            StubSource::new(vec![py_file("a.py"), py_file("b.py"), py_file("c.py")]),
            analyzer,
        );

        let verdict = pipeline.process(sample_pr()).await.unwrap();
        assert_eq!(verdict.report.files_analyzed, 2);
        assert_eq!(verdict.report.files_unevaluated, 1);
        assert_eq!(verdict.report.flake8_total, Some(2));
    }

    #[tokio::test]
    async fn test_every_file_failing_fails_the_pr() {
        let mut analyzer = StubAnalyzer::clean();
        analyzer.unavailable = vec!["a.py".to_string(), "b.py".to_string()];
        let source = StubSource::new(vec![py_file("a.py"), py_file("b.py")]);
        let (pipeline, _, analyzer) = pipeline(source, analyzer);

        let err = pipeline.process(sample_pr()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::AnalysisFailure);
        assert!(matches!(err, PipelineError::AnalysisFailure { failed_files: 2, .. }));
        // Each file was retried up to the attempt cap.
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_not_a_failure() {
        let mut analyzer = StubAnalyzer::clean();
        analyzer.unsupported = vec!["a.py".to_string()];
        let (pipeline, _, analyzer) = pipeline(StubSource::new(vec![py_file("a.py")]), analyzer);

        let verdict = pipeline.process(sample_pr()).await.unwrap();
        assert_eq!(verdict.report.files_unevaluated, 1);
        assert!(verdict.report.overall_pass);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_analyzable_files_are_skipped() {
        let mut removed = py_file("gone.py");
        removed.change_type = ChangeType::Removed;
        let readme = ChangedFile {
            path: "README.md".to_string(),
            content: "# hi".to_string(),
            change_type: ChangeType::Added,
        };
        let (pipeline, _, analyzer) = pipeline(
            StubSource::new(vec![py_file("a.py"), removed, readme]),
            StubAnalyzer::clean(),
        );

        let verdict = pipeline.process(sample_pr()).await.unwrap();
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(verdict.report.files_analyzed, 1);
    }

    #[tokio::test]
    async fn test_no_analyzable_files_is_vacuous_pass() {
        let readme = ChangedFile {
            path: "docs/guide.md".to_string(),
            content: "text".to_string(),
            change_type: ChangeType::Modified,
        };
        let (pipeline, _, _) = pipeline(StubSource::new(vec![readme]), StubAnalyzer::clean());
        let verdict = pipeline.process(sample_pr()).await.unwrap();
        assert!(verdict.report.overall_pass);
        assert_eq!(verdict.report.files_analyzed, 0);
    }

    #[tokio::test]
    async fn test_fan_out_limits_concurrent_analyses() {
        let mut analyzer = StubAnalyzer::clean();
        analyzer.delay = Duration::from_millis(20);
        let files = (0..8).map(|i| py_file(&format!("m{i}.py"))).collect();
        let source = Arc::new(StubSource::new(files));
        let analyzer = Arc::new(analyzer);
        let mut settings = fast_settings();
        settings.fan_out = 2;
        let pipeline = PrPipeline::new(
            source,
            analyzer.clone(),
            Arc::new(NullSink),
            lenient_policy(),
            settings,
        );

        pipeline.process(sample_pr()).await.unwrap();
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 8);
        assert!(analyzer.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancel_after_download_marks_cancelled() {
        let handle = CancelHandle::new();
        let mut source = StubSource::new(vec![py_file("a.py")]);
        source.delay = Duration::from_millis(50);
        let source = Arc::new(source);
        let analyzer = Arc::new(StubAnalyzer::clean());
        let pipeline = PrPipeline::new(
            source.clone(),
            analyzer.clone(),
            Arc::new(NullSink),
            lenient_policy(),
            fast_settings(),
        )
        .with_cancel(handle.signal());

        let task = tokio::spawn(async move { pipeline.process_traced(sample_pr()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let (result, history) = task.await.unwrap();

        assert_eq!(result.unwrap_err().kind(), FailureKind::Cancelled);
        // The in-flight download completed; nothing after it ran.
        assert_eq!(source.download_calls.load(Ordering::SeqCst), 1);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            history,
            vec![
                PipelineState::Discovered,
                PipelineState::Downloading,
                PipelineState::Failed
            ]
        );
    }
}
