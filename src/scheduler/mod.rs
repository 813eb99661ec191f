//! Batch Scheduler: fans PRs from many repositories out to a bounded worker pool.

pub mod cancel;

pub use cancel::{CancelHandle, CancelSignal};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::analysis::FileAnalyzer;
use crate::config::ConcurrencyConfig;
use crate::eligibility::{EligibilityVerdict, Policy};
use crate::github::PrSource;
use crate::pipeline::{FailureKind, PipelineSettings, PrPipeline};
use crate::pr::{PrUrl, PullRequestRef, RepoRef};
use crate::report::ReportSink;
use crate::retry::{BackoffPolicy, RetryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepoStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// Per-repository progress, kept in input order.
#[derive(Debug, Clone, Serialize)]
pub struct RepoProgress {
    pub repo: RepoRef,
    pub status: RepoStatus,
    /// Open PRs found by discovery
    pub discovered: usize,
    /// PRs with an entry in the job
    pub completed: usize,
    /// Entries that were cancelled rather than evaluated
    pub cancelled: usize,
    /// Discovery error, when the repository failed
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub enum EntryOutcome {
    Verdict(EligibilityVerdict),
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub pr: PullRequestRef,
    pub outcome: EntryOutcome,
}

impl BatchEntry {
    fn cancelled(pr: PullRequestRef) -> Self {
        let reason = format!("Processing of {pr} was cancelled before it started");
        Self {
            pr,
            outcome: EntryOutcome::Failed {
                kind: FailureKind::Cancelled,
                reason,
            },
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(&self.outcome, EntryOutcome::Verdict(v) if v.eligible)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.outcome,
            EntryOutcome::Failed {
                kind: FailureKind::Cancelled,
                ..
            }
        )
    }
}

/// Results of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchJob {
    pub repositories: Vec<RepoProgress>,
    /// In completion order
    pub entries: Vec<BatchEntry>,
    pub cancelled: bool,
}

impl BatchJob {
    fn new(repos: &[RepoRef]) -> Self {
        Self {
            repositories: repos
                .iter()
                .map(|repo| RepoProgress {
                    repo: repo.clone(),
                    status: RepoStatus::Pending,
                    discovered: 0,
                    completed: 0,
                    cancelled: 0,
                    error: None,
                })
                .collect(),
            entries: Vec::new(),
            cancelled: false,
        }
    }

    pub fn eligible_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_eligible()).count()
    }

    pub fn ineligible_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(&e.outcome, EntryOutcome::Verdict(v) if !v.eligible))
            .count()
    }

    /// Entries that ended in a failure other than cancellation.
    pub fn failed_count(&self) -> usize {
        self.count_failures(|kind| kind != FailureKind::Cancelled)
    }

    pub fn cancelled_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_cancelled()).count()
    }

    fn count_failures(&self, pred: impl Fn(FailureKind) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, EntryOutcome::Failed { kind, .. } if pred(kind)))
            .count()
    }

    pub fn entries_for<'a>(
        &'a self,
        repo: &'a RepoRef,
    ) -> impl Iterator<Item = &'a BatchEntry> + 'a {
        self.entries.iter().filter(move |e| &e.pr.repo == repo)
    }

    fn mark_discovered(&mut self, index: usize, count: usize) {
        let progress = &mut self.repositories[index];
        progress.discovered = count;
        progress.status = if count == 0 {
            RepoStatus::Done
        } else {
            RepoStatus::Running
        };
    }

    fn mark_failed(&mut self, index: usize, error: String) {
        let progress = &mut self.repositories[index];
        progress.status = RepoStatus::Failed;
        progress.error = Some(error);
    }

    /// A repository with cancelled entries stays `Running`: it was never finished.
    fn record(&mut self, index: usize, entry: BatchEntry) {
        let progress = &mut self.repositories[index];
        progress.completed += 1;
        if entry.is_cancelled() {
            progress.cancelled += 1;
        }
        if progress.completed >= progress.discovered && progress.cancelled == 0 {
            progress.status = RepoStatus::Done;
        }
        self.entries.push(entry);
    }
}

/// One queued PR, tagged with its repository's position in the input.
struct WorkItem {
    repo_index: usize,
    pr: PullRequestRef,
}

/// What to run for one repository.
struct Target {
    repo: RepoRef,
    only_pr: Option<u64>,
}

pub struct BatchScheduler {
    source: Arc<dyn PrSource>,
    pipeline: Arc<PrPipeline>,
    backoff: BackoffPolicy,
    concurrency: ConcurrencyConfig,
    cancel: CancelHandle,
}

impl BatchScheduler {
    pub fn new(
        source: Arc<dyn PrSource>,
        analyzer: Arc<dyn FileAnalyzer>,
        sink: Arc<dyn ReportSink>,
        policy: Arc<Policy>,
        settings: PipelineSettings,
        concurrency: ConcurrencyConfig,
    ) -> Self {
        let cancel = CancelHandle::new();
        let backoff = settings.backoff.clone();
        let pipeline = PrPipeline::new(Arc::clone(&source), analyzer, sink, policy, settings)
            .with_cancel(cancel.signal());
        Self {
            source,
            pipeline: Arc::new(pipeline),
            backoff,
            concurrency,
            cancel,
        }
    }

    /// Handle for stopping a running batch from another task.
    ///
    /// A cancel requested between runs applies to the next run; the flag is
    /// cleared when that run returns.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Evaluate every open PR of every repository in `repos`.
    pub async fn run(&self, repos: Vec<RepoRef>) -> BatchJob {
        let targets = repos
            .into_iter()
            .map(|repo| Target { repo, only_pr: None })
            .collect();
        self.execute(targets).await
    }

    /// Evaluate a single PR, found through its repository's open PRs.
    pub async fn run_pr(&self, pr: PrUrl) -> BatchJob {
        let target = Target {
            repo: pr.repo,
            only_pr: Some(pr.pr_number),
        };
        self.execute(vec![target]).await
    }

    #[instrument(skip_all, fields(repos = targets.len(), workers = self.concurrency.workers))]
    async fn execute(&self, targets: Vec<Target>) -> BatchJob {
        let repos: Vec<RepoRef> = targets.iter().map(|t| t.repo.clone()).collect();
        let job = Arc::new(Mutex::new(BatchJob::new(&repos)));
        let signal = self.cancel.signal();

        let (tx, rx) = mpsc::channel::<WorkItem>(self.concurrency.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency.workers.max(1) {
            workers.spawn(worker(
                id,
                Arc::clone(&rx),
                Arc::clone(&self.pipeline),
                Arc::clone(&job),
                signal.clone(),
            ));
        }

        self.produce(targets, tx, &job, &signal).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "batch worker panicked");
            }
        }

        let mut job = match Arc::try_unwrap(job) {
            Ok(job) => job.into_inner(),
            Err(shared) => shared.lock().await.clone(),
        };
        job.cancelled = signal.is_cancelled();
        if job.cancelled {
            // A cancellation ends this run only; the next run re-discovers from scratch.
            self.cancel.reset();
        }
        info!(
            entries = job.entries.len(),
            eligible = job.eligible_count(),
            ineligible = job.ineligible_count(),
            failed = job.failed_count(),
            cancelled = job.cancelled,
            "batch finished"
        );
        job
    }

    /// Discover repositories in input order and feed their PRs to the queue.
    /// Dropping `tx` on return lets the workers drain and exit.
    async fn produce(
        &self,
        targets: Vec<Target>,
        tx: mpsc::Sender<WorkItem>,
        job: &Mutex<BatchJob>,
        signal: &CancelSignal,
    ) {
        for (repo_index, target) in targets.into_iter().enumerate() {
            if signal.is_cancelled() {
                info!("cancellation requested, stopping discovery");
                return;
            }

            let repo = &target.repo;
            let discovered = self
                .backoff
                .run("discover_open_prs", signal, || self.source.discover_open_prs(repo))
                .await;

            let mut prs = match discovered {
                Ok(prs) => prs,
                Err(RetryError::Cancelled) => return,
                Err(err) => {
                    warn!(repo = %repo, error = %err, "discovery failed");
                    let error = format!("{}: {err}", FailureKind::DiscoveryFailure);
                    job.lock().await.mark_failed(repo_index, error);
                    continue;
                }
            };

            if let Some(number) = target.only_pr {
                prs.retain(|pr| pr.number == number);
                if prs.is_empty() {
                    warn!(repo = %repo, pr = number, "requested PR is not open");
                    let error = format!("PR #{number} is not an open pull request of {repo}");
                    job.lock().await.mark_failed(repo_index, error);
                    continue;
                }
            }

            info!(repo = %repo, prs = prs.len(), "discovered open PRs");
            job.lock().await.mark_discovered(repo_index, prs.len());

            let mut pending = prs.into_iter();
            while let Some(pr) = pending.next() {
                let permit = if signal.is_cancelled() {
                    None
                } else {
                    tokio::select! {
                        permit = tx.reserve() => permit.ok(),
                        _ = signal.cancelled() => None,
                    }
                };

                match permit {
                    Some(permit) if !signal.is_cancelled() => {
                        permit.send(WorkItem { repo_index, pr })
                    }
                    _ => {
                        // This PR and the rest of its repository never reach a worker.
                        let mut job = job.lock().await;
                        for pr in std::iter::once(pr).chain(pending) {
                            debug!(pr = %pr, "not enqueued before cancellation");
                            job.record(repo_index, BatchEntry::cancelled(pr));
                        }
                        return;
                    }
                }
            }
        }
    }
}

async fn worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    pipeline: Arc<PrPipeline>,
    job: Arc<Mutex<BatchJob>>,
    signal: CancelSignal,
) {
    debug!(worker = id, "worker started");
    loop {
        let next = rx.lock().await.recv().await;
        let Some(WorkItem { repo_index, pr }) = next else {
            break;
        };

        let entry = if signal.is_cancelled() {
            BatchEntry::cancelled(pr)
        } else {
            let outcome = match pipeline.process(pr.clone()).await {
                Ok(verdict) => EntryOutcome::Verdict(verdict),
                Err(e) => EntryOutcome::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                },
            };
            BatchEntry { pr, outcome }
        };

        job.lock().await.record(repo_index, entry);
    }
    debug!(worker = id, "worker finished");
}
