use serde::Serialize;

use crate::pipeline::FailureKind;
use crate::scheduler::{BatchEntry, BatchJob, EntryOutcome, RepoStatus};

/// Outcome of one PR as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Eligible,
    Ineligible,
    Failed,
    Cancelled,
}

impl Decision {
    pub fn of(entry: &BatchEntry) -> Self {
        match &entry.outcome {
            EntryOutcome::Verdict(v) if v.eligible => Decision::Eligible,
            EntryOutcome::Verdict(_) => Decision::Ineligible,
            EntryOutcome::Failed {
                kind: FailureKind::Cancelled,
                ..
            } => Decision::Cancelled,
            EntryOutcome::Failed { .. } => Decision::Failed,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Eligible => write!(f, "ELIGIBLE"),
            Decision::Ineligible => write!(f, "INELIGIBLE"),
            Decision::Failed => write!(f, "FAILED"),
            Decision::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Counts shown at the end of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Repositories in the input
    pub repositories: usize,
    /// Repositories whose discovery failed
    pub repositories_failed: usize,
    /// Repositories with PRs cancelled before evaluation
    pub repositories_interrupted: usize,
    /// Repositories never discovered because the batch was cancelled
    pub repositories_pending: usize,
    /// PR entries recorded
    pub prs: usize,
    pub eligible: usize,
    pub ineligible: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl From<&BatchJob> for BatchSummary {
    fn from(job: &BatchJob) -> Self {
        let repos_with = |status: RepoStatus| {
            job.repositories.iter().filter(|r| r.status == status).count()
        };
        Self {
            repositories: job.repositories.len(),
            repositories_failed: repos_with(RepoStatus::Failed),
            repositories_interrupted: job.repositories.iter().filter(|r| r.cancelled > 0).count(),
            repositories_pending: repos_with(RepoStatus::Pending),
            prs: job.entries.len(),
            eligible: job.eligible_count(),
            ineligible: job.ineligible_count(),
            failed: job.failed_count(),
            cancelled: job.cancelled_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::tests::sample_pr;

    #[test]
    fn test_decision_display() {
        assert_eq!(Decision::Eligible.to_string(), "ELIGIBLE");
        assert_eq!(Decision::Cancelled.to_string(), "CANCELLED");
    }

    #[test]
    fn test_cancelled_failure_is_its_own_decision() {
        let entry = BatchEntry {
            pr: sample_pr(),
            outcome: EntryOutcome::Failed {
                kind: FailureKind::Cancelled,
                reason: "stopped".to_string(),
            },
        };
        assert_eq!(Decision::of(&entry), Decision::Cancelled);

        let entry = BatchEntry {
            pr: sample_pr(),
            outcome: EntryOutcome::Failed {
                kind: FailureKind::AnalysisFailure,
                reason: "service down".to_string(),
            },
        };
        assert_eq!(Decision::of(&entry), Decision::Failed);
    }
}
