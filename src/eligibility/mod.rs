pub mod predicates;

pub use predicates::{
    ChangedFilesPredicate, DescriptionLengthPredicate, MergeablePredicate, MinApprovalsPredicate,
    NoChangesRequestedPredicate, NotDraftPredicate, OpenCommentsPredicate, QualityPredicate,
    TestsPresentPredicate,
};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ConfigError, PolicyConfig};
use crate::pr::{DownloadResult, PullRequestRef, ReviewState};
use crate::quality::AggregatedQualityReport;

/// PR metadata the predicates look at.
#[derive(Debug, Clone)]
pub struct PrMetadata {
    pub pr: PullRequestRef,
    /// Every changed path, removed files included
    pub changed_paths: Vec<String>,
    pub review: Option<ReviewState>,
}

impl PrMetadata {
    pub fn from_download(download: &DownloadResult) -> Self {
        Self {
            pr: download.pr.clone(),
            changed_paths: download.files.iter().map(|f| f.path.clone()).collect(),
            review: download.review.clone(),
        }
    }
}

/// What a predicate gets to inspect.
pub struct EvaluationInput<'a> {
    pub report: &'a AggregatedQualityReport,
    pub metadata: &'a PrMetadata,
}

/// A named eligibility rule.
///
/// Returns `Err(reason)` with a message meant for the PR author when the rule fails.
pub trait Predicate: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String>;
}

/// Ordered set of predicates. Every predicate is evaluated; none short-circuits.
#[derive(Default)]
pub struct Policy {
    predicates: Vec<Box<dyn Predicate>>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("predicates", &self.predicate_names())
            .finish()
    }
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the built-in predicates enabled by `config`.
    pub fn from_config(config: &PolicyConfig) -> Result<Self, ConfigError> {
        let mut policy = Policy::new();

        if config.require_quality_pass {
            policy.register(Box::new(QualityPredicate));
        }
        if config.min_description_length > 0 {
            policy.register(Box::new(DescriptionLengthPredicate::new(
                config.min_description_length,
            )));
        }
        policy.register(Box::new(ChangedFilesPredicate::new(config.max_changed_files)));
        if config.require_tests {
            let patterns = config
                .test_path_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Invalid(format!("policy.test_path_patterns: {e}")))?;
            policy.register(Box::new(TestsPresentPredicate::new(patterns)));
        }
        if let Some(min) = config.min_approvals {
            policy.register(Box::new(MinApprovalsPredicate::new(min)));
        }
        if let Some(max) = config.max_open_comments {
            policy.register(Box::new(OpenCommentsPredicate::new(max)));
        }
        if config.no_changes_requested {
            policy.register(Box::new(NoChangesRequestedPredicate));
        }
        if config.require_mergeable {
            policy.register(Box::new(MergeablePredicate));
        }
        if config.reject_drafts {
            policy.register(Box::new(NotDraftPredicate));
        }

        debug!(predicates = ?policy.predicate_names(), "built eligibility policy");
        Ok(policy)
    }

    /// Append an operator-supplied predicate; it runs after those already registered.
    pub fn register(&mut self, predicate: Box<dyn Predicate>) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    pub fn predicate_names(&self) -> Vec<&str> {
        self.predicates.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Final decision for one PR.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EligibilityVerdict {
    pub pr: PullRequestRef,
    pub eligible: bool,
    /// One message per failing predicate, in policy order
    pub reasons: Vec<String>,
    /// Names of the predicates that passed
    pub passed: Vec<String>,
    pub report: AggregatedQualityReport,
}

/// Apply every predicate in `policy`; the PR is eligible iff none fails.
pub fn evaluate(
    report: AggregatedQualityReport,
    metadata: &PrMetadata,
    policy: &Policy,
) -> EligibilityVerdict {
    let input = EvaluationInput {
        report: &report,
        metadata,
    };

    let mut reasons = Vec::new();
    let mut passed = Vec::new();
    for predicate in &policy.predicates {
        match predicate.check(&input) {
            Ok(()) => passed.push(predicate.name().to_string()),
            Err(reason) => {
                debug!(predicate = predicate.name(), %reason, "predicate failed");
                reasons.push(reason);
            }
        }
    }

    let eligible = reasons.is_empty();
    info!(pr = %metadata.pr, eligible, failed = reasons.len(), "evaluated eligibility");
    EligibilityVerdict {
        pr: metadata.pr.clone(),
        eligible,
        reasons,
        passed,
        report,
    }
}
