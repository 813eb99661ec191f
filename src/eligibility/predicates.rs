//! Built-in eligibility predicates.

use regex::Regex;

use super::{EvaluationInput, Predicate};
use crate::pr::ReviewState;

const REVIEW_UNAVAILABLE: &str = "review state unavailable";

fn review<'a>(input: &'a EvaluationInput<'_>, rule: &str) -> Result<&'a ReviewState, String> {
    input
        .metadata
        .review
        .as_ref()
        .ok_or_else(|| format!("Cannot check {rule}: {REVIEW_UNAVAILABLE}"))
}

/// The aggregated quality report must pass overall.
pub struct QualityPredicate;

impl Predicate for QualityPredicate {
    fn name(&self) -> &str {
        "quality"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        if input.report.overall_pass {
            return Ok(());
        }
        Err(format!(
            "Code quality checks failed: {}",
            input.report.thresholds.failing().join(", ")
        ))
    }
}

pub struct DescriptionLengthPredicate {
    min_chars: usize,
}

impl DescriptionLengthPredicate {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl Predicate for DescriptionLengthPredicate {
    fn name(&self) -> &str {
        "description_length"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        let len = input.metadata.pr.description.trim().chars().count();
        if len >= self.min_chars {
            Ok(())
        } else {
            Err(format!(
                "Description too short: {len} characters, at least {} required",
                self.min_chars
            ))
        }
    }
}

pub struct ChangedFilesPredicate {
    max_files: usize,
}

impl ChangedFilesPredicate {
    pub fn new(max_files: usize) -> Self {
        Self { max_files }
    }
}

impl Predicate for ChangedFilesPredicate {
    fn name(&self) -> &str {
        "max_changed_files"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        let count = input.metadata.changed_paths.len();
        if count <= self.max_files {
            Ok(())
        } else {
            Err(format!(
                "Too many changed files: {count}, at most {} allowed",
                self.max_files
            ))
        }
    }
}

/// At least one changed path must look like a test.
pub struct TestsPresentPredicate {
    patterns: Vec<Regex>,
}

impl TestsPresentPredicate {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }
}

impl Predicate for TestsPresentPredicate {
    fn name(&self) -> &str {
        "tests_present"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        let has_tests = input
            .metadata
            .changed_paths
            .iter()
            .any(|path| self.patterns.iter().any(|re| re.is_match(path)));
        if has_tests {
            Ok(())
        } else {
            Err("No test files among the changed files".to_string())
        }
    }
}

pub struct MinApprovalsPredicate {
    min: u32,
}

impl MinApprovalsPredicate {
    pub fn new(min: u32) -> Self {
        Self { min }
    }
}

impl Predicate for MinApprovalsPredicate {
    fn name(&self) -> &str {
        "min_approvals"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        let approvals = review(input, "approvals")?.approvals;
        if approvals >= self.min {
            Ok(())
        } else {
            Err(format!("Not enough approvals: {approvals} of {} required", self.min))
        }
    }
}

pub struct OpenCommentsPredicate {
    max: u32,
}

impl OpenCommentsPredicate {
    pub fn new(max: u32) -> Self {
        Self { max }
    }
}

impl Predicate for OpenCommentsPredicate {
    fn name(&self) -> &str {
        "max_open_comments"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        let comments = review(input, "open comments")?.open_comments;
        if comments <= self.max {
            Ok(())
        } else {
            Err(format!("Too many open comments: {comments}, at most {} allowed", self.max))
        }
    }
}

pub struct NoChangesRequestedPredicate;

impl Predicate for NoChangesRequestedPredicate {
    fn name(&self) -> &str {
        "no_changes_requested"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        match review(input, "requested changes")?.changes_requested {
            0 => Ok(()),
            n => Err(format!("Reviewers requested changes ({n} review(s))")),
        }
    }
}

pub struct MergeablePredicate;

impl Predicate for MergeablePredicate {
    fn name(&self) -> &str {
        "mergeable"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        match review(input, "mergeability")?.mergeable {
            Some(true) => Ok(()),
            Some(false) => Err("PR has merge conflicts".to_string()),
            None => Err("GitHub has not computed mergeability yet".to_string()),
        }
    }
}

pub struct NotDraftPredicate;

impl Predicate for NotDraftPredicate {
    fn name(&self) -> &str {
        "not_draft"
    }

    fn check(&self, input: &EvaluationInput<'_>) -> Result<(), String> {
        if input.metadata.pr.draft {
            Err("PR is still a draft".to_string())
        } else {
            Ok(())
        }
    }
}
