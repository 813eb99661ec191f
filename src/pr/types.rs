use serde::Serialize;
use std::fmt;

/// A GitHub repository, identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// An open pull request as returned by discovery.
///
/// Never mutated after discovery; every stage works from a clone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullRequestRef {
    /// Repository the PR targets
    pub repo: RepoRef,
    /// PR number (e.g., 42)
    pub number: u64,
    /// Head branch name
    pub head_ref: String,
    /// Commit SHA of the head branch, used to fetch file contents
    pub head_sha: String,
    /// Base branch name
    pub base_ref: String,
    /// Author's GitHub login
    pub author: String,
    /// PR title
    pub title: String,
    /// PR body; empty when the author left none
    pub description: String,
    /// Whether the PR is a draft
    pub draft: bool,
    /// HTML URL of the PR
    pub url: String,
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// How a file was touched by the PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
    Renamed,
}

impl ChangeType {
    /// Map a GitHub `status` value from the PR files endpoint.
    pub fn from_github_status(status: &str) -> Self {
        match status {
            "added" => ChangeType::Added,
            "removed" => ChangeType::Removed,
            "renamed" => ChangeType::Renamed,
            _ => ChangeType::Modified,
        }
    }
}

/// A single changed file with its content at the PR head.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    /// Repository-relative path (e.g., "src/app/models.py")
    pub path: String,
    /// File content at head; empty for removed files
    pub content: String,
    pub change_type: ChangeType,
}

/// Review activity on a PR, used by the merge-rule predicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewState {
    /// Number of reviews in APPROVED state
    pub approvals: u32,
    /// Number of reviews in CHANGES_REQUESTED state
    pub changes_requested: u32,
    /// Issue plus review comments
    pub open_comments: u32,
    /// GitHub's mergeability; `None` while GitHub is still computing it
    pub mergeable: Option<bool>,
}

/// Everything the Download collaborator returns for one PR.
///
/// Owned by the pipeline run that requested it and dropped once analysis is done.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub pr: PullRequestRef,
    /// Changed files in the order GitHub reported them
    pub files: Vec<ChangedFile>,
    /// Review state, when the collaborator could provide it
    pub review: Option<ReviewState>,
}
