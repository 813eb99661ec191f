pub mod client;

pub use client::GitHubClient;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pr::{DownloadResult, PullRequestRef, RepoRef};
use crate::retry::Transient;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("GitHub authentication failed: {0}")]
    Auth(String),

    #[error("Pull request not found: {0}")]
    PrNotFound(String),

    #[error("GitHub rate limit exceeded")]
    RateLimited,

    #[error("GitHub request failed: {0}")]
    Network(String),

    #[error("GitHub request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cannot build GitHub URL: {0}")]
    InvalidUrl(String),
}

impl Transient for DownloadError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            DownloadError::RateLimited | DownloadError::Network(_) | DownloadError::Timeout(_)
        )
    }

    fn timed_out(after: Duration) -> Self {
        DownloadError::Timeout(after)
    }
}

/// The Download collaborator: PR discovery and changed-file retrieval.
#[async_trait]
pub trait PrSource: Send + Sync {
    /// All currently open PRs of `repo`.
    async fn discover_open_prs(&self, repo: &RepoRef) -> Result<Vec<PullRequestRef>, DownloadError>;

    /// Changed files (content at head) plus review state for one PR.
    async fn download_pr_files(&self, pr: &PullRequestRef) -> Result<DownloadResult, DownloadError>;
}
