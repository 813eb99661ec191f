pub mod types;

pub use types::{ChangeType, ChangedFile, DownloadResult, PullRequestRef, RepoRef, ReviewState};

use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PrError {
    #[error("Invalid PR URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid repository reference: {0}")]
    InvalidRepo(String),

    #[error("Failed to read repository list: {0}")]
    ListRead(#[from] std::io::Error),
}

/// Parsed components of a GitHub PR URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrUrl {
    pub repo: RepoRef,
    pub pr_number: u64,
}

fn github_path_segments(url: &str) -> Option<Vec<String>> {
    let parsed = reqwest::Url::parse(url).ok()?;
    if parsed.host_str() != Some("github.com") {
        return None;
    }
    let segments = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();
    Some(segments)
}

/// Parse `https://github.com/{owner}/{repo}/pull/{number}`.
pub fn parse_pr_url(url: &str) -> Result<PrUrl, PrError> {
    let segments = github_path_segments(url).ok_or_else(|| PrError::InvalidUrl(url.to_string()))?;

    if segments.len() != 4 || segments[2] != "pull" {
        return Err(PrError::InvalidUrl(url.to_string()));
    }

    let pr_number = segments[3]
        .parse::<u64>()
        .map_err(|_| PrError::InvalidUrl(url.to_string()))?;

    Ok(PrUrl {
        repo: RepoRef::new(&segments[0], &segments[1]),
        pr_number,
    })
}

/// Parse a repository reference, either `https://github.com/{owner}/{repo}`
/// (trailing `.git` and extra path segments are tolerated) or `owner/repo`.
pub fn parse_repo_ref(input: &str) -> Result<RepoRef, PrError> {
    let input = input.trim();
    let invalid = || PrError::InvalidRepo(input.to_string());

    let segments = if input.contains("://") {
        github_path_segments(input).ok_or_else(invalid)?
    } else {
        input
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    };

    if segments.len() < 2 || (!input.contains("://") && segments.len() != 2) {
        return Err(invalid());
    }

    let name = segments[1].trim_end_matches(".git");
    if name.is_empty() {
        return Err(invalid());
    }
    Ok(RepoRef::new(&segments[0], name))
}

/// Parse a repository list: one repository per line, blank lines and `#`
/// comments ignored. A CSV-style file whose header's first column is
/// `repo_url` is accepted; only the first column of each row is read.
pub fn parse_repo_list(text: &str) -> Result<Vec<RepoRef>, PrError> {
    let mut repos = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let first_column = line.split(',').next().unwrap_or(line).trim().trim_matches('"');
        if index == 0 && first_column.eq_ignore_ascii_case("repo_url") {
            continue;
        }
        repos.push(parse_repo_ref(first_column)?);
    }
    debug!(repositories = repos.len(), "parsed repository list");
    Ok(repos)
}

/// Read and parse a repository list file.
pub fn load_repo_list(path: &Path) -> Result<Vec<RepoRef>, PrError> {
    let contents = fs::read_to_string(path)?;
    parse_repo_list(&contents)
}
