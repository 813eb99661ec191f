use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use super::{DownloadError, PrSource};
use crate::pr::{ChangeType, ChangedFile, DownloadResult, PullRequestRef, RepoRef, ReviewState};

const PAGE_SIZE: usize = 100;
const USER_AGENT: &str = "merge-gate";
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// GitHub REST adapter for the Download collaborator.
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    /// Content requests in flight per `download_pr_files`
    max_concurrent_requests: usize,
    /// Lowercase extensions whose content is fetched; `None` fetches all
    content_extensions: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct User {
    login: String,
}

#[derive(Deserialize)]
struct Branch {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

#[derive(Deserialize)]
struct PullSummary {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    html_url: String,
    user: User,
    head: Branch,
    base: Branch,
}

#[derive(Deserialize)]
struct PullDetail {
    mergeable: Option<bool>,
    #[serde(default)]
    comments: u32,
    #[serde(default)]
    review_comments: u32,
}

#[derive(Deserialize)]
struct PullFile {
    filename: String,
    status: String,
}

#[derive(Deserialize)]
struct Review {
    state: String,
}

/// Which not-found variant a 404 maps to.
#[derive(Clone, Copy)]
enum Subject<'a> {
    Repo(&'a RepoRef),
    Pr(&'a PullRequestRef),
}

impl GitHubClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            content_extensions: None,
        }
    }

    pub fn with_concurrency(mut self, max_concurrent_requests: usize) -> Self {
        self.max_concurrent_requests = max_concurrent_requests.max(1);
        self
    }

    /// Only fetch content for files with one of these extensions (no dot).
    /// Other files are listed with empty content. An empty list fetches all.
    pub fn with_content_extensions(mut self, extensions: &[String]) -> Self {
        self.content_extensions = if extensions.is_empty() {
            None
        } else {
            Some(extensions.iter().map(|e| e.to_ascii_lowercase()).collect())
        };
        self
    }

    fn wants_content(&self, path: &str) -> bool {
        let Some(wanted) = &self.content_extensions else {
            return true;
        };
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| wanted.contains(&ext.to_ascii_lowercase()))
    }

    /// `{base}/repos/{owner}/{name}/contents/{path}` with every segment percent-encoded.
    fn contents_url(&self, pr: &PullRequestRef, path: &str) -> Result<Url, DownloadError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        let no_path = || DownloadError::InvalidUrl(format!("{} has no path", self.base_url));
        url.path_segments_mut()
            .map_err(|_| no_path())?
            .pop_if_empty()
            .extend(["repos", pr.repo.owner.as_str(), pr.repo.name.as_str(), "contents"])
            .extend(path.split('/'));
        Ok(url)
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.get_as(url, "application/vnd.github+json")
    }

    fn get_as(&self, url: &str, accept: &str) -> RequestBuilder {
        let request = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", accept);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        subject: Subject<'_>,
    ) -> Result<Response, DownloadError> {
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        check_status(response, subject)
    }

    /// Fetch every page of a list endpoint.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        url: &str,
        extra_query: &[(&str, &str)],
        subject: Subject<'_>,
    ) -> Result<Vec<T>, DownloadError> {
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let page_str = page.to_string();
            let per_page = PAGE_SIZE.to_string();
            let request = self
                .get(url)
                .query(extra_query)
                .query(&[("per_page", per_page.as_str()), ("page", page_str.as_str())]);
            let batch: Vec<T> = self
                .send(request, subject)
                .await?
                .json()
                .await
                .map_err(|e| DownloadError::Network(e.to_string()))?;
            let len = batch.len();
            items.extend(batch);
            if len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    fn content_request(
        &self,
        pr: &PullRequestRef,
        path: &str,
    ) -> Result<RequestBuilder, DownloadError> {
        let url = self.contents_url(pr, path)?;
        Ok(self
            .get_as(url.as_str(), "application/vnd.github.raw")
            .query(&[("ref", pr.head_sha.as_str())]))
    }

    async fn fetch_review_state(&self, pr: &PullRequestRef) -> Result<ReviewState, DownloadError> {
        let pull_url = format!(
            "{}/repos/{}/{}/pulls/{}",
            self.base_url, pr.repo.owner, pr.repo.name, pr.number
        );
        let detail: PullDetail = self
            .send(self.get(&pull_url), Subject::Pr(pr))
            .await?
            .json()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let reviews: Vec<Review> = self
            .get_paginated(&format!("{pull_url}/reviews"), &[], Subject::Pr(pr))
            .await?;

        Ok(ReviewState {
            approvals: reviews.iter().filter(|r| r.state == "APPROVED").count() as u32,
            changes_requested: reviews
                .iter()
                .filter(|r| r.state == "CHANGES_REQUESTED")
                .count() as u32,
            open_comments: detail.comments + detail.review_comments,
            mergeable: detail.mergeable,
        })
    }
}

/// Map GitHub error statuses onto the collaborator error taxonomy.
fn check_status(response: Response, subject: Subject<'_>) -> Result<Response, DownloadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let rate_limit_exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");

    Err(match status {
        StatusCode::NOT_FOUND => match subject {
            Subject::Repo(repo) => DownloadError::RepoNotFound(repo.to_string()),
            Subject::Pr(pr) => DownloadError::PrNotFound(pr.to_string()),
        },
        StatusCode::TOO_MANY_REQUESTS => DownloadError::RateLimited,
        StatusCode::FORBIDDEN if rate_limit_exhausted => DownloadError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DownloadError::Auth(format!("GitHub returned {status}"))
        }
        _ => DownloadError::Network(format!("GitHub returned {status}")),
    })
}

/// Raw file content at the PR head. A missing file (submodule, symlink
/// target outside the tree) yields empty content.
async fn read_content(
    request: RequestBuilder,
    pr: &PullRequestRef,
    path: &str,
) -> Result<String, DownloadError> {
    let response = request
        .send()
        .await
        .map_err(|e| DownloadError::Network(e.to_string()))?;

    if response.status() == StatusCode::NOT_FOUND {
        warn!(path, "file content not found at head, treating as empty");
        return Ok(String::new());
    }
    check_status(response, Subject::Pr(pr))?
        .text()
        .await
        .map_err(|e| DownloadError::Network(e.to_string()))
}

#[async_trait]
impl PrSource for GitHubClient {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn discover_open_prs(
        &self,
        repo: &RepoRef,
    ) -> Result<Vec<PullRequestRef>, DownloadError> {
        let url = format!("{}/repos/{}/{}/pulls", self.base_url, repo.owner, repo.name);
        let pulls: Vec<PullSummary> = self
            .get_paginated(&url, &[("state", "open")], Subject::Repo(repo))
            .await?;
        debug!(open_prs = pulls.len(), "discovered open pull requests");

        Ok(pulls
            .into_iter()
            .map(|p| PullRequestRef {
                repo: repo.clone(),
                number: p.number,
                head_ref: p.head.name,
                head_sha: p.head.sha,
                base_ref: p.base.name,
                author: p.user.login,
                title: p.title,
                description: p.body.unwrap_or_default(),
                draft: p.draft,
                url: p.html_url,
            })
            .collect())
    }

    #[instrument(skip(self), fields(pr = %pr))]
    async fn download_pr_files(
        &self,
        pr: &PullRequestRef,
    ) -> Result<DownloadResult, DownloadError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/files",
            self.base_url, pr.repo.owner, pr.repo.name, pr.number
        );
        let listed: Vec<PullFile> = self.get_paginated(&url, &[], Subject::Pr(pr)).await?;
        debug!(changed_files = listed.len(), "listed changed files");

        let shared_pr = Arc::new(pr.clone());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_requests));
        let mut fetches = JoinSet::new();
        let mut files = Vec::with_capacity(listed.len());

        for (index, entry) in listed.into_iter().enumerate() {
            let change_type = ChangeType::from_github_status(&entry.status);
            if change_type != ChangeType::Removed && self.wants_content(&entry.filename) {
                let request = self.content_request(pr, &entry.filename)?;
                let pr = Arc::clone(&shared_pr);
                let semaphore = Arc::clone(&semaphore);
                let path = entry.filename.clone();
                fetches.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (index, read_content(request, &pr, &path).await)
                });
            }
            files.push(ChangedFile {
                path: entry.filename,
                content: String::new(),
                change_type,
            });
        }

        debug!(fetches = fetches.len(), "fetching file contents");
        // Returning early drops the set, which aborts the remaining fetches.
        while let Some(joined) = fetches.join_next().await {
            let (index, content) = joined
                .map_err(|e| DownloadError::Network(format!("content fetch task failed: {e}")))?;
            files[index].content = content?;
        }

        let review = self.fetch_review_state(pr).await?;
        debug!(
            approvals = review.approvals,
            comments = review.open_comments,
            "fetched review state"
        );

        Ok(DownloadResult {
            pr: pr.clone(),
            files,
            review: Some(review),
        })
    }
}
