use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::retry::Retryable;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "ciport-migration-bot";

/// Per-request timeout for most calls; log downloads get a longer one.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LOG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("github transport error: {0}")]
    Transport(String),
    /// The credential hit its rate limit; callers rotate the token pool.
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("github returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl Retryable for GithubError {
    fn is_retryable(&self) -> bool {
        match self {
            GithubError::Transport(_) => true,
            GithubError::RateLimited(_) => false,
            GithubError::Status { status, .. } => *status >= 500,
        }
    }
}

impl From<reqwest::Error> for GithubError {
    fn from(e: reqwest::Error) -> Self {
        GithubError::Transport(e.to_string())
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub remaining: u64,
    /// Unix epoch at which the window resets.
    pub reset: u64,
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub fork: bool,
    pub parent_full_name: Option<String>,
    pub default_branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub html_url: String,
    pub number: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    /// "queued" | "in_progress" | "completed"
    pub status: String,
    pub conclusion: Option<String>,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunJob {
    pub id: u64,
    pub name: String,
    pub conclusion: Option<String>,
}

#[derive(Deserialize)]
struct ContentsResponse {
    path: String,
    content: Option<String>,
}

#[derive(Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Deserialize)]
struct RateLimitCore {
    remaining: u64,
    reset: u64,
}

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    fork: bool,
    default_branch: String,
    parent: Option<ParentRepo>,
}

#[derive(Deserialize)]
struct ParentRepo {
    full_name: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<RunJob>,
}

// ── Client ───────────────────────────────────────────────────────────────

/// Thin async client over the host REST API. Credentials are passed per
/// call so the token pool can rotate them between operations; rate-limit
/// responses surface as `GithubError::RateLimited`.
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
}

impl GithubClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_API_BASE.to_string(),
        })
    }

    /// Point the client at a different API root (tests, GHE).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, token: &str, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Map a response into our error taxonomy; rate-limit 403/429s become
    /// `RateLimited` so the pool can rotate.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, GithubError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = trim_body(&resp.text().await.unwrap_or_default());
        if status.as_u16() == 429
            || (status.as_u16() == 403 && body.to_lowercase().contains("rate limit"))
        {
            return Err(GithubError::RateLimited(body));
        }
        Err(GithubError::Status {
            status: status.as_u16(),
            body,
        })
    }

    // ── Rate limit / identity ────────────────────────────────────────────

    pub async fn rate_limit(&self, token: &str) -> Result<RateLimit, GithubError> {
        let resp = self
            .request(reqwest::Method::GET, token, "/rate_limit")
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let parsed: RateLimitResponse = Self::check(resp).await?.json().await?;
        Ok(RateLimit {
            remaining: parsed.resources.core.remaining,
            reset: parsed.resources.core.reset,
        })
    }

    pub async fn authenticated_user(&self, token: &str) -> Result<String, GithubError> {
        let resp = self.request(reqwest::Method::GET, token, "/user").send().await?;
        let parsed: UserResponse = Self::check(resp).await?.json().await?;
        Ok(parsed.login)
    }

    // ── Contents ─────────────────────────────────────────────────────────

    /// Fetch a file at `path`, decoded from the contents API's base64
    /// envelope. `Ok(None)` means the path does not exist.
    pub async fn file_contents(
        &self,
        token: &str,
        full_name: &str,
        path: &str,
    ) -> Result<Option<RemoteFile>, GithubError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/contents/{path}"),
            )
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let parsed: ContentsResponse = Self::check(resp).await?.json().await?;
        let encoded: String = parsed
            .content
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| GithubError::Transport(format!("contents decode: {e}")))?;
        Ok(Some(RemoteFile {
            path: parsed.path,
            content: String::from_utf8_lossy(&bytes).into_owned(),
        }))
    }

    /// List a directory via the contents API. `Ok(None)` when absent.
    pub async fn list_dir(
        &self,
        token: &str,
        full_name: &str,
        path: &str,
    ) -> Result<Option<Vec<DirEntry>>, GithubError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/contents/{path}"),
            )
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let entries: Vec<DirEntry> = Self::check(resp).await?.json().await?;
        Ok(Some(entries))
    }

    /// Fetch raw text from a download URL handed back by the contents API.
    pub async fn download_text(&self, token: &str, url: &str) -> Result<String, GithubError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(LOG_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check(resp).await?.text().await?)
    }

    // ── Repos / forks ────────────────────────────────────────────────────

    pub async fn repo_info(
        &self,
        token: &str,
        full_name: &str,
    ) -> Result<Option<RepoInfo>, GithubError> {
        let resp = self
            .request(reqwest::Method::GET, token, &format!("/repos/{full_name}"))
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let parsed: RepoResponse = Self::check(resp).await?.json().await?;
        Ok(Some(RepoInfo {
            fork: parsed.fork,
            parent_full_name: parsed.parent.map(|p| p.full_name),
            default_branch: parsed.default_branch,
        }))
    }

    pub async fn create_fork(&self, token: &str, full_name: &str) -> Result<(), GithubError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                token,
                &format!("/repos/{full_name}/forks"),
            )
            .timeout(LOG_TIMEOUT)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    // ── Git refs / files ─────────────────────────────────────────────────

    pub async fn ref_sha(
        &self,
        token: &str,
        full_name: &str,
        branch: &str,
    ) -> Result<Option<String>, GithubError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/git/refs/heads/{branch}"),
            )
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let parsed: RefResponse = Self::check(resp).await?.json().await?;
        Ok(Some(parsed.object.sha))
    }

    /// Delete a branch ref; an already-absent ref is not an error.
    pub async fn delete_ref(
        &self,
        token: &str,
        full_name: &str,
        branch: &str,
    ) -> Result<(), GithubError> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                token,
                &format!("/repos/{full_name}/git/refs/heads/{branch}"),
            )
            .send()
            .await?;
        if matches!(resp.status().as_u16(), 404 | 422) {
            return Ok(());
        }
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn create_ref(
        &self,
        token: &str,
        full_name: &str,
        branch: &str,
        sha: &str,
    ) -> Result<(), GithubError> {
        let resp = self
            .request(reqwest::Method::POST, token, &format!("/repos/{full_name}/git/refs"))
            .json(&json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": sha,
            }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Create or update a file on a branch, carrying the existing blob SHA
    /// when the path already exists (the API requires it for updates).
    pub async fn put_file(
        &self,
        token: &str,
        full_name: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(), GithubError> {
        let existing = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/contents/{path}"),
            )
            .query(&[("ref", branch)])
            .send()
            .await?;
        let existing_sha = if existing.status().is_success() {
            existing
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("sha").and_then(|s| s.as_str()).map(str::to_string))
        } else {
            None
        };

        let mut body = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            body["sha"] = json!(sha);
        }

        let resp = self
            .request(
                reqwest::Method::PUT,
                token,
                &format!("/repos/{full_name}/contents/{path}"),
            )
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    // ── Pull requests ────────────────────────────────────────────────────

    pub async fn open_pull_request(
        &self,
        token: &str,
        base_full_name: &str,
        head: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, GithubError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                token,
                &format!("/repos/{base_full_name}/pulls"),
            )
            .json(&json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base_branch,
            }))
            .send()
            .await?;
        let parsed: PullRequest = Self::check(resp).await?.json().await?;
        Ok(parsed)
    }

    // ── Workflow runs ────────────────────────────────────────────────────

    pub async fn list_runs(
        &self,
        token: &str,
        full_name: &str,
        branch: &str,
    ) -> Result<Vec<WorkflowRun>, GithubError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/actions/runs"),
            )
            .query(&[("branch", branch), ("per_page", "5")])
            .send()
            .await?;
        let parsed: RunsResponse = Self::check(resp).await?.json().await?;
        Ok(parsed.workflow_runs)
    }

    pub async fn workflow_run(
        &self,
        token: &str,
        full_name: &str,
        run_id: u64,
    ) -> Result<WorkflowRun, GithubError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/actions/runs/{run_id}"),
            )
            .send()
            .await?;
        let parsed: WorkflowRun = Self::check(resp).await?.json().await?;
        Ok(parsed)
    }

    pub async fn run_jobs(
        &self,
        token: &str,
        full_name: &str,
        run_id: u64,
    ) -> Result<Vec<RunJob>, GithubError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/actions/runs/{run_id}/jobs"),
            )
            .send()
            .await?;
        let parsed: JobsResponse = Self::check(resp).await?.json().await?;
        Ok(parsed.jobs)
    }

    pub async fn job_logs(
        &self,
        token: &str,
        full_name: &str,
        job_id: u64,
    ) -> Result<String, GithubError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                token,
                &format!("/repos/{full_name}/actions/jobs/{job_id}/logs"),
            )
            .timeout(LOG_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check(resp).await?.text().await?)
    }
}

/// Keep error bodies loggable: first 300 chars, clamped to a char boundary.
fn trim_body(body: &str) -> String {
    let mut end = body.len().min(300);
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_body_respects_char_boundaries() {
        let s = "é".repeat(400);
        let trimmed = trim_body(&s);
        assert!(trimmed.len() <= 300);
        assert!(s.starts_with(&trimmed));
    }

    #[test]
    fn status_retryability() {
        assert!(GithubError::Transport("timeout".into()).is_retryable());
        assert!(GithubError::Status { status: 502, body: String::new() }.is_retryable());
        assert!(!GithubError::Status { status: 404, body: String::new() }.is_retryable());
        assert!(!GithubError::RateLimited(String::new()).is_retryable());
    }
}
