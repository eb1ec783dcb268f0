//! GitHub REST client: the repository metadata provider.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Typed provider failure, mapped to caller-facing outcomes by the orchestrator.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("repository not found")]
    NotFound,
    #[error("GitHub rate limit exhausted")]
    RateLimited,
    #[error("GitHub rejected the credentials")]
    AuthFailed,
    #[error("GitHub request failed: {0}")]
    Transport(String),
}

/// Repository attributes as returned by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoAttributes {
    pub full_name: String,
    pub description: Option<String>,
    pub html_url: String,
    #[serde(default)]
    pub owner: OwnerInfo,
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub open_issues_count: u64,
    /// Repository size in KB, as GitHub reports it
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub topics: Vec<String>,
    pub license: Option<LicenseInfo>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub disabled: bool,
    pub default_branch: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub pushed_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerInfo {
    #[serde(default)]
    pub avatar_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseInfo {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TopicsResponse {
    names: Vec<String>,
}

/// Seam for the metadata provider so tests can substitute a fake.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch(&self, owner: &str, name: &str) -> Result<RepoAttributes, FetchError>;

    /// Topics lookup degrades to empty instead of failing.
    async fn fetch_topics(&self, owner: &str, name: &str) -> Vec<String>;
}

/// GitHub API client
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    token: Option<String>,
    debug: bool,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Self {
        Self::new_with_options(token, false)
    }

    pub fn new_with_options(token: Option<String>, debug: bool) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("repolens/0.1.0")
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            token,
            debug,
        }
    }

    /// Build REST request with auth header if token available
    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// REST GET with retry on transient errors, classifying terminal statuses
    async fn rest_get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut last_error = String::new();

        for attempt in 0..4 {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * (1 << attempt.min(3)));
                tokio::time::sleep(delay).await;
            }

            let start = std::time::Instant::now();
            let response = match self.request(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            if self.debug {
                let now = chrono::Local::now().format("%H:%M:%S%.3f");
                eprintln!(
                    "\x1b[90m[{}] GET {} ... {}ms\x1b[0m",
                    now,
                    url,
                    start.elapsed().as_millis()
                );
            }

            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            let remaining = response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());

            match classify_error_status(status, remaining) {
                Some(err) => return Err(err),
                None => {
                    last_error = format!("GitHub API error {}", status);
                    continue;
                }
            }
        }

        Err(FetchError::Transport(format!(
            "request failed after retries: {}",
            last_error
        )))
    }
}

/// Terminal error for a non-success status, or None when the attempt should
/// be retried with backoff. Every 5xx gets the retry budget.
fn classify_error_status(
    status: reqwest::StatusCode,
    ratelimit_remaining: Option<u64>,
) -> Option<FetchError> {
    use reqwest::StatusCode;

    match status {
        StatusCode::NOT_FOUND => Some(FetchError::NotFound),
        StatusCode::UNAUTHORIZED => Some(FetchError::AuthFailed),
        StatusCode::TOO_MANY_REQUESTS => Some(FetchError::RateLimited),
        // 403 is rate limiting when the quota header reads zero; a 403 with
        // remaining quota is an access problem, not a retry-later situation
        StatusCode::FORBIDDEN => Some(if ratelimit_remaining == Some(0) {
            FetchError::RateLimited
        } else {
            FetchError::AuthFailed
        }),
        s if s.is_server_error() => None,
        s => Some(FetchError::Transport(format!("GitHub API error {}", s))),
    }
}

#[async_trait]
impl MetadataProvider for GitHubClient {
    async fn fetch(&self, owner: &str, name: &str) -> Result<RepoAttributes, FetchError> {
        let url = format!("https://api.github.com/repos/{}/{}", owner, name);
        let response = self.rest_get(&url).await?;

        response
            .json::<RepoAttributes>()
            .await
            .map_err(|e| FetchError::Transport(format!("failed to parse repo payload: {}", e)))
    }

    async fn fetch_topics(&self, owner: &str, name: &str) -> Vec<String> {
        let url = format!("https://api.github.com/repos/{}/{}/topics", owner, name);

        let response = match self.rest_get(&url).await {
            Ok(r) => r,
            Err(e) => {
                if self.debug {
                    eprintln!("\x1b[33m[github]\x1b[0m topics fetch failed: {}", e);
                }
                return Vec::new();
            }
        };

        response
            .json::<TopicsResponse>()
            .await
            .map(|t| t.names)
            .unwrap_or_default()
    }
}

/// Parse "owner/name" out of a submitted GitHub URL or bare pair.
/// Accepts full URLs, trailing slashes, a trailing ".git", and "owner/name".
pub fn parse_repo_url(input: &str) -> Option<(String, String)> {
    let trimmed = input.trim();

    let path = if let Some(rest) = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .or_else(|| trimmed.strip_prefix("github.com/"))
    {
        rest
    } else {
        trimmed
    };

    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);

    let mut parts = path.split('/');
    let owner = parts.next()?.trim();
    let name = parts.next()?.trim();

    // Anything deeper than owner/name (blob, tree, issues...) is not a repo URL
    if parts.next().is_some() || owner.is_empty() || name.is_empty() {
        return None;
    }

    let valid = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !valid(owner) || !valid(name) {
        return None;
    }

    Some((owner.to_string(), name.to_string()))
}
