//! Analysis orchestrator
//!
//! Decides, for an owner/name pair, whether to serve cached rows, fetch fresh
//! metadata from the provider, and (re)generate the analysis. Every mutating
//! step is an idempotent upsert keyed on a natural unique key, so concurrent
//! identical requests converge instead of colliding; there is no lock.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::analyzer::{Alternative, AnalysisGenerator, GenerationMode, RepoAnalysis};
use crate::db::{Database, StoredAnalysis, StoredRepo};
use crate::github::{FetchError, LicenseInfo, MetadataProvider, OwnerInfo, RepoAttributes};

/// Analyses older than this are regenerated on the next resolve
pub const STALE_AFTER_DAYS: i64 = 7;

/// A repo row younger than this with no analysis is treated as "analysis in
/// progress" rather than "never started". Placeholder heuristic; a background
/// job signal would replace it.
pub const ANALYSIS_GRACE_SECS: i64 = 120;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("repository {0} not found")]
    NotFound(String),
    #[error("rate limited by the metadata provider, retry later")]
    RateLimited,
    #[error("provider credentials missing or rejected: {0}")]
    Misconfigured(String),
    #[error("provider request failed: {0}")]
    Provider(String),
    #[error("storage unavailable: {0}")]
    Storage(anyhow::Error),
    #[error("analysis still in progress")]
    AnalysisInProgress,
}

// anyhow::Error does not implement std::error::Error, so thiserror's #[from]
// cannot derive this conversion
impl From<anyhow::Error> for ResolveError {
    fn from(err: anyhow::Error) -> Self {
        ResolveError::Storage(err)
    }
}

/// Read-only projection for polling clients
#[derive(Debug, Clone, Serialize)]
pub struct RepoStatus {
    pub exists: bool,
    pub has_analysis: bool,
    pub is_analyzing: bool,
}

/// Pure staleness check, shared by the analysis and force-refresh policies
pub fn is_stale(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - updated_at > Duration::days(STALE_AFTER_DAYS)
}

#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn MetadataProvider>,
    generator: Arc<dyn AnalysisGenerator>,
    debug: bool,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn MetadataProvider>,
        generator: Arc<dyn AnalysisGenerator>,
        debug: bool,
    ) -> Self {
        Self {
            provider,
            generator,
            debug,
        }
    }

    /// Resolve a repository and its analysis, using cached rows when they are
    /// fresh and materializing the rest. Generator failure never propagates:
    /// the result always carries a valid analysis or a non-generator error.
    pub async fn resolve(
        &self,
        db: &Database,
        owner: &str,
        name: &str,
        force_refresh: bool,
    ) -> Result<(StoredRepo, StoredAnalysis), ResolveError> {
        let full_name = format!("{}/{}", owner, name);
        let existing = db.get_repo(&full_name)?;

        // Cache-hit fast path: the only path with no external calls
        if let Some(repo) = &existing {
            if !force_refresh {
                if let Some(analysis) = db.get_analysis(repo.id)? {
                    if !is_stale(analysis.updated_at, Utc::now()) {
                        return Ok((repo.clone(), analysis));
                    }
                }
            }
        }

        // Repository materialization: first sighting or explicit refresh.
        // Staleness alone never triggers a provider call; the provider is only
        // consulted on demand.
        let first_time = existing.is_none();
        let repo = match existing {
            Some(repo) if !force_refresh => repo,
            _ => {
                let attrs = self
                    .provider
                    .fetch(owner, name)
                    .await
                    .map_err(|e| map_fetch_error(e, &full_name))?;

                let mut topics = self.provider.fetch_topics(owner, name).await;
                if topics.is_empty() {
                    topics = attrs.topics.clone();
                }

                db.upsert_repo(&attrs, &topics)?
            }
        };

        let current = db.get_analysis(repo.id)?;

        if let Some(analysis) = &current {
            if !force_refresh && !is_stale(analysis.updated_at, Utc::now()) {
                return Ok((repo, analysis.clone()));
            }
        }

        // A missing analysis on a repo row somebody else just created usually
        // means their generation is still running; tell the caller to poll
        // instead of racing a second generation.
        if current.is_none() && !force_refresh && !first_time {
            let age = Utc::now() - repo.created_at;
            if age < Duration::seconds(ANALYSIS_GRACE_SECS) {
                return Err(ResolveError::AnalysisInProgress);
            }
        }

        let analysis = self.generate_with_fallback(&repo).await;
        let stored = db.upsert_analysis(repo.id, &analysis)?;

        Ok((repo, stored))
    }

    /// Status projection for polling clients
    pub fn status(&self, db: &Database, owner: &str, name: &str) -> Result<RepoStatus, ResolveError> {
        let full_name = format!("{}/{}", owner, name);

        let repo = db.get_repo(&full_name)?;
        let has_analysis = match &repo {
            Some(r) => db.get_analysis(r.id)?.is_some(),
            None => false,
        };
        let exists = repo.is_some();

        Ok(RepoStatus {
            exists,
            has_analysis,
            is_analyzing: exists && !has_analysis,
        })
    }

    /// Standard attempt, strict retry, then deterministic synthesis. Never fails.
    async fn generate_with_fallback(&self, repo: &StoredRepo) -> RepoAnalysis {
        let attrs = stored_to_attrs(repo);

        match self.generator.generate(&attrs, GenerationMode::Standard).await {
            Ok(analysis) => analysis,
            Err(first) => {
                if self.debug {
                    eprintln!(
                        "\x1b[33m[analyze]\x1b[0m {} first attempt failed: {}",
                        repo.full_name, first
                    );
                }
                match self
                    .generator
                    .generate(&attrs, GenerationMode::StrictRetry)
                    .await
                {
                    Ok(analysis) => analysis,
                    Err(second) => {
                        eprintln!(
                            "\x1b[33m[analyze]\x1b[0m {} strict retry failed ({}), using synthesized analysis",
                            repo.full_name, second
                        );
                        synthesize_fallback(repo)
                    }
                }
            }
        }
    }
}

fn map_fetch_error(err: FetchError, full_name: &str) -> ResolveError {
    match err {
        FetchError::NotFound => ResolveError::NotFound(full_name.to_string()),
        FetchError::RateLimited => ResolveError::RateLimited,
        FetchError::AuthFailed => {
            ResolveError::Misconfigured("GitHub rejected the configured token".to_string())
        }
        FetchError::Transport(msg) => ResolveError::Provider(msg),
    }
}

/// Rebuild provider-shaped attributes from a stored row, for regeneration
/// paths that do not refetch metadata
fn stored_to_attrs(repo: &StoredRepo) -> RepoAttributes {
    RepoAttributes {
        full_name: repo.full_name.clone(),
        description: repo.description.clone(),
        html_url: repo.url.clone(),
        owner: OwnerInfo {
            avatar_url: repo.avatar_url.clone().unwrap_or_default(),
        },
        language: repo.language.clone(),
        stargazers_count: repo.stars,
        forks_count: repo.forks,
        open_issues_count: repo.open_issues,
        size: repo.size_kb,
        topics: repo.topics.clone(),
        license: repo.license.clone().map(|name| LicenseInfo { name: Some(name) }),
        archived: repo.archived,
        disabled: repo.disabled,
        default_branch: repo.default_branch.clone(),
        created_at: repo.repo_created_at.clone(),
        updated_at: repo.repo_updated_at.clone(),
        pushed_at: repo.repo_pushed_at.clone(),
    }
}

/// Minimal valid analysis synthesized from the repository's own attributes.
/// Every record invariant holds: non-empty category and summary, and exactly
/// one placeholder alternative with a valid URL and a reasoning string.
fn synthesize_fallback(repo: &StoredRepo) -> RepoAnalysis {
    let category = repo
        .language
        .clone()
        .unwrap_or_else(|| "General".to_string());

    let summary = match &repo.description {
        Some(desc) if !desc.trim().is_empty() => desc.clone(),
        _ => format!("{} is a repository hosted on GitHub.", repo.full_name),
    };

    let mut strengths = Vec::new();
    if repo.stars > 0 {
        strengths.push(format!("{} stars on GitHub", repo.stars));
    }
    if let Some(license) = &repo.license {
        strengths.push(format!("Licensed under {}", license));
    }
    if !repo.topics.is_empty() {
        strengths.push(format!("Tagged: {}", repo.topics.join(", ")));
    }
    if strengths.is_empty() {
        strengths.push("Source code is publicly available".to_string());
    }

    let mut considerations = vec![
        "Automated summary; the analysis service was unavailable".to_string(),
    ];
    if repo.archived {
        considerations.push("Repository is archived and no longer maintained".to_string());
    }

    let search_url = url::Url::parse_with_params(
        "https://github.com/search",
        &[
            ("q", format!("{} in:name,description,topics", category)),
            ("type", "repositories".to_string()),
        ],
    )
    .map(|u| u.to_string())
    .unwrap_or_else(|_| "https://github.com/search?type=repositories".to_string());

    let alternatives = vec![Alternative {
        name: format!("GitHub search: {} projects", category),
        url: search_url,
        description: None,
        github_url: None,
        stars: None,
        category: Some(category.clone()),
        reasoning: format!(
            "A search for comparable {} projects, since no curated alternatives could be generated.",
            category
        ),
    }];

    RepoAnalysis {
        category,
        summary,
        strengths,
        considerations,
        use_case: format!(
            "Projects that need what {} provides.",
            repo.full_name
        ),
        audience: "Developers evaluating this repository.".to_string(),
        alternatives,
    }
}
