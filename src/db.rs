use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::analyzer::{Alternative, RepoAnalysis};
use crate::github::RepoAttributes;

/// Stored repository row, provider attributes plus local bookkeeping timestamps
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRepo {
    pub id: i64,
    pub full_name: String,
    pub description: Option<String>,
    pub url: String,
    pub avatar_url: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub open_issues: u64,
    pub size_kb: u64,
    pub topics: Vec<String>,
    pub license: Option<String>,
    pub archived: bool,
    pub disabled: bool,
    pub default_branch: Option<String>,
    pub repo_created_at: Option<String>,
    pub repo_updated_at: Option<String>,
    pub repo_pushed_at: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored analysis row, one per repository
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAnalysis {
    pub id: i64,
    pub repo_id: i64,
    pub category: String,
    pub summary: String,
    pub strengths: Vec<String>,
    pub considerations: Vec<String>,
    pub use_case: String,
    pub audience: String,
    pub alternatives: Vec<Alternative>,
    /// Concatenated prose kept for display consumers that read one text field
    pub legacy_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the paginated listing, with the analysis category joined in
#[derive(Debug, Clone, Serialize)]
pub struct RepoSummary {
    pub id: i64,
    pub full_name: String,
    pub description: Option<String>,
    pub url: String,
    pub avatar_url: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub updated_at: DateTime<Utc>,
    pub category: Option<String>,
    pub has_analysis: bool,
}

/// Sort key for the listing query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Stars,
    Name,
    Updated,
}

impl SortKey {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stars" => Some(SortKey::Stars),
            "name" => Some(SortKey::Name),
            "updated" => Some(SortKey::Updated),
            _ => None,
        }
    }

    fn column(self) -> &'static str {
        match self {
            SortKey::Stars => "r.stars",
            SortKey::Name => "r.full_name COLLATE NOCASE",
            SortKey::Updated => "r.updated_at",
        }
    }

    fn default_order(self) -> SortOrder {
        match self {
            SortKey::Name => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Listing parameters; page is 1-based, per_page is clamped to 1..=100
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub query: Option<String>,
    pub sort: SortKey,
    pub order: Option<SortOrder>,
    pub page: u64,
    pub per_page: u64,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            query: None,
            sort: SortKey::Stars,
            order: None,
            page: 1,
            per_page: 20,
        }
    }
}

const REPO_COLUMNS: &str = "id, full_name, description, url, avatar_url, language, stars, forks, \
     open_issues, size_kb, topics, license, archived, disabled, default_branch, \
     repo_created_at, repo_updated_at, repo_pushed_at, created_at, updated_at";

const ANALYSIS_COLUMNS: &str = "id, repo_id, category, summary, strengths, considerations, \
     use_case, audience, alternatives, legacy_text, created_at, updated_at";

/// The connection sits behind a mutex so a Database can be borrowed from
/// futures that cross await points (rusqlite's Connection is Send but not
/// Sync). Calls hold the lock only for the duration of one statement.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Set busy timeout to handle concurrent access from multiple connections
        // SQLite will retry for up to 30 seconds before returning SQLITE_BUSY
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let db = Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database for testing
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // A poisoned lock only means another thread panicked mid-statement; the
    // connection itself is still usable, so recover the guard
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS repos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                full_name TEXT UNIQUE COLLATE NOCASE NOT NULL,
                description TEXT,
                url TEXT NOT NULL,
                avatar_url TEXT,
                language TEXT,
                stars INTEGER NOT NULL DEFAULT 0,
                forks INTEGER NOT NULL DEFAULT 0,
                open_issues INTEGER NOT NULL DEFAULT 0,
                size_kb INTEGER NOT NULL DEFAULT 0,
                topics TEXT NOT NULL DEFAULT '[]',
                license TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                default_branch TEXT,
                repo_created_at TEXT,
                repo_updated_at TEXT,
                repo_pushed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_repos_stars ON repos(stars DESC);
            CREATE INDEX IF NOT EXISTS idx_repos_updated ON repos(updated_at DESC);

            CREATE TABLE IF NOT EXISTS analyses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id INTEGER UNIQUE NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                summary TEXT NOT NULL,
                strengths TEXT NOT NULL DEFAULT '[]',
                considerations TEXT NOT NULL DEFAULT '[]',
                use_case TEXT NOT NULL DEFAULT '',
                audience TEXT NOT NULL DEFAULT '',
                alternatives TEXT NOT NULL DEFAULT '[]',
                legacy_text TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Insert or update a repository by its unique full name.
    ///
    /// The unique index on full_name is the concurrency control: concurrent
    /// first-time inserts for the same key converge to a single row via
    /// ON CONFLICT DO UPDATE, and a loser that still hits a constraint error
    /// re-reads the winner's row instead of surfacing the failure.
    pub fn upsert_repo(&self, attrs: &RepoAttributes, topics: &[String]) -> Result<StoredRepo> {
        let now = Utc::now().to_rfc3339();
        let topics_json = serde_json::to_string(topics)?;
        let license = attrs.license.as_ref().and_then(|l| l.name.clone());
        let avatar = if attrs.owner.avatar_url.is_empty() {
            None
        } else {
            Some(attrs.owner.avatar_url.clone())
        };

        let result = self.conn().execute(
            "INSERT INTO repos (full_name, description, url, avatar_url, language, stars, forks,
                                open_issues, size_kb, topics, license, archived, disabled,
                                default_branch, repo_created_at, repo_updated_at, repo_pushed_at,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)
             ON CONFLICT(full_name) DO UPDATE SET
                description = excluded.description,
                url = excluded.url,
                avatar_url = excluded.avatar_url,
                language = excluded.language,
                stars = excluded.stars,
                forks = excluded.forks,
                open_issues = excluded.open_issues,
                size_kb = excluded.size_kb,
                topics = excluded.topics,
                license = excluded.license,
                archived = excluded.archived,
                disabled = excluded.disabled,
                default_branch = excluded.default_branch,
                repo_created_at = excluded.repo_created_at,
                repo_updated_at = excluded.repo_updated_at,
                repo_pushed_at = excluded.repo_pushed_at,
                updated_at = excluded.updated_at",
            params![
                attrs.full_name,
                attrs.description,
                attrs.html_url,
                avatar,
                attrs.language,
                attrs.stargazers_count as i64,
                attrs.forks_count as i64,
                attrs.open_issues_count as i64,
                attrs.size as i64,
                topics_json,
                license,
                attrs.archived,
                attrs.disabled,
                attrs.default_branch,
                attrs.created_at,
                attrs.updated_at,
                attrs.pushed_at,
                now,
            ],
        );

        if let Err(e) = result {
            if !is_unique_violation(&e) {
                return Err(e.into());
            }
            // Lost a race that ON CONFLICT could not absorb: fall through to re-read
        }

        self.get_repo(&attrs.full_name)?
            .context("repo row missing after upsert")
    }

    /// Look up a repository by full name (case-insensitive)
    pub fn get_repo(&self, full_name: &str) -> Result<Option<StoredRepo>> {
        let sql = format!("SELECT {} FROM repos WHERE full_name = ?1", REPO_COLUMNS);
        self.conn()
            .query_row(&sql, params![full_name], row_to_repo)
            .optional()
            .map_err(Into::into)
    }

    /// Insert or update the analysis for a repository.
    /// Same convergence contract as upsert_repo, keyed on repo_id.
    pub fn upsert_analysis(&self, repo_id: i64, analysis: &RepoAnalysis) -> Result<StoredAnalysis> {
        let now = Utc::now().to_rfc3339();
        let strengths = serde_json::to_string(&analysis.strengths)?;
        let considerations = serde_json::to_string(&analysis.considerations)?;
        let alternatives = serde_json::to_string(&analysis.alternatives)?;
        let legacy_text = analysis.legacy_text();

        let result = self.conn().execute(
            "INSERT INTO analyses (repo_id, category, summary, strengths, considerations,
                                   use_case, audience, alternatives, legacy_text,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(repo_id) DO UPDATE SET
                category = excluded.category,
                summary = excluded.summary,
                strengths = excluded.strengths,
                considerations = excluded.considerations,
                use_case = excluded.use_case,
                audience = excluded.audience,
                alternatives = excluded.alternatives,
                legacy_text = excluded.legacy_text,
                updated_at = excluded.updated_at",
            params![
                repo_id,
                analysis.category,
                analysis.summary,
                strengths,
                considerations,
                analysis.use_case,
                analysis.audience,
                alternatives,
                legacy_text,
                now,
            ],
        );

        if let Err(e) = result {
            if !is_unique_violation(&e) {
                return Err(e.into());
            }
        }

        self.get_analysis(repo_id)?
            .context("analysis row missing after upsert")
    }

    /// Get the analysis for a repository, if one exists
    pub fn get_analysis(&self, repo_id: i64) -> Result<Option<StoredAnalysis>> {
        let sql = format!("SELECT {} FROM analyses WHERE repo_id = ?1", ANALYSIS_COLUMNS);
        self.conn()
            .query_row(&sql, params![repo_id], row_to_analysis)
            .optional()
            .map_err(Into::into)
    }

    /// Paginated listing with optional name/description search.
    /// Returns the page rows and the total match count.
    pub fn list_repos(&self, opts: &ListOptions) -> Result<(Vec<RepoSummary>, u64)> {
        let per_page = opts.per_page.clamp(1, 100);
        let page = opts.page.max(1);
        // page is caller-supplied; saturate so an absurd value cannot overflow,
        // and cap at what SQLite's integer OFFSET can carry
        let offset = (page - 1).saturating_mul(per_page).min(i64::MAX as u64);
        let order = opts.order.unwrap_or_else(|| opts.sort.default_order());

        let pattern = opts
            .query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .map(|q| format!("%{}%", q.trim()));

        let where_clause = if pattern.is_some() {
            "WHERE r.full_name LIKE ?1 OR r.description LIKE ?1"
        } else {
            ""
        };

        let conn = self.conn();

        let total: u64 = {
            let sql = format!("SELECT COUNT(*) FROM repos r {}", where_clause);
            match &pattern {
                Some(p) => conn.query_row(&sql, params![p], |row| row.get(0))?,
                None => conn.query_row(&sql, [], |row| row.get(0))?,
            }
        };

        // Sort column and order come from closed enums, never from user input
        let sql = format!(
            "SELECT r.id, r.full_name, r.description, r.url, r.avatar_url, r.language,
                    r.stars, r.updated_at, a.category
             FROM repos r
             LEFT JOIN analyses a ON a.repo_id = r.id
             {}
             ORDER BY {} {}
             LIMIT {} OFFSET {}",
            where_clause,
            opts.sort.column(),
            order.keyword(),
            per_page,
            offset
        );

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RepoSummary> {
            let category: Option<String> = row.get(8)?;
            Ok(RepoSummary {
                id: row.get(0)?,
                full_name: row.get(1)?,
                description: row.get(2)?,
                url: row.get(3)?,
                avatar_url: row.get(4)?,
                language: row.get(5)?,
                stars: row.get::<_, i64>(6)? as u64,
                updated_at: parse_ts(row, 7)?,
                has_analysis: category.is_some(),
                category,
            })
        };

        let rows = match &pattern {
            Some(p) => stmt.query_map(params![p], map_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt.query_map([], map_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
        };

        Ok((rows, total))
    }

    /// Total row counts (repos, analyses)
    pub fn stats(&self) -> Result<(u64, u64)> {
        let conn = self.conn();
        let repos: u64 = conn.query_row("SELECT COUNT(*) FROM repos", [], |row| row.get(0))?;
        let analyses: u64 =
            conn.query_row("SELECT COUNT(*) FROM analyses", [], |row| row.get(0))?;
        Ok((repos, analyses))
    }

    /// Delete a repository (the analysis cascades). Not reachable from the HTTP
    /// surface; kept for operator cleanup via sqlite3 parity in tests.
    #[cfg(test)]
    pub fn delete_repo(&self, full_name: &str) -> Result<usize> {
        self.conn()
            .execute("DELETE FROM repos WHERE full_name = ?1", params![full_name])
            .map_err(Into::into)
    }

    /// Backdate an analysis so staleness paths can be exercised
    #[cfg(test)]
    pub fn backdate_analysis(&self, repo_id: i64, by: chrono::Duration) -> Result<()> {
        let then = (Utc::now() - by).to_rfc3339();
        self.conn().execute(
            "UPDATE analyses SET updated_at = ?1, created_at = ?1 WHERE repo_id = ?2",
            params![then, repo_id],
        )?;
        Ok(())
    }

    /// Backdate a repo row's local creation time
    #[cfg(test)]
    pub fn backdate_repo(&self, repo_id: i64, by: chrono::Duration) -> Result<()> {
        let then = (Utc::now() - by).to_rfc3339();
        self.conn().execute(
            "UPDATE repos SET created_at = ?1 WHERE id = ?2",
            params![then, repo_id],
        )?;
        Ok(())
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_json_list<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Vec<T>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRepo> {
    Ok(StoredRepo {
        id: row.get(0)?,
        full_name: row.get(1)?,
        description: row.get(2)?,
        url: row.get(3)?,
        avatar_url: row.get(4)?,
        language: row.get(5)?,
        stars: row.get::<_, i64>(6)? as u64,
        forks: row.get::<_, i64>(7)? as u64,
        open_issues: row.get::<_, i64>(8)? as u64,
        size_kb: row.get::<_, i64>(9)? as u64,
        topics: parse_json_list(row, 10)?,
        license: row.get(11)?,
        archived: row.get(12)?,
        disabled: row.get(13)?,
        default_branch: row.get(14)?,
        repo_created_at: row.get(15)?,
        repo_updated_at: row.get(16)?,
        repo_pushed_at: row.get(17)?,
        created_at: parse_ts(row, 18)?,
        updated_at: parse_ts(row, 19)?,
    })
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredAnalysis> {
    Ok(StoredAnalysis {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        category: row.get(2)?,
        summary: row.get(3)?,
        strengths: parse_json_list(row, 4)?,
        considerations: parse_json_list(row, 5)?,
        use_case: row.get(6)?,
        audience: row.get(7)?,
        alternatives: parse_json_list(row, 8)?,
        legacy_text: row.get(9)?,
        created_at: parse_ts(row, 10)?,
        updated_at: parse_ts(row, 11)?,
    })
}
