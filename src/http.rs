//! HTTP surface: submit, resolve, list, and status routes

use anyhow::Result;
use axum::{
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};

use crate::db::{Database, ListOptions, RepoSummary, SortKey, SortOrder, StoredAnalysis, StoredRepo};
use crate::github::parse_repo_url;
use crate::orchestrator::{Orchestrator, ResolveError};

/// Shared state for the HTTP server. Each request opens its own database
/// connection; the store's unique keys handle the concurrency.
#[derive(Clone)]
struct AppState {
    db_path: PathBuf,
    orch: Orchestrator,
}

#[derive(Deserialize)]
struct SubmitRequest {
    url: String,
}

#[derive(Deserialize)]
struct ResolveParams {
    #[serde(default)]
    refresh: bool,
}

#[derive(Deserialize)]
struct ListParams {
    q: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    page: Option<u64>,
    per_page: Option<u64>,
}

#[derive(Serialize)]
struct ResolveResponse {
    repository: StoredRepo,
    analysis: StoredAnalysis,
}

#[derive(Serialize)]
struct ListResponse {
    items: Vec<RepoSummary>,
    total: u64,
    page: u64,
    per_page: u64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/repos", post(submit_handler).get(list_handler))
        .route("/api/repos/:owner/:name", get(resolve_handler))
        .route("/api/repos/:owner/:name/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(db_path: PathBuf, port: u16, orch: Orchestrator) -> Result<()> {
    let app = router(AppState { db_path, orch });

    let addr = format!("127.0.0.1:{}", port);
    eprintln!("\x1b[32mok\x1b[0m repolens listening at http://{}", addr);
    eprintln!("    Press Ctrl+C to stop");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn open_db(state: &AppState) -> Result<Database, Response> {
    Database::open(&state.db_path).map_err(|e| {
        eprintln!("\x1b[31m[http]\x1b[0m storage unavailable: {}", e);
        error_json(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
    })
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// NotFound -> 404, RateLimited -> 429, AnalysisInProgress -> 202,
/// everything else -> 500
fn resolve_error_response(err: ResolveError) -> Response {
    match err {
        ResolveError::NotFound(full_name) => error_json(
            StatusCode::NOT_FOUND,
            &format!("repository {} not found", full_name),
        ),
        ResolveError::RateLimited => error_json(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limited by GitHub, try again later",
        ),
        ResolveError::AnalysisInProgress => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "analyzing" })),
        )
            .into_response(),
        ResolveError::Misconfigured(msg) => {
            eprintln!("\x1b[31m[http]\x1b[0m misconfigured: {}", msg);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "server misconfigured")
        }
        other => {
            eprintln!("\x1b[31m[http]\x1b[0m resolve failed: {}", other);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "unexpected error")
        }
    }
}

/// Submit a repository URL for analysis
async fn submit_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Response {
    let Some((owner, name)) = parse_repo_url(&req.url) else {
        return error_json(StatusCode::BAD_REQUEST, "not a valid GitHub repository URL");
    };

    let db = match open_db(&state) {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    match state.orch.resolve(&db, &owner, &name, false).await {
        Ok((repository, analysis)) => Json(ResolveResponse {
            repository,
            analysis,
        })
        .into_response(),
        Err(e) => resolve_error_response(e),
    }
}

/// Resolve a known owner/name pair, optionally forcing a refresh
async fn resolve_handler(
    State(state): State<AppState>,
    UrlPath((owner, name)): UrlPath<(String, String)>,
    Query(params): Query<ResolveParams>,
) -> Response {
    let db = match open_db(&state) {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    match state.orch.resolve(&db, &owner, &name, params.refresh).await {
        Ok((repository, analysis)) => Json(ResolveResponse {
            repository,
            analysis,
        })
        .into_response(),
        Err(e) => resolve_error_response(e),
    }
}

/// Status projection for polling clients
async fn status_handler(
    State(state): State<AppState>,
    UrlPath((owner, name)): UrlPath<(String, String)>,
) -> Response {
    let db = match open_db(&state) {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    match state.orch.status(&db, &owner, &name) {
        Ok(status) => Json(status).into_response(),
        Err(e) => resolve_error_response(e),
    }
}

/// Paginated listing with search and sort
async fn list_handler(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    let db = match open_db(&state) {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    let opts = list_options(&params);

    match db.list_repos(&opts) {
        Ok((items, total)) => Json(ListResponse {
            items,
            total,
            page: opts.page.max(1),
            per_page: opts.per_page.clamp(1, 100),
        })
        .into_response(),
        Err(e) => {
            eprintln!("\x1b[31m[http]\x1b[0m list failed: {}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "unexpected error")
        }
    }
}

fn list_options(params: &ListParams) -> ListOptions {
    let sort = params
        .sort
        .as_deref()
        .and_then(SortKey::from_str)
        .unwrap_or(SortKey::Stars);

    let order = match params.order.as_deref() {
        Some("asc") => Some(SortOrder::Asc),
        Some("desc") => Some(SortOrder::Desc),
        _ => None,
    };

    ListOptions {
        query: params.q.clone(),
        sort,
        order,
        page: params.page.unwrap_or(1),
        per_page: params.per_page.unwrap_or(20),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::OpenAiGenerator;
    use crate::github::GitHubClient;
    use std::sync::Arc;

    #[test]
    fn test_router_builds_with_all_handlers() {
        // Routing fails to compile unless every handler future is Send
        let orch = Orchestrator::new(
            Arc::new(GitHubClient::new(None)),
            Arc::new(OpenAiGenerator::new(String::new(), false)),
            false,
        );
        let _app = router(AppState {
            db_path: PathBuf::from(":memory:"),
            orch,
        });
    }

    fn params(sort: Option<&str>, order: Option<&str>) -> ListParams {
        ListParams {
            q: None,
            sort: sort.map(String::from),
            order: order.map(String::from),
            page: None,
            per_page: None,
        }
    }

    #[test]
    fn test_list_options_defaults() {
        let opts = list_options(&params(None, None));
        assert_eq!(opts.sort, SortKey::Stars);
        assert_eq!(opts.order, None);
        assert_eq!(opts.page, 1);
        assert_eq!(opts.per_page, 20);
    }

    #[test]
    fn test_list_options_parses_sort_and_order() {
        let opts = list_options(&params(Some("name"), Some("desc")));
        assert_eq!(opts.sort, SortKey::Name);
        assert_eq!(opts.order, Some(SortOrder::Desc));
    }

    #[test]
    fn test_list_options_ignores_unknown_sort() {
        let opts = list_options(&params(Some("created_at; DROP TABLE repos"), Some("sideways")));
        assert_eq!(opts.sort, SortKey::Stars);
        assert_eq!(opts.order, None);
    }

    #[test]
    fn test_error_mapping_statuses() {
        let resp = resolve_error_response(ResolveError::NotFound("a/b".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = resolve_error_response(ResolveError::RateLimited);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = resolve_error_response(ResolveError::AnalysisInProgress);
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = resolve_error_response(ResolveError::Misconfigured("no token".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = resolve_error_response(ResolveError::Provider("boom".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
