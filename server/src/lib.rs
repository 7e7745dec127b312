use anyhow::{bail, Result};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use edaoogle_core::{IndexPaths, RankedResult, SearchEngine, SearchOutcome};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Index root holding the published generation.
    pub index_dir: PathBuf,
    /// Document root for static files.
    pub home_dir: PathBuf,
    /// Prepended to a result url to form its link.
    pub link_prefix: String,
    pub admin_token: Option<String>,
    /// Comma-separated origins; any origin when unset.
    pub cors_allow_origin: Option<String>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub took_s: f64,
    pub total_hits: usize,
    pub generation: Option<u64>,
    pub results: Vec<RankedResult>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    engine: Arc<RwLock<SearchEngine>>,
    reload_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    /// Snapshot of the engine; the read lock is held only for the clone.
    fn engine(&self) -> SearchEngine {
        self.engine.read().clone()
    }
}

pub fn build_app(config: AppConfig) -> Result<Router> {
    if !config.home_dir.is_dir() {
        bail!("home directory {} does not exist", config.home_dir.display());
    }
    let engine = SearchEngine::open(&config.index_dir)?;
    match engine.generation() {
        Some(generation) => tracing::info!(generation, "serving published index"),
        None => tracing::warn!(index = %config.index_dir.display(), "no published index; searches return no results"),
    }

    let cors = match &config.cors_allow_origin {
        Some(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        None => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    let static_files = ServeDir::new(&config.home_dir);
    let app_state = AppState {
        config: Arc::new(config),
        engine: Arc::new(RwLock::new(engine)),
        reload_lock: Arc::new(tokio::sync::Mutex::new(())),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", get(search_page_handler))
        .route("/api/search", get(search_api_handler))
        .route("/index/reload", post(reload_handler))
        .fallback_service(static_files)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);
    Ok(app)
}

async fn run_search(engine: SearchEngine, query: &str) -> Result<SearchOutcome, (StatusCode, String)> {
    let query = query.to_string();
    tokio::task::spawn_blocking(move || engine.search(&query))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            tracing::error!(error = %e, "search failed");
            (StatusCode::SERVICE_UNAVAILABLE, "search unavailable".to_string())
        })
}

pub async fn search_api_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    let engine = state.engine();
    let generation = engine.generation();
    let outcome = run_search(engine, &params.q).await?;
    Ok(Json(SearchResponse {
        query: params.q,
        took_s: outcome.elapsed.as_secs_f64(),
        total_hits: outcome.results.len(),
        generation,
        results: outcome.results,
    }))
}

pub async fn search_page_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> (StatusCode, Html<String>) {
    match run_search(state.engine(), &params.q).await {
        Ok(outcome) => (StatusCode::OK, Html(render_results_page(&params.q, &outcome, &state.config.link_prefix))),
        Err((status, message)) => (status, Html(render_error_page(&params.q, &message))),
    }
}

async fn reload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    let _guard = state.reload_lock.lock().await;
    let unavailable = |e: edaoogle_core::IndexError| (StatusCode::SERVICE_UNAVAILABLE, e.to_string());

    let current = state.engine().generation();
    let published = IndexPaths::new(&state.config.index_dir).published_generation().map_err(unavailable)?;
    if published == current {
        return Ok(Json(serde_json::json!({ "generation": current, "reloaded": false })));
    }
    let root = state.config.index_dir.clone();
    let engine = tokio::task::spawn_blocking(move || SearchEngine::open(root))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(unavailable)?;
    let generation = engine.generation();
    *state.engine.write() = engine;
    tracing::info!(?generation, "reloaded published index");
    Ok(Json(serde_json::json!({ "generation": generation, "reloaded": true })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let required = match &state.config.admin_token {
        Some(t) => t,
        None => return Err((StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set".into())),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid admin token".into()))
    }
}

fn page_header(query: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8" />
    <title>EDAoogle</title>
    <link href="https://fonts.googleapis.com/css2?family=Inter:wght@400;800&display=swap" rel="stylesheet" />
    <link rel="stylesheet" href="/css/style.css" />
</head>
<body>
    <article class="edaoogle">
        <div class="title"><a href="/">EDAoogle</a></div>
        <div class="search">
            <form action="/search" method="get">
                <input type="text" name="q" value="{}" autofocus>
            </form>
        </div>
"#,
        escape_html(query)
    )
}

const PAGE_TRAILER: &str = "    </article>\n</body>\n</html>\n";

pub fn render_results_page(query: &str, outcome: &SearchOutcome, link_prefix: &str) -> String {
    let mut page = page_header(query);
    let _ = writeln!(
        page,
        "        <div class=\"results\">{} results ({:.6} seconds):</div>",
        outcome.results.len(),
        outcome.elapsed.as_secs_f64()
    );
    for result in &outcome.results {
        let url = escape_html(&result.url);
        let _ = writeln!(
            page,
            "        <div class=\"result\"><a href=\"{link_prefix}{url}\">{url}</a> <span class=\"score\">{}</span></div>",
            result.score
        );
    }
    page.push_str(PAGE_TRAILER);
    page
}

fn render_error_page(query: &str, message: &str) -> String {
    let mut page = page_header(query);
    let _ = writeln!(page, "        <div class=\"error\">{}</div>", escape_html(message));
    page.push_str(PAGE_TRAILER);
    page
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn results_page_reports_count_and_real_time() {
        let outcome = SearchOutcome {
            terms: vec!["cat".into()],
            results: vec![RankedResult::new("a.html", 3), RankedResult::new("b.html", 1)],
            elapsed: Duration::from_micros(1500),
        };
        let page = render_results_page("cat", &outcome, "/wiki/");
        assert!(page.contains("2 results (0.001500 seconds):"));
        assert!(page.contains(r#"<a href="/wiki/a.html">a.html</a>"#));
        assert!(page.find("a.html").unwrap() < page.find("b.html").unwrap());
    }
}
