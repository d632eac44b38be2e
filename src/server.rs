use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::{ResultCache, ResultKey};
use crate::cli::ServeArgs;
use crate::engine::{self, Histogram, RankedRow};
use crate::export;
use crate::relation::{DuckDbRelation, HcpcsDescription, RelationAccessor};
use crate::session::{FilterEvent, FilterSession, SessionError, SessionStore, SessionView};
use crate::storage::{StoragePaths, file_present_nonempty};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    relation: Arc<dyn RelationAccessor>,
    cache: Arc<ResultCache>,
    sessions: Arc<SessionStore>,
    query_timeout: Duration,
}

impl AppState {
    pub fn new(
        relation: Arc<dyn RelationAccessor>,
        cache: ResultCache,
        sessions: SessionStore,
        query_timeout: Duration,
    ) -> Self {
        Self {
            relation,
            cache: Arc::new(cache),
            sessions: Arc::new(sessions),
            query_timeout,
        }
    }
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    if !file_present_nonempty(&paths.duckdb_path) {
        return Err(anyhow!(
            "DuckDB not found at {}. Run: providers-dashboard build",
            paths.duckdb_path.display()
        ));
    }
    let relation = DuckDbRelation::open(&paths.duckdb_path)?;

    let state = AppState::new(
        Arc::new(relation),
        ResultCache::new(
            opts.cache_capacity,
            Duration::from_secs(opts.cache_ttl_secs),
        ),
        SessionStore::new(Duration::from_secs(opts.session_ttl_secs)),
        Duration::from_secs(opts.query_timeout_secs),
    );
    tracing::info!(
        "cache capacity={} ttl={}s, session ttl={}s, query timeout={}s",
        opts.cache_capacity,
        opts.cache_ttl_secs,
        opts.session_ttl_secs,
        opts.query_timeout_secs
    );

    let cache = Arc::clone(&state.cache);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            let dropped = cache.cleanup_expired();
            if dropped > 0 {
                tracing::debug!("dropped {} expired results ({} left)", dropped, cache.len());
            }
        }
    });

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/sessions", post(api_open_session))
        .route("/api/sessions/:id", get(api_session_view))
        .route("/api/sessions/:id/filters", post(api_filter_event))
        .route("/api/sessions/:id/submit", post(api_submit))
        .route("/api/sessions/:id/hcpcs", get(api_hcpcs_descriptions))
        .route("/download_excel", get(download_excel))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown or expired session {0}")]
    UnknownSession(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Results are not available (expired or never computed). Please resubmit.")]
    NotCached,
    #[error("query did not finish within {0:?}")]
    Timeout(Duration),
    #[error("query failed: {0:#}")]
    Relation(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownSession(_) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::StaleControl(_) | SessionError::GateClosed) => {
                StatusCode::CONFLICT
            }
            ApiError::Session(SessionError::Refresh { .. }) | ApiError::Relation(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::NotCached => {
                return (StatusCode::NOT_FOUND, Html(not_cached_page())).into_response();
            }
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        if status.is_server_error() {
            tracing::warn!("{}", self);
        }
        (status, self.to_string()).into_response()
    }
}

fn not_cached_page() -> String {
    format!(
        "<!doctype html><html><body><p>{}</p><p><a href=\"/\">Back to the dashboard</a></p></body></html>",
        ApiError::NotCached
    )
}

/// Runs pipeline work off the async runtime, bounded by the query timeout. A
/// timed-out task is left to finish in the background.
async fn blocking<T, F>(st: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    let limit = st.query_timeout;
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(out)) => out,
        Ok(Err(join)) => Err(ApiError::Relation(anyhow!("worker task failed: {join}"))),
        Err(_) => Err(ApiError::Timeout(limit)),
    }
}

fn lookup(st: &AppState, id: &str) -> Result<Arc<parking_lot::Mutex<FilterSession>>, ApiError> {
    st.sessions
        .get(id)
        .ok_or_else(|| ApiError::UnknownSession(id.to_string()))
}

#[derive(Debug, Serialize)]
struct OpenSessionResponse {
    session_id: String,
    #[serde(flatten)]
    view: SessionView,
}

async fn api_open_session(State(st): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let relation = Arc::clone(&st.relation);
    let session = blocking(&st, move || Ok(FilterSession::open(relation.as_ref())?)).await?;
    let view = session.view();
    let session_id = st.sessions.insert(session);
    tracing::info!(
        "opened session {} ({} live)",
        session_id,
        st.sessions.len()
    );
    Ok((
        StatusCode::CREATED,
        Json(OpenSessionResponse { session_id, view }),
    ))
}

/// Current controls. A session left mid-cascade by a failed refresh resumes here.
async fn api_session_view(
    State(st): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = lookup(&st, &id)?;
    let relation = Arc::clone(&st.relation);
    let view = blocking(&st, move || {
        let mut s = session.lock();
        s.settle(relation.as_ref())?;
        Ok(s.view())
    })
    .await?;
    Ok(Json(view))
}

async fn api_filter_event(
    State(st): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(event): Json<FilterEvent>,
) -> Result<Json<SessionView>, ApiError> {
    let session = lookup(&st, &id)?;
    let relation = Arc::clone(&st.relation);
    let view = blocking(&st, move || {
        let mut s = session.lock();
        tracing::debug!("session {}: {} -> {:?}", id, event.field, event.value);
        s.dispatch(relation.as_ref(), event)?;
        Ok(s.view())
    })
    .await?;
    Ok(Json(view))
}

#[derive(Debug, Default, Deserialize)]
struct SubmitParams {
    rank_position: Option<String>,
    rank_by: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    title: String,
    advisory: Option<String>,
    rows: Vec<RankedRow>,
    histogram: Histogram,
    cache_key: ResultKey,
    export_url: String,
    cached: bool,
}

async fn api_submit(
    State(st): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(p): Json<SubmitParams>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let session = lookup(&st, &id)?;
    let relation = Arc::clone(&st.relation);
    let cache = Arc::clone(&st.cache);
    let resp = blocking(&st, move || {
        let mut s = session.lock();
        let submission = s.submit(p.rank_position.as_deref(), p.rank_by.as_deref())?;
        let fetched = engine::fetch_or_compute(relation.as_ref(), &cache, &submission.inputs)
            .map_err(ApiError::Relation)?;
        s.record_result(fetched.key.clone());

        let record = fetched.record;
        Ok(SubmitResponse {
            title: record.title(),
            advisory: submission.advisory,
            rows: record.rows.clone(),
            histogram: record.histogram.clone(),
            export_url: format!("/download_excel?cache_key={}", fetched.key),
            cache_key: fetched.key,
            cached: fetched.cached,
        })
    })
    .await?;
    Ok(Json(resp))
}

async fn api_hcpcs_descriptions(
    State(st): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Vec<HcpcsDescription>>, ApiError> {
    let session = lookup(&st, &id)?;
    let relation = Arc::clone(&st.relation);
    let rows = blocking(&st, move || {
        session
            .lock()
            .hcpcs_descriptions(relation.as_ref())
            .map_err(ApiError::Relation)
    })
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    cache_key: Option<String>,
}

async fn download_excel(
    State(st): State<AppState>,
    Query(p): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    let key = p
        .cache_key
        .as_deref()
        .and_then(ResultKey::parse)
        .ok_or(ApiError::NotCached)?;
    let record = st.cache.get(&key).ok_or_else(|| {
        tracing::info!("export requested for uncached result {}", key);
        ApiError::NotCached
    })?;

    let bytes = blocking(&st, move || {
        export::encode(&record).map_err(ApiError::Relation)
    })
    .await?;
    Ok((
        [
            (header::CONTENT_TYPE, export::CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export::FILE_NAME),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        bytes,
    )
        .into_response())
}
