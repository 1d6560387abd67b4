use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

mod config;
mod error;
mod logging;
mod models;
mod payload;
mod projections;
mod track_test;


use config::ServerConfig;
use error::ApiError;
use models::{
    AjaxData, DataResponse, DomClickRecord, Event, HistoryData, JsErrorRecord, SourceErrorRecord,
    UrlRecord,
};
use payload::TrackerPayload;
use projections::{DayClock, TrackerStore};

/// Telemetry ingestion API
/// Browser agents post events, dashboards read today's aggregates.
/// One store per process, shared by every handler.
#[derive(Clone)]
pub(crate) struct AppState {
    store: Arc<TrackerStore>,
    max_test_delay_ms: u64,
}

impl AppState {
    fn new(store: TrackerStore, max_test_delay_ms: u64) -> Self {
        Self {
            store: Arc::new(store),
            max_test_delay_ms,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init()?;
    let config = ServerConfig::from_env().context("failed to load configuration")?;

    let clock = config
        .utc_offset
        .map(DayClock::fixed)
        .unwrap_or_else(DayClock::local);
    let state = AppState::new(TrackerStore::new(clock), config.max_test_delay_ms);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        utc_offset = ?config.utc_offset,
        "tracker server running"
    );

    axum::serve(listener, app).await.context("server terminated")?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/tracker", post(ingest_event))
        .route("/tracker/getProjectList", get(get_project_list))
        .route("/tracker/getJsError/:project_id", get(get_js_error))
        .route("/tracker/getSourceError/:project_id", get(get_source_error))
        .route("/tracker/getHistoryData/:project_id", get(get_history_data))
        .route("/tracker/getHashData/:project_id", get(get_hash_data))
        .route("/tracker/getDomData/:project_id", get(get_dom_data))
        .route("/tracker/getAjaxData/:project_id", get(get_ajax_data))
        .route(
            "/tracker/getCustomData/:project_id/:event_type",
            get(get_custom_data),
        )
        .nest("/trackTest", track_test::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn root() -> &'static str {
    "Tracker API v0.1.0"
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Accept one tracked event
/// Only placement failures (project, time, type) are rejected
async fn ingest_event(
    State(state): State<AppState>,
    TrackerPayload(fields): TrackerPayload,
) -> Result<StatusCode, ApiError> {
    let event = Event::from_fields(fields).map_err(|err| {
        warn!(error = %err, "rejected tracker event");
        err
    })?;
    debug!(project = %event.project, kind = event.detail.kind().as_str(), "tracker event");

    state.store.ingest(event);
    Ok(StatusCode::CREATED)
}

async fn get_project_list(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.list_projects())
}

async fn get_js_error(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<DataResponse<Vec<JsErrorRecord>>> {
    Json(DataResponse {
        data: state.store.js_errors(&project_id),
    })
}

async fn get_source_error(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<DataResponse<Vec<SourceErrorRecord>>> {
    Json(DataResponse {
        data: state.store.source_errors(&project_id),
    })
}

async fn get_history_data(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<DataResponse<HistoryData>> {
    Json(DataResponse {
        data: state.store.history_data(&project_id),
    })
}

async fn get_hash_data(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<DataResponse<Vec<UrlRecord>>> {
    Json(DataResponse {
        data: state.store.hash_changes(&project_id),
    })
}

async fn get_dom_data(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<DataResponse<Vec<DomClickRecord>>> {
    Json(DataResponse {
        data: state.store.dom_clicks(&project_id),
    })
}

async fn get_ajax_data(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<DataResponse<AjaxData>> {
    Json(DataResponse {
        data: state.store.ajax_data(&project_id),
    })
}

async fn get_custom_data(
    State(state): State<AppState>,
    Path((project_id, event_type)): Path<(String, String)>,
) -> Json<DataResponse<Vec<Value>>> {
    Json(DataResponse {
        data: state.store.custom_events(&project_id, &event_type),
    })
}
