//! HTTP front surface.
//!
//! A small JSON API standing in for the chat front end: it records
//! observations, fires manual reports and exposes the broadcast settings.
//! `sitebot serve` runs it together with the [`Scheduler`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/messages` | Record an operator message |
//! | `POST` | `/photos` | Record a photo (idempotent on `unique_id`) |
//! | `POST` | `/reports` | Generate a report now (manual trigger) |
//! | `GET`  | `/alerts` | Current severe-weather alert, or `null` |
//! | `GET`  | `/settings/{key}` | Read a setting |
//! | `PUT`  | `/settings/{key}` | Write a setting (last write wins) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message text must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `report_failed` (500),
//! `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::delivery::LogDelivery;
use crate::ingest::{Ingestor, Uploader};
use crate::models::{Message, ReportOutcome};
use crate::pipeline::{ReportPipeline, Trigger};
use crate::scheduler::Scheduler;
use crate::store::ObservationStore;
use crate::traits::Delivery;

/// Target used for manual reports requested without one.
const DEFAULT_MANUAL_TARGET: &str = "api";

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    ingestor: Ingestor,
    pipeline: Arc<ReportPipeline>,
    delivery: Arc<dyn Delivery>,
}

impl AppState {
    pub fn new(pipeline: Arc<ReportPipeline>, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            ingestor: Ingestor::new(pipeline.store().clone(), pipeline.clock()),
            pipeline,
            delivery,
        }
    }

    fn store(&self) -> &ObservationStore {
        self.pipeline.store()
    }
}

/// All routes, with permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/messages", post(handle_message))
        .route("/photos", post(handle_photo))
        .route("/reports", post(handle_report))
        .route("/alerts", get(handle_alerts))
        .route(
            "/settings/{key}",
            get(handle_get_setting).put(handle_put_setting),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the API server and the scheduler.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = ObservationStore::open(config).await?;
    let pipeline = Arc::new(ReportPipeline::from_config(config, store)?);
    let delivery: Arc<dyn Delivery> = Arc::new(LogDelivery);

    let scheduler = Arc::new(Scheduler::new(
        pipeline.clone(),
        delivery.clone(),
        &config.schedule,
    )?);
    let _jobs = scheduler.spawn();

    let app = router(AppState::new(pipeline, delivery));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "site report server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Validation failures become 400s, everything else a 500.
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("must not be empty") {
        bad_request(msg)
    } else {
        internal(msg)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /messages ============

#[derive(Deserialize)]
struct MessageRequest {
    author_id: String,
    #[serde(default)]
    author_name: Option<String>,
    text: String,
    /// Defaults to the time of the request.
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

async fn handle_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    let message = state
        .ingestor
        .ingest_message(
            &req.author_id,
            req.author_name.as_deref().unwrap_or_default(),
            &req.text,
            req.timestamp.unwrap_or_else(Utc::now),
        )
        .await
        .map_err(classify_error)?;
    Ok((StatusCode::CREATED, Json(message)))
}

// ============ POST /photos ============

#[derive(Deserialize)]
struct PhotoRequest {
    unique_id: String,
    storage_path: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
}

#[derive(Serialize)]
struct PhotoResponse {
    unique_id: String,
    inserted: bool,
}

async fn handle_photo(
    State(state): State<AppState>,
    Json(req): Json<PhotoRequest>,
) -> Result<Json<PhotoResponse>, AppError> {
    let uploader = req.author_id.as_ref().map(|id| Uploader {
        author_id: id.clone(),
        author_name: req.author_name.clone().unwrap_or_else(|| id.clone()),
    });

    let inserted = state
        .ingestor
        .ingest_photo_upload(
            &req.unique_id,
            &req.storage_path,
            req.caption.as_deref(),
            req.timestamp.unwrap_or_else(Utc::now),
            uploader.as_ref(),
        )
        .await
        .map_err(classify_error)?;

    Ok(Json(PhotoResponse {
        unique_id: req.unique_id,
        inserted,
    }))
}

// ============ POST /reports ============

#[derive(Deserialize, Default)]
struct ReportRequest {
    #[serde(default)]
    target: Option<String>,
}

async fn handle_report(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ReportOutcome>, AppError> {
    let req: ReportRequest = if body.is_empty() {
        ReportRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| bad_request(format!("invalid request body: {}", e)))?
    };
    let trigger = Trigger::Manual {
        target: req
            .target
            .unwrap_or_else(|| DEFAULT_MANUAL_TARGET.to_string()),
    };

    let outcome = state
        .pipeline
        .handle_trigger(&trigger, state.delivery.as_ref())
        .await
        .map_err(|e| AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "report_failed".to_string(),
            message: e.to_string(),
        })?;
    Ok(Json(outcome))
}

// ============ GET /alerts ============

#[derive(Serialize)]
struct AlertResponse {
    alert: Option<String>,
}

async fn handle_alerts(State(state): State<AppState>) -> Json<AlertResponse> {
    Json(AlertResponse {
        alert: state.pipeline.weather().severe_alert().await,
    })
}

// ============ /settings/{key} ============

#[derive(Serialize)]
struct SettingResponse {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct SettingRequest {
    value: String,
}

async fn handle_get_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SettingResponse>, AppError> {
    let value = state
        .store()
        .get_setting(&key)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("setting not found: {}", key)))?;
    Ok(Json(SettingResponse { key, value }))
}

async fn handle_put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<SettingRequest>,
) -> Result<Json<SettingResponse>, AppError> {
    if key.trim().is_empty() {
        return Err(bad_request("setting key must not be empty"));
    }
    state
        .store()
        .set_setting(&key, &req.value)
        .await
        .map_err(classify_error)?;
    Ok(Json(SettingResponse {
        key,
        value: req.value,
    }))
}
