//! Shared fixtures: a mock OpenWeatherMap + OpenProject upstream served by
//! axum on a free port, and in-memory fakes for the other collaborators.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use site_report::config::Config;
use site_report::models::{CurrentWeather, ReportDocument, SiteSummary};
use site_report::traits::{Analyzer, Delivery, Renderer, WeatherSource};

pub const WEATHER_KEY: &str = "weather-test-key";
pub const PROJECT_KEY: &str = "project-test-key";

// ─── Mock upstream ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MockState {
    /// Number of 503 responses `/weather` returns before succeeding.
    pub weather_failures: AtomicU32,
    pub weather_always_fail: AtomicBool,
    pub weather_calls: AtomicU32,
    pub weather_queries: Mutex<Vec<HashMap<String, String>>>,
    /// Project listing requests, one per page.
    pub project_list_calls: AtomicU32,
    /// Extra projects listed ahead of the real ones.
    pub filler_projects: AtomicU32,
    /// Extra in-progress work packages appended to the real ones.
    pub filler_work_packages: AtomicU32,
    pub work_package_filters: Mutex<Vec<Option<String>>>,
}

impl MockState {
    pub fn weather_calls(&self) -> u32 {
        self.weather_calls.load(Ordering::SeqCst)
    }

    pub fn project_list_calls(&self) -> u32 {
        self.project_list_calls.load(Ordering::SeqCst)
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("apikey:{}", PROJECT_KEY))
    );
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

/// Slice `elements` the way OpenProject pages a collection: `offset` is the
/// 1-based page number.
fn page(elements: Vec<Value>, query: &HashMap<String, String>) -> Value {
    let page_size = query
        .get("pageSize")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(20)
        .max(1);
    let offset = query
        .get("offset")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1);
    let total = elements.len();
    let slice: Vec<Value> = elements
        .into_iter()
        .skip((offset - 1) * page_size)
        .take(page_size)
        .collect();
    json!({
        "_type": "Collection",
        "total": total,
        "count": slice.len(),
        "pageSize": page_size,
        "offset": offset,
        "_embedded": { "elements": slice }
    })
}

async fn weather(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.weather_calls.fetch_add(1, Ordering::SeqCst);
    let key_ok = query.get("appid").map(String::as_str) == Some(WEATHER_KEY);
    state.weather_queries.lock().unwrap().push(query);

    if state.weather_always_fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream down").into_response();
    }
    let pending = state.weather_failures.load(Ordering::SeqCst);
    if pending > 0 {
        state.weather_failures.store(pending - 1, Ordering::SeqCst);
        return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
    }
    if !key_ok {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }

    Json(json!({
        "weather": [{ "id": 500, "description": "light rain", "icon": "10d" }],
        "main": { "temp": 31.5, "humidity": 40 },
        "wind": { "speed": 12.0 },
        "name": "Site"
    }))
    .into_response()
}

async fn forecast(State(state): State<Arc<MockState>>) -> Response {
    if state.weather_always_fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream down").into_response();
    }
    Json(json!({
        "list": [
            { "pop": 0.2, "dt_txt": "2026-02-10 12:00:00" },
            { "pop": 0.9, "dt_txt": "2026-02-10 15:00:00" },
            { "pop": 1.0, "dt_txt": "2026-02-10 18:00:00" }
        ]
    }))
    .into_response()
}

async fn projects(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    state.project_list_calls.fetch_add(1, Ordering::SeqCst);

    let fillers = state.filler_projects.load(Ordering::SeqCst);
    let mut elements: Vec<Value> = (0..fillers)
        .map(|i| json!({ "id": 1000 + i, "identifier": format!("annex-{}", i), "name": "Annex" }))
        .collect();
    elements.push(json!({ "id": 3, "identifier": "tower-b", "name": "Tower B" }));
    elements.push(json!({ "id": 7, "identifier": "tower-a", "name": "Tower A" }));

    Json(page(elements, &query)).into_response()
}

async fn work_packages(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    state
        .work_package_filters
        .lock()
        .unwrap()
        .push(query.get("filters").cloned());

    let mut elements = vec![
        json!({
            "id": 11, "subject": "Pour level 4 slab",
            "_links": { "status": { "title": "In progress" } },
            "startDate": "2026-02-01", "dueDate": "2026-02-20"
        }),
        json!({
            "id": 12, "subject": "Facade mockup",
            "_links": { "status": { "title": "Scheduled" } },
            "startDate": "2026-03-05", "dueDate": null
        }),
        json!({
            "id": 13, "subject": "Excavation",
            "_links": { "status": { "title": "Closed" } },
            "startDate": "2026-04-01", "dueDate": null
        }),
        json!({
            "id": 14, "subject": "Broken dates",
            "_links": { "status": { "title": "New" } },
            "startDate": "soon"
        }),
    ];
    let fillers = state.filler_work_packages.load(Ordering::SeqCst);
    elements.extend((0..fillers).map(|i| {
        json!({
            "id": 100 + i, "subject": format!("Rebar batch {}", i),
            "_links": { "status": { "title": "In progress" } }
        })
    }));

    Json(page(elements, &query)).into_response()
}

/// Serve the mock upstream on a free local port. Returns its base URL.
pub async fn start_mock(state: Arc<MockState>) -> String {
    let app = Router::new()
        .route("/data/2.5/weather", get(weather))
        .route("/data/2.5/forecast", get(forecast))
        .route("/api/v3/projects", get(projects))
        .route("/api/v3/work_packages", get(work_packages))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

/// A config pointing every upstream at `base`, with fast retries.
pub fn test_config(tmp: &TempDir, base: &str, project_path: &str) -> Config {
    let root = tmp.path();
    let content = format!(
        r#"
[db]
path = "{db}"

[reports]
output_dir = "{out}"

[retry]
max_attempts = 3
initial_backoff_ms = 1
max_backoff_ms = 5

[weather]
base_url = "{base}/data/2.5"
api_key = "{wkey}"
timeout_secs = 5

[project]
url = "{base}{project_path}"
api_key = "{pkey}"
timeout_secs = 5
"#,
        db = root.join("site.sqlite").display(),
        out = root.join("reports").display(),
        base = base,
        project_path = project_path,
        wkey = WEATHER_KEY,
        pkey = PROJECT_KEY,
    );
    let config: Config = toml::from_str(&content).unwrap();
    site_report::config::validate(&config).unwrap();
    config
}

// ─── Fake collaborators ─────────────────────────────────────────────

pub const STUB_PHOTO_ANALYSIS: &str = "Workers wear PPE; scaffold braced.";
pub const STUB_OVERALL: &str = "Steady progress on the structure.";

#[derive(Default)]
pub struct StubAnalyzer {
    pub fail_summary: bool,
    pub fail_photos: bool,
    pub fail_tip: bool,
    pub photo_calls: AtomicU32,
    pub transcripts: Mutex<Vec<String>>,
    pub contexts: Mutex<Vec<Value>>,
}

impl StubAnalyzer {
    pub fn photo_calls(&self) -> u32 {
        self.photo_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for StubAnalyzer {
    fn name(&self) -> &str {
        "stub"
    }

    async fn analyze_photo(&self, instruction: &str, _image_path: &Path) -> Result<String> {
        self.photo_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_photos {
            bail!("vision model unavailable");
        }
        assert!(instruction.starts_with("Analyze this construction site photo"));
        Ok(STUB_PHOTO_ANALYSIS.to_string())
    }

    async fn summarize_messages(&self, transcript: &str) -> Result<SiteSummary> {
        self.transcripts.lock().unwrap().push(transcript.to_string());
        if self.fail_summary {
            bail!("summarizer timed out");
        }
        Ok(SiteSummary {
            manpower_machinery: "<ul><li>14 workers, 1 tower crane</li></ul>".into(),
            activities: "<ul><li>Level 4 slab pour</li></ul>".into(),
        })
    }

    async fn analyze_site(&self, _transcript: &str, context: &Value) -> Result<String> {
        self.contexts.lock().unwrap().push(context.clone());
        Ok(STUB_OVERALL.to_string())
    }

    async fn safety_tip(&self) -> Result<String> {
        if self.fail_tip {
            bail!("no tip today");
        }
        Ok("🦺 Clip your harness before leaving the platform.".to_string())
    }
}

/// Wraps a renderer and keeps every document it was handed.
pub struct CapturingRenderer<R> {
    inner: R,
    pub documents: Mutex<Vec<ReportDocument>>,
}

impl<R> CapturingRenderer<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            documents: Mutex::new(Vec::new()),
        }
    }

    pub fn documents(&self) -> Vec<ReportDocument> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl<R: Renderer> Renderer for CapturingRenderer<R> {
    async fn render(&self, document: &ReportDocument) -> Result<PathBuf> {
        self.documents.lock().unwrap().push(document.clone());
        self.inner.render(document).await
    }
}

pub struct FailingRenderer;

#[async_trait]
impl Renderer for FailingRenderer {
    async fn render(&self, _document: &ReportDocument) -> Result<PathBuf> {
        bail!("disk full")
    }
}

/// Weather that always reports the same alert.
pub struct AlertingWeather(pub Option<String>);

#[async_trait]
impl WeatherSource for AlertingWeather {
    async fn current(&self) -> Option<CurrentWeather> {
        None
    }

    async fn severe_alert(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct RecordingDelivery {
    pub texts: Mutex<Vec<(String, String)>>,
    pub documents: Mutex<Vec<(String, PathBuf)>>,
}

impl RecordingDelivery {
    pub fn texts(&self) -> Vec<(String, String)> {
        self.texts.lock().unwrap().clone()
    }

    pub fn documents(&self) -> Vec<(String, PathBuf)> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn send_text(&self, target: &str, text: &str) -> Result<()> {
        self.texts
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_document(&self, target: &str, path: &Path, _caption: &str) -> Result<()> {
        self.documents
            .lock()
            .unwrap()
            .push((target.to_string(), path.to_path_buf()));
        Ok(())
    }
}

/// Every regular file below `dir`.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out
}
