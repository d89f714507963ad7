//! Project adapter (OpenProject API v3).
//!
//! The configured URL may point at the instance root
//! (`https://op.example.com`) or at a project page
//! (`https://op.example.com/projects/tower-a/work_packages`). API calls always
//! go to the instance root; a `projects/<identifier>` path segment, when
//! present, is resolved once to the numeric project id by listing all projects
//! and comparing identifiers client-side.
//!
//! Collections are paged: `offset` is the 1-based page number and every page
//! carries the collection `total`. Both the project listing and the work
//! package query walk all pages.
//!
//! Work items are classified into two buckets:
//! - **active**: status contains "in progress" (case-insensitive);
//! - **incoming**: any other open status with a start date, oldest first.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{resolve_secret, ProjectConfig};
use crate::models::{ProjectSummary, WorkItem};
use crate::retry::{get_json, FetchError, RetryPolicy};
use crate::traits::ProjectSource;

/// Statuses that never count as incoming work.
const CLOSED_STATUSES: [&str; 4] = ["closed", "rejected", "completed", "on hold"];

/// Upper bound on pages read from one collection.
const MAX_PAGES: u32 = 100;

/// Instance root and optional project identifier parsed from a project URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectReference {
    pub root: String,
    pub identifier: Option<String>,
}

pub fn parse_project_reference(url: &str) -> Result<ProjectReference> {
    let parsed =
        reqwest::Url::parse(url).with_context(|| format!("invalid project url: {}", url))?;
    if parsed.host_str().is_none() {
        anyhow::bail!("project url has no host: {}", url);
    }

    let identifier = parsed.path_segments().and_then(|segments| {
        let segments: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
        segments
            .iter()
            .position(|s| *s == "projects")
            .and_then(|i| segments.get(i + 1))
            .map(|s| s.to_string())
    });

    Ok(ProjectReference {
        root: parsed.origin().ascii_serialization(),
        identifier,
    })
}

pub struct ProjectClient {
    http: reqwest::Client,
    reference: ProjectReference,
    api_key: Option<String>,
    page_size: u32,
    retry: RetryPolicy,
    project_id: OnceCell<i64>,
}

impl ProjectClient {
    pub fn new(config: &ProjectConfig, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            reference: parse_project_reference(&config.url)?,
            api_key: resolve_secret(&config.api_key, &config.api_key_env),
            page_size: config.page_size,
            retry,
            project_id: OnceCell::new(),
        })
    }

    fn get(&self, path: &str) -> Result<reqwest::RequestBuilder, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| FetchError::Config("project API key not configured".into()))?;
        Ok(self
            .http
            .get(format!("{}{}", self.reference.root, path))
            .basic_auth("apikey", Some(api_key)))
    }

    async fn fetch_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, FetchError> {
        self.retry
            .call(|| {
                let request = self.get(path).map(|r| r.query(query));
                async move { get_json::<Value>(request?).await }
            })
            .await
    }

    /// Every element of a paged collection.
    async fn fetch_all(
        &self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<Vec<Value>, FetchError> {
        let page_size = self.page_size.max(1);
        let page_size_param = page_size.to_string();
        let mut elements = Vec::new();

        for page in 1..=MAX_PAGES {
            let offset = page.to_string();
            let mut query = vec![
                ("pageSize", page_size_param.as_str()),
                ("offset", offset.as_str()),
            ];
            query.extend_from_slice(extra);

            let body = self.fetch_json(path, &query).await?;
            let batch = embedded_elements(&body);
            elements.extend_from_slice(batch);

            let done = match body.get("total").and_then(Value::as_u64) {
                Some(total) => batch.is_empty() || elements.len() as u64 >= total,
                None => batch.len() < page_size as usize,
            };
            if done {
                return Ok(elements);
            }
        }

        warn!(path, pages = MAX_PAGES, "page limit reached, collection truncated");
        Ok(elements)
    }

    /// Numeric id of the configured project, if the URL named one.
    ///
    /// A successful lookup is cached for the client's lifetime; failures are not.
    pub async fn resolve_project_id(&self) -> Result<Option<i64>, FetchError> {
        let Some(identifier) = self.reference.identifier.as_deref() else {
            return Ok(None);
        };

        let this = self;
        let id = self
            .project_id
            .get_or_try_init(|| async move {
                let projects = this.fetch_all("/api/v3/projects", &[]).await?;

                let id = projects
                    .iter()
                    .find(|p| p.get("identifier").and_then(Value::as_str) == Some(identifier))
                    .and_then(|p| p.get("id").and_then(Value::as_i64))
                    .ok_or_else(|| {
                        FetchError::Config(format!("project '{}' not found", identifier))
                    })?;
                info!(identifier, id, "resolved project");
                Ok::<i64, FetchError>(id)
            })
            .await?;

        Ok(Some(*id))
    }

    /// Raw work package elements, scoped to the configured project if any.
    pub async fn get_work_packages(&self) -> Result<Vec<Value>, FetchError> {
        let project_id = self.resolve_project_id().await?;

        let filters = project_id.map(|id| {
            serde_json::json!([{ "project": { "operator": "=", "values": [id.to_string()] } }])
                .to_string()
        });
        let mut query = Vec::new();
        if let Some(filters) = &filters {
            query.push(("filters", filters.as_str()));
        }

        self.fetch_all("/api/v3/work_packages", &query).await
    }

    /// Active/incoming buckets; empty when the tracker cannot be reached.
    pub async fn get_summary(&self) -> ProjectSummary {
        match self.get_work_packages().await {
            Ok(packages) => classify_work_packages(&packages),
            Err(e) => {
                warn!(error = %e, "Error fetching project data, using empty summary");
                ProjectSummary::default()
            }
        }
    }
}

#[async_trait]
impl ProjectSource for ProjectClient {
    async fn summary(&self) -> ProjectSummary {
        self.get_summary().await
    }
}

fn embedded_elements(body: &Value) -> &[Value] {
    body.get("_embedded")
        .and_then(|e| e.get("elements"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn parse_date(pkg: &Value, field: &str) -> Result<Option<NaiveDate>> {
    match pkg.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .with_context(|| format!("invalid {}: '{}'", field, s)),
        Some(other) => Err(anyhow!("invalid {}: {}", field, other)),
    }
}

/// Parse one work package element; missing or malformed fields are errors.
pub fn parse_work_item(pkg: &Value) -> Result<WorkItem> {
    let id = pkg
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("missing id"))?;
    let subject = pkg
        .get("subject")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing subject"))?;
    let status = pkg
        .pointer("/_links/status/title")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing status"))?;

    Ok(WorkItem {
        id,
        subject: subject.to_string(),
        status: status.to_string(),
        start_date: parse_date(pkg, "startDate")?,
        due_date: parse_date(pkg, "dueDate")?,
    })
}

/// Split work packages into active and incoming buckets.
///
/// Bad elements are skipped one by one with a warning.
pub fn classify_work_packages(packages: &[Value]) -> ProjectSummary {
    let mut summary = ProjectSummary::default();

    for pkg in packages {
        let item = match parse_work_item(pkg) {
            Ok(item) => item,
            Err(e) => {
                let package = pkg.get("id").cloned().unwrap_or(Value::Null);
                warn!(package = %package, error = %e, "skipping work package");
                continue;
            }
        };

        let status = item.status.trim().to_lowercase();
        if status.contains("in progress") {
            summary.active.push(item);
        } else if !CLOSED_STATUSES.contains(&status.as_str()) && item.start_date.is_some() {
            summary.incoming.push(item);
        }
    }

    summary
        .incoming
        .sort_by_key(|item| item.start_date.unwrap_or(NaiveDate::MAX));
    summary
}
