//! Core data models used throughout the report pipeline.
//!
//! Observations (messages and photo records) are what the store holds;
//! [`ReportDocument`] is what the aggregator hands to the renderer. Every
//! renderer-facing field is always present: absent upstream data is
//! represented by an empty list, empty string, or an explicit `None`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A free-text operator message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub period_key: String,
}

/// A stored photograph and its (lazily computed) analysis.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoRecord {
    /// Idempotency key assigned by the upload source.
    pub unique_id: String,
    pub storage_path: String,
    pub caption: Option<String>,
    /// `None` until the lazy analysis pass has run for this record.
    pub analysis: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub period_key: String,
}

impl PhotoRecord {
    pub fn is_analyzed(&self) -> bool {
        self.analysis.is_some()
    }
}

/// A work item from the project-tracking system, classified but never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub id: i64,
    pub subject: String,
    pub status: String,
    pub start_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub active: Vec<WorkItem>,
    pub incoming: Vec<WorkItem>,
}

impl ProjectSummary {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.incoming.is_empty()
    }
}

/// Current conditions as returned by the weather service, plus the
/// localized description and icon URL added by the adapter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CurrentWeather {
    #[serde(default)]
    pub weather: Vec<WeatherCondition>,
    #[serde(default)]
    pub main: Option<MainReadings>,
    #[serde(default)]
    pub wind: Wind,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WeatherCondition {
    #[serde(default = "default_condition_id")]
    pub id: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

fn default_condition_id() -> i64 {
    800
}
fn default_icon() -> String {
    "01d".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MainReadings {
    #[serde(default)]
    pub temp: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
}

/// Wind readings in the source unit (metres per second).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Wind {
    #[serde(default)]
    pub speed: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Forecast {
    #[serde(default)]
    pub list: Vec<ForecastEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ForecastEntry {
    /// Probability of precipitation, `0.0..=1.0`.
    #[serde(default)]
    pub pop: f64,
    #[serde(default)]
    pub dt_txt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WeatherSnapshot {
    pub current: Option<CurrentWeather>,
}

/// The two HTML fragments produced from the period's messages.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SiteSummary {
    #[serde(rename = "site_manpower_machinery", default)]
    pub manpower_machinery: String,
    #[serde(rename = "site_activities", default)]
    pub activities: String,
}

/// Per-photo view model handed to the renderer.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoView {
    pub path: String,
    pub analysis: String,
    pub timestamp: String,
    pub caption: String,
}

/// The canonical report document: the single value passed to a renderer.
#[derive(Debug, Clone, Serialize)]
pub struct ReportDocument {
    pub date: String,
    pub report_id: String,
    pub weather: WeatherSnapshot,
    pub projects: ProjectSummary,
    pub site_manpower_machinery: String,
    pub site_activities: String,
    pub analysis: String,
    pub photos: Vec<PhotoView>,
}

/// What a successful pipeline run returns to its trigger.
#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub report_id: String,
    pub period_key: String,
    pub artifact_path: PathBuf,
}
