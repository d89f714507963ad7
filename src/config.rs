//! TOML configuration for the site report pipeline.
//!
//! Every section except `[db]` is optional; missing keys fall back to the
//! `default_*` functions below. Credentials may be given inline (`api_key`)
//! or through an environment variable (`api_key_env`), inline first.

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub project: Option<ProjectConfig>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
    #[serde(default)]
    pub stylesheet: Option<PathBuf>,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            id_prefix: default_id_prefix(),
            utc_offset_hours: default_utc_offset_hours(),
            stylesheet: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/reports")
}
fn default_id_prefix() -> String {
    "BN".to_string()
}
fn default_utc_offset_hours() -> i32 {
    3
}

impl ReportsConfig {
    /// The site's local offset from UTC.
    pub fn offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            anyhow::anyhow!(
                "reports.utc_offset_hours out of range: {}",
                self.utc_offset_hours
            )
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    2000
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeatherConfig {
    #[serde(default = "default_weather_base_url")]
    pub base_url: String,
    #[serde(default = "default_lat")]
    pub lat: f64,
    #[serde(default = "default_lon")]
    pub lon: f64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_weather_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_weather_base_url(),
            lat: default_lat(),
            lon: default_lon(),
            api_key: None,
            api_key_env: default_weather_key_env(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_weather_base_url() -> String {
    "https://api.openweathermap.org/data/2.5".to_string()
}
fn default_lat() -> f64 {
    24.7136
}
fn default_lon() -> f64 {
    46.6753
}
fn default_weather_key_env() -> String {
    "OPENWEATHER_API_KEY".to_string()
}
fn default_http_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_project_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_project_key_env() -> String {
    "OPENPROJECT_API_KEY".to_string()
}
fn default_page_size() -> u32 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_analysis_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_analysis_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_analysis_base_url(),
            model: None,
            api_key: None,
            api_key_env: default_analysis_key_env(),
            timeout_secs: default_analysis_timeout_secs(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_analysis_base_url() -> String {
    "https://dashscope-intl.aliyuncs.com/compatible-mode/v1".to_string()
}
fn default_analysis_key_env() -> String {
    "DASHSCOPE_API_KEY".to_string()
}
fn default_analysis_timeout_secs() -> u64 {
    60
}
fn default_concurrency() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub report_target: Option<String>,
    #[serde(default = "default_report_time")]
    pub report_time: String,
    #[serde(default = "default_alert_interval_secs")]
    pub alert_interval_secs: u64,
    #[serde(default = "default_safety_tip_time")]
    pub safety_tip_time: String,
    #[serde(default = "default_reminder_time")]
    pub reminder_time: String,
    #[serde(default)]
    pub admin_targets: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            report_target: None,
            report_time: default_report_time(),
            alert_interval_secs: default_alert_interval_secs(),
            safety_tip_time: default_safety_tip_time(),
            reminder_time: default_reminder_time(),
            admin_targets: Vec::new(),
        }
    }
}

fn default_report_time() -> String {
    "18:00".to_string()
}
fn default_alert_interval_secs() -> u64 {
    3600
}
fn default_safety_tip_time() -> String {
    "08:00".to_string()
}
fn default_reminder_time() -> String {
    "10:00".to_string()
}

/// Parse an `HH:MM` local wall-clock time from the schedule section.
pub fn parse_clock_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .with_context(|| format!("invalid time '{}', expected HH:MM", value))
}

/// Resolve a credential: inline value first, then the named environment variable.
pub fn resolve_secret(inline: &Option<String>, env_name: &str) -> Option<String> {
    inline
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var(env_name).ok().filter(|s| !s.is_empty()))
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config.reports.offset()?;

    if config.reports.id_prefix.trim().is_empty() {
        anyhow::bail!("reports.id_prefix must not be empty");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
        anyhow::bail!("retry.initial_backoff_ms must be <= retry.max_backoff_ms");
    }

    if config.analysis.concurrency == 0 {
        anyhow::bail!("analysis.concurrency must be >= 1");
    }

    match config.analysis.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.analysis.model.is_none() {
                anyhow::bail!("analysis.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown analysis provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if let Some(project) = &config.project {
        if project.url.trim().is_empty() {
            anyhow::bail!("project.url must not be empty");
        }
        if project.page_size == 0 {
            anyhow::bail!("project.page_size must be >= 1");
        }
    }

    parse_clock_time(&config.schedule.report_time).context("schedule.report_time")?;
    parse_clock_time(&config.schedule.safety_tip_time).context("schedule.safety_tip_time")?;
    parse_clock_time(&config.schedule.reminder_time).context("schedule.reminder_time")?;
    if config.schedule.alert_interval_secs == 0 {
        anyhow::bail!("schedule.alert_interval_secs must be >= 1");
    }

    Ok(())
}
