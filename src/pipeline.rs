//! Report aggregation pipeline.
//!
//! One [`ReportPipeline::run`] call is one report. It walks a fixed sequence
//! of stages:
//!
//! ```text
//! Idle ─▶ Numbering ─▶ Collecting ─▶ Summarizing ─▶ Analyzing ─▶ Assembled ─▶ Rendered
//!            │                                                                 │
//!            └──────────────────────────▶ Errored ◀────────────────────────────┘
//! ```
//!
//! Only `Numbering` (the report counter could not be allocated) and
//! `Rendered` (the artifact could not be written) end a run with an error.
//! Every upstream failure in between degrades to an empty value or a fixed
//! placeholder, so once a report id has been allocated a document is always
//! produced.
//!
//! Runs may overlap. Report numbers come from a single atomic upsert in the
//! store, and photo analysis goes through the shared [`AnalysisCache`], so
//! overlapping runs never share an id or analyze a photo twice.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::analysis::{
    create_analyzer, ANALYSIS_UNAVAILABLE, EMPTY_TRANSCRIPT, NO_ACTIVITIES_PLACEHOLDER,
    NO_MANPOWER_PLACEHOLDER,
};
use crate::config::Config;
use crate::lazy_analysis::AnalysisCache;
use crate::models::{
    Message, PhotoRecord, PhotoView, ProjectSummary, ReportDocument, ReportOutcome, SiteSummary,
    WeatherSnapshot,
};
use crate::period::{format_report_id, SiteClock};
use crate::project::ProjectClient;
use crate::render::HtmlRenderer;
use crate::retry::RetryPolicy;
use crate::store::ObservationStore;
use crate::traits::{Analyzer, Delivery, NoProjectSource, ProjectSource, Renderer, WeatherSource};
use crate::weather::WeatherClient;

/// Shown for a photo whose analysis is not available in this run.
pub const ANALYSIS_PENDING: &str = "Analysis pending.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    Numbering,
    Collecting,
    Summarizing,
    Analyzing,
    Assembled,
    Rendered,
    Errored,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Numbering => "numbering",
            PipelineStage::Collecting => "collecting",
            PipelineStage::Summarizing => "summarizing",
            PipelineStage::Analyzing => "analyzing",
            PipelineStage::Assembled => "assembled",
            PipelineStage::Rendered => "rendered",
            PipelineStage::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// A fatal pipeline failure, tagged with the stage it happened in.
#[derive(Debug, Error)]
#[error("report pipeline failed while {stage}: {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: anyhow::Error,
}

/// What started a run, and who receives the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Scheduled { target: String },
    Manual { target: String },
}

impl Trigger {
    pub fn target(&self) -> &str {
        match self {
            Trigger::Scheduled { target } | Trigger::Manual { target } => target,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Trigger::Manual { .. })
    }
}

/// The pipeline's upstream and downstream collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub weather: Arc<dyn WeatherSource>,
    pub projects: Arc<dyn ProjectSource>,
    pub analyzer: Arc<dyn Analyzer>,
    pub renderer: Arc<dyn Renderer>,
}

impl Collaborators {
    /// Production collaborators built from configuration.
    pub fn from_config(config: &Config, clock: SiteClock) -> Result<Self> {
        let retry = RetryPolicy::from(&config.retry);

        let weather = Arc::new(WeatherClient::new(&config.weather, retry.clone(), clock)?);
        let projects: Arc<dyn ProjectSource> = match &config.project {
            Some(project) => Arc::new(ProjectClient::new(project, retry.clone())?),
            None => Arc::new(NoProjectSource),
        };
        let analyzer: Arc<dyn Analyzer> = Arc::from(create_analyzer(&config.analysis, retry)?);
        let renderer = Arc::new(HtmlRenderer::from_config(&config.reports));

        Ok(Self {
            weather,
            projects,
            analyzer,
            renderer,
        })
    }
}

/// A fully assembled document, before rendering.
#[derive(Debug, Clone)]
pub struct PreparedReport {
    pub period_key: String,
    pub document: ReportDocument,
}

/// Tracks the stage of one run and turns failures into [`PipelineError`]s.
struct RunState {
    stage: PipelineStage,
    report_id: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            stage: PipelineStage::Idle,
            report_id: None,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        debug!(from = %self.stage, to = %next, report_id = ?self.report_id, "pipeline stage");
        self.stage = next;
    }

    fn fail(&mut self, source: anyhow::Error) -> PipelineError {
        let stage = self.stage;
        error!(
            stage = %stage,
            report_id = ?self.report_id,
            error = %source,
            "report pipeline failed"
        );
        self.stage = PipelineStage::Errored;
        PipelineError { stage, source }
    }
}

pub struct ReportPipeline {
    store: ObservationStore,
    cache: Arc<AnalysisCache>,
    clock: SiteClock,
    id_prefix: String,
    concurrency: usize,
    parts: Collaborators,
}

impl ReportPipeline {
    pub fn new(store: ObservationStore, clock: SiteClock, parts: Collaborators) -> Self {
        Self {
            cache: Arc::new(AnalysisCache::new(store.clone())),
            store,
            clock,
            id_prefix: "BN".to_string(),
            concurrency: 3,
            parts,
        }
    }

    pub fn from_config(config: &Config, store: ObservationStore) -> Result<Self> {
        let clock = SiteClock::from_config(&config.reports)?;
        let parts = Collaborators::from_config(config, clock)?;
        Ok(Self::new(store, clock, parts)
            .with_id_prefix(&config.reports.id_prefix)
            .with_concurrency(config.analysis.concurrency))
    }

    pub fn with_id_prefix(mut self, prefix: &str) -> Self {
        self.id_prefix = prefix.to_string();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }

    pub fn clock(&self) -> SiteClock {
        self.clock
    }

    pub fn analyzer(&self) -> &dyn Analyzer {
        self.parts.analyzer.as_ref()
    }

    pub fn weather(&self) -> Arc<dyn WeatherSource> {
        self.parts.weather.clone()
    }

    /// Produce and render one report for the current local day.
    pub async fn run(&self) -> Result<ReportOutcome, PipelineError> {
        self.run_at(Utc::now()).await
    }

    /// Produce and render one report for the local day containing `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<ReportOutcome, PipelineError> {
        let mut state = RunState::new();
        let prepared = self.prepare_with(&mut state, now).await?;

        state.advance(PipelineStage::Rendered);
        let artifact_path = match self.parts.renderer.render(&prepared.document).await {
            Ok(path) => path,
            Err(e) => return Err(state.fail(e)),
        };

        let outcome = ReportOutcome {
            report_id: prepared.document.report_id,
            period_key: prepared.period_key,
            artifact_path,
        };
        if let Err(e) = self.store.record_report(&outcome).await {
            warn!(report_id = %outcome.report_id, error = %e, "failed to record report in ledger");
        }

        info!(
            report_id = %outcome.report_id,
            period = %outcome.period_key,
            path = %outcome.artifact_path.display(),
            "report generated"
        );
        Ok(outcome)
    }

    /// Run every stage up to `Assembled` without rendering.
    ///
    /// This allocates a report number like a full run does.
    pub async fn prepare(&self, now: DateTime<Utc>) -> Result<PreparedReport, PipelineError> {
        let mut state = RunState::new();
        self.prepare_with(&mut state, now).await
    }

    async fn prepare_with(
        &self,
        state: &mut RunState,
        now: DateTime<Utc>,
    ) -> Result<PreparedReport, PipelineError> {
        // ── Numbering ──
        state.advance(PipelineStage::Numbering);
        let period_key = self.clock.period_key(now);
        let month_key = self.clock.month_key(now);
        let count = match self.store.next_report_number(&month_key).await {
            Ok(count) => count,
            Err(e) => return Err(state.fail(e)),
        };
        let local_date = self.clock.local(now).date_naive();
        let report_id = format_report_id(&self.id_prefix, local_date, count);
        state.report_id = Some(report_id.clone());
        info!(report_id = %report_id, period = %period_key, "generating report");

        // ── Collecting ──
        state.advance(PipelineStage::Collecting);
        let messages = self
            .store
            .messages_for_period(&period_key)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    period = %period_key,
                    error = %e,
                    "failed to read messages, continuing without"
                );
                Vec::new()
            });
        let photos = self
            .store
            .photos_for_period(&period_key)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    period = %period_key,
                    error = %e,
                    "failed to read photos, continuing without"
                );
                Vec::new()
            });
        let (current, projects) =
            tokio::join!(self.parts.weather.current(), self.parts.projects.summary());
        let weather = WeatherSnapshot { current };
        debug!(
            messages = messages.len(),
            photos = photos.len(),
            has_weather = weather.current.is_some(),
            active = projects.active.len(),
            incoming = projects.incoming.len(),
            "collected observations"
        );

        // ── Summarizing ──
        state.advance(PipelineStage::Summarizing);
        let transcript = format_transcript(&messages, &self.clock);
        let (summary, analysis) = self
            .summarize(&messages, &transcript, &weather, &projects)
            .await;

        // ── Analyzing ──
        state.advance(PipelineStage::Analyzing);
        let analyses = self.analyze_photos(&photos).await;

        // ── Assembled ──
        let photos = photos
            .iter()
            .zip(analyses)
            .map(|(photo, analysis)| PhotoView {
                path: photo.storage_path.clone(),
                analysis: analysis.unwrap_or_else(|| ANALYSIS_PENDING.to_string()),
                timestamp: self.clock.local(photo.timestamp).format("%H:%M %p").to_string(),
                caption: photo.caption.clone().unwrap_or_default(),
            })
            .collect();

        let document = ReportDocument {
            date: period_key.clone(),
            report_id,
            weather,
            projects,
            site_manpower_machinery: summary.manpower_machinery,
            site_activities: summary.activities,
            analysis,
            photos,
        };
        state.advance(PipelineStage::Assembled);

        Ok(PreparedReport {
            period_key,
            document,
        })
    }

    /// The two summary fragments and the overall analysis, with fallbacks.
    async fn summarize(
        &self,
        messages: &[Message],
        transcript: &str,
        weather: &WeatherSnapshot,
        projects: &ProjectSummary,
    ) -> (SiteSummary, String) {
        let analyzer = self.parts.analyzer.as_ref();
        if !analyzer.is_enabled() {
            debug!("analysis disabled, using placeholders");
            return (placeholder_summary(), ANALYSIS_UNAVAILABLE.to_string());
        }

        let context = json!({ "weather": weather.current, "project": projects });
        let overall = format!("Daily Summary based on logs: {}", transcript);

        let summary_call = async {
            if messages.is_empty() {
                return placeholder_summary();
            }
            match analyzer.summarize_messages(transcript).await {
                Ok(summary) => fill_placeholders(summary),
                Err(e) => {
                    warn!(error = %e, "message summary failed, using placeholders");
                    placeholder_summary()
                }
            }
        };
        let analysis_call = async {
            match analyzer.analyze_site(&overall, &context).await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => ANALYSIS_UNAVAILABLE.to_string(),
                Err(e) => {
                    warn!(error = %e, "overall analysis failed, using placeholder");
                    ANALYSIS_UNAVAILABLE.to_string()
                }
            }
        };

        tokio::join!(summary_call, analysis_call)
    }

    /// Analysis text per photo, in input order. `None` = not available.
    async fn analyze_photos(&self, photos: &[PhotoRecord]) -> Vec<Option<String>> {
        let mut results: Vec<Option<String>> =
            photos.iter().map(|p| p.analysis.clone()).collect();
        if !self.parts.analyzer.is_enabled() {
            return results;
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (idx, photo) in photos.iter().enumerate() {
            if photo.is_analyzed() {
                continue;
            }
            let photo = photo.clone();
            let cache = self.cache.clone();
            let analyzer = self.parts.analyzer.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let analysis = match cache.ensure_analyzed(&photo, analyzer.as_ref()).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(photo = %photo.unique_id, error = %e, "photo left without analysis");
                        None
                    }
                };
                (idx, analysis)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, analysis)) => results[idx] = analysis,
                Err(e) => warn!(error = %e, "photo analysis task aborted"),
            }
        }
        results
    }

    /// Run the pipeline for `trigger` and deliver the outcome to its target.
    ///
    /// Manual triggers hear about failures; scheduled ones are only logged.
    pub async fn handle_trigger(
        &self,
        trigger: &Trigger,
        delivery: &dyn Delivery,
    ) -> Result<ReportOutcome, PipelineError> {
        match self.run().await {
            Ok(outcome) => {
                let caption = format!(
                    "📄 Daily site report {} ({})",
                    outcome.report_id, outcome.period_key
                );
                if let Err(e) = delivery
                    .send_document(trigger.target(), &outcome.artifact_path, &caption)
                    .await
                {
                    warn!(destination = trigger.target(), error = %e, "failed to deliver report");
                }
                Ok(outcome)
            }
            Err(e) => {
                if trigger.is_manual() {
                    let notice = format!("⚠️ Report generation failed: {}", e);
                    if let Err(send_err) = delivery.send_text(trigger.target(), &notice).await {
                        warn!(
                            destination = trigger.target(),
                            error = %send_err,
                            "failed to deliver failure notice"
                        );
                    }
                } else {
                    error!(destination = trigger.target(), error = %e, "scheduled report failed");
                }
                Err(e)
            }
        }
    }
}

fn placeholder_summary() -> SiteSummary {
    SiteSummary {
        manpower_machinery: NO_MANPOWER_PLACEHOLDER.to_string(),
        activities: NO_ACTIVITIES_PLACEHOLDER.to_string(),
    }
}

fn fill_placeholders(mut summary: SiteSummary) -> SiteSummary {
    if summary.manpower_machinery.trim().is_empty() {
        summary.manpower_machinery = NO_MANPOWER_PLACEHOLDER.to_string();
    }
    if summary.activities.trim().is_empty() {
        summary.activities = NO_ACTIVITIES_PLACEHOLDER.to_string();
    }
    summary
}

/// One line per message: `<local time>: <author>: <text>`.
pub fn format_transcript(messages: &[Message], clock: &SiteClock) -> String {
    if messages.is_empty() {
        return EMPTY_TRANSCRIPT.to_string();
    }
    messages
        .iter()
        .map(|m| {
            format!(
                "{}: {}: {}",
                clock.local(m.timestamp).format("%Y-%m-%d %H:%M:%S"),
                m.author_name,
                m.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
