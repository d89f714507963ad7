//! Collaborator traits at the edges of the report pipeline.
//!
//! The aggregator talks to every upstream and downstream system through one
//! of these traits, so each can be swapped for a fake in tests or for a
//! different vendor in production.
//!
//! ```text
//!  WeatherSource ─┐
//!  ProjectSource ─┼──▶ ReportPipeline ──▶ Renderer ──▶ artifact path
//!  Analyzer ──────┘          │
//!                            ▼
//!                     ObservationStore
//! ```
//!
//! Delivery of artifacts and alerts to people is behind [`Delivery`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::models::{CurrentWeather, ProjectSummary, ReportDocument, SiteSummary};

// ═══════════════════════════════════════════════════════════════════════
// Upstream data sources
// ═══════════════════════════════════════════════════════════════════════

/// Current weather conditions. Implementations swallow their own failures.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Current conditions, or `None` when the service is unavailable.
    async fn current(&self) -> Option<CurrentWeather>;

    /// Newline-joined severe-condition alerts, or `None` when all is calm.
    async fn severe_alert(&self) -> Option<String> {
        None
    }
}

/// Work items from the project tracker. Implementations swallow their own failures.
#[async_trait]
pub trait ProjectSource: Send + Sync {
    /// Active and incoming work; empty buckets when the tracker is unavailable.
    async fn summary(&self) -> ProjectSummary;
}

/// A project source for deployments without a tracker.
pub struct NoProjectSource;

#[async_trait]
impl ProjectSource for NoProjectSource {
    async fn summary(&self) -> ProjectSummary {
        ProjectSummary::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Generative analysis
// ═══════════════════════════════════════════════════════════════════════

/// The generative-analysis service (text and image understanding).
///
/// Every method may fail; callers decide the fallback. When
/// [`is_enabled`](Analyzer::is_enabled) is `false` the pipeline does not call
/// the analyzer for photos at all, so disabled analysis never burns the
/// one-shot failure marker.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Model or backend identifier, for logs.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Describe one site photo following `instruction`.
    async fn analyze_photo(&self, instruction: &str, image_path: &Path) -> Result<String>;

    /// Turn a period's message transcript into the two HTML summary fragments.
    async fn summarize_messages(&self, transcript: &str) -> Result<SiteSummary>;

    /// Free-form overall analysis of the period, given weather/project context.
    async fn analyze_site(&self, transcript: &str, context: &Value) -> Result<String>;

    /// A short safety tip for the site crew.
    async fn safety_tip(&self) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════════════════

/// Turns a canonical report document into a persisted artifact.
///
/// The artifact path must be a pure function of the document's date and
/// report id: distinct ids never collide, and re-rendering the same id
/// overwrites the previous artifact.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, document: &ReportDocument) -> Result<PathBuf>;
}

/// Sends artifacts and notices to a delivery target (chat, channel, inbox).
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send_text(&self, target: &str, text: &str) -> Result<()>;

    async fn send_document(&self, target: &str, path: &Path, caption: &str) -> Result<()>;
}
