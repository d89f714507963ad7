//! # Site Report
//!
//! A daily construction-site report pipeline.
//!
//! Operators send free-text messages and photos through the day. At report
//! time the pipeline numbers the report, pulls the day's observations,
//! fetches weather and project-tracker data, runs generative analysis over
//! new photos and the message log, and renders one self-contained artifact.
//! Any upstream may fail; the report is still produced with placeholders.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────────┐
//! │  HTTP / CLI  │──▶│  Ingestor    │──▶│ SQLite store   │
//! │  (sitebot)   │   └──────────────┘   │ msgs / photos  │
//! └──────┬───────┘                      │ counters       │
//!        │ trigger                      └───────┬────────┘
//!        ▼                                      │
//! ┌──────────────┐   weather ◀── OpenWeatherMap │
//! │  Scheduler   │──▶ ReportPipeline ◀──────────┘
//! └──────────────┘   projects ◀── OpenProject
//!                    analysis ◀── chat-completions API
//!                         │
//!                         ▼
//!                  HtmlRenderer ──▶ data/reports/<date>/Site_Report_<id>.html
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sitebot init
//! sitebot ingest-message --author-id 7 --author-name foreman --text "12 workers, 1 crane"
//! sitebot report
//! sitebot serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`period`] | Period keys and report ids |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Observation store |
//! | [`ingest`] | Observation ingestion |
//! | [`retry`] | Retry policy for remote calls |
//! | [`weather`] | Weather adapter and alerts |
//! | [`project`] | Project tracker adapter |
//! | [`analysis`] | Generative-analysis clients |
//! | [`lazy_analysis`] | At-most-once photo analysis |
//! | [`pipeline`] | Report aggregation |
//! | [`render`] | HTML artifact renderer |
//! | [`delivery`] | Delivery backends |
//! | [`scheduler`] | Daily jobs and broadcasts |
//! | [`server`] | HTTP API |
//! | [`traits`] | Collaborator traits |

pub mod analysis;
pub mod config;
pub mod db;
pub mod delivery;
pub mod ingest;
pub mod lazy_analysis;
pub mod migrate;
pub mod models;
pub mod period;
pub mod pipeline;
pub mod project;
pub mod render;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod traits;
pub mod weather;
