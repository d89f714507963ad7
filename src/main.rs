//! # Site report CLI (`sitebot`)
//!
//! Records site observations and produces the daily construction-site
//! report.
//!
//! ## Usage
//!
//! ```bash
//! sitebot --config ./config/sitebot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sitebot init` | Create the SQLite database and run schema migrations |
//! | `sitebot report` | Generate a report now (manual trigger) |
//! | `sitebot alerts` | Print the current severe-weather alert |
//! | `sitebot ingest-message` | Record an operator message |
//! | `sitebot ingest-photo` | Record a photo |
//! | `sitebot settings get <key>` | Read a setting |
//! | `sitebot settings set <key> <value>` | Write a setting |
//! | `sitebot serve` | Start the HTTP API and the scheduler |
//!
//! Log verbosity follows `RUST_LOG` (default `info`); logs go to stderr.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use site_report::config;
use site_report::delivery::LogDelivery;
use site_report::ingest::{Ingestor, Uploader};
use site_report::migrate;
use site_report::period::SiteClock;
use site_report::pipeline::{ReportPipeline, Trigger};
use site_report::server;
use site_report::store::ObservationStore;

/// Daily construction-site report bot.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sitebot.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sitebot",
    about = "Daily construction-site report pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sitebot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it more than once is safe.
    Init,

    /// Generate today's report now and print its id and artifact path.
    Report {
        /// Delivery target for the finished report.
        #[arg(long, default_value = "cli")]
        target: String,
    },

    /// Check the weather and print any severe-condition alert.
    Alerts,

    /// Record an operator message.
    IngestMessage {
        #[arg(long)]
        author_id: String,
        #[arg(long, default_value = "")]
        author_name: String,
        #[arg(long)]
        text: String,
        /// RFC 3339 timestamp; defaults to now.
        #[arg(long)]
        at: Option<String>,
    },

    /// Record a photo. Re-ingesting the same unique id is a no-op.
    IngestPhoto {
        #[arg(long)]
        unique_id: String,
        /// Where the image file is stored.
        #[arg(long)]
        path: String,
        #[arg(long)]
        caption: Option<String>,
        /// Uploader id; with a caption, the caption is also recorded as a message.
        #[arg(long)]
        author_id: Option<String>,
        #[arg(long)]
        author_name: Option<String>,
        /// RFC 3339 timestamp; defaults to now.
        #[arg(long)]
        at: Option<String>,
    },

    /// Read or write persisted settings (e.g. `safety_channel`).
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Start the HTTP API and the scheduler.
    Serve,
}

#[derive(Subcommand)]
enum SettingsAction {
    Get { key: String },
    Set {
        key: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
}

fn parse_timestamp(at: Option<&str>) -> Result<DateTime<Utc>> {
    match at {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid timestamp '{}', expected RFC 3339", s))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Report { target } => {
            let store = ObservationStore::open(&cfg).await?;
            let pipeline = ReportPipeline::from_config(&cfg, store)?;
            let outcome = pipeline
                .handle_trigger(&Trigger::Manual { target }, &LogDelivery)
                .await?;
            println!("report {}", outcome.report_id);
            println!("  period: {}", outcome.period_key);
            println!("  artifact: {}", outcome.artifact_path.display());
        }
        Commands::Alerts => {
            let store = ObservationStore::open(&cfg).await?;
            let pipeline = ReportPipeline::from_config(&cfg, store)?;
            match pipeline.weather().severe_alert().await {
                Some(alert) => println!("{}", alert),
                None => println!("No severe conditions."),
            }
        }
        Commands::IngestMessage {
            author_id,
            author_name,
            text,
            at,
        } => {
            let ingestor = open_ingestor(&cfg).await?;
            let message = ingestor
                .ingest_message(&author_id, &author_name, &text, parse_timestamp(at.as_deref())?)
                .await?;
            println!("message {} recorded for {}", message.id, message.period_key);
        }
        Commands::IngestPhoto {
            unique_id,
            path,
            caption,
            author_id,
            author_name,
            at,
        } => {
            let ingestor = open_ingestor(&cfg).await?;
            let uploader = author_id.map(|id| Uploader {
                author_name: author_name.unwrap_or_else(|| id.clone()),
                author_id: id,
            });
            let inserted = ingestor
                .ingest_photo_upload(
                    &unique_id,
                    &path,
                    caption.as_deref(),
                    parse_timestamp(at.as_deref())?,
                    uploader.as_ref(),
                )
                .await?;
            if inserted {
                println!("photo {} recorded", unique_id);
            } else {
                println!("photo {} already recorded", unique_id);
            }
        }
        Commands::Settings { action } => {
            let store = ObservationStore::open(&cfg).await?;
            match action {
                SettingsAction::Get { key } => match store.get_setting(&key).await? {
                    Some(value) => println!("{}", value),
                    None => anyhow::bail!("setting not found: {}", key),
                },
                SettingsAction::Set { key, value } => {
                    store.set_setting(&key, &value).await?;
                    println!("{} = {}", key, value);
                }
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn open_ingestor(cfg: &config::Config) -> Result<Ingestor> {
    let store = ObservationStore::open(cfg).await?;
    Ok(Ingestor::new(store, SiteClock::from_config(&cfg.reports)?))
}
