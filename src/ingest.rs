//! Observation ingestion.
//!
//! The entry points used by the front surfaces (HTTP API and CLI) to record
//! operator messages and photos. Each observation is stamped with the period
//! key of the site-local day it happened on; grouping at report time is by
//! that key alone.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::models::Message;
use crate::period::SiteClock;
use crate::store::ObservationStore;

/// Prefix of the message recorded for a captioned photo.
pub const PHOTO_CAPTION_PREFIX: &str = "[PHOTO CAPTION]: ";

/// Who uploaded a photo, when known.
#[derive(Debug, Clone)]
pub struct Uploader {
    pub author_id: String,
    pub author_name: String,
}

#[derive(Clone)]
pub struct Ingestor {
    store: ObservationStore,
    clock: SiteClock,
}

impl Ingestor {
    pub fn new(store: ObservationStore, clock: SiteClock) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> SiteClock {
        self.clock
    }

    pub async fn ingest_message(
        &self,
        author_id: &str,
        author_name: &str,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Message> {
        if text.trim().is_empty() {
            bail!("message text must not be empty");
        }
        let author_name = if author_name.trim().is_empty() {
            author_id
        } else {
            author_name
        };

        let period_key = self.clock.period_key(timestamp);
        let message = self
            .store
            .append_message(author_id, author_name, text, timestamp, &period_key)
            .await?;
        debug!(id = message.id, period = %period_key, "message ingested");
        Ok(message)
    }

    /// Record a photo. Returns `false` if `unique_id` was already ingested.
    pub async fn ingest_photo(
        &self,
        unique_id: &str,
        storage_path: &str,
        caption: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        if unique_id.trim().is_empty() {
            bail!("photo unique_id must not be empty");
        }
        if storage_path.trim().is_empty() {
            bail!("photo storage_path must not be empty");
        }

        let period_key = self.clock.period_key(timestamp);
        let inserted = self
            .store
            .append_photo(unique_id, storage_path, caption, timestamp, &period_key)
            .await?;
        if inserted {
            info!(photo = unique_id, period = %period_key, "photo ingested");
        } else {
            debug!(photo = unique_id, "photo already ingested, skipping");
        }
        Ok(inserted)
    }

    /// Record a photo and, for a new captioned upload with a known uploader,
    /// also record the caption as a message so it reaches the summary.
    pub async fn ingest_photo_upload(
        &self,
        unique_id: &str,
        storage_path: &str,
        caption: Option<&str>,
        timestamp: DateTime<Utc>,
        uploader: Option<&Uploader>,
    ) -> Result<bool> {
        let inserted = self
            .ingest_photo(unique_id, storage_path, caption, timestamp)
            .await?;

        let caption = caption.map(str::trim).filter(|c| !c.is_empty());
        if let (true, Some(caption), Some(uploader)) = (inserted, caption, uploader) {
            self.ingest_message(
                &uploader.author_id,
                &uploader.author_name,
                &format!("{}{}", PHOTO_CAPTION_PREFIX, caption),
                timestamp,
            )
            .await?;
        }
        Ok(inserted)
    }
}
