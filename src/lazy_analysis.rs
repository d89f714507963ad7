//! At-most-once photo analysis, memoized in the observation store.
//!
//! A photo is sent to the analyzer only while its stored analysis is `NULL`.
//! The first outcome (the analyzer's text, or [`ANALYSIS_FAILED_MARKER`] when
//! the call failed) is written once and returned to every later caller, so a
//! failing upstream is tried once per photo and never again.
//!
//! Concurrent callers for the same photo are serialized on a per-photo lock
//! and re-read the record after acquiring it, so overlapping report runs do
//! not both call the analyzer.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::analysis::{photo_instruction, ANALYSIS_FAILED_MARKER};
use crate::models::PhotoRecord;
use crate::store::ObservationStore;
use crate::traits::Analyzer;

pub struct AnalysisCache {
    store: ObservationStore,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AnalysisCache {
    pub fn new(store: ObservationStore) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, unique_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(unique_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, unique_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(unique_id);
    }

    /// The photo's analysis, computing and storing it first if needed.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be read or written, or when the analyzer
    /// is disabled (the photo then stays pending). Analyzer failures are not
    /// errors: they are stored and returned as the failure marker.
    pub async fn ensure_analyzed(
        &self,
        record: &PhotoRecord,
        analyzer: &dyn Analyzer,
    ) -> Result<String> {
        if let Some(analysis) = &record.analysis {
            return Ok(analysis.clone());
        }
        if !analyzer.is_enabled() {
            bail!("analysis disabled, photo {} left pending", record.unique_id);
        }

        let lock = self.lock_for(&record.unique_id);
        let _guard = lock.lock().await;

        let current = self.store.get_photo(&record.unique_id).await;
        if let Some(analysis) = current?.and_then(|p| p.analysis) {
            self.release(&record.unique_id);
            return Ok(analysis);
        }

        let instruction = photo_instruction(record.caption.as_deref());
        let outcome = match analyzer
            .analyze_photo(&instruction, Path::new(&record.storage_path))
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                info!(photo = %record.unique_id, analyzer = analyzer.name(), "photo analyzed");
                text
            }
            Ok(_) => {
                warn!(
                    photo = %record.unique_id,
                    "analyzer returned empty text, storing failure marker"
                );
                ANALYSIS_FAILED_MARKER.to_string()
            }
            Err(e) => {
                warn!(
                    photo = %record.unique_id,
                    error = %e,
                    "photo analysis failed, storing failure marker"
                );
                ANALYSIS_FAILED_MARKER.to_string()
            }
        };

        let stored = self
            .store
            .set_photo_analysis(&record.unique_id, &outcome)
            .await;
        self.release(&record.unique_id);
        stored
    }
}
