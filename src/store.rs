//! Durable observation store on SQLite.
//!
//! Holds operator messages, photo records, the per-month report counters,
//! the report ledger and the small `bot_settings` key-value table. Every
//! method runs as its own statement (or transaction) and returns only after
//! SQLite has committed it.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{Message, PhotoRecord, ReportOutcome};

/// Settings key holding the broadcast destination for alerts and tips.
pub const SAFETY_CHANNEL_KEY: &str = "safety_channel";

#[derive(Clone)]
pub struct ObservationStore {
    pool: SqlitePool,
}

fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn millis_to_ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        id: row.get("id"),
        author_id: row.get("author_id"),
        author_name: row.get("author_name"),
        text: row.get("text"),
        timestamp: millis_to_ts(row.get("timestamp")),
        period_key: row.get("period_key"),
    }
}

fn photo_from_row(row: &SqliteRow) -> PhotoRecord {
    PhotoRecord {
        unique_id: row.get("unique_id"),
        storage_path: row.get("storage_path"),
        caption: row.get("caption"),
        analysis: row.get("analysis"),
        timestamp: millis_to_ts(row.get("timestamp")),
        period_key: row.get("period_key"),
    }
}

impl ObservationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    // ── Messages ────────────────────────────────────────────────────────

    pub async fn append_message(
        &self,
        author_id: &str,
        author_name: &str,
        text: &str,
        timestamp: DateTime<Utc>,
        period_key: &str,
    ) -> Result<Message> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages (author_id, author_name, text, timestamp, period_key)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(author_id)
        .bind(author_name)
        .bind(text)
        .bind(ts_to_millis(timestamp))
        .bind(period_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            id,
            author_id: author_id.to_string(),
            author_name: author_name.to_string(),
            text: text.to_string(),
            timestamp,
            period_key: period_key.to_string(),
        })
    }

    /// Messages of one period, oldest first.
    pub async fn messages_for_period(&self, period_key: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, author_id, author_name, text, timestamp, period_key
            FROM messages
            WHERE period_key = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(period_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    // ── Photos ──────────────────────────────────────────────────────────

    /// Insert a photo record. Returns `false` when `unique_id` was already stored.
    pub async fn append_photo(
        &self,
        unique_id: &str,
        storage_path: &str,
        caption: Option<&str>,
        timestamp: DateTime<Utc>,
        period_key: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO photos (unique_id, storage_path, caption, analysis, timestamp, period_key)
            VALUES (?, ?, ?, NULL, ?, ?)
            ON CONFLICT(unique_id) DO NOTHING
            "#,
        )
        .bind(unique_id)
        .bind(storage_path)
        .bind(caption.filter(|c| !c.is_empty()))
        .bind(ts_to_millis(timestamp))
        .bind(period_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn photos_for_period(&self, period_key: &str) -> Result<Vec<PhotoRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT unique_id, storage_path, caption, analysis, timestamp, period_key
            FROM photos
            WHERE period_key = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(period_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(photo_from_row).collect())
    }

    pub async fn get_photo(&self, unique_id: &str) -> Result<Option<PhotoRecord>> {
        let row = sqlx::query(
            r#"
            SELECT unique_id, storage_path, caption, analysis, timestamp, period_key
            FROM photos
            WHERE unique_id = ?
            "#,
        )
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(photo_from_row))
    }

    /// Set a photo's analysis if it has none yet, returning the stored value.
    ///
    /// The analysis column is write-once: when another writer got there
    /// first, its value is kept and returned.
    pub async fn set_photo_analysis(&self, unique_id: &str, analysis: &str) -> Result<String> {
        sqlx::query("UPDATE photos SET analysis = ? WHERE unique_id = ? AND analysis IS NULL")
            .bind(analysis)
            .bind(unique_id)
            .execute(&self.pool)
            .await?;

        let stored: Option<Option<String>> =
            sqlx::query_scalar("SELECT analysis FROM photos WHERE unique_id = ?")
                .bind(unique_id)
                .fetch_optional(&self.pool)
                .await?;

        stored
            .flatten()
            .ok_or_else(|| anyhow!("photo not found: {}", unique_id))
    }

    /// Whether anything was recorded for the period.
    pub async fn has_activity(&self, period_key: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM messages WHERE period_key = ?)
                OR EXISTS (SELECT 1 FROM photos WHERE period_key = ?)
            "#,
        )
        .bind(period_key)
        .bind(period_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(found)
    }

    // ── Report counters and ledger ──────────────────────────────────────

    /// Atomically increment the counter for `month_key` and return the new value.
    ///
    /// A single upsert statement, so concurrent callers are serialized by
    /// SQLite's write lock and never observe the same value.
    pub async fn next_report_number(&self, month_key: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO report_counters (month_key, count) VALUES (?, 1)
            ON CONFLICT(month_key) DO UPDATE SET count = count + 1
            RETURNING count
            "#,
        )
        .bind(month_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn current_report_number(&self, month_key: &str) -> Result<i64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT count FROM report_counters WHERE month_key = ?")
                .bind(month_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn record_report(&self, outcome: &ReportOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reports (report_id, period_key, artifact_path, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(report_id) DO UPDATE SET
                period_key = excluded.period_key,
                artifact_path = excluded.artifact_path,
                created_at = excluded.created_at
            "#,
        )
        .bind(&outcome.report_id)
        .bind(&outcome.period_key)
        .bind(outcome.artifact_path.display().to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Report ids and artifact paths rendered for a period, oldest first.
    pub async fn reports_for_period(&self, period_key: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT report_id, artifact_path
            FROM reports
            WHERE period_key = ?
            ORDER BY created_at ASC, report_id ASC
            "#,
        )
        .bind(period_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("report_id"), row.get("artifact_path")))
            .collect())
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM bot_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
