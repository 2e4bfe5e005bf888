//! Runtime state tracking: shutdown detection and cycle bookkeeping.

use crate::Result;
use chrono::{DateTime, Utc};

use super::{Database, query_failed};

impl Database {
    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call `set_clean_shutdown()`,
    /// meaning IN_PROGRESS rows may have been orphaned by a crash.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = 'clean_shutdown'")
                .fetch_optional(&self.pool)
                .await
                .map_err(query_failed("check shutdown state"))?;

        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that the application has started
    pub async fn set_clean_start(&self) -> Result<()> {
        self.put_state("clean_shutdown", "false").await
    }

    /// Mark that the application is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.put_state("clean_shutdown", "true").await
    }

    /// Remember when the last ingestion cycle completed
    pub async fn record_cycle_completed(&self, at: DateTime<Utc>) -> Result<()> {
        self.put_state("last_cycle_at", &at.timestamp().to_string())
            .await
    }

    /// When the last ingestion cycle completed, if ever
    pub async fn last_cycle_at(&self) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = 'last_cycle_at'")
                .fetch_optional(&self.pool)
                .await
                .map_err(query_failed("read last cycle time"))?;

        Ok(value
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0)))
    }

    async fn put_state(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update runtime state"))?;

        Ok(())
    }
}
