//! Retry ledger persistence
//!
//! SQLite-backed record of every remote file's processing lifecycle.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`jobs`] - Discovery, claiming and completion of fetch jobs
//! - [`state`] - Runtime state (shutdown tracking, last cycle)
//!
//! Timestamps are stored as unix seconds.

use crate::error::{DatabaseError, Error};
use crate::retry::RetryPolicy;
use crate::types::{FetchJob, JobId, JobStatus};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod jobs;
mod migrations;
mod state;

/// Ledger row as stored
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Unique database ID
    pub id: i64,
    /// Remote file path
    pub remote_path: String,
    /// Remote modification token; empty when unknown
    pub modification_token: String,
    /// Status code (see [`JobStatus::from_i32`])
    pub status: i32,
    /// Failed attempts
    pub retry_count: i64,
    /// Times claimed
    pub claim_count: i64,
    /// Listed size in bytes
    pub size_bytes: Option<i64>,
    /// Unix timestamp of the last claim
    pub last_attempt_at: Option<i64>,
    /// Unix timestamp before which a retryable job is not due
    pub next_attempt_at: Option<i64>,
    /// Last failure
    pub error_message: Option<String>,
    /// Unix timestamp of discovery
    pub created_at: i64,
    /// Unix timestamp of the terminal transition
    pub completed_at: Option<i64>,
}

impl From<JobRecord> for FetchJob {
    fn from(r: JobRecord) -> Self {
        FetchJob {
            id: JobId(r.id),
            remote_path: r.remote_path,
            modification_token: r.modification_token,
            status: JobStatus::from_i32(r.status),
            retry_count: u32::try_from(r.retry_count).unwrap_or(0),
            claim_count: u32::try_from(r.claim_count).unwrap_or(0),
            size_bytes: r.size_bytes.and_then(|s| u64::try_from(s).ok()),
            last_attempt_at: r.last_attempt_at.and_then(from_unix),
            next_attempt_at: r.next_attempt_at.and_then(from_unix),
            error_message: r.error_message,
            created_at: from_unix(r.created_at).unwrap_or_default(),
            completed_at: r.completed_at.and_then(from_unix),
        }
    }
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn query_failed(what: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::QueryFailed(format!("Failed to {what}: {e}")))
}

/// Database handle for the retry ledger
pub struct Database {
    pool: SqlitePool,
    policy: RetryPolicy,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
