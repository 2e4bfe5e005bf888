//! Fetch job lifecycle: discovery, claiming, completion and lease recovery.
//!
//! Every claim bumps the job's `claim_count`, and every transition out of
//! IN_PROGRESS is fenced on the [`Claim`] it was handed. A worker whose lease
//! expired and whose job was claimed again gets `LeaseLost` instead of
//! settling someone else's attempt.

use crate::error::DatabaseError;
use crate::types::{Claim, FetchJob, JobId, JobStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{Database, JobRecord, query_failed};

const JOB_COLUMNS: &str = "id, remote_path, modification_token, status, retry_count, claim_count, \
     size_bytes, last_attempt_at, next_attempt_at, error_message, created_at, completed_at";

impl Database {
    /// Record a file seen in a remote listing
    ///
    /// Returns the new job's ID, or `None` when a job with the same
    /// (remote path, modification token) already exists.
    pub async fn record_discovered(
        &self,
        remote_path: &str,
        modification_token: Option<&str>,
        size_bytes: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>> {
        let size = size_bytes.and_then(|s| i64::try_from(s).ok());
        let result = sqlx::query(
            r#"
            INSERT INTO file_jobs (remote_path, modification_token, status, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(remote_path, modification_token) DO NOTHING
            "#,
        )
        .bind(remote_path)
        .bind(modification_token.unwrap_or(""))
        .bind(JobStatus::Pending.to_i32())
        .bind(size)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await
        .map_err(query_failed("record discovered file"))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(JobId(result.last_insert_rowid())))
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: JobId) -> Result<Option<FetchJob>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM file_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get job"))?;

        Ok(record.map(FetchJob::from))
    }

    /// All jobs, oldest first
    pub async fn list_jobs(&self) -> Result<Vec<FetchJob>> {
        let records = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM file_jobs ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list jobs"))?;

        Ok(records.into_iter().map(FetchJob::from).collect())
    }

    /// Jobs in one status, oldest first
    pub async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<FetchJob>> {
        let records = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM file_jobs WHERE status = ? ORDER BY id ASC"
        ))
        .bind(status.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list jobs by status"))?;

        Ok(records.into_iter().map(FetchJob::from).collect())
    }

    /// Number of jobs in one status
    pub async fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_jobs WHERE status = ?")
            .bind(status.to_i32())
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed("count jobs"))?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Atomically claim up to `limit` due jobs, moving them to IN_PROGRESS
    ///
    /// A job is due when it is PENDING, or FAILED_RETRYABLE with
    /// `retry_count < max_retries` and `next_attempt_at <= now`. Selection and
    /// transition happen in one statement, so concurrent callers never receive
    /// the same job. Returned jobs are ordered by ID.
    pub async fn claim_due(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<FetchJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ts = now.timestamp();

        let mut records = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE file_jobs
            SET status = ?, last_attempt_at = ?, claim_count = claim_count + 1
            WHERE id IN (
                SELECT id FROM file_jobs
                WHERE status = ?
                   OR (status = ? AND retry_count < ? AND next_attempt_at <= ?)
                ORDER BY COALESCE(next_attempt_at, created_at) ASC, id ASC
                LIMIT ?
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(JobStatus::InProgress.to_i32())
        .bind(now_ts)
        .bind(JobStatus::Pending.to_i32())
        .bind(JobStatus::FailedRetryable.to_i32())
        .bind(i64::from(self.policy.max_retries))
        .bind(now_ts)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("claim due jobs"))?;

        records.sort_by_key(|r| r.id);
        Ok(records.into_iter().map(FetchJob::from).collect())
    }

    /// IN_PROGRESS → SUCCESS
    pub async fn mark_success(&self, claim: Claim, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_jobs
            SET status = ?, next_attempt_at = NULL, error_message = NULL, completed_at = ?
            WHERE id = ? AND status = ? AND claim_count = ?
            "#,
        )
        .bind(JobStatus::Success.to_i32())
        .bind(now.timestamp())
        .bind(claim.id)
        .bind(JobStatus::InProgress.to_i32())
        .bind(i64::from(claim.claim_count))
        .execute(&self.pool)
        .await
        .map_err(query_failed("mark job successful"))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(claim).await);
        }
        Ok(())
    }

    /// Record a failed attempt
    ///
    /// Increments `retry_count`. Once it reaches `max_retries` the job becomes
    /// FAILED_TERMINAL; otherwise it becomes FAILED_RETRYABLE and is parked
    /// until `now + backoff(retry_count)`. Returns the updated job.
    pub async fn mark_failed(
        &self,
        claim: Claim,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FetchJob> {
        let job = self.require_claimed(claim).await?;
        let retry_count = job.retry_count.saturating_add(1);

        if retry_count >= self.policy.max_retries {
            return self
                .finish_terminal(claim, job.retry_count, error, now)
                .await;
        }

        let delay = self.policy.backoff.delay(retry_count);
        let next_attempt = now.timestamp().saturating_add(duration_secs(delay));

        let result = sqlx::query(
            r#"
            UPDATE file_jobs
            SET status = ?, retry_count = ?, next_attempt_at = ?, error_message = ?
            WHERE id = ? AND status = ? AND claim_count = ? AND retry_count = ?
            "#,
        )
        .bind(JobStatus::FailedRetryable.to_i32())
        .bind(i64::from(retry_count))
        .bind(next_attempt)
        .bind(error)
        .bind(claim.id)
        .bind(JobStatus::InProgress.to_i32())
        .bind(i64::from(claim.claim_count))
        .bind(i64::from(job.retry_count))
        .execute(&self.pool)
        .await
        .map_err(query_failed("mark job failed"))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(claim).await);
        }
        self.fetch_required(claim.id).await
    }

    /// IN_PROGRESS → FAILED_TERMINAL regardless of the retry budget
    ///
    /// For job-fatal conditions. The attempt is still counted.
    pub async fn mark_terminal(
        &self,
        claim: Claim,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FetchJob> {
        let job = self.require_claimed(claim).await?;
        self.finish_terminal(claim, job.retry_count, error, now).await
    }

    /// IN_PROGRESS → PENDING without counting an attempt
    ///
    /// For jobs interrupted by shutdown or a run-level failure before their
    /// outcome was known.
    pub async fn release(&self, claim: Claim) -> Result<()> {
        let result = sqlx::query(
            "UPDATE file_jobs SET status = ? WHERE id = ? AND status = ? AND claim_count = ?",
        )
        .bind(JobStatus::Pending.to_i32())
        .bind(claim.id)
        .bind(JobStatus::InProgress.to_i32())
        .bind(i64::from(claim.claim_count))
        .execute(&self.pool)
        .await
        .map_err(query_failed("release job"))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(claim).await);
        }
        Ok(())
    }

    /// Return IN_PROGRESS jobs claimed at least `lease_timeout` ago to PENDING
    ///
    /// Returns the number of jobs reclaimed.
    pub async fn reclaim_stale(&self, lease_timeout: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now.timestamp().saturating_sub(duration_secs(lease_timeout));

        let result = sqlx::query(
            r#"
            UPDATE file_jobs
            SET status = ?
            WHERE status = ? AND (last_attempt_at IS NULL OR last_attempt_at <= ?)
            "#,
        )
        .bind(JobStatus::Pending.to_i32())
        .bind(JobStatus::InProgress.to_i32())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(query_failed("reclaim stale jobs"))?;

        Ok(result.rows_affected())
    }

    async fn finish_terminal(
        &self,
        claim: Claim,
        previous_retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FetchJob> {
        let result = sqlx::query(
            r#"
            UPDATE file_jobs
            SET status = ?, retry_count = ?, next_attempt_at = NULL, error_message = ?,
                completed_at = ?
            WHERE id = ? AND status = ? AND claim_count = ? AND retry_count = ?
            "#,
        )
        .bind(JobStatus::FailedTerminal.to_i32())
        .bind(i64::from(previous_retry_count.saturating_add(1)))
        .bind(error)
        .bind(now.timestamp())
        .bind(claim.id)
        .bind(JobStatus::InProgress.to_i32())
        .bind(i64::from(claim.claim_count))
        .bind(i64::from(previous_retry_count))
        .execute(&self.pool)
        .await
        .map_err(query_failed("mark job terminal"))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(claim).await);
        }
        self.fetch_required(claim.id).await
    }

    /// The job, provided `claim` still holds it
    async fn require_claimed(&self, claim: Claim) -> Result<FetchJob> {
        let job = self.fetch_required(claim.id).await?;
        match claim_error(claim, &job) {
            Some(e) => Err(e),
            None => Ok(job),
        }
    }

    async fn fetch_required(&self, id: JobId) -> Result<FetchJob> {
        self.get_job(id)
            .await?
            .ok_or_else(|| Error::Database(DatabaseError::NotFound(format!("job {id}"))))
    }

    async fn transition_error(&self, claim: Claim) -> Error {
        match self.get_job(claim.id).await {
            // Changed between the read and the update
            Ok(Some(job)) => claim_error(claim, &job).unwrap_or_else(|| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "job {} changed concurrently",
                    claim.id
                )))
            }),
            Ok(None) => Error::Database(DatabaseError::NotFound(format!("job {}", claim.id))),
            Err(e) => e,
        }
    }
}

/// Why `claim` may not settle `job`, if it may not
fn claim_error(claim: Claim, job: &FetchJob) -> Option<Error> {
    if job.status != JobStatus::InProgress {
        return Some(Error::Database(DatabaseError::InvalidTransition {
            id: claim.id,
            expected: JobStatus::InProgress,
            actual: job.status,
        }));
    }
    if job.claim_count != claim.claim_count {
        return Some(Error::Database(DatabaseError::LeaseLost {
            id: claim.id,
            held: claim.claim_count,
            current: job.claim_count,
        }));
    }
    None
}

fn duration_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
