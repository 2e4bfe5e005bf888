//! Core types for secure-ingest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a ledger job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Lifecycle state of a fetch job
///
/// `PENDING -> IN_PROGRESS -> {SUCCESS, FAILED_RETRYABLE, FAILED_TERMINAL}`;
/// a retryable job becomes claimable again once its backoff has elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Discovered, never attempted (or released back after an interruption)
    Pending,
    /// Claimed by a worker
    InProgress,
    /// Plaintext forwarded
    Success,
    /// Failed, will be retried after backoff
    FailedRetryable,
    /// Failed for good
    FailedTerminal,
}

impl JobStatus {
    /// Convert integer status code to JobStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => JobStatus::Pending,
            1 => JobStatus::InProgress,
            2 => JobStatus::Success,
            3 => JobStatus::FailedRetryable,
            // Unknown codes surface as terminal so they are never silently re-run
            _ => JobStatus::FailedTerminal,
        }
    }

    /// Convert JobStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::InProgress => 1,
            JobStatus::Success => 2,
            JobStatus::FailedRetryable => 3,
            JobStatus::FailedTerminal => 4,
        }
    }

    /// SUCCESS and FAILED_TERMINAL are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::FailedTerminal)
    }

    /// Upper-case name as used in logs and messages
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::FailedRetryable => "FAILED_RETRYABLE",
            JobStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote file's processing lifecycle as recorded in the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchJob {
    /// Ledger identifier
    pub id: JobId,
    /// Full path of the file on the remote endpoint
    pub remote_path: String,
    /// Remote modification token (mtime, etag); empty when the endpoint has none
    pub modification_token: String,
    /// Current status
    pub status: JobStatus,
    /// Completed attempts that failed
    pub retry_count: u32,
    /// Times the job has been claimed; identifies the current claim
    pub claim_count: u32,
    /// Size reported by the listing, in bytes
    pub size_bytes: Option<u64>,
    /// When the job was last claimed
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time a retryable job may be claimed again
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last failure, prefixed with its error code
    pub error_message: Option<String>,
    /// When the file was first discovered
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl FetchJob {
    /// The claim this snapshot was taken under
    pub fn claim(&self) -> Claim {
        Claim {
            id: self.id,
            claim_count: self.claim_count,
        }
    }

    /// Final path component of the remote path
    pub fn file_name(&self) -> &str {
        self.remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_path)
    }
}

/// A worker's hold on an IN_PROGRESS job
///
/// Completions are fenced on it: once the job has been reclaimed and claimed
/// again, an older claim can no longer settle it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Claim {
    /// Job the claim is on
    pub id: JobId,
    /// Value of `claim_count` when the job was claimed
    pub claim_count: u32,
}

/// Signature verification outcome of a decrypted message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    /// Signature present and valid for a key in the ring
    Verified,
    /// Signature present but the issuer is not in the ring
    NoMatchingKey,
    /// Signature present and does not match the content
    SignatureMismatch,
    /// No signature layer
    Unsigned,
}

impl std::fmt::Display for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verification::Verified => "verified",
            Verification::NoMatchingKey => "no matching key",
            Verification::SignatureMismatch => "signature mismatch",
            Verification::Unsigned => "unsigned",
        })
    }
}

/// Event emitted on the operator channel
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A listing found a file the ledger had not seen
    JobDiscovered {
        /// Job ID
        id: JobId,
        /// Remote path
        remote_path: String,
    },

    /// A worker claimed the job
    JobClaimed {
        /// Job ID
        id: JobId,
        /// Remote path
        remote_path: String,
        /// 1-based attempt number
        attempt: u32,
    },

    /// Plaintext forwarded and job marked SUCCESS
    JobSucceeded {
        /// Job ID
        id: JobId,
        /// Remote path
        remote_path: String,
        /// Signature outcome of the message
        verification: Verification,
        /// Plaintext size in bytes
        bytes: u64,
    },

    /// Attempt failed, job will be retried
    JobRetrying {
        /// Job ID
        id: JobId,
        /// Remote path
        remote_path: String,
        /// Failed attempts so far
        retry_count: u32,
        /// When the job becomes claimable again
        #[serde(skip_serializing_if = "Option::is_none")]
        next_attempt_at: Option<DateTime<Utc>>,
        /// Error message
        error: String,
    },

    /// Job reached FAILED_TERMINAL
    JobFailed {
        /// Job ID
        id: JobId,
        /// Remote path
        remote_path: String,
        /// Machine-readable error code
        error_code: String,
        /// Error message
        error: String,
    },

    /// Integrity check failed: the ciphertext may have been tampered with
    IntegrityAlert {
        /// Job ID
        id: JobId,
        /// Remote path
        remote_path: String,
    },

    /// Signature outcome reported (and possibly blocked) by policy
    SignatureRejected {
        /// Job ID
        id: JobId,
        /// Remote path
        remote_path: String,
        /// Verification outcome
        outcome: Verification,
        /// Whether forwarding was blocked
        blocked: bool,
    },

    /// Expired IN_PROGRESS leases returned to PENDING
    StaleJobsReclaimed {
        /// Number of jobs reclaimed
        count: u64,
    },

    /// A run-level fatal error stopped new claims
    RunHalted {
        /// Machine-readable error code
        error_code: String,
        /// Error message
        error: String,
    },

    /// Webhook delivery failed
    WebhookFailed {
        /// Webhook URL
        url: String,
        /// Error message
        error: String,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

impl Event {
    /// Job the event concerns, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::JobDiscovered { id, .. }
            | Event::JobClaimed { id, .. }
            | Event::JobSucceeded { id, .. }
            | Event::JobRetrying { id, .. }
            | Event::JobFailed { id, .. }
            | Event::IntegrityAlert { id, .. }
            | Event::SignatureRejected { id, .. } => Some(*id),
            Event::StaleJobsReclaimed { .. }
            | Event::RunHalted { .. }
            | Event::WebhookFailed { .. }
            | Event::Shutdown => None,
        }
    }
}
