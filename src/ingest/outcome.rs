//! Failure classification

use crate::error::Error;
use crate::retry::IsRetryable;
use serde::{Deserialize, Serialize};

/// What the orchestrator does with a job whose attempt failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Count the attempt and try again after backoff
    Retry,
    /// Fail the job for good on this first occurrence
    Terminal,
    /// Stop claiming work; the job is released untouched
    RunFatal,
}

/// Decide how a failed attempt is recorded
///
/// Only I/O-class failures are retried: remote transfer problems, local disk
/// and ledger errors, and anything the sink reports. Every cryptographic or
/// key failure, a missing remote file and a blocked signature end the job.
/// Authentication failures, a missing remote directory and configuration
/// errors halt the run.
///
/// ```
/// use secure_ingest::{Disposition, Error, FetchError, PgpError, classify};
///
/// let timeout = Error::Fetch(FetchError::Timeout { operation: "fetch".into(), seconds: 300 });
/// assert_eq!(classify(&timeout), Disposition::Retry);
/// assert_eq!(classify(&Error::Pgp(PgpError::IntegrityCheckFailed)), Disposition::Terminal);
/// assert_eq!(classify(&Error::Fetch(FetchError::Auth("denied".into()))), Disposition::RunFatal);
/// ```
pub fn classify(error: &Error) -> Disposition {
    if error.is_run_fatal() {
        return Disposition::RunFatal;
    }
    match error {
        Error::Fetch(e) if e.is_retryable() => Disposition::Retry,
        Error::Fetch(_) => Disposition::Terminal,
        Error::Sink(_)
        | Error::Io(_)
        | Error::Network(_)
        | Error::Database(_)
        | Error::Sqlx(_)
        | Error::ShuttingDown => Disposition::Retry,
        Error::Pgp(_)
        | Error::NoMatchingKey { .. }
        | Error::SignatureRejected { .. }
        | Error::Serialization(_)
        | Error::Other(_) => Disposition::Terminal,
        Error::Config { .. } => Disposition::RunFatal,
    }
}
