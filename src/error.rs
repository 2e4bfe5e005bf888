//! Error types for secure-ingest
//!
//! One top-level [`Error`] with domain sub-enums for the remote fetcher
//! ([`FetchError`]), the OpenPGP engine ([`PgpError`]), the ledger
//! ([`DatabaseError`]) and the downstream sink ([`SinkError`]).
//!
//! Retry decisions are not made here; see [`crate::ingest::classify`].

use crate::types::{JobId, JobStatus, Verification};
use thiserror::Error;

/// Result type alias for secure-ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for secure-ingest
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "remote.host")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Remote endpoint or transfer failure
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// OpenPGP processing failure
    #[error("OpenPGP error: {0}")]
    Pgp(#[from] PgpError),

    /// Downstream sink refused or could not take the plaintext
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error (webhooks, HTTP sink)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No encrypted session key in the envelope targets a key we hold
    #[error("no matching decryption key (envelope addressed to: {})", .recipients.join(", "))]
    NoMatchingKey {
        /// Hex key IDs the envelope was addressed to
        recipients: Vec<String>,
    },

    /// Signature outcome blocked by the configured signature policy
    #[error("signature policy rejected message: {outcome}")]
    SignatureRejected {
        /// The verification outcome that was rejected
        outcome: Verification,
    },

    /// Shutdown in progress - not claiming new jobs
    #[error("shutdown in progress: not claiming new jobs")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// A job was asked to leave a state it is not in
    #[error("job {id} is {actual}, expected {expected}")]
    InvalidTransition {
        /// Job whose transition was refused
        id: JobId,
        /// State the transition requires
        expected: JobStatus,
        /// State the job is actually in
        actual: JobStatus,
    },

    /// The job was reclaimed and claimed again since this claim was taken
    #[error("job {id} lease lost: claim {held} superseded by claim {current}")]
    LeaseLost {
        /// Job whose lease was lost
        id: JobId,
        /// Claim the caller holds
        held: u32,
        /// Claim currently holding the job
        current: u32,
    },
}

/// Remote endpoint errors
///
/// Connection failures, transient I/O and timeouts are retryable. `Auth` and
/// `RemoteDirMissing` halt the whole run; `NotFound` fails only the job.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Could not reach the endpoint or the session dropped
    #[error("connection failed: {0}")]
    Connection(String),

    /// The endpoint refused our credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The configured remote directory does not exist
    #[error("remote directory missing: {0}")]
    RemoteDirMissing(String),

    /// The remote file vanished between listing and fetch
    #[error("remote file not found: {0}")]
    NotFound(String),

    /// Transfer interrupted mid-stream
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Operation exceeded its time budget
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// What was being attempted
        operation: String,
        /// Budget that was exceeded
        seconds: u64,
    },

    /// Transfer completed with fewer or more bytes than the listing reported
    #[error("transfer length mismatch: expected {expected} bytes, received {actual}")]
    LengthMismatch {
        /// Size reported by the remote listing
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },
}

/// OpenPGP engine errors
#[derive(Debug, Error)]
pub enum PgpError {
    /// Secret key could not be unlocked (wrong passphrase or damaged key)
    #[error("failed to extract private key {key_id}: {reason}")]
    KeyExtraction {
        /// Hex key ID of the key being unlocked
        key_id: String,
        /// Why extraction failed
        reason: String,
    },

    /// Modification detection code did not match: possible tampering
    #[error("integrity check failed: message may have been tampered with")]
    IntegrityCheckFailed,

    /// Envelope layers are not in an accepted order or are missing
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A single packet could not be parsed
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Algorithm identifier we do not implement
    #[error("unsupported {kind} algorithm {id}")]
    UnsupportedAlgorithm {
        /// Algorithm family ("public-key", "symmetric", "hash", "compression", "S2K")
        kind: &'static str,
        /// RFC 4880 algorithm identifier
        id: u8,
    },

    /// No signing-capable secret key in the key ring
    #[error("no signing-capable secret key in key ring")]
    NoSigningKey,

    /// Recipient key cannot encrypt
    #[error("key {0} is not encryption-capable")]
    NoEncryptionKey(String),

    /// Requested key ID is not in the key ring
    #[error("key {0} not found in key ring")]
    KeyNotFound(String),

    /// ASCII armor could not be decoded
    #[error("armor error: {0}")]
    Armor(String),

    /// Compressed layer could not be inflated
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Compressed layer inflates past the configured ceiling
    #[error("decompressed size exceeds limit of {limit} bytes")]
    DecompressionLimit {
        /// Configured ceiling in bytes
        limit: u64,
    },

    /// Public-key or symmetric primitive failed
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}

/// Downstream sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink received the data and refused it
    #[error("sink rejected delivery: {0}")]
    Rejected(String),

    /// The sink could not be reached
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Conditions that stop the whole run rather than a single job
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fetch(FetchError::Auth(_) | FetchError::RemoteDirMissing(_))
                | Error::Config { .. }
        )
    }

    /// Machine-readable code for events, webhooks and the ledger's error column
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Fetch(e) => match e {
                FetchError::Connection(_) => "connection_error",
                FetchError::Auth(_) => "auth_error",
                FetchError::RemoteDirMissing(_) => "remote_dir_missing",
                FetchError::NotFound(_) => "file_not_found",
                FetchError::TransientIo(_) => "transient_io_error",
                FetchError::Timeout { .. } => "timeout",
                FetchError::LengthMismatch { .. } => "length_mismatch",
            },
            Error::Pgp(e) => match e {
                PgpError::KeyExtraction { .. } => "key_extraction_error",
                PgpError::IntegrityCheckFailed => "integrity_check_failed",
                PgpError::MalformedEnvelope(_) | PgpError::MalformedPacket(_) => {
                    "malformed_envelope"
                }
                PgpError::UnsupportedAlgorithm { .. } => "unsupported_algorithm",
                PgpError::NoSigningKey => "no_signing_key",
                PgpError::NoEncryptionKey(_) | PgpError::KeyNotFound(_) => "key_error",
                PgpError::Armor(_) => "armor_error",
                PgpError::Decompression(_) | PgpError::DecompressionLimit { .. } => {
                    "decompression_error"
                }
                PgpError::Crypto(_) => "crypto_error",
            },
            Error::Sink(_) => "sink_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::NoMatchingKey { .. } => "no_matching_key",
            Error::SignatureRejected { .. } => "signature_rejected",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "internal_error",
        }
    }
}
