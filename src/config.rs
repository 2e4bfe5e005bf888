//! Configuration types for secure-ingest

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for [`Ingestor`](crate::Ingestor)
///
/// Fields are organized into sub-configs:
/// - [`remote`](RemoteConfig) - endpoint, credentials, transfer limits
/// - [`staging`](StagingConfig) - local download and plaintext directories
/// - [`keys`](KeyConfig) - key rings, passphrase, signature policy
/// - [`ledger`](LedgerConfig) - database, retry budget, backoff, leases
/// - [`workers`](WorkerConfig) - polling and concurrency
/// - [`notifications`](NotificationConfig) - operator webhooks
///
/// Everything except `remote.host` has a working default.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote endpoint settings
    pub remote: RemoteConfig,

    /// Local staging directories
    #[serde(default)]
    pub staging: StagingConfig,

    /// Key material and signature policy
    #[serde(default)]
    pub keys: KeyConfig,

    /// Retry ledger settings
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Worker pool and polling
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Operator notifications
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            return Err(config_error("remote host must not be empty", "remote.host"));
        }
        if self.remote.connections == 0 {
            return Err(config_error(
                "at least one remote connection is required",
                "remote.connections",
            ));
        }
        if self.workers.max_concurrent_jobs == 0 {
            return Err(config_error(
                "at least one worker is required",
                "workers.max_concurrent_jobs",
            ));
        }
        if self.workers.claim_batch == 0 {
            return Err(config_error(
                "claim batch must be at least 1",
                "workers.claim_batch",
            ));
        }
        if self.ledger.max_retries == 0 {
            return Err(config_error(
                "max_retries must be at least 1",
                "ledger.max_retries",
            ));
        }
        // A live transfer must never outlast its lease
        if self.ledger.lease_timeout <= self.remote.io_timeout {
            return Err(config_error(
                "lease timeout must be longer than the remote I/O timeout",
                "ledger.lease_timeout",
            ));
        }
        if let BackoffConfig::Exponential { multiplier, .. } = self.ledger.backoff
            && multiplier < 1.0
        {
            return Err(config_error(
                "backoff multiplier must be >= 1.0",
                "ledger.backoff.multiplier",
            ));
        }
        for (i, hook) in self.notifications.webhooks.iter().enumerate() {
            if hook.url.trim().is_empty() {
                return Err(config_error(
                    "webhook URL must not be empty",
                    &format!("notifications.webhooks[{i}].url"),
                ));
            }
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Remote endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Endpoint hostname
    pub host: String,

    /// Endpoint port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login name
    #[serde(default)]
    pub username: String,

    /// How to authenticate
    #[serde(default)]
    pub auth: RemoteAuth,

    /// Directory the counterparty drops files into (default: ".")
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Only ingest files whose name ends with this suffix (e.g. ".pgp")
    #[serde(default)]
    pub file_suffix: Option<String>,

    /// Maximum concurrent sessions to the endpoint (default: 4)
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Time allowed to establish and authenticate a session (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Time allowed for one complete file transfer (default: 5 minutes)
    #[serde(default = "default_io_timeout", with = "duration_serde")]
    pub io_timeout: Duration,

    /// known_hosts file for strict host-key checking (disabled when unset)
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: RemoteAuth::default(),
            remote_dir: default_remote_dir(),
            file_suffix: None,
            connections: default_connections(),
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
            known_hosts: None,
        }
    }
}

/// Remote authentication method
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RemoteAuth {
    /// Password authentication
    Password {
        /// The password
        password: String,
    },
    /// Public-key authentication from a private key file
    PrivateKey {
        /// Path to the private key file
        path: PathBuf,
        /// Passphrase protecting the key file
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl Default for RemoteAuth {
    fn default() -> Self {
        RemoteAuth::Password {
            password: String::new(),
        }
    }
}

/// Local staging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Where downloads land; partial transfers live here as hidden `.part` files
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Where decrypted files are written (disabled when unset)
    #[serde(default = "default_plaintext_dir")]
    pub plaintext_dir: Option<PathBuf>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            plaintext_dir: default_plaintext_dir(),
        }
    }
}

/// Key material configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Key ring files (armored or binary), merged in order
    #[serde(default)]
    pub key_ring_paths: Vec<PathBuf>,

    /// Passphrase for extracting private keys
    #[serde(default)]
    pub passphrase: String,

    /// Hex key ID of the signing key; first signing-capable key when unset
    #[serde(default)]
    pub signer_key_id: Option<String>,

    /// What to do with each signature outcome
    #[serde(default)]
    pub signature_policy: SignaturePolicy,

    /// Ceiling on inflated message size (default: 1 GiB)
    #[serde(default = "default_max_decompressed_bytes")]
    pub max_decompressed_bytes: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_ring_paths: Vec::new(),
            passphrase: String::new(),
            signer_key_id: None,
            signature_policy: SignaturePolicy::default(),
            max_decompressed_bytes: default_max_decompressed_bytes(),
        }
    }
}

/// Whether a signature outcome lets the plaintext through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAction {
    /// Forward the plaintext
    Forward,
    /// Fail the job terminally and report
    Block,
}

/// Signature policy per verification outcome
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePolicy {
    /// Signature present but does not match (default: block)
    #[serde(default = "default_block")]
    pub on_mismatch: SignatureAction,

    /// Signature by a key not in the ring (default: forward)
    #[serde(default = "default_forward")]
    pub on_unknown_signer: SignatureAction,

    /// No signature layer (default: forward)
    #[serde(default = "default_forward")]
    pub on_unsigned: SignatureAction,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self {
            on_mismatch: SignatureAction::Block,
            on_unknown_signer: SignatureAction::Forward,
            on_unsigned: SignatureAction::Forward,
        }
    }
}

/// Retry ledger configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// SQLite database path (default: "secure-ingest.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Attempts before a job becomes FAILED_TERMINAL (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay schedule between attempts (default: fixed 5 minutes)
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// IN_PROGRESS jobs older than this are reclaimed (default: 15 minutes)
    ///
    /// Must exceed `remote.io_timeout`.
    #[serde(default = "default_lease_timeout", with = "duration_serde")]
    pub lease_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
            lease_timeout: default_lease_timeout(),
        }
    }
}

/// Backoff schedule for failed jobs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay after every failure
    Fixed {
        /// The delay
        #[serde(default = "default_fixed_delay", with = "duration_serde")]
        delay: Duration,
    },
    /// Delay grows geometrically with the retry count
    Exponential {
        /// Delay after the first failure
        #[serde(default = "default_fixed_delay", with = "duration_serde")]
        initial_delay: Duration,
        /// Upper bound on the delay
        #[serde(default = "default_backoff_max_delay", with = "duration_serde")]
        max_delay: Duration,
        /// Growth factor per failure
        #[serde(default = "default_backoff_multiplier")]
        multiplier: f64,
        /// Add up to 100% random jitter
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Fixed {
            delay: default_fixed_delay(),
        }
    }
}

/// Worker pool and polling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pause between cycles (default: 60 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Jobs processed concurrently (default: 4)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Jobs claimed per cycle (default: 16)
    #[serde(default = "default_claim_batch")]
    pub claim_batch: u32,

    /// In-process retry of the connect step
    #[serde(default)]
    pub connect_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            claim_batch: default_claim_batch(),
            connect_retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for in-process retries of transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Notification configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhook configurations
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

/// Webhook configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL to POST to
    pub url: String,

    /// Events that trigger this webhook
    pub events: Vec<WebhookEvent>,

    /// Optional authentication header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Timeout for webhook requests (default: 30 seconds)
    #[serde(default = "default_webhook_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

/// Webhook trigger event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    /// A job's plaintext was forwarded
    OnSuccess,
    /// A job reached FAILED_TERMINAL
    OnFailed,
    /// An integrity check failed
    OnIntegrityAlert,
    /// A run-level error stopped new claims
    OnRunHalted,
}

fn default_port() -> u16 {
    22
}

fn default_remote_dir() -> String {
    ".".to_string()
}

fn default_connections() -> usize {
    4
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("staging")
}

fn default_plaintext_dir() -> Option<PathBuf> {
    Some(PathBuf::from("plaintext"))
}

fn default_max_decompressed_bytes() -> u64 {
    1 << 30
}

fn default_block() -> SignatureAction {
    SignatureAction::Block
}

fn default_forward() -> SignatureAction {
    SignatureAction::Forward
}

fn default_database_path() -> PathBuf {
    PathBuf::from("secure-ingest.db")
}

fn default_max_retries() -> u32 {
    3
}

fn default_lease_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_fixed_delay() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_backoff_max_delay() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_claim_batch() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            remote: RemoteConfig {
                host: "sftp.example.com".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = minimal();
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.remote.connections, 4);
        assert_eq!(config.ledger.max_retries, 3);
        assert_eq!(
            config.ledger.backoff,
            BackoffConfig::Fixed {
                delay: Duration::from_secs(300)
            }
        );
        assert_eq!(config.workers.poll_interval, Duration::from_secs(60));
        assert_eq!(
            config.keys.signature_policy.on_mismatch,
            SignatureAction::Block
        );
        assert_eq!(
            config.keys.signature_policy.on_unsigned,
            SignatureAction::Forward
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let json = r#"{ "remote": { "host": "sftp.example.com", "username": "ingest" } }"#;
        let config: Config = serde_json::from_str(json).expect("deserialize failed");

        assert_eq!(config.remote.username, "ingest");
        assert_eq!(config.remote.remote_dir, ".");
        assert_eq!(config.remote.io_timeout, Duration::from_secs(300));
        assert_eq!(config.staging.staging_dir, PathBuf::from("staging"));
        assert_eq!(config.ledger.lease_timeout, Duration::from_secs(900));
        assert_eq!(config.workers.claim_batch, 16);
    }

    #[test]
    fn tagged_auth_and_backoff_deserialize() {
        let json = r#"{
            "remote": {
                "host": "h",
                "auth": { "method": "private_key", "path": "/keys/id_ed25519" }
            },
            "ledger": {
                "backoff": { "strategy": "exponential", "initial_delay": 10, "multiplier": 3.0 }
            }
        }"#;
        let config: Config = serde_json::from_str(json).expect("deserialize failed");

        assert_eq!(
            config.remote.auth,
            RemoteAuth::PrivateKey {
                path: PathBuf::from("/keys/id_ed25519"),
                passphrase: None
            }
        );
        match config.ledger.backoff {
            BackoffConfig::Exponential {
                initial_delay,
                max_delay,
                multiplier,
                jitter,
            } => {
                assert_eq!(initial_delay, Duration::from_secs(10));
                assert_eq!(max_delay, Duration::from_secs(6 * 60 * 60));
                assert_eq!(multiplier, 3.0);
                assert!(!jitter);
            }
            other => panic!("expected exponential backoff, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_host() {
        let err = Config::default().validate().unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("remote.host")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_zero_workers_and_retries() {
        let mut config = minimal();
        config.workers.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.ledger.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.workers.claim_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_lease_not_longer_than_io_timeout() {
        let mut config = minimal();
        config.remote.io_timeout = Duration::from_secs(900);
        config.ledger.lease_timeout = Duration::from_secs(900);
        match config.validate().unwrap_err() {
            Error::Config { key, .. } => {
                assert_eq!(key.as_deref(), Some("ledger.lease_timeout"))
            }
            other => panic!("expected config error, got {other:?}"),
        }

        config.ledger.lease_timeout = Duration::from_secs(60);
        assert!(config.validate().is_err());

        config.ledger.lease_timeout = Duration::from_secs(901);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn webhook_round_trip_keeps_timeout_seconds() {
        let hook = WebhookConfig {
            url: "https://ops.example.com/hook".into(),
            events: vec![WebhookEvent::OnIntegrityAlert],
            auth_header: None,
            timeout: Duration::from_secs(12),
        };
        let json = serde_json::to_value(&hook).unwrap();
        assert_eq!(json["timeout"], 12);
        let back: WebhookConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.timeout, Duration::from_secs(12));
        assert_eq!(back.events, vec![WebhookEvent::OnIntegrityAlert]);
    }
}
