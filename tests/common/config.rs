//! Test configuration helpers for building ingestors

use super::fixtures::{RECEIVER_PASSPHRASE, RecordingSink, write_key_files};
use secure_ingest::config::{BackoffConfig, RetryConfig};
use secure_ingest::{Config, Ingestor, MemoryEndpoint, RemoteEndpoint, Sink};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Remote directory the memory endpoint exposes
pub const INBOX: &str = "outbound";

/// Config rooted in `temp_dir` with immediate retries and a fast connect budget
pub fn test_config(temp_dir: &TempDir) -> Config {
    let root = temp_dir.path();
    let mut config = Config::default();
    config.remote.host = "memory".into();
    config.remote.remote_dir = INBOX.into();
    config.staging.staging_dir = root.join("staging");
    config.staging.plaintext_dir = Some(root.join("plaintext"));
    config.keys.key_ring_paths = write_key_files(&root.join("keys"));
    config.keys.passphrase = RECEIVER_PASSPHRASE.into();
    config.ledger.database_path = root.join("ledger.db");
    config.ledger.backoff = BackoffConfig::Fixed {
        delay: Duration::ZERO,
    };
    config.workers.poll_interval = Duration::from_millis(50);
    config.workers.connect_retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// An ingestor over a fresh memory endpoint and recording sink
///
/// Returns the temp directory as well; keep it alive for the test duration.
pub struct TestIngest {
    pub ingestor: Ingestor,
    pub endpoint: MemoryEndpoint,
    pub sink: Arc<RecordingSink>,
    pub temp_dir: TempDir,
}

/// Build a [`TestIngest`], letting the caller adjust the config first
pub async fn create_ingest(tweak: impl FnOnce(&mut Config)) -> TestIngest {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp_dir);
    tweak(&mut config);

    let endpoint = MemoryEndpoint::new();
    endpoint.add_dir(INBOX);
    let sink = Arc::new(RecordingSink::default());

    let ingestor = Ingestor::new(
        config,
        Arc::new(endpoint.clone()) as Arc<dyn RemoteEndpoint>,
        Arc::clone(&sink) as Arc<dyn Sink>,
    )
    .await
    .unwrap();

    TestIngest {
        ingestor,
        endpoint,
        sink,
        temp_dir,
    }
}

/// Live SFTP settings from the environment (`.env` is honoured)
///
/// Required: `SFTP_HOST`, `SFTP_USERNAME`, `SFTP_PASSWORD`, `SFTP_REMOTE_DIR`.
/// Optional: `SFTP_PORT` (default 22).
pub fn load_sftp_config(temp_dir: &TempDir) -> Option<Config> {
    dotenvy::dotenv().ok();

    let host = std::env::var("SFTP_HOST").ok()?;
    let username = std::env::var("SFTP_USERNAME").ok()?;
    let password = std::env::var("SFTP_PASSWORD").ok()?;
    let remote_dir = std::env::var("SFTP_REMOTE_DIR").ok()?;
    let port = std::env::var("SFTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(22);

    let mut config = test_config(temp_dir);
    config.remote.host = host;
    config.remote.port = port;
    config.remote.username = username;
    config.remote.auth = secure_ingest::RemoteAuth::Password { password };
    config.remote.remote_dir = remote_dir;
    Some(config)
}
