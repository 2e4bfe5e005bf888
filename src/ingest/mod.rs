//! Orchestrator: drives fetch → decrypt/verify → forward for every remote file
//!
//! The `Ingestor` struct and its methods are organized by domain:
//! - [`cycle`] - One discovery/claim/process pass and the polling loop
//! - [`job_task`] - Processing of a single claimed job
//! - [`outcome`] - Pure classification of failures into retry decisions
//! - [`lifecycle`] - Startup recovery and graceful shutdown
//! - [`webhooks`] - Operator event channel and webhook notifications

mod cycle;
mod job_task;
mod lifecycle;
mod outcome;
mod webhooks;


pub use cycle::CycleReport;
pub use outcome::{Disposition, classify};
pub use webhooks::WebhookPayload;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::pgp::{EngineOptions, KeyRing, PgpEngine};
use crate::remote::{Credentials, RemoteEndpoint, SessionPool, Stager};
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::types::Event;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use webhooks::Notifier;

/// Worker and shutdown state shared by every cycle
#[derive(Clone)]
pub(crate) struct WorkerState {
    /// Limits concurrently processed jobs (`workers.max_concurrent_jobs`)
    pub(crate) concurrent_limit: Arc<Semaphore>,
    /// Cancelled on shutdown; every job token is a child of it
    pub(crate) cancel_token: CancellationToken,
    /// Cleared on shutdown or after a run-level failure
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// The error that halted the run, kept for [`Ingestor::run`]
    pub(crate) halt_error: Arc<std::sync::Mutex<Option<Error>>>,
}

/// The ingestion pipeline (cloneable - all fields are Arc-wrapped)
///
/// ```no_run
/// use secure_ingest::{Config, DirectorySink, Ingestor, MemoryEndpoint};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut config = Config::default();
/// config.remote.host = "sftp.example.com".into();
///
/// let ingestor = Ingestor::new(
///     config,
///     Arc::new(MemoryEndpoint::new()),
///     Arc::new(DirectorySink::new("delivered")),
/// )
/// .await?;
///
/// let report = ingestor.run_cycle().await?;
/// println!("{} files delivered", report.succeeded);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Ingestor {
    /// Retry ledger (public for inspection by embedding applications and tests)
    pub db: Arc<Database>,
    pub(crate) engine: Arc<PgpEngine>,
    pub(crate) key_ring: Arc<KeyRing>,
    pub(crate) sessions: Arc<SessionPool>,
    pub(crate) stager: Stager,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) notifier: Notifier,
    pub(crate) config: Arc<Config>,
    pub(crate) workers: WorkerState,
}

impl Ingestor {
    /// Create an ingestor, loading the key ring from `keys.key_ring_paths`
    ///
    /// Opens (and migrates) the ledger and creates the staging and plaintext
    /// directories. If the previous run did not shut down cleanly, every
    /// IN_PROGRESS job is returned to PENDING immediately.
    pub async fn new(
        config: Config,
        endpoint: Arc<dyn RemoteEndpoint>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self> {
        config.validate()?;
        let key_ring = KeyRing::load(&config.keys.key_ring_paths).await?;
        Self::with_key_ring(config, key_ring, endpoint, sink).await
    }

    /// Create an ingestor with an already-loaded key ring
    pub async fn with_key_ring(
        config: Config,
        key_ring: KeyRing,
        endpoint: Arc<dyn RemoteEndpoint>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self> {
        config.validate()?;
        if key_ring.is_empty() {
            return Err(Error::Config {
                message: "key ring contains no usable keys".into(),
                key: Some("keys.key_ring_paths".into()),
            });
        }

        let stager = Stager::from_config(&config.staging, &config.remote);
        stager.prepare().await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create staging directory '{}': {}",
                    config.staging.staging_dir.display(),
                    e
                ),
            ))
        })?;
        if let Some(dir) = &config.staging.plaintext_dir {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create plaintext directory '{}': {}", dir.display(), e),
                ))
            })?;
        }

        let db = Database::new(&config.ledger.database_path)
            .await?
            .with_retry_policy(RetryPolicy::from_config(&config.ledger));

        // Buffer of 1000 events; slow subscribers lag rather than block workers
        let (event_tx, _rx) = broadcast::channel(1000);

        let sessions = SessionPool::new(
            endpoint,
            Credentials::from_config(&config.remote),
            config.remote.connections,
            config.remote.connect_timeout,
        );

        let engine = PgpEngine::new(EngineOptions::from_config(&config.keys));
        let config = Arc::new(config);

        let ingestor = Self {
            db: Arc::new(db),
            engine: Arc::new(engine),
            key_ring: Arc::new(key_ring),
            sessions: Arc::new(sessions),
            stager,
            sink,
            notifier: Notifier::new(event_tx, config.notifications.webhooks.clone()),
            workers: WorkerState {
                concurrent_limit: Arc::new(Semaphore::new(config.workers.max_concurrent_jobs)),
                cancel_token: CancellationToken::new(),
                accepting_new: Arc::new(AtomicBool::new(true)),
                halt_error: Arc::new(std::sync::Mutex::new(None)),
            },
            config,
        };

        ingestor.recover_after_restart().await?;
        Ok(ingestor)
    }

    /// Subscribe to the operator event channel
    ///
    /// Each subscriber receives every event emitted after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notifier.subscribe()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Key ring used for decryption and signature checks
    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }
}
