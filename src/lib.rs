//! # secure-ingest
//!
//! Durable ingestion of OpenPGP-encrypted files dropped on a remote SFTP
//! endpoint.
//!
//! Every poll cycle lists the remote directory, records new files in a
//! SQLite retry ledger, and works through due jobs on a bounded worker pool:
//! each file is fetched into a staging directory, decrypted and
//! signature-checked, and the plaintext handed to a [`Sink`]. Failures are
//! classified as retryable (I/O), terminal for the file (anything
//! cryptographic) or fatal for the run (bad credentials, missing directory).
//!
//! ## Components
//!
//! - [`pgp`] - OpenPGP engine: sign-and-encrypt, decrypt, verify, key rings
//! - [`remote`] - Remote endpoint sessions, pooling and atomic staging
//! - [`db`] - The retry ledger
//! - [`ingest`] - The orchestrator tying them together
//!
//! ## Quick Start
//!
//! ```no_run
//! use secure_ingest::{Config, DirectorySink, Ingestor, MemoryEndpoint, run_with_shutdown};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.remote.host = "sftp.example.com".to_string();
//!     config.remote.remote_dir = "outbound".to_string();
//!     config.keys.key_ring_paths = vec!["keys/ingest.asc".into()];
//!     config.keys.passphrase = "passphrase".to_string();
//!
//!     let ingestor = Ingestor::new(
//!         config,
//!         Arc::new(MemoryEndpoint::new()),
//!         Arc::new(DirectorySink::new("delivered")),
//!     )
//!     .await?;
//!
//!     // Subscribe to events
//!     let mut events = ingestor.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     run_with_shutdown(ingestor).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Retry ledger persistence
pub mod db;
/// Error types
pub mod error;
/// Orchestration of fetch, decrypt and delivery
pub mod ingest;
/// OpenPGP engine
pub mod pgp;
/// Remote endpoint access
pub mod remote;
/// Retry logic with exponential backoff
pub mod retry;
/// Downstream sinks
pub mod sink;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, RemoteAuth, SignatureAction, SignaturePolicy};
pub use db::Database;
pub use error::{DatabaseError, Error, FetchError, PgpError, Result, SinkError};
pub use ingest::{CycleReport, Disposition, Ingestor, classify};
pub use pgp::{
    DecryptResult, Decrypted, EncryptOptions, EngineOptions, KeyId, KeyPair, KeyRing, PgpEngine,
};
pub use remote::{MemoryEndpoint, RemoteEndpoint, RemoteEntry, RemoteSession};
#[cfg(feature = "sftp")]
pub use remote::SftpEndpoint;
pub use sink::{DeliveryMetadata, DirectorySink, HttpSink, Sink};
pub use types::{Claim, Event, FetchJob, JobId, JobStatus, Verification};

/// Run the ingestion loop until a termination signal, then shut down gracefully.
///
/// Starts [`Ingestor::run`] in the background, waits for a signal and calls
/// [`Ingestor::shutdown`]. If the run halts on its own (authentication
/// failure, missing remote directory) the halting error is returned without
/// waiting for a signal.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(ingestor: Ingestor) -> Result<()> {
    let mut run = ingestor.start();

    tokio::select! {
        _ = wait_for_signal() => {}
        finished = &mut run => {
            return match finished {
                Ok(result) => result,
                Err(e) => Err(Error::Other(format!("ingestion loop panicked: {e}"))),
            };
        }
    }

    ingestor.shutdown().await?;
    match run.await {
        Ok(result) => result,
        Err(e) => Err(Error::Other(format!("ingestion loop panicked: {e}"))),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
