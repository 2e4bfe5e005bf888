//! Startup recovery and shutdown coordination.

use super::Ingestor;
use crate::error::Result;
use crate::types::Event;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::time::Duration;

impl Ingestor {
    /// Reclaim orphaned jobs if the previous run died, then mark this run started
    pub(crate) async fn recover_after_restart(&self) -> Result<()> {
        if self.db.was_unclean_shutdown().await? {
            // Nothing can still be working on these
            let reclaimed = self.db.reclaim_stale(Duration::ZERO, Utc::now()).await?;
            tracing::warn!(
                reclaimed,
                "previous run did not shut down cleanly, returned in-flight jobs to PENDING"
            );
            if reclaimed > 0 {
                self.notifier.publish(Event::StaleJobsReclaimed { count: reclaimed });
            }
        }
        self.db.set_clean_start().await
    }

    /// Gracefully shut down the ingestor
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops claiming new jobs
    /// 2. Cancels in-flight jobs; each releases its ledger row to PENDING
    /// 3. Waits (up to 30 seconds) for workers to finish
    /// 4. Closes idle remote sessions and marks a clean shutdown in the ledger
    ///
    /// # Errors
    ///
    /// Returns an error if the clean-shutdown marker cannot be written. The
    /// next start then reclaims every IN_PROGRESS job.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.workers.accepting_new.store(false, Ordering::SeqCst);
        self.notifier.publish(Event::Shutdown);
        self.workers.cancel_token.cancel();
        tracing::info!("Stopped claiming and signalled in-flight jobs");

        let shutdown_timeout = Duration::from_secs(30);
        match tokio::time::timeout(shutdown_timeout, self.wait_for_workers()).await {
            Ok(()) => tracing::info!("All workers finished"),
            Err(_) => tracing::warn!(
                "Timeout waiting for workers to finish, proceeding with shutdown"
            ),
        }

        self.sessions.clear();

        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
            return Err(e);
        }
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Whether the ingestor still claims new work
    pub fn is_accepting(&self) -> bool {
        self.workers.accepting_new.load(Ordering::SeqCst)
    }

    /// Wait until every worker slot is free
    async fn wait_for_workers(&self) {
        let slots = u32::try_from(self.config.workers.max_concurrent_jobs).unwrap_or(u32::MAX);
        // Acquiring every permit means no job holds one
        if let Ok(permits) = self.workers.concurrent_limit.acquire_many(slots).await {
            drop(permits);
        }
    }
}
