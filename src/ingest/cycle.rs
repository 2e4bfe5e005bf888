//! Discovery, claiming and the polling loop

use super::Ingestor;
use super::job_task::JobOutcome;
use crate::error::{Error, Result};
use crate::remote::filter_listing;
use crate::types::Event;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What one cycle did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Expired IN_PROGRESS leases returned to PENDING
    pub reclaimed: u64,
    /// New files recorded from the listing
    pub discovered: usize,
    /// Jobs claimed from the ledger
    pub claimed: usize,
    /// Jobs delivered and marked SUCCESS
    pub succeeded: usize,
    /// Jobs that failed and will be retried
    pub retrying: usize,
    /// Jobs that reached FAILED_TERMINAL
    pub terminal: usize,
    /// Jobs returned to PENDING without an attempt being counted
    pub released: usize,
    /// The run-level error that halted the run, if any
    pub halted: Option<String>,
}

impl CycleReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Retrying => self.retrying += 1,
            JobOutcome::Terminal => self.terminal += 1,
            JobOutcome::Released | JobOutcome::Halted(_) => self.released += 1,
        }
    }
}

impl Ingestor {
    /// Run one cycle
    ///
    /// 1. Reclaim expired leases.
    /// 2. Connect (retrying with backoff) and list the remote directory,
    ///    recording new files. If the endpoint stays unreachable the cycle
    ///    ends here.
    /// 3. Claim up to `workers.claim_batch` due jobs and process them on the
    ///    worker pool.
    ///
    /// An authentication failure, a missing remote directory or a
    /// configuration error halts the run: nothing more is claimed, jobs not
    /// yet started are released, and [`Event::RunHalted`] is published. Once
    /// halted or shut down, this returns [`Error::ShuttingDown`].
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        if !self.workers.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let mut report = CycleReport::default();

        report.reclaimed = self
            .db
            .reclaim_stale(self.config.ledger.lease_timeout, Utc::now())
            .await?;
        if report.reclaimed > 0 {
            tracing::warn!(count = report.reclaimed, "reclaimed jobs with expired leases");
            self.notifier.publish(Event::StaleJobsReclaimed {
                count: report.reclaimed,
            });
        }

        match self.discover().await {
            Ok(discovered) => report.discovered = discovered,
            Err(e) if e.is_run_fatal() => {
                self.halt(e, &mut report);
                return Ok(report);
            }
            Err(e @ (Error::Database(_) | Error::Sqlx(_))) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "remote endpoint unavailable, skipping this cycle");
                return Ok(report);
            }
        }

        let jobs = self
            .db
            .claim_due(self.config.workers.claim_batch, Utc::now())
            .await?;
        report.claimed = jobs.len();
        if !jobs.is_empty() {
            tracing::info!(count = jobs.len(), "claimed due jobs");
        }

        let mut halt = None;
        for outcome in self.process_batch(jobs).await {
            report.record(&outcome);
            if let JobOutcome::Halted(e) = outcome
                && halt.is_none()
            {
                halt = Some(e);
            }
        }
        if let Some(e) = halt {
            self.halt(e, &mut report);
        }

        if let Err(e) = self.db.record_cycle_completed(Utc::now()).await {
            tracing::warn!(error = %e, "failed to record cycle completion");
        }
        tracing::info!(
            discovered = report.discovered,
            claimed = report.claimed,
            succeeded = report.succeeded,
            retrying = report.retrying,
            terminal = report.terminal,
            released = report.released,
            "cycle complete"
        );
        Ok(report)
    }

    /// List the remote directory and record unseen files
    async fn discover(&self) -> Result<usize> {
        let remote = &self.config.remote;
        let mut pooled = self
            .sessions
            .get_with_retry(&self.config.workers.connect_retry)
            .await?;
        let listing = pooled.session().list(&remote.remote_dir).await?;
        pooled.release();

        let mut discovered = 0;
        for entry in filter_listing(listing, remote.file_suffix.as_deref()) {
            let recorded = self
                .db
                .record_discovered(
                    &entry.path,
                    entry.modification_token.as_deref(),
                    Some(entry.size),
                    Utc::now(),
                )
                .await?;
            if let Some(id) = recorded {
                discovered += 1;
                tracing::info!(job_id = %id, remote_path = %entry.path, size = entry.size, "discovered file");
                self.notifier.publish(Event::JobDiscovered {
                    id,
                    remote_path: entry.path,
                });
            }
        }
        Ok(discovered)
    }

    /// Process claimed jobs, at most `workers.max_concurrent_jobs` at a time
    ///
    /// Jobs still waiting for a worker when the run halts or shuts down are
    /// released without an attempt.
    async fn process_batch(&self, jobs: Vec<crate::types::FetchJob>) -> Vec<JobOutcome> {
        let halted = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for job in jobs {
            let ingestor = self.clone();
            let halted = halted.clone();
            let limit = Arc::clone(&self.workers.concurrent_limit);

            tasks.spawn(async move {
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return ingestor.release(&job, "worker pool closed").await,
                };
                let shutdown = ingestor.workers.cancel_token.clone();
                if shutdown.is_cancelled() {
                    return ingestor.release(&job, "shutdown before the job started").await;
                }
                if halted.is_cancelled() {
                    return ingestor.release(&job, "run halted before the job started").await;
                }

                let outcome = ingestor.process_job(job, shutdown.child_token()).await;
                if matches!(outcome, JobOutcome::Halted(_)) {
                    // Jobs still waiting are released; running ones finish
                    halted.cancel();
                }
                outcome
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "job task panicked"),
            }
        }
        outcomes
    }

    /// Stop claiming, publish the halt and remember its cause for [`run`](Self::run)
    fn halt(&self, error: Error, report: &mut CycleReport) {
        self.workers.accepting_new.store(false, Ordering::SeqCst);
        tracing::error!(error_code = error.error_code(), error = %error, "run halted");
        self.notifier.publish(Event::RunHalted {
            error_code: error.error_code().to_string(),
            error: error.to_string(),
        });
        report.halted = Some(error.to_string());
        *self
            .workers
            .halt_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Run cycles every `workers.poll_interval` until shutdown or a halt
    ///
    /// Returns `Ok(())` after [`shutdown`](Self::shutdown) and the halting
    /// error after a run-level failure. Errors of an individual cycle (for
    /// example a ledger hiccup) are logged and the loop carries on.
    pub async fn run(&self) -> Result<()> {
        let cancel = self.workers.cancel_token.clone();
        let poll_interval = self.config.workers.poll_interval;
        tracing::info!(
            endpoint = %self.sessions.endpoint().describe(),
            remote_dir = %self.config.remote.remote_dir,
            poll_interval_secs = poll_interval.as_secs(),
            "ingestion loop started"
        );

        loop {
            match self.run_cycle().await {
                Ok(report) if report.halted.is_some() => break,
                Ok(_) => {}
                Err(Error::ShuttingDown) => break,
                Err(e) => tracing::error!(error = %e, "cycle failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        let halt = self
            .workers
            .halt_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match halt {
            Some(e) => Err(e),
            None => {
                tracing::info!("ingestion loop stopped");
                Ok(())
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime
    pub fn start(&self) -> tokio::task::JoinHandle<Result<()>> {
        let ingestor = self.clone();
        tokio::spawn(async move { ingestor.run().await })
    }
}
