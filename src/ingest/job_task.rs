//! Processing of one claimed job
//!
//! A worker takes a claimed job through fetch, decrypt/verify and delivery
//! sequentially, then settles the ledger row exactly once: SUCCESS, a counted
//! failure, or (when interrupted before its outcome is known) released back
//! to PENDING.

use super::Ingestor;
use super::outcome::{Disposition, classify};
use crate::config::SignatureAction;
use crate::error::{Error, PgpError, Result};
use crate::pgp::DecryptResult;
use crate::remote::{StagedFile, local_name};
use crate::sink::{DeliveryMetadata, write_atomic};
use crate::types::{Event, FetchJob, JobStatus, Verification};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

/// Suffixes removed from the remote name to name the plaintext
const CIPHERTEXT_SUFFIXES: [&str; 3] = [".pgp", ".gpg", ".asc"];

/// How a claimed job ended, as counted in the cycle report
#[derive(Debug)]
pub(crate) enum JobOutcome {
    Succeeded,
    Retrying,
    Terminal,
    /// Returned to PENDING without counting an attempt
    Released,
    /// A run-level failure; the job was released
    Halted(Error),
}

/// What a successful attempt delivered
struct Delivered {
    verification: Verification,
    bytes: u64,
}

impl Ingestor {
    /// Process one claimed job end to end and settle its ledger row
    pub(crate) async fn process_job(&self, job: FetchJob, cancel: CancellationToken) -> JobOutcome {
        let attempt_no = job.retry_count + 1;
        tracing::info!(
            job_id = %job.id,
            remote_path = %job.remote_path,
            attempt = attempt_no,
            "processing job"
        );
        self.notifier.publish(Event::JobClaimed {
            id: job.id,
            remote_path: job.remote_path.clone(),
            attempt: attempt_no,
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::ShuttingDown),
            result = self.attempt(&job) => result,
        };

        match result {
            Ok(delivered) => self.settle_success(&job, delivered).await,
            Err(Error::ShuttingDown) => self.release(&job, "interrupted by shutdown").await,
            Err(e) => self.settle_failure(&job, e).await,
        }
    }

    /// Fetch, decrypt, apply the signature policy and deliver
    async fn attempt(&self, job: &FetchJob) -> Result<Delivered> {
        let name = local_name(&job.remote_path).ok_or_else(|| {
            Error::Other(format!(
                "remote path {} does not end in a usable file name",
                job.remote_path
            ))
        })?;

        let staged = self.fetch(job, name).await?;
        let result = self.decrypt_and_deliver(job, name, &staged).await;
        // The ciphertext is fetched again on retry
        staged.remove().await;
        result
    }

    async fn fetch(&self, job: &FetchJob, name: &str) -> Result<StagedFile> {
        let mut pooled = self.sessions.get().await?;
        match self
            .stager
            .fetch(
                pooled.session(),
                &job.remote_path,
                name,
                job.id,
                job.size_bytes,
            )
            .await
        {
            Ok(staged) => {
                pooled.release();
                tracing::debug!(job_id = %job.id, bytes = staged.bytes, "fetched ciphertext");
                Ok(staged)
            }
            // The session itself is suspect after a failed transfer
            Err(e) => Err(e.into()),
        }
    }

    async fn decrypt_and_deliver(
        &self,
        job: &FetchJob,
        name: &str,
        staged: &StagedFile,
    ) -> Result<Delivered> {
        let ciphertext = staged.read().await?;
        let decrypted = self.decrypt(ciphertext).await?;
        self.apply_signature_policy(job, &decrypted)?;

        let plaintext_name = plaintext_name(name);
        if let Some(dir) = &self.config.staging.plaintext_dir {
            write_atomic(&dir.join(&plaintext_name), &decrypted.plaintext, job.id).await?;
        }

        let metadata = DeliveryMetadata {
            file_name: plaintext_name,
            remote_path: job.remote_path.clone(),
            job_id: job.id,
            verification: decrypted.verification,
            signer: decrypted.signer.map(|k| k.to_string()),
        };
        self.sink.forward(&decrypted.plaintext, &metadata).await?;

        Ok(Delivered {
            verification: decrypted.verification,
            bytes: decrypted.plaintext.len() as u64,
        })
    }

    /// Decrypt on the blocking pool; RSA and inflate are CPU-bound
    async fn decrypt(&self, ciphertext: Vec<u8>) -> Result<DecryptResult> {
        let engine = std::sync::Arc::clone(&self.engine);
        let key_ring = std::sync::Arc::clone(&self.key_ring);
        let config = std::sync::Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || {
            engine.decrypt(&ciphertext, &key_ring, &config.keys.passphrase)
        })
        .await
        .map_err(|e| Error::Other(format!("decryption task failed: {e}")))??
        .into_result()
    }

    /// Block or pass the plaintext according to its signature outcome
    fn apply_signature_policy(&self, job: &FetchJob, decrypted: &DecryptResult) -> Result<()> {
        let policy = &self.config.keys.signature_policy;
        let outcome = decrypted.verification;
        let action = match outcome {
            Verification::Verified => return Ok(()),
            Verification::SignatureMismatch => policy.on_mismatch,
            Verification::NoMatchingKey => policy.on_unknown_signer,
            Verification::Unsigned => policy.on_unsigned,
        };
        let blocked = action == SignatureAction::Block;

        // A mismatch is always reported, other outcomes only when they block
        if blocked || outcome == Verification::SignatureMismatch {
            tracing::warn!(
                job_id = %job.id,
                remote_path = %job.remote_path,
                outcome = %outcome,
                signer = ?decrypted.signer.map(|k| k.to_string()),
                blocked,
                "signature check did not pass"
            );
            self.notifier.publish(Event::SignatureRejected {
                id: job.id,
                remote_path: job.remote_path.clone(),
                outcome,
                blocked,
            });
        }

        if blocked {
            return Err(Error::SignatureRejected { outcome });
        }
        Ok(())
    }

    async fn settle_success(&self, job: &FetchJob, delivered: Delivered) -> JobOutcome {
        if let Err(e) = self.db.mark_success(job.claim(), Utc::now()).await {
            // Delivered but unrecorded: the lease expires and the file is delivered again
            tracing::error!(job_id = %job.id, error = %e, "failed to record successful delivery");
            return JobOutcome::Retrying;
        }

        tracing::info!(
            job_id = %job.id,
            remote_path = %job.remote_path,
            verification = %delivered.verification,
            bytes = delivered.bytes,
            "job succeeded"
        );
        self.notifier.publish(Event::JobSucceeded {
            id: job.id,
            remote_path: job.remote_path.clone(),
            verification: delivered.verification,
            bytes: delivered.bytes,
        });
        JobOutcome::Succeeded
    }

    async fn settle_failure(&self, job: &FetchJob, error: Error) -> JobOutcome {
        let message = format!("{}: {}", error.error_code(), error);

        if matches!(error, Error::Pgp(PgpError::IntegrityCheckFailed)) {
            tracing::error!(
                job_id = %job.id,
                remote_path = %job.remote_path,
                "integrity check failed: ciphertext may have been tampered with"
            );
            self.notifier.publish(Event::IntegrityAlert {
                id: job.id,
                remote_path: job.remote_path.clone(),
            });
        }

        let recorded = match classify(&error) {
            Disposition::Retry => self.db.mark_failed(job.claim(), &message, Utc::now()).await,
            Disposition::Terminal => self.db.mark_terminal(job.claim(), &message, Utc::now()).await,
            Disposition::RunFatal => {
                tracing::error!(
                    job_id = %job.id,
                    error = %error,
                    "run-level failure while processing job"
                );
                self.release(job, "run halted").await;
                return JobOutcome::Halted(error);
            }
        };

        match recorded {
            Ok(updated) if updated.status == JobStatus::FailedTerminal => {
                tracing::error!(
                    job_id = %job.id,
                    remote_path = %job.remote_path,
                    retry_count = updated.retry_count,
                    error = %error,
                    "job failed permanently"
                );
                self.notifier.publish(Event::JobFailed {
                    id: job.id,
                    remote_path: job.remote_path.clone(),
                    error_code: error.error_code().to_string(),
                    error: error.to_string(),
                });
                JobOutcome::Terminal
            }
            Ok(updated) => {
                tracing::warn!(
                    job_id = %job.id,
                    remote_path = %job.remote_path,
                    retry_count = updated.retry_count,
                    next_attempt_at = ?updated.next_attempt_at,
                    error = %error,
                    "job failed, will retry"
                );
                self.notifier.publish(Event::JobRetrying {
                    id: job.id,
                    remote_path: job.remote_path.clone(),
                    retry_count: updated.retry_count,
                    next_attempt_at: updated.next_attempt_at,
                    error: error.to_string(),
                });
                JobOutcome::Retrying
            }
            Err(db_error) => {
                // Left IN_PROGRESS; reclaim_stale returns it once the lease expires
                tracing::error!(
                    job_id = %job.id,
                    error = %error,
                    ledger_error = %db_error,
                    "failed to record job failure"
                );
                JobOutcome::Retrying
            }
        }
    }

    pub(crate) async fn release(&self, job: &FetchJob, reason: &str) -> JobOutcome {
        match self.db.release(job.claim()).await {
            Ok(()) => tracing::info!(job_id = %job.id, reason, "job released to PENDING"),
            Err(e) => {
                tracing::warn!(job_id = %job.id, reason, error = %e, "failed to release job")
            }
        }
        JobOutcome::Released
    }
}

/// Plaintext file name: the ciphertext name without its OpenPGP suffix
///
/// Names without a known suffix get `.decrypted` appended.
pub(crate) fn plaintext_name(name: &str) -> String {
    CIPHERTEXT_SUFFIXES
        .iter()
        .find_map(|suffix| {
            let stem = name.strip_suffix(suffix)?;
            (!stem.is_empty()).then(|| stem.to_string())
        })
        .unwrap_or_else(|| format!("{name}.decrypted"))
}
