//! Atomic staging of downloads
//!
//! A transfer is written to a hidden `.part` file beside its final location,
//! synced, checked against the listed size and only then renamed into place.
//! Readers of the staging directory therefore never see a half-written file
//! under a real name.

use super::RemoteSession;
use crate::config::{RemoteConfig, StagingConfig};
use crate::error::FetchError;
use crate::types::JobId;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A completed, length-verified download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Final local path
    pub path: PathBuf,
    /// Size on disk
    pub bytes: u64,
}

impl StagedFile {
    /// Read the staged ciphertext
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Delete the staged file; a file that is already gone is not an error
    pub async fn remove(&self) {
        discard(&self.path).await;
    }
}

/// Downloads remote files into the staging directory
#[derive(Debug, Clone)]
pub struct Stager {
    staging_dir: PathBuf,
    io_timeout: Duration,
}

impl Stager {
    /// Stage into `staging_dir`, giving each transfer `io_timeout` to finish
    pub fn new(staging_dir: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            io_timeout,
        }
    }

    /// Stager for the configured staging directory and transfer timeout
    pub fn from_config(staging: &StagingConfig, remote: &RemoteConfig) -> Self {
        Self::new(staging.staging_dir.clone(), remote.io_timeout)
    }

    /// Directory downloads land in
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Create the staging directory and delete partial files left by an earlier run
    ///
    /// A transfer cancelled mid-flight (shutdown, crash) leaves its `.part`
    /// file behind.
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut entries = tokio::fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(".part") {
                tracing::info!(path = %entry.path().display(), "removing leftover partial download");
                discard(&entry.path()).await;
            }
        }
        Ok(())
    }

    /// Where a transfer for `job_id` is written while in flight
    pub fn part_path(&self, name: &str, job_id: JobId) -> PathBuf {
        self.staging_dir.join(format!(".{name}.{job_id}.part"))
    }

    /// Where a completed transfer for `job_id` ends up
    ///
    /// Prefixed with the job id: two jobs for files of the same name, such as
    /// a re-upload, can be in flight at once.
    pub fn final_path(&self, name: &str, job_id: JobId) -> PathBuf {
        self.staging_dir.join(format!("{job_id}-{name}"))
    }

    /// Download `remote_path` through `session` and promote it to `final_path(name, job_id)`
    ///
    /// When `expected_size` is known the received length must match it
    /// exactly. On any error, including the transfer exceeding the I/O
    /// timeout, the partial file is removed and nothing appears under the
    /// final name.
    pub async fn fetch(
        &self,
        session: &mut dyn RemoteSession,
        remote_path: &str,
        name: &str,
        job_id: JobId,
        expected_size: Option<u64>,
    ) -> Result<StagedFile, FetchError> {
        let part = self.part_path(name, job_id);
        let final_path = self.final_path(name, job_id);

        let transfer = async {
            session.fetch(remote_path, &part).await?;

            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&part)
                .await
                .map_err(local_io)?;
            file.sync_all().await.map_err(local_io)?;
            let actual = file.metadata().await.map_err(local_io)?.len();
            drop(file);

            if let Some(expected) = expected_size
                && actual != expected
            {
                return Err(FetchError::LengthMismatch { expected, actual });
            }

            tokio::fs::rename(&part, &final_path)
                .await
                .map_err(local_io)?;
            Ok(StagedFile {
                path: final_path.clone(),
                bytes: actual,
            })
        };

        match tokio::time::timeout(self.io_timeout, transfer).await {
            Ok(Ok(staged)) => {
                tracing::debug!(
                    remote_path,
                    path = %staged.path.display(),
                    bytes = staged.bytes,
                    "staged download"
                );
                Ok(staged)
            }
            Ok(Err(e)) => {
                discard(&part).await;
                Err(e)
            }
            Err(_) => {
                discard(&part).await;
                Err(FetchError::Timeout {
                    operation: format!("fetch of {remote_path}"),
                    seconds: self.io_timeout.as_secs(),
                })
            }
        }
    }
}

/// Local file name for a remote path: its last segment, if that is a plain name
pub fn local_name(remote_path: &str) -> Option<&str> {
    let name = remote_path.rsplit('/').next()?;
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('\\')
        && !name.starts_with('.');
    plain.then_some(name)
}

fn local_io(e: std::io::Error) -> FetchError {
    FetchError::TransientIo(format!("staging: {e}"))
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staged file");
        }
    }
}
