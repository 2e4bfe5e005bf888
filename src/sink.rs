//! Downstream delivery of decrypted plaintext
//!
//! The orchestrator hands every verified plaintext to a [`Sink`]. Any sink
//! error makes the job retryable: the file is fetched and decrypted again on
//! the next attempt, so a sink never has to buffer anything itself.

use crate::error::SinkError;
use crate::types::{JobId, Verification};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the sink learns about each delivery
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Plaintext file name (the remote name minus `.pgp`/`.gpg`/`.asc`)
    pub file_name: String,
    /// Path of the ciphertext on the remote endpoint
    pub remote_path: String,
    /// Ledger job
    pub job_id: JobId,
    /// Signature outcome
    pub verification: Verification,
    /// Hex key ID of the signer, when the message was signed
    pub signer: Option<String>,
}

/// Destination for decrypted files
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one plaintext
    async fn forward(&self, plaintext: &[u8], metadata: &DeliveryMetadata)
    -> Result<(), SinkError>;
}

/// Writes each plaintext into a delivery directory
///
/// Files appear atomically: they are written under a hidden temporary name,
/// synced and renamed. A redelivery overwrites the earlier file.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Deliver into `dir`, created on first use
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The delivery directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Sink for DirectorySink {
    async fn forward(
        &self,
        plaintext: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<(), SinkError> {
        let unavailable = |e: std::io::Error| {
            SinkError::Unavailable(format!("{}: {e}", self.dir.display()))
        };
        if metadata.file_name.is_empty() || metadata.file_name.contains(['/', '\\']) {
            return Err(SinkError::Rejected(format!(
                "unusable file name {:?}",
                metadata.file_name
            )));
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(unavailable)?;
        let target = self.dir.join(&metadata.file_name);
        write_atomic(&target, plaintext, metadata.job_id)
            .await
            .map_err(unavailable)?;

        tracing::debug!(
            job_id = %metadata.job_id,
            path = %target.display(),
            bytes = plaintext.len(),
            "delivered plaintext to directory"
        );
        Ok(())
    }
}

/// POSTs each plaintext to an HTTP endpoint
///
/// The body is the raw plaintext; metadata travels in `X-Ingest-*` headers.
/// 4xx responses are rejections, everything else that is not 2xx means the
/// sink is unavailable.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    timeout: Duration,
}

impl HttpSink {
    /// Header carrying the plaintext file name
    pub const FILE_NAME_HEADER: &'static str = "X-Ingest-File-Name";
    /// Header carrying the remote path
    pub const REMOTE_PATH_HEADER: &'static str = "X-Ingest-Remote-Path";
    /// Header carrying the ledger job ID
    pub const JOB_ID_HEADER: &'static str = "X-Ingest-Job-Id";
    /// Header carrying the verification outcome (`verified`, `unsigned`, ...)
    pub const VERIFICATION_HEADER: &'static str = "X-Ingest-Verification";
    /// Header carrying the signer key ID, when present
    pub const SIGNER_HEADER: &'static str = "X-Ingest-Signer";

    /// Sink posting to `url` with a 30 second timeout
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            auth_header: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Send this value as the `Authorization` header
    pub fn with_auth_header(mut self, value: impl Into<String>) -> Self {
        self.auth_header = Some(value.into());
        self
    }

    /// Per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn forward(
        &self,
        plaintext: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<(), SinkError> {
        let verification = serde_json::to_value(metadata.verification)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(Self::FILE_NAME_HEADER, &metadata.file_name)
            .header(Self::REMOTE_PATH_HEADER, &metadata.remote_path)
            .header(Self::JOB_ID_HEADER, metadata.job_id.to_string())
            .header(Self::VERIFICATION_HEADER, verification)
            .body(plaintext.to_vec());
        if let Some(signer) = &metadata.signer {
            request = request.header(Self::SIGNER_HEADER, signer);
        }
        if let Some(auth) = &self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                SinkError::Rejected(format!("invalid request: {e}"))
            } else {
                SinkError::Unavailable(format!("{}: {e}", self.url))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(job_id = %metadata.job_id, url = %self.url, "delivered plaintext over HTTP");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{} returned {status}: {body}", self.url);
        if status.is_client_error() {
            Err(SinkError::Rejected(message))
        } else {
            Err(SinkError::Unavailable(message))
        }
    }
}

/// Write `data` to `target` through a synced temporary file in the same directory
pub(crate) async fn write_atomic(target: &Path, data: &[u8], job_id: JobId) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = target.with_file_name(format!(".{name}.{job_id}.tmp"));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, target).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metadata() -> DeliveryMetadata {
        DeliveryMetadata {
            file_name: "report.csv".into(),
            remote_path: "inbox/report.csv.pgp".into(),
            job_id: JobId(12),
            verification: Verification::Verified,
            signer: Some("0123456789ABCDEF".into()),
        }
    }

    #[tokio::test]
    async fn test_directory_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("delivered"));

        sink.forward(b"col1,col2\n1,2\n", &metadata()).await.unwrap();
        let written = tokio::fs::read(dir.path().join("delivered/report.csv"))
            .await
            .unwrap();
        assert_eq!(written, b"col1,col2\n1,2\n");

        // Redelivery replaces the file, no temporaries are left behind
        sink.forward(b"v2", &metadata()).await.unwrap();
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(sink.dir()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["report.csv"]);
    }

    #[tokio::test]
    async fn test_directory_sink_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let mut meta = metadata();
        meta.file_name = "../escape.csv".into();

        let err = sink.forward(b"x", &meta).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_http_sink_posts_body_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("X-Ingest-File-Name", "report.csv"))
            .and(header("X-Ingest-Remote-Path", "inbox/report.csv.pgp"))
            .and(header("X-Ingest-Job-Id", "12"))
            .and(header("X-Ingest-Verification", "verified"))
            .and(header("X-Ingest-Signer", "0123456789ABCDEF"))
            .and(header("Authorization", "Bearer token"))
            .and(body_bytes(b"col1,col2\n1,2\n".to_vec()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(format!("{}/ingest", server.uri())).with_auth_header("Bearer token");
        sink.forward(b"col1,col2\n1,2\n", &metadata()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_sink_classifies_status_codes() {
        let server = MockServer::start().await;
        Mock::given(path("/reject"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad csv"))
            .mount(&server)
            .await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let reject = HttpSink::new(format!("{}/reject", server.uri()));
        match reject.forward(b"x", &metadata()).await {
            Err(SinkError::Rejected(message)) => assert!(message.contains("bad csv")),
            other => panic!("expected Rejected, got {other:?}"),
        }

        let down = HttpSink::new(format!("{}/down", server.uri()));
        assert!(matches!(
            down.forward(b"x", &metadata()).await,
            Err(SinkError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_http_sink_unreachable() {
        let sink = HttpSink::new("http://127.0.0.1:1/ingest").with_timeout(Duration::from_secs(2));
        assert!(matches!(
            sink.forward(b"x", &metadata()).await,
            Err(SinkError::Unavailable(_))
        ));
    }
}
