//! Retry ledger behaviour across process boundaries
//!
//! Two `Database` handles on one file stand in for two ingest processes
//! sharing a ledger.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{INBOX, REPORT_CSV, create_ingest, job_for, partner_envelope};
use secure_ingest::config::{BackoffConfig, LedgerConfig};
use secure_ingest::remote::Fault;
use secure_ingest::retry::RetryPolicy;
use secure_ingest::{Database, Event, JobId, JobStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn policy(max_retries: u32, delay: Duration) -> RetryPolicy {
    RetryPolicy::from_config(&LedgerConfig {
        max_retries,
        backoff: BackoffConfig::Fixed { delay },
        ..Default::default()
    })
}

#[tokio::test]
async fn test_concurrent_claimers_never_share_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let first = Arc::new(Database::new(&path).await.unwrap());
    let second = Arc::new(Database::new(&path).await.unwrap());

    let now = Utc::now();
    for i in 0..40 {
        first
            .record_discovered(&format!("{INBOX}/file{i}.pgp"), Some("t1"), Some(10), now)
            .await
            .unwrap()
            .unwrap();
    }

    let mut tasks = Vec::new();
    for i in 0..8 {
        let db = if i % 2 == 0 {
            Arc::clone(&first)
        } else {
            Arc::clone(&second)
        };
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = db.claim_due(3, Utc::now()).await.unwrap();
                if batch.is_empty() {
                    return claimed;
                }
                claimed.extend(batch.into_iter().map(|job| job.id));
            }
        }));
    }

    let mut seen: HashSet<JobId> = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for id in task.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(total, 40);
    assert_eq!(first.count_by_status(JobStatus::InProgress).await.unwrap(), 40);
}

#[tokio::test]
async fn test_discovery_is_idempotent_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let first = Database::new(&path).await.unwrap();
    let second = Database::new(&path).await.unwrap();
    let now = Utc::now();

    let id = first
        .record_discovered("outbound/a.pgp", Some("v1"), Some(1), now)
        .await
        .unwrap();
    assert!(id.is_some());
    let again = second
        .record_discovered("outbound/a.pgp", Some("v1"), Some(1), now)
        .await
        .unwrap();
    assert_eq!(again, None);
    let reupload = second
        .record_discovered("outbound/a.pgp", Some("v2"), Some(1), now)
        .await
        .unwrap();
    assert!(reupload.is_some());
    assert_ne!(reupload, id);
}

#[tokio::test]
async fn test_backoff_delays_the_next_claim() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(&dir.path().join("ledger.db"))
        .await
        .unwrap()
        .with_retry_policy(policy(3, Duration::from_secs(60)));
    let now = Utc::now();
    db.record_discovered("outbound/a.pgp", None, None, now)
        .await
        .unwrap()
        .unwrap();

    let job = db.claim_due(1, now).await.unwrap().remove(0);
    let failed = db
        .mark_failed(job.claim(), "timeout: stalled", now)
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::FailedRetryable);
    assert_eq!(
        failed.next_attempt_at.map(|t| t.timestamp()),
        Some((now + ChronoDuration::seconds(60)).timestamp())
    );

    assert!(db.claim_due(1, now + ChronoDuration::seconds(59)).await.unwrap().is_empty());
    let due = db.claim_due(1, now + ChronoDuration::seconds(60)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].retry_count, 1);
}

#[tokio::test]
async fn test_persistent_transfer_failure_exhausts_retries() {
    let t = create_ingest(|c| c.ledger.max_retries = 3).await;
    let remote_path = format!("{INBOX}/report.csv.pgp");
    t.endpoint
        .put(&remote_path, partner_envelope(REPORT_CSV, "report.csv"));
    t.endpoint.inject(Fault::DropTransfer {
        path: remote_path.clone(),
    });
    let mut events = t.ingestor.subscribe();

    for _ in 0..5 {
        t.ingestor.run_cycle().await.unwrap();
    }

    let job = job_for(&t.ingestor, &remote_path).await;
    assert_eq!(job.status, JobStatus::FailedTerminal);
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.next_attempt_at, None);
    assert!(
        job.error_message
            .as_deref()
            .unwrap()
            .starts_with("transient_io_error")
    );
    assert_eq!(t.endpoint.fetch_count(&remote_path), 3);
    assert!(t.sink.deliveries().is_empty());

    let mut retrying = 0;
    let mut failed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::JobRetrying { .. } => retrying += 1,
            Event::JobFailed { .. } => failed += 1,
            _ => {}
        }
    }
    assert_eq!((retrying, failed), (2, 1));
}
