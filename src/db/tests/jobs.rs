use crate::db::*;
use crate::retry::{FixedBackoff, RetryPolicy};
use crate::error::DatabaseError;
use crate::types::{Claim, JobId, JobStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn ledger(temp_file: &NamedTempFile, max_retries: u32) -> Database {
    Database::new(temp_file.path())
        .await
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_retries,
            backoff: Arc::new(FixedBackoff {
                delay: Duration::from_secs(300),
            }),
        })
}

#[tokio::test]
async fn test_record_discovered_is_unique_per_path_and_token() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    let first = db
        .record_discovered("in/a.pgp", Some("1700000000"), Some(10), t0())
        .await
        .unwrap();
    assert!(first.is_some());

    let again = db
        .record_discovered("in/a.pgp", Some("1700000000"), Some(10), t0())
        .await
        .unwrap();
    assert_eq!(again, None, "same identity must not create a second row");

    let reupload = db
        .record_discovered("in/a.pgp", Some("1700000999"), Some(12), t0())
        .await
        .unwrap();
    assert!(reupload.is_some(), "new modification token is a new file");

    // Missing tokens collide with each other too
    assert!(
        db.record_discovered("in/b.pgp", None, None, t0())
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        db.record_discovered("in/b.pgp", None, None, t0())
            .await
            .unwrap()
            .is_none()
    );

    let job = db.get_job(first.unwrap()).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.size_bytes, Some(10));
    assert_eq!(job.created_at, t0());
    assert_eq!(db.list_jobs().await.unwrap().len(), 3);

    db.close().await;
}

#[tokio::test]
async fn test_claim_due_moves_pending_to_in_progress() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    for name in ["a", "b", "c"] {
        db.record_discovered(&format!("in/{name}.pgp"), None, None, t0())
            .await
            .unwrap();
    }

    let claimed = db.claim_due(2, t0()).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(claimed.iter().all(|j| j.status == JobStatus::InProgress));
    assert!(claimed.iter().all(|j| j.last_attempt_at == Some(t0())));
    assert_eq!(claimed[0].remote_path, "in/a.pgp");
    assert_eq!(claimed[1].remote_path, "in/b.pgp");

    let rest = db.claim_due(10, t0()).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].remote_path, "in/c.pgp");

    assert!(db.claim_due(10, t0()).await.unwrap().is_empty());
    assert!(db.claim_due(0, t0()).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_mark_success_clears_next_attempt_and_is_final() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    let id = db
        .record_discovered("in/a.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();
    let first = db.claim_due(1, t0()).await.unwrap().remove(0);
    let failed = db
        .mark_failed(first.claim(), "connection_error: reset", t0())
        .await
        .unwrap();
    assert!(failed.next_attempt_at.is_some());

    let later = t0() + ChronoDuration::seconds(300);
    let second = db.claim_due(1, later).await.unwrap().remove(0);
    db.mark_success(second.claim(), later).await.unwrap();

    let job = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.next_attempt_at, None);
    assert_eq!(job.error_message, None);
    assert_eq!(job.completed_at, Some(later));

    // A second completion is refused and changes nothing
    let err = db.mark_success(second.claim(), later).await.unwrap_err();
    assert!(matches!(
        err,
        crate::Error::Database(DatabaseError::InvalidTransition {
            actual: JobStatus::Success,
            ..
        })
    ));
    assert!(db.claim_due(10, later).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_mark_failed_schedules_retry_after_backoff() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    let id = db
        .record_discovered("in/a.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();
    let claimed = db.claim_due(1, t0()).await.unwrap().remove(0);

    let job = db
        .mark_failed(claimed.claim(), "transient_io_error: eof", t0())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::FailedRetryable);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.next_attempt_at, Some(t0() + ChronoDuration::seconds(300)));
    assert_eq!(job.error_message.as_deref(), Some("transient_io_error: eof"));

    // Not due before the backoff has elapsed
    let early = t0() + ChronoDuration::seconds(299);
    assert!(db.claim_due(10, early).await.unwrap().is_empty());

    let due = t0() + ChronoDuration::seconds(300);
    let claimed = db.claim_due(10, due).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].retry_count, 1);

    db.close().await;
}

#[tokio::test]
async fn test_retry_exhaustion_is_terminal_and_never_claimed_again() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    let id = db
        .record_discovered("in/a.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();

    let mut now = t0();
    for expected in 1..=2 {
        let claimed = db.claim_due(1, now).await.unwrap().remove(0);
        assert_eq!(claimed.id, id);
        let job = db
            .mark_failed(claimed.claim(), "connection_error", now)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::FailedRetryable);
        assert_eq!(job.retry_count, expected);
        now += ChronoDuration::seconds(300);
    }

    // retry_count == MAX_RETRIES - 1: one more failure ends it
    let claimed = db.claim_due(1, now).await.unwrap().remove(0);
    let job = db
        .mark_failed(claimed.claim(), "connection_error", now)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::FailedTerminal);
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.next_attempt_at, None);
    assert_eq!(job.completed_at, Some(now));

    let far_future = now + ChronoDuration::days(365);
    assert!(db.claim_due(10, far_future).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_mark_terminal_skips_retry_budget() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    db.record_discovered("in/tampered.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();
    let claimed = db.claim_due(1, t0()).await.unwrap().remove(0);

    let job = db
        .mark_terminal(claimed.claim(), "integrity_check_failed: tampered", t0())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::FailedTerminal);
    assert_eq!(job.retry_count, 1);
    assert!(db.claim_due(10, t0() + ChronoDuration::days(1)).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_release_returns_job_without_counting_attempt() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    let id = db
        .record_discovered("in/a.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();
    let claimed = db.claim_due(1, t0()).await.unwrap().remove(0);
    db.release(claimed.claim()).await.unwrap();

    let job = db.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);

    // Releasing a job that is not in progress is refused
    assert!(db.release(claimed.claim()).await.is_err());

    db.close().await;
}

#[tokio::test]
async fn test_transitions_require_in_progress() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    let id = db
        .record_discovered("in/a.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();

    let unclaimed = Claim { id, claim_count: 0 };
    assert!(db.mark_success(unclaimed, t0()).await.is_err());
    assert!(db.mark_failed(unclaimed, "x", t0()).await.is_err());
    assert!(db.mark_terminal(unclaimed, "x", t0()).await.is_err());
    assert_eq!(
        db.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    let missing = db
        .mark_success(
            Claim {
                id: JobId(9999),
                claim_count: 1,
            },
            t0(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        missing,
        crate::Error::Database(DatabaseError::NotFound(_))
    ));

    db.close().await;
}

#[tokio::test]
async fn test_reclaim_stale_only_touches_expired_leases() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    let old = db
        .record_discovered("in/old.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();
    db.claim_due(1, t0()).await.unwrap();

    let later = t0() + ChronoDuration::seconds(600);
    let fresh = db
        .record_discovered("in/fresh.pgp", None, None, later)
        .await
        .unwrap()
        .unwrap();
    db.claim_due(1, later).await.unwrap();

    let now = t0() + ChronoDuration::seconds(900);
    let reclaimed = db
        .reclaim_stale(Duration::from_secs(900), now)
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    assert_eq!(
        db.get_job(old).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
    assert_eq!(
        db.get_job(fresh).await.unwrap().unwrap().status,
        JobStatus::InProgress
    );

    // The reclaimed job is claimable again and keeps its retry count
    let claimed = db.claim_due(10, now).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, old);
    assert_eq!(claimed[0].retry_count, 0);

    db.close().await;
}

#[tokio::test]
async fn test_stale_claim_cannot_settle_reclaimed_job() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    db.record_discovered("in/slow.pgp", None, None, t0())
        .await
        .unwrap()
        .unwrap();
    let stale = db.claim_due(1, t0()).await.unwrap().remove(0);
    assert_eq!(stale.claim_count, 1);

    let expired = t0() + ChronoDuration::seconds(1000);
    assert_eq!(
        db.reclaim_stale(Duration::from_secs(900), expired)
            .await
            .unwrap(),
        1
    );

    // Reclaimed but not yet re-claimed: the old worker sees a plain transition error
    let err = db.mark_success(stale.claim(), expired).await.unwrap_err();
    assert!(matches!(
        err,
        crate::Error::Database(DatabaseError::InvalidTransition {
            actual: JobStatus::Pending,
            ..
        })
    ));

    let current = db.claim_due(1, expired).await.unwrap().remove(0);
    assert_eq!(current.id, stale.id);
    assert_eq!(current.claim_count, 2);

    for err in [
        db.mark_success(stale.claim(), expired).await.unwrap_err(),
        db.mark_failed(stale.claim(), "timeout", expired)
            .await
            .unwrap_err(),
        db.mark_terminal(stale.claim(), "timeout", expired)
            .await
            .unwrap_err(),
        db.release(stale.claim()).await.unwrap_err(),
    ] {
        assert!(
            matches!(
                err,
                crate::Error::Database(DatabaseError::LeaseLost {
                    held: 1,
                    current: 2,
                    ..
                })
            ),
            "unexpected error: {err}"
        );
    }

    let job = db.get_job(stale.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::InProgress);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.error_message, None);

    db.mark_success(current.claim(), expired).await.unwrap();
    assert_eq!(
        db.get_job(stale.id).await.unwrap().unwrap().status,
        JobStatus::Success
    );

    db.close().await;
}

#[tokio::test]
async fn test_count_and_list_by_status() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = ledger(&temp_file, 3).await;

    for name in ["a", "b", "c"] {
        db.record_discovered(&format!("in/{name}.pgp"), None, None, t0())
            .await
            .unwrap();
    }
    let claimed = db.claim_due(1, t0()).await.unwrap();
    db.mark_success(claimed[0].claim(), t0()).await.unwrap();

    assert_eq!(db.count_by_status(JobStatus::Pending).await.unwrap(), 2);
    assert_eq!(db.count_by_status(JobStatus::Success).await.unwrap(), 1);
    assert_eq!(db.count_by_status(JobStatus::InProgress).await.unwrap(), 0);

    let pending = db.list_jobs_by_status(JobStatus::Pending).await.unwrap();
    let paths: Vec<_> = pending.iter().map(|j| j.remote_path.as_str()).collect();
    assert_eq!(paths, vec!["in/b.pgp", "in/c.pgp"]);

    db.close().await;
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Arc::new(ledger(&temp_file, 3).await);

    for i in 0..40 {
        db.record_discovered(&format!("in/file-{i:02}.pgp"), None, None, t0())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = db.claim_due(3, t0()).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|j| j.id));
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(total, 40);
    assert_eq!(seen.len(), 40);
}
