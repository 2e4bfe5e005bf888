//! Custom assertions for ledger state and events

use secure_ingest::{Event, FetchJob, Ingestor, JobStatus};
use std::time::Duration;
use tokio::sync::broadcast;

/// The ledger row for `remote_path`, panicking if there is not exactly one
pub async fn job_for(ingestor: &Ingestor, remote_path: &str) -> FetchJob {
    let jobs: Vec<_> = ingestor
        .db
        .list_jobs()
        .await
        .unwrap()
        .into_iter()
        .filter(|job| job.remote_path == remote_path)
        .collect();
    assert_eq!(jobs.len(), 1, "expected one job for {remote_path}: {jobs:?}");
    jobs.into_iter().next().unwrap()
}

/// Assert the ledger row for `remote_path` has `expected` status
pub async fn assert_job_status(ingestor: &Ingestor, remote_path: &str, expected: JobStatus) {
    let job = job_for(ingestor, remote_path).await;
    assert_eq!(
        job.status, expected,
        "job for {remote_path} has status {:?} (error: {:?})",
        job.status, job.error_message
    );
}

/// Wait until an event matching `predicate` arrives or `timeout` passes
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    predicate: impl Fn(&Event) -> bool,
) -> Option<Event> {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
