use crate::db::*;
use crate::types::Claim;
use tempfile::NamedTempFile;

/// Querying after the pool is closed returns an error rather than hanging.
#[tokio::test]
async fn test_get_job_after_pool_close_returns_error() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let id = db
        .record_discovered("in/report.csv.pgp", None, Some(64), chrono::Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert!(db.get_job(id).await.unwrap().is_some());

    db.pool.close().await;

    let result = db.get_job(id).await;
    assert!(result.is_err(), "query on closed pool must fail");
    let result = db.claim_due(1, chrono::Utc::now()).await;
    assert!(result.is_err());
    let result = db
        .mark_success(Claim { id, claim_count: 1 }, chrono::Utc::now())
        .await;
    assert!(result.is_err());
}
