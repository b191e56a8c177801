use std::path::Path;

use chrono::{Duration, Utc};
use log::{info, warn};

use crate::error::Result;
use crate::s3::S3Mirror;
use crate::spool::Spool;
use crate::store::backups::BackupStore;
use crate::store::connections::Connection;

#[derive(Debug, Default)]
pub struct RetentionOutcome {
    pub deleted_records: usize,
    pub s3_failures: usize,
}

/// Deletes completed backups older than the retention window: S3 object
/// first (when recorded, configured and allowed by the connection), then the
/// local file, then the record. Storage failures are warnings; the sweep
/// keeps going. In-progress records are never eligible.
pub async fn run_retention(
    backups: &BackupStore,
    spool: &Spool,
    s3: Option<&S3Mirror>,
    conn: &Connection,
    retention_days: i64,
) -> Result<RetentionOutcome> {
    let cutoff = Utc::now() - Duration::hours(retention_days * 24);
    let expired = backups.older_than(&conn.id, cutoff).await?;

    let mut outcome = RetentionOutcome::default();

    for backup in expired {
        if let Some(key) = backup.s3_object_key.as_deref() {
            match s3 {
                Some(mirror) if conn.s3_cleanup_on_retention => {
                    if let Err(e) = mirror.remove(key).await {
                        warn!("retention: could not delete s3 object {key}: {e}");
                        outcome.s3_failures += 1;
                    }
                }
                _ => {
                    // Either S3 is not configured or the connection opted
                    // out; the object stays behind on purpose.
                }
            }
        }

        let local = Path::new(&backup.local_path);
        if local.exists() {
            spool.remove(local);
        }

        backups.delete(&backup.id).await?;
        outcome.deleted_records += 1;
    }

    if outcome.deleted_records > 0 {
        info!(
            "retention: removed {} expired backups for connection {} ({} s3 failures)",
            outcome.deleted_records, conn.id, outcome.s3_failures
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backups::{Backup, BackupStatus};
    use crate::store::connections::{test_connection, ConnectionStore};
    use crate::store::test_pool;
    use std::fs;

    #[tokio::test]
    async fn sweep_deletes_expired_records_and_files() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = test_pool().await;
        let conn = test_connection("c1", "pg one", "u1");
        ConnectionStore::new(pool.clone())
            .save(&conn)
            .await
            .expect("seed connection");
        let backups = BackupStore::new(pool);

        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(tmp.path());
        let dir = spool.prepare_dir(&conn.name).expect("dir");

        let now = Utc::now();

        let old_path = dir.join("shop_20250101_000000.sql");
        fs::write(&old_path, b"old dump").expect("write");
        let mut old = Backup::begin("c1", old_path.display().to_string(), now);
        old.status = BackupStatus::Completed;
        old.created_at = now - Duration::days(31);
        backups.create(&old).await.expect("create");

        let fresh_path = dir.join("shop_20260301_000000.sql");
        fs::write(&fresh_path, b"fresh dump").expect("write");
        let mut fresh = Backup::begin("c1", fresh_path.display().to_string(), now);
        fresh.status = BackupStatus::Completed;
        backups.create(&fresh).await.expect("create");

        let mut orphaned = Backup::begin("c1", dir.join("gone.sql").display().to_string(), now);
        orphaned.status = BackupStatus::InProgress;
        orphaned.created_at = now - Duration::days(31);
        backups.create(&orphaned).await.expect("create");

        let outcome = run_retention(&backups, &spool, None, &conn, 30)
            .await
            .expect("sweep");

        assert_eq!(outcome.deleted_records, 1);
        assert!(!old_path.exists());
        assert!(fresh_path.exists());
        assert!(backups.get(&old.id).await.expect("get").is_none());
        // Crash leftovers stay visible and untouched.
        assert!(backups.get(&orphaned.id).await.expect("get").is_some());
        assert!(backups.get(&fresh.id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn records_with_s3_keys_still_age_out_locally() {
        let pool = test_pool().await;
        let conn = test_connection("c1", "pg one", "u1");
        ConnectionStore::new(pool.clone())
            .save(&conn)
            .await
            .expect("seed connection");
        let backups = BackupStore::new(pool);
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(tmp.path());

        let now = Utc::now();
        let mut old = Backup::begin("c1", "/nonexistent/x.sql".into(), now);
        old.status = BackupStatus::Completed;
        old.s3_object_key = Some("p/pg_one/x.sql".into());
        old.created_at = now - Duration::days(40);
        backups.create(&old).await.expect("create");

        // No mirror configured: the record is removed, the object is not
        // reachable and is simply left in place.
        let outcome = run_retention(&backups, &spool, None, &conn, 30)
            .await
            .expect("sweep");
        assert_eq!(outcome.deleted_records, 1);
        assert_eq!(outcome.s3_failures, 0);
        assert!(backups.get(&old.id).await.expect("get").is_none());
    }
}
