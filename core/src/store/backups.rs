use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{BackupError, Result};

use super::{fmt_ts, parse_ts, parse_ts_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::InProgress)
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(BackupStatus::InProgress),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(BackupError::Validation(format!(
                "unknown backup status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dump attempt. `local_path` is always set but may point at a file
/// that no longer exists; `s3_object_key` is set only after a successful
/// upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub connection_id: String,
    pub schedule_id: Option<String>,
    pub status: BackupStatus,
    pub local_path: String,
    pub s3_object_key: Option<String>,
    pub size_bytes: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Backup {
    pub fn begin(connection_id: &str, local_path: String, started_at: DateTime<Utc>) -> Self {
        Backup {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            schedule_id: None,
            status: BackupStatus::InProgress,
            local_path,
            s3_object_key: None,
            size_bytes: 0,
            started_at,
            completed_at: None,
            created_at: started_at,
            updated_at: started_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStats {
    pub total: i64,
    pub failed: i64,
    pub total_size: i64,
    pub avg_duration_minutes: f64,
    pub success_rate_percent: f64,
}

#[derive(Clone)]
pub struct BackupStore {
    pool: SqlitePool,
}

impl BackupStore {
    pub fn new(pool: SqlitePool) -> Self {
        BackupStore { pool }
    }

    pub async fn create(&self, backup: &Backup) -> Result<()> {
        sqlx::query(
            "INSERT INTO backups (
                id, connection_id, schedule_id, status, local_path,
                s3_object_key, size_bytes, started_at, completed_at,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&backup.id)
        .bind(&backup.connection_id)
        .bind(&backup.schedule_id)
        .bind(backup.status.as_str())
        .bind(&backup.local_path)
        .bind(&backup.s3_object_key)
        .bind(backup.size_bytes)
        .bind(fmt_ts(backup.started_at))
        .bind(backup.completed_at.map(fmt_ts))
        .bind(fmt_ts(backup.created_at))
        .bind(fmt_ts(backup.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transitions a record; terminal statuses stamp `completed_at`.
    pub async fn update_status(&self, id: &str, status: BackupStatus) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let completed_at = status.is_terminal().then(|| now.clone());
        let result = sqlx::query(
            "UPDATE backups SET status = ?,
                    completed_at = COALESCE(?, completed_at),
                    updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("backup"));
        }
        Ok(())
    }

    /// Same transition, additionally stamping the originating schedule.
    pub async fn update_status_and_schedule(
        &self,
        id: &str,
        status: BackupStatus,
        schedule_id: &str,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let completed_at = status.is_terminal().then(|| now.clone());
        let result = sqlx::query(
            "UPDATE backups SET status = ?, schedule_id = ?,
                    completed_at = COALESCE(?, completed_at),
                    updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(schedule_id)
        .bind(completed_at)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("backup"));
        }
        Ok(())
    }

    pub async fn update_s3_object_key(&self, id: &str, key: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE backups SET s3_object_key = ?, updated_at = ? WHERE id = ?")
            .bind(key)
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("backup"));
        }
        Ok(())
    }

    pub async fn update_size_bytes(&self, id: &str, size_bytes: i64) -> Result<()> {
        let result = sqlx::query("UPDATE backups SET size_bytes = ?, updated_at = ? WHERE id = ?")
            .bind(size_bytes)
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("backup"));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Backup>> {
        let row = sqlx::query("SELECT * FROM backups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_backup(&r)).transpose()
    }

    pub async fn list_by_connection(&self, connection_id: &str) -> Result<Vec<Backup>> {
        let rows =
            sqlx::query("SELECT * FROM backups WHERE connection_id = ? ORDER BY created_at DESC")
                .bind(connection_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_backup).collect()
    }

    /// Joined with connections to scope by owner. `search` matches a
    /// case-insensitive substring of the local path or the status.
    pub async fn list_paginated(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
        search: &str,
    ) -> Result<(Vec<Backup>, i64)> {
        let pattern = format!("%{}%", search.to_lowercase());
        let rows = sqlx::query(
            "SELECT b.* FROM backups b
             JOIN connections c ON c.id = b.connection_id
             WHERE c.user_id = ?
               AND (LOWER(b.local_path) LIKE ? OR LOWER(b.status) LIKE ?)
             ORDER BY b.created_at DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backups b
             JOIN connections c ON c.id = b.connection_id
             WHERE c.user_id = ?
               AND (LOWER(b.local_path) LIKE ? OR LOWER(b.status) LIKE ?)",
        )
        .bind(user_id)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let backups = rows.iter().map(row_to_backup).collect::<Result<_>>()?;
        Ok((backups, total))
    }

    /// Completed records older than `cutoff`; the retention GC input set.
    /// In-progress and failed records are never returned.
    pub async fn older_than(
        &self,
        connection_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Backup>> {
        let rows = sqlx::query(
            "SELECT * FROM backups
             WHERE connection_id = ? AND status = 'completed' AND created_at < ?
             ORDER BY created_at",
        )
        .bind(connection_id)
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_backup).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self, user_id: &str) -> Result<BackupStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(CASE WHEN b.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                    COALESCE(SUM(b.size_bytes), 0) AS total_size
             FROM backups b
             JOIN connections c ON c.id = b.connection_id
             WHERE c.user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let failed: i64 = row.get("failed");
        let total_size: i64 = row.get("total_size");

        // Durations come from timestamp text, so the average is folded here
        // rather than in SQL.
        let spans = sqlx::query(
            "SELECT b.started_at, b.completed_at
             FROM backups b
             JOIN connections c ON c.id = b.connection_id
             WHERE c.user_id = ? AND b.completed_at IS NOT NULL",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut minutes = 0.0;
        for span in &spans {
            let started = parse_ts(&span.get::<String, _>("started_at"))?;
            let completed = parse_ts(&span.get::<String, _>("completed_at"))?;
            minutes += (completed - started).num_seconds().max(0) as f64 / 60.0;
        }
        let avg_duration_minutes = if spans.is_empty() {
            0.0
        } else {
            minutes / spans.len() as f64
        };

        let success_rate_percent = if total == 0 {
            100.0
        } else {
            (total - failed) as f64 / total as f64 * 100.0
        };

        Ok(BackupStats {
            total,
            failed,
            total_size,
            avg_duration_minutes,
            success_rate_percent,
        })
    }
}

fn row_to_backup(row: &SqliteRow) -> Result<Backup> {
    Ok(Backup {
        id: row.get("id"),
        connection_id: row.get("connection_id"),
        schedule_id: row.get("schedule_id"),
        status: row.get::<String, _>("status").parse()?,
        local_path: row.get("local_path"),
        s3_object_key: row.get("s3_object_key"),
        size_bytes: row.get("size_bytes"),
        started_at: parse_ts(&row.get::<String, _>("started_at"))?,
        completed_at: parse_ts_opt(row.get("completed_at"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connections::{test_connection, ConnectionStore};
    use crate::store::test_pool;
    use chrono::Duration;

    async fn seed(pool: &SqlitePool) -> (ConnectionStore, BackupStore) {
        let connections = ConnectionStore::new(pool.clone());
        connections
            .save(&test_connection("c1", "pg one", "u1"))
            .await
            .expect("seed connection");
        (connections, BackupStore::new(pool.clone()))
    }

    #[tokio::test]
    async fn lifecycle_stamps_completed_at() {
        let pool = test_pool().await;
        let (_, store) = seed(&pool).await;

        let backup = Backup::begin("c1", "/tmp/shop.sql".into(), Utc::now());
        store.create(&backup).await.expect("create");

        let loaded = store.get(&backup.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, BackupStatus::InProgress);
        assert!(loaded.completed_at.is_none());

        store
            .update_status(&backup.id, BackupStatus::Completed)
            .await
            .expect("complete");
        let loaded = store.get(&backup.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, BackupStatus::Completed);
        let completed_at = loaded.completed_at.expect("terminal stamps completed_at");
        assert!(completed_at >= loaded.started_at);
    }

    #[tokio::test]
    async fn schedule_stamp_applies() {
        let pool = test_pool().await;
        let (_, store) = seed(&pool).await;
        let backup = Backup::begin("c1", "/tmp/shop.sql".into(), Utc::now());
        store.create(&backup).await.expect("create");

        store
            .update_status_and_schedule(&backup.id, BackupStatus::Completed, "s1")
            .await
            .expect("stamp");
        let loaded = store.get(&backup.id).await.expect("get").expect("present");
        assert_eq!(loaded.schedule_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn older_than_skips_non_completed() {
        let pool = test_pool().await;
        let (_, store) = seed(&pool).await;
        let now = Utc::now();

        let mut old_completed = Backup::begin("c1", "/tmp/a.sql".into(), now - Duration::days(40));
        old_completed.status = BackupStatus::Completed;
        old_completed.created_at = now - Duration::days(40);
        store.create(&old_completed).await.expect("create");

        let mut old_in_progress = Backup::begin("c1", "/tmp/b.sql".into(), now - Duration::days(40));
        old_in_progress.created_at = now - Duration::days(40);
        store.create(&old_in_progress).await.expect("create");

        let mut fresh = Backup::begin("c1", "/tmp/c.sql".into(), now);
        fresh.status = BackupStatus::Completed;
        store.create(&fresh).await.expect("create");

        let eligible = store
            .older_than("c1", now - Duration::days(30))
            .await
            .expect("older_than");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, old_completed.id);
    }

    #[tokio::test]
    async fn pagination_and_search() {
        let pool = test_pool().await;
        let (_, store) = seed(&pool).await;

        for i in 0..5 {
            let mut b = Backup::begin("c1", format!("/tmp/shop_{i}.sql"), Utc::now());
            b.status = if i == 0 {
                BackupStatus::Failed
            } else {
                BackupStatus::Completed
            };
            store.create(&b).await.expect("create");
        }

        let (page, total) = store.list_paginated("u1", 2, 0, "").await.expect("page");
        assert_eq!(page.len(), 2);
        assert_eq!(total, 5);

        let (found, total) = store
            .list_paginated("u1", 10, 0, "FAILED")
            .await
            .expect("search");
        assert_eq!(total, 1);
        assert_eq!(found[0].status, BackupStatus::Failed);

        let (none, _) = store
            .list_paginated("other-user", 10, 0, "")
            .await
            .expect("scoped");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn stats_cover_counts_and_rates() {
        let pool = test_pool().await;
        let (_, store) = seed(&pool).await;
        let now = Utc::now();

        let mut ok = Backup::begin("c1", "/tmp/a.sql".into(), now - Duration::minutes(4));
        ok.status = BackupStatus::Completed;
        ok.size_bytes = 1000;
        ok.completed_at = Some(now);
        store.create(&ok).await.expect("create");

        let mut bad = Backup::begin("c1", "/tmp/b.sql".into(), now);
        bad.status = BackupStatus::Failed;
        store.create(&bad).await.expect("create");

        let stats = store.stats("u1").await.expect("stats");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_size, 1000);
        assert!((stats.success_rate_percent - 50.0).abs() < f64::EPSILON);
        assert!(stats.avg_duration_minutes >= 3.9 && stats.avg_duration_minutes <= 4.1);

        let empty = store.stats("nobody").await.expect("stats");
        assert_eq!(empty.total, 0);
        assert!((empty.success_rate_percent - 100.0).abs() < f64::EPSILON);
    }
}
