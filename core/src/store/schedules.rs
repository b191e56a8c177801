use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{BackupError, Result};

use super::{fmt_ts, parse_ts, parse_ts_opt};

/// Durable cron entry; at most one per connection, enforced by a UNIQUE
/// constraint on `connection_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: String,
    pub connection_id: String,
    pub enabled: bool,
    pub cron_expr: String,
    pub retention_days: i64,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        ScheduleStore { pool }
    }

    /// Insert-or-overwrite keyed by connection: scheduling a connection that
    /// already has a schedule re-enables and rewrites it in place, keeping
    /// the original row id.
    pub async fn upsert(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        sqlx::query(
            "INSERT INTO backup_schedules (
                id, connection_id, enabled, cron_expr, retention_days,
                next_run_time, last_backup_time, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id) DO UPDATE SET
                enabled = excluded.enabled,
                cron_expr = excluded.cron_expr,
                retention_days = excluded.retention_days,
                next_run_time = excluded.next_run_time,
                updated_at = excluded.updated_at",
        )
        .bind(&schedule.id)
        .bind(&schedule.connection_id)
        .bind(schedule.enabled)
        .bind(&schedule.cron_expr)
        .bind(schedule.retention_days)
        .bind(schedule.next_run_time.map(fmt_ts))
        .bind(schedule.last_backup_time.map(fmt_ts))
        .bind(fmt_ts(schedule.created_at))
        .bind(fmt_ts(schedule.updated_at))
        .execute(&self.pool)
        .await?;

        // Re-read to pick up the surviving row id on the conflict path.
        self.get_by_connection(&schedule.connection_id)
            .await?
            .ok_or(BackupError::NotFound("backup schedule"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<BackupSchedule>> {
        let row = sqlx::query("SELECT * FROM backup_schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_schedule(&r)).transpose()
    }

    pub async fn get_by_connection(&self, connection_id: &str) -> Result<Option<BackupSchedule>> {
        let row = sqlx::query("SELECT * FROM backup_schedules WHERE connection_id = ?")
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_schedule(&r)).transpose()
    }

    pub async fn list_enabled(&self) -> Result<Vec<BackupSchedule>> {
        let rows = sqlx::query("SELECT * FROM backup_schedules WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    pub async fn set_enabled(&self, connection_id: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_schedules SET enabled = ?, updated_at = ? WHERE connection_id = ?",
        )
        .bind(enabled)
        .bind(fmt_ts(Utc::now()))
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("backup schedule"));
        }
        Ok(())
    }

    /// Post-firing bookkeeping: advance `next_run_time` and stamp the run.
    pub async fn update_after_run(
        &self,
        id: &str,
        next_run_time: Option<DateTime<Utc>>,
        last_backup_time: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backup_schedules
             SET next_run_time = ?, last_backup_time = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(next_run_time.map(fmt_ts))
        .bind(fmt_ts(last_backup_time))
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("backup schedule"));
        }
        Ok(())
    }
}

fn row_to_schedule(row: &SqliteRow) -> Result<BackupSchedule> {
    Ok(BackupSchedule {
        id: row.get("id"),
        connection_id: row.get("connection_id"),
        enabled: row.get("enabled"),
        cron_expr: row.get("cron_expr"),
        retention_days: row.get("retention_days"),
        next_run_time: parse_ts_opt(row.get("next_run_time"))?,
        last_backup_time: parse_ts_opt(row.get("last_backup_time"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
pub(crate) fn test_schedule(connection_id: &str, cron_expr: &str) -> BackupSchedule {
    let now = Utc::now();
    BackupSchedule {
        id: uuid::Uuid::new_v4().to_string(),
        connection_id: connection_id.to_string(),
        enabled: true,
        cron_expr: cron_expr.to_string(),
        retention_days: 30,
        next_run_time: None,
        last_backup_time: None,
        created_at: now,
        updated_at: now,
    }
}
