use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{BackupError, Result};

use super::{fmt_ts, parse_ts};

pub const FEED_WINDOW_DAYS: i64 = 7;
pub const FEED_LIMIT: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    #[serde(rename = "backup_failed")]
    BackupFailed,
    #[serde(rename = "backup_completed")]
    BackupCompleted,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::BackupFailed => "backup_failed",
            NotificationType::BackupCompleted => "backup_completed",
        }
    }
}

impl std::str::FromStr for NotificationType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backup_failed" => Ok(NotificationType::BackupFailed),
            "backup_completed" => Ok(NotificationType::BackupCompleted),
            other => Err(BackupError::Validation(format!(
                "unknown notification type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationType,
    pub unread: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct NotificationStore {
    pool: SqlitePool,
}

impl NotificationStore {
    pub fn new(pool: SqlitePool) -> Self {
        NotificationStore { pool }
    }

    pub async fn create(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        kind: NotificationType,
        metadata: Option<serde_json::Value>,
    ) -> Result<Notification> {
        let now = Utc::now();
        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            kind,
            unread: true,
            metadata,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO notifications
                (id, user_id, title, message, type, status, metadata,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'unread', ?, ?, ?)",
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.kind.as_str())
        .bind(
            notification
                .metadata
                .as_ref()
                .map(|m| m.to_string()),
        )
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;

        Ok(notification)
    }

    /// The user feed: everything unread plus anything from the last seven
    /// days, unread first, newest first, capped at fifty items.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Notification>> {
        let cutoff = fmt_ts(Utc::now() - Duration::days(FEED_WINDOW_DAYS));
        let rows = sqlx::query(
            "SELECT * FROM notifications
             WHERE user_id = ? AND (status = 'unread' OR created_at >= ?)
             ORDER BY CASE WHEN status = 'unread' THEN 0 ELSE 1 END,
                      created_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(cutoff)
        .bind(FEED_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_notification).collect()
    }

    pub async fn mark_read(&self, user_id: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query(
                "UPDATE notifications SET status = 'read', updated_at = ?
                 WHERE id = ? AND user_id = ?",
            )
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete(&self, user_id: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM notifications WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

fn row_to_notification(row: &SqliteRow) -> Result<Notification> {
    let metadata: Option<String> = row.get("metadata");
    Ok(Notification {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        message: row.get("message"),
        kind: row.get::<String, _>("type").parse()?,
        unread: row.get::<String, _>("status") == "unread",
        metadata: metadata
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    BackupError::Validation(format!("bad notification metadata: {e}"))
                })
            })
            .transpose()?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}
