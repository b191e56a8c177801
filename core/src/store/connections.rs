use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::databases::Engine;
use crate::error::{BackupError, Result};

use super::{fmt_ts, parse_ts, parse_ts_opt};

/// A registered target database. Credential fields hold vault ciphertext at
/// rest; the orchestrator decrypts on read and blanks them before anything
/// leaves the public surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub ssl: bool,
    pub ssh: Option<SshConfig>,
    /// Extra databases dumped in the same run; empty means dump only
    /// `database`.
    pub selected_databases: Vec<String>,
    pub s3_cleanup_on_retention: bool,
    pub user_id: String,
    pub database_size: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

impl Connection {
    pub fn blank_secrets(&mut self) {
        self.password = String::new();
        if let Some(ssh) = &mut self.ssh {
            ssh.password = None;
            ssh.private_key = None;
        }
    }
}

/// `ListForUser` projection: connection identity plus the latest completed
/// backup time and the active schedule, secrets omitted.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub name: String,
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub status: String,
    pub database_size: i64,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub cron_expr: Option<String>,
    pub retention_days: Option<i64>,
}

#[derive(Clone)]
pub struct ConnectionStore {
    pool: SqlitePool,
}

impl ConnectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        ConnectionStore { pool }
    }

    fn validate(conn: &Connection) -> Result<()> {
        if conn.name.trim().is_empty() {
            return Err(BackupError::Validation(
                "connection name must not be empty".into(),
            ));
        }
        if let Some(ssh) = &conn.ssh {
            let has_password = ssh.password.as_deref().is_some_and(|p| !p.is_empty());
            let has_key = ssh.private_key.as_deref().is_some_and(|k| !k.is_empty());
            if !has_password && !has_key {
                return Err(BackupError::Validation(
                    "ssh is enabled but neither a password nor a private key is set".into(),
                ));
            }
        }
        // The column is comma-joined with no quoting.
        if let Some(bad) = conn.selected_databases.iter().find(|db| db.contains(',')) {
            return Err(BackupError::Validation(format!(
                "database name '{bad}' contains a comma and cannot be stored"
            )));
        }
        Ok(())
    }

    pub async fn save(&self, conn: &Connection) -> Result<()> {
        Self::validate(conn)?;
        let ssh = conn.ssh.as_ref();
        sqlx::query(
            "INSERT INTO connections (
                id, name, type, host, port, username, password, database_name,
                ssl, ssh_enabled, ssh_host, ssh_port, ssh_username,
                ssh_password, ssh_private_key, selected_databases,
                s3_cleanup_on_retention, user_id, database_size, status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&conn.id)
        .bind(&conn.name)
        .bind(conn.engine.as_str())
        .bind(&conn.host)
        .bind(conn.port as i64)
        .bind(&conn.username)
        .bind(&conn.password)
        .bind(&conn.database)
        .bind(conn.ssl)
        .bind(ssh.is_some())
        .bind(ssh.map(|s| s.host.as_str()).unwrap_or(""))
        .bind(ssh.map(|s| s.port as i64).unwrap_or(22))
        .bind(ssh.map(|s| s.username.as_str()).unwrap_or(""))
        .bind(ssh.and_then(|s| s.password.as_deref()).unwrap_or(""))
        .bind(ssh.and_then(|s| s.private_key.as_deref()).unwrap_or(""))
        .bind(conn.selected_databases.join(","))
        .bind(conn.s3_cleanup_on_retention)
        .bind(&conn.user_id)
        .bind(conn.database_size)
        .bind(&conn.status)
        .bind(fmt_ts(conn.created_at))
        .bind(fmt_ts(conn.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_connection(&r)).transpose()
    }

    pub async fn update(&self, conn: &Connection) -> Result<()> {
        Self::validate(conn)?;
        let ssh = conn.ssh.as_ref();
        let result = sqlx::query(
            "UPDATE connections SET
                name = ?, type = ?, host = ?, port = ?, username = ?,
                password = ?, database_name = ?, ssl = ?, ssh_enabled = ?,
                ssh_host = ?, ssh_port = ?, ssh_username = ?, ssh_password = ?,
                ssh_private_key = ?, selected_databases = ?,
                s3_cleanup_on_retention = ?, status = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&conn.name)
        .bind(conn.engine.as_str())
        .bind(&conn.host)
        .bind(conn.port as i64)
        .bind(&conn.username)
        .bind(&conn.password)
        .bind(&conn.database)
        .bind(conn.ssl)
        .bind(ssh.is_some())
        .bind(ssh.map(|s| s.host.as_str()).unwrap_or(""))
        .bind(ssh.map(|s| s.port as i64).unwrap_or(22))
        .bind(ssh.map(|s| s.username.as_str()).unwrap_or(""))
        .bind(ssh.and_then(|s| s.password.as_deref()).unwrap_or(""))
        .bind(ssh.and_then(|s| s.private_key.as_deref()).unwrap_or(""))
        .bind(conn.selected_databases.join(","))
        .bind(conn.s3_cleanup_on_retention)
        .bind(&conn.status)
        .bind(fmt_ts(Utc::now()))
        .bind(&conn.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("connection"));
        }
        Ok(())
    }

    /// Deletion cascades to the connection's schedule and backup records.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("connection"));
        }
        Ok(())
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConnectionSummary>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.type, c.host, c.port, c.database_name,
                    c.status, c.database_size,
                    (SELECT MAX(b.completed_at) FROM backups b
                      WHERE b.connection_id = c.id AND b.status = 'completed')
                        AS last_backup_time,
                    s.cron_expr AS cron_expr,
                    s.retention_days AS retention_days
             FROM connections c
             LEFT JOIN backup_schedules s
                    ON s.connection_id = c.id AND s.enabled = 1
             WHERE c.user_id = ?
             ORDER BY c.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ConnectionSummary {
                    id: row.get("id"),
                    name: row.get("name"),
                    engine: row.get::<String, _>("type").parse()?,
                    host: row.get("host"),
                    port: row.get::<i64, _>("port") as u16,
                    database: row.get("database_name"),
                    status: row.get("status"),
                    database_size: row.get("database_size"),
                    last_backup_time: parse_ts_opt(row.get("last_backup_time"))?,
                    cron_expr: row.get("cron_expr"),
                    retention_days: row.get("retention_days"),
                })
            })
            .collect()
    }

    pub async fn update_selected_databases(&self, id: &str, databases: &[String]) -> Result<()> {
        if let Some(bad) = databases.iter().find(|db| db.contains(',')) {
            return Err(BackupError::Validation(format!(
                "database name '{bad}' contains a comma and cannot be stored"
            )));
        }
        self.simple_update(id, "selected_databases", databases.join(","))
            .await
    }

    pub async fn update_s3_cleanup_flag(&self, id: &str, cleanup: bool) -> Result<()> {
        self.simple_update(id, "s3_cleanup_on_retention", if cleanup { "1" } else { "0" })
            .await
    }

    pub async fn update_database_size(&self, id: &str, size: i64) -> Result<()> {
        self.simple_update(id, "database_size", size.to_string())
            .await
    }

    pub async fn update_name(&self, id: &str, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(BackupError::Validation(
                "connection name must not be empty".into(),
            ));
        }
        self.simple_update(id, "name", name.to_string()).await
    }

    async fn simple_update(&self, id: &str, column: &str, value: impl ToString) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE connections SET {column} = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(value.to_string())
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound("connection"));
        }
        Ok(())
    }
}

fn row_to_connection(row: &SqliteRow) -> Result<Connection> {
    let ssh = if row.get::<bool, _>("ssh_enabled") {
        Some(SshConfig {
            host: row.get("ssh_host"),
            port: row.get::<i64, _>("ssh_port") as u16,
            username: row.get("ssh_username"),
            password: non_empty(row.get("ssh_password")),
            private_key: non_empty(row.get("ssh_private_key")),
        })
    } else {
        None
    };

    let selected: String = row.get("selected_databases");

    Ok(Connection {
        id: row.get("id"),
        name: row.get("name"),
        engine: row.get::<String, _>("type").parse()?,
        host: row.get("host"),
        port: row.get::<i64, _>("port") as u16,
        username: row.get("username"),
        password: row.get("password"),
        database: row.get("database_name"),
        ssl: row.get("ssl"),
        ssh,
        selected_databases: selected
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        s3_cleanup_on_retention: row.get("s3_cleanup_on_retention"),
        user_id: row.get("user_id"),
        database_size: row.get("database_size"),
        status: row.get("status"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
pub(crate) fn test_connection(id: &str, name: &str, user_id: &str) -> Connection {
    Connection {
        id: id.to_string(),
        name: name.to_string(),
        engine: Engine::PostgreSql,
        host: "localhost".into(),
        port: 5432,
        username: "postgres".into(),
        password: "enc:pw".into(),
        database: "shop".into(),
        ssl: false,
        ssh: None,
        selected_databases: Vec::new(),
        s3_cleanup_on_retention: true,
        user_id: user_id.to_string(),
        database_size: 0,
        status: "active".into(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
