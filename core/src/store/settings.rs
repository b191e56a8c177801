use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::Result;

use super::{fmt_ts, parse_ts};

/// Per-user settings consumed by the engine. `s3_secret_key` and
/// `smtp_password` hold vault ciphertext at rest; the orchestrator's
/// internal getter decrypts them and its public getter blanks them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub s3_enabled: bool,
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_use_ssl: bool,
    pub s3_path_prefix: String,
    pub s3_purge_local: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_from_address: String,
    pub updated_at: DateTime<Utc>,
}

impl UserSettings {
    pub fn empty(user_id: &str) -> Self {
        UserSettings {
            user_id: user_id.to_string(),
            s3_enabled: false,
            s3_endpoint: String::new(),
            s3_region: String::new(),
            s3_bucket: String::new(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            s3_use_ssl: false,
            s3_path_prefix: String::new(),
            s3_purge_local: false,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_from_address: String::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn blank_secrets(&mut self) {
        self.s3_secret_key = String::new();
        self.smtp_password = String::new();
    }

    /// SMTP environment variables take precedence over persisted values.
    /// Returns the names of the fields that are env-managed and therefore
    /// read-only to users. Mail itself is sent elsewhere; the engine only
    /// honors the precedence when echoing settings.
    pub fn apply_smtp_env_overrides(&mut self) -> Vec<&'static str> {
        let mut managed = Vec::new();
        if let Ok(host) = std::env::var("SMTP_HOST") {
            self.smtp_host = host;
            managed.push("smtp_host");
        }
        if let Ok(port) = std::env::var("SMTP_PORT") {
            if let Ok(port) = port.parse() {
                self.smtp_port = port;
                managed.push("smtp_port");
            }
        }
        if let Ok(username) = std::env::var("SMTP_USERNAME") {
            self.smtp_username = username;
            managed.push("smtp_username");
        }
        if let Ok(password) = std::env::var("SMTP_PASSWORD") {
            self.smtp_password = password;
            managed.push("smtp_password");
        }
        if let Ok(from) = std::env::var("SMTP_FROM_ADDRESS") {
            self.smtp_from_address = from;
            managed.push("smtp_from_address");
        }
        managed
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    pub fn new(pool: SqlitePool) -> Self {
        SettingsStore { pool }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<UserSettings>> {
        let row = sqlx::query("SELECT * FROM user_settings WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_settings(&r)).transpose()
    }

    pub async fn upsert(&self, settings: &UserSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_settings (
                user_id, s3_enabled, s3_endpoint, s3_region, s3_bucket,
                s3_access_key, s3_secret_key, s3_use_ssl, s3_path_prefix,
                s3_purge_local, smtp_host, smtp_port, smtp_username,
                smtp_password, smtp_from_address, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                s3_enabled = excluded.s3_enabled,
                s3_endpoint = excluded.s3_endpoint,
                s3_region = excluded.s3_region,
                s3_bucket = excluded.s3_bucket,
                s3_access_key = excluded.s3_access_key,
                s3_secret_key = excluded.s3_secret_key,
                s3_use_ssl = excluded.s3_use_ssl,
                s3_path_prefix = excluded.s3_path_prefix,
                s3_purge_local = excluded.s3_purge_local,
                smtp_host = excluded.smtp_host,
                smtp_port = excluded.smtp_port,
                smtp_username = excluded.smtp_username,
                smtp_password = excluded.smtp_password,
                smtp_from_address = excluded.smtp_from_address,
                updated_at = excluded.updated_at",
        )
        .bind(&settings.user_id)
        .bind(settings.s3_enabled)
        .bind(&settings.s3_endpoint)
        .bind(&settings.s3_region)
        .bind(&settings.s3_bucket)
        .bind(&settings.s3_access_key)
        .bind(&settings.s3_secret_key)
        .bind(settings.s3_use_ssl)
        .bind(&settings.s3_path_prefix)
        .bind(settings.s3_purge_local)
        .bind(&settings.smtp_host)
        .bind(settings.smtp_port as i64)
        .bind(&settings.smtp_username)
        .bind(&settings.smtp_password)
        .bind(&settings.smtp_from_address)
        .bind(fmt_ts(settings.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_settings(row: &SqliteRow) -> Result<UserSettings> {
    Ok(UserSettings {
        user_id: row.get("user_id"),
        s3_enabled: row.get("s3_enabled"),
        s3_endpoint: row.get("s3_endpoint"),
        s3_region: row.get("s3_region"),
        s3_bucket: row.get("s3_bucket"),
        s3_access_key: row.get("s3_access_key"),
        s3_secret_key: row.get("s3_secret_key"),
        s3_use_ssl: row.get("s3_use_ssl"),
        s3_path_prefix: row.get("s3_path_prefix"),
        s3_purge_local: row.get("s3_purge_local"),
        smtp_host: row.get("smtp_host"),
        smtp_port: row.get::<i64, _>("smtp_port") as u16,
        smtp_username: row.get("smtp_username"),
        smtp_password: row.get("smtp_password"),
        smtp_from_address: row.get("smtp_from_address"),
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;
    use serial_test::serial;

    #[tokio::test]
    async fn upsert_then_get_round_trip() {
        let store = SettingsStore::new(test_pool().await);
        let mut settings = UserSettings::empty("u1");
        settings.s3_enabled = true;
        settings.s3_endpoint = "localhost:9000".into();
        settings.s3_bucket = "b".into();
        settings.s3_secret_key = "enc:secret".into();
        store.upsert(&settings).await.expect("upsert");

        settings.s3_purge_local = true;
        store.upsert(&settings).await.expect("update");

        let loaded = store.get("u1").await.expect("get").expect("present");
        assert!(loaded.s3_enabled);
        assert!(loaded.s3_purge_local);
        assert_eq!(loaded.s3_secret_key, "enc:secret");
        assert!(store.get("nobody").await.expect("get").is_none());
    }

    #[test]
    #[serial]
    fn smtp_env_overrides_take_precedence() {
        std::env::set_var("SMTP_HOST", "mail.env.example");
        std::env::remove_var("SMTP_PORT");
        std::env::remove_var("SMTP_USERNAME");
        std::env::remove_var("SMTP_PASSWORD");
        std::env::remove_var("SMTP_FROM_ADDRESS");

        let mut settings = UserSettings::empty("u1");
        settings.smtp_host = "mail.stored.example".into();
        let managed = settings.apply_smtp_env_overrides();

        assert_eq!(settings.smtp_host, "mail.env.example");
        assert_eq!(managed, vec!["smtp_host"]);

        std::env::remove_var("SMTP_HOST");
    }
}
