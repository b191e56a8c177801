use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::{BackupError, Result};

pub mod backups;
pub mod connections;
pub mod notifications;
pub mod schedules;
pub mod settings;

const SCHEMA: &str = include_str!("schema.sql");

/// Opens (creating if missing) the engine's sqlite database and ensures the
/// schema exists. All timestamps are RFC3339 UTC text, booleans 0/1
/// integers, primary keys UUID text.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::raw_sql(SCHEMA).execute(&pool).await?;

    Ok(pool)
}

/// Serializes a timestamp the way every table stores it: RFC3339, UTC,
/// second precision, `Z` suffix. The fixed width keeps SQL text comparisons
/// equivalent to chronological ones.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| BackupError::Validation(format!("bad stored timestamp '{raw}': {e}")))
}

pub fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::raw_sql("PRAGMA foreign_keys = ON;")
        .execute(&pool)
        .await
        .expect("enable foreign keys");
    sqlx::raw_sql(SCHEMA).execute(&pool).await.expect("schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_and_order_lexicographically() {
        let a = parse_ts("2026-03-01T00:00:00Z").unwrap();
        let b = a + chrono::Duration::seconds(1);
        let (sa, sb) = (fmt_ts(a), fmt_ts(b));
        assert_eq!(sa, "2026-03-01T00:00:00Z");
        assert!(sa < sb);
        assert_eq!(parse_ts(&sa).unwrap(), a);
    }

    #[test]
    fn bad_timestamp_is_a_validation_error() {
        assert!(matches!(
            parse_ts("last tuesday"),
            Err(BackupError::Validation(_))
        ));
    }
}
