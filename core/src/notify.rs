use log::warn;
use serde_json::json;

use crate::error::Result;
use crate::store::connections::Connection;
use crate::store::notifications::{Notification, NotificationStore, NotificationType};

/// Emits persisted user-feed items. Only scheduled runs notify; on-demand
/// failures are returned to the caller synchronously instead.
#[derive(Clone)]
pub struct Notifier {
    store: NotificationStore,
}

impl Notifier {
    pub fn new(store: NotificationStore) -> Self {
        Notifier { store }
    }

    pub async fn backup_failed(&self, conn: &Connection, error: &str) -> Result<Notification> {
        let metadata = json!({
            "connection_id": conn.id,
            "database_type": conn.engine.as_str(),
            "database_name": conn.database,
            "error": error,
        });

        self.store
            .create(
                &conn.user_id,
                "Backup Failed",
                error,
                NotificationType::BackupFailed,
                Some(metadata),
            )
            .await
    }

    /// Failure to notify must never fail the firing that produced it.
    pub async fn backup_failed_best_effort(&self, conn: &Connection, error: &str) {
        if let Err(e) = self.backup_failed(conn, error).await {
            warn!(
                "could not persist backup_failed notification for connection {}: {e}",
                conn.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connections::test_connection;
    use crate::store::test_pool;

    #[tokio::test]
    async fn failed_run_produces_an_unread_item_with_metadata() {
        let pool = test_pool().await;
        let notifier = Notifier::new(NotificationStore::new(pool.clone()));
        let conn = test_connection("c1", "pg one", "u1");

        notifier
            .backup_failed(&conn, "pg_dump exited with code 1")
            .await
            .expect("notify");

        let feed = NotificationStore::new(pool)
            .list_for_user("u1")
            .await
            .expect("feed");
        assert_eq!(feed.len(), 1);
        let item = &feed[0];
        assert_eq!(item.title, "Backup Failed");
        assert!(item.unread);
        assert_eq!(item.kind, NotificationType::BackupFailed);
        let metadata = item.metadata.as_ref().expect("metadata");
        assert_eq!(metadata["connection_id"], "c1");
        assert_eq!(metadata["database_type"], "postgresql");
        assert_eq!(metadata["error"], "pg_dump exited with code 1");
    }
}
