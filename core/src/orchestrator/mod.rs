use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use crate::databases::{self, require_dump_tool, require_restore_tool, Engine, JobSpec};
use crate::error::{BackupError, Result};
use crate::notify::Notifier;
use crate::retention::run_retention;
use crate::s3::{rewrite_key, S3Mirror, S3Params, DOWNLOAD_SUBDIR};
use crate::scheduler::{next_fire, parse_cron, ScheduleRunner, Scheduler};
use crate::spool::Spool;
use crate::store::backups::{Backup, BackupStats, BackupStatus, BackupStore};
use crate::store::connections::{Connection, ConnectionStore, ConnectionSummary, SshConfig};
use crate::store::notifications::{Notification, NotificationStore};
use crate::store::schedules::{BackupSchedule, ScheduleStore};
use crate::store::settings::{SettingsStore, UserSettings};
use crate::tunnel::{self, TunnelHandle, TunnelParams};
use crate::vault::Vault;

/// Process-wide configuration handed in at startup.
pub struct EngineConfig {
    /// Location of the engine's own sqlite database.
    pub database_path: PathBuf,
    /// Root of the local dump spool.
    pub backup_root: PathBuf,
    /// Secret the credential vault derives its key from.
    pub encryption_secret: String,
}

/// Connection creation request; secrets arrive in plaintext and are
/// encrypted before anything is persisted.
pub struct NewConnection {
    pub name: String,
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub ssl: bool,
    pub ssh: Option<NewSshConfig>,
    pub selected_databases: Vec<String>,
    pub s3_cleanup_on_retention: bool,
    pub user_id: String,
}

pub struct NewSshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

pub struct ScheduleRequest {
    pub connection_id: String,
    pub cron_expr: String,
    pub retention_days: i64,
}

#[derive(Debug, Default)]
pub struct S3CleanupOutcome {
    pub removed: usize,
    pub failed: usize,
}

/// The backup engine's public entry point. Owns the cron scheduler and
/// composes vault, stores, drivers, tunnel, spool and S3 mirror. Cloning is
/// cheap; every clone shares the same underlying state.
#[derive(Clone)]
pub struct Orchestrator {
    vault: Vault,
    spool: Spool,
    connections: ConnectionStore,
    backups: BackupStore,
    schedules: ScheduleStore,
    settings: SettingsStore,
    notifications: NotificationStore,
    notifier: Notifier,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    pub async fn new(config: &EngineConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = crate::store::open_pool(&config.database_path).await?;
        let notifications = NotificationStore::new(pool.clone());
        Ok(Orchestrator {
            vault: Vault::new(&config.encryption_secret),
            spool: Spool::new(&config.backup_root),
            connections: ConnectionStore::new(pool.clone()),
            backups: BackupStore::new(pool.clone()),
            schedules: ScheduleStore::new(pool.clone()),
            settings: SettingsStore::new(pool),
            notifier: Notifier::new(notifications.clone()),
            notifications,
            scheduler: Arc::new(Scheduler::new()),
        })
    }

    /// Startup recovery: registers every enabled schedule and runs at most
    /// one catch-up firing per schedule whose `next_run_time` already
    /// passed while the process was down.
    pub async fn bootstrap(&self) -> Result<()> {
        let enabled = self.schedules.list_enabled().await?;
        info!("scheduler bootstrap: {} enabled schedules", enabled.len());

        let runner: Arc<dyn ScheduleRunner> = Arc::new(self.clone());
        let now = Utc::now();

        for schedule in enabled {
            if let Err(e) = self.scheduler.register(&schedule, runner.clone()) {
                warn!("schedule {} not registered: {e}", schedule.id);
                continue;
            }
            if schedule.next_run_time.is_some_and(|t| t < now) {
                info!(
                    "schedule {} missed its window; running one catch-up",
                    schedule.id
                );
                let orchestrator = self.clone();
                tokio::spawn(async move {
                    orchestrator.run_schedule_inner(schedule).await;
                });
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    // ----- connections -----

    pub async fn save_connection(&self, req: NewConnection) -> Result<Connection> {
        let now = Utc::now();
        let ssh = req
            .ssh
            .map(|ssh| {
                Ok::<_, BackupError>(SshConfig {
                    host: ssh.host,
                    port: ssh.port,
                    username: ssh.username,
                    password: ssh
                        .password
                        .filter(|p| !p.is_empty())
                        .map(|p| self.vault.encrypt(&p))
                        .transpose()?,
                    private_key: ssh
                        .private_key
                        .filter(|k| !k.is_empty())
                        .map(|k| self.vault.encrypt(&k))
                        .transpose()?,
                })
            })
            .transpose()?;

        let mut conn = Connection {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            engine: req.engine,
            host: req.host,
            port: req.port,
            username: req.username,
            password: self.vault.encrypt(&req.password)?,
            database: req.database,
            ssl: req.ssl,
            ssh,
            selected_databases: req.selected_databases,
            s3_cleanup_on_retention: req.s3_cleanup_on_retention,
            user_id: req.user_id,
            database_size: 0,
            status: "active".into(),
            created_at: now,
            updated_at: now,
        };
        self.connections.save(&conn).await?;

        conn.blank_secrets();
        Ok(conn)
    }

    pub async fn get_connection(&self, id: &str) -> Result<Connection> {
        let mut conn = self
            .connections
            .get(id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;
        conn.blank_secrets();
        Ok(conn)
    }

    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<ConnectionSummary>> {
        self.connections.list_for_user(user_id).await
    }

    pub async fn update_selected_databases(&self, id: &str, databases: &[String]) -> Result<()> {
        self.connections.update_selected_databases(id, databases).await
    }

    pub async fn update_s3_cleanup_flag(&self, id: &str, cleanup: bool) -> Result<()> {
        self.connections.update_s3_cleanup_flag(id, cleanup).await
    }

    /// Deletes a connection; its schedule and backup records cascade. S3
    /// objects are removed only when `remove_s3` asks for it, and storage
    /// failures never block the deletion.
    pub async fn delete_connection(&self, id: &str, remove_s3: bool) -> Result<()> {
        let conn = self
            .connections
            .get(id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;

        if remove_s3 {
            if let Err(e) = self.cleanup_s3_backups_for_connection(id).await {
                warn!("s3 cleanup for connection {id} failed, deleting anyway: {e}");
            }
        }

        if let Some(schedule) = self.schedules.get_by_connection(id).await? {
            self.scheduler.remove(&schedule.id);
        }

        self.connections.delete(id).await?;
        info!("deleted connection {id} ({})", conn.name);
        Ok(())
    }

    /// Renames a connection, dragging its S3 folder and local spool folder
    /// along. Storage failures downgrade to warnings; records keep their
    /// old `local_path` and fall back to S3 rehydration when read.
    pub async fn rename_connection(&self, id: &str, new_name: &str) -> Result<()> {
        let conn = self
            .connections
            .get(id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;

        if let Err(e) = self
            .rename_s3_folder_for_connection(id, &conn.name, new_name)
            .await
        {
            warn!("s3 rename for connection {id} failed, renaming anyway: {e}");
        }
        self.spool.rename_dir(&conn.name, new_name);
        self.connections.update_name(id, new_name).await
    }

    // ----- settings -----

    /// Encrypt-on-write for the secret fields, then persist.
    pub async fn set_user_settings(&self, mut settings: UserSettings) -> Result<()> {
        if !settings.s3_secret_key.is_empty() {
            settings.s3_secret_key = self.vault.encrypt(&settings.s3_secret_key)?;
        }
        if !settings.smtp_password.is_empty() {
            settings.smtp_password = self.vault.encrypt(&settings.smtp_password)?;
        }
        settings.updated_at = Utc::now();
        self.settings.upsert(&settings).await
    }

    /// Public variant: secrets blanked, SMTP env overrides applied so
    /// callers see effective values and which fields are env-managed.
    pub async fn get_user_settings(
        &self,
        user_id: &str,
    ) -> Result<(UserSettings, Vec<&'static str>)> {
        let mut settings = self
            .settings
            .get(user_id)
            .await?
            .unwrap_or_else(|| UserSettings::empty(user_id));
        settings.blank_secrets();
        let env_managed = settings.apply_smtp_env_overrides();
        settings.smtp_password = String::new();
        Ok((settings, env_managed))
    }

    /// Internal variant: secrets decrypted; never leaves the engine.
    async fn settings_internal(&self, user_id: &str) -> Result<Option<UserSettings>> {
        let Some(mut settings) = self.settings.get(user_id).await? else {
            return Ok(None);
        };
        settings.s3_secret_key = self
            .vault
            .decrypt_opt(&settings.s3_secret_key)?
            .unwrap_or_default();
        settings.smtp_password = self
            .vault
            .decrypt_opt(&settings.smtp_password)?
            .unwrap_or_default();
        Ok(Some(settings))
    }

    /// `Ok(None)` when S3 is disabled or no settings exist; `Err(S3Config)`
    /// when it is enabled but incomplete.
    async fn mirror_for_user(&self, user_id: &str) -> Result<Option<(S3Mirror, S3Params)>> {
        let Some(settings) = self.settings_internal(user_id).await? else {
            return Ok(None);
        };
        if !settings.s3_enabled {
            return Ok(None);
        }
        let params = S3Params::from_settings(&settings)?;
        let mirror = S3Mirror::connect(&params).await?;
        Ok(Some((mirror, params)))
    }

    // ----- backups -----

    /// Dumps a connection: single-database, or fanned out over
    /// `selected_databases` when that list is non-empty. A multi-database
    /// run fails only when every sub-dump fails; the first successful
    /// backup is returned and the rest are persisted individually.
    pub async fn create_backup(&self, connection_id: &str) -> Result<Backup> {
        let conn = self
            .connections
            .get(connection_id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;

        require_dump_tool(conn.engine)?;
        let password = self.vault.decrypt_opt(&conn.password)?;

        // One tunnel for the whole run, torn down on every exit path.
        let tunnel = self.open_tunnel_if_needed(&conn).await?;
        let (host, port) = match &tunnel {
            Some(handle) => (handle.local_host().to_string(), handle.local_port()),
            None => (conn.host.clone(), conn.port),
        };

        if conn.selected_databases.is_empty() {
            let database = conn.database.clone();
            return self
                .dump_one(&conn, &host, port, password.as_deref(), &database, true)
                .await;
        }

        let mut first_success: Option<Backup> = None;
        let mut failures: Vec<(String, BackupError)> = Vec::new();
        let selected = conn.selected_databases.clone();
        for database in &selected {
            match self
                .dump_one(&conn, &host, port, password.as_deref(), database, false)
                .await
            {
                Ok(backup) => {
                    if first_success.is_none() {
                        first_success = Some(backup);
                    }
                }
                Err(e) => {
                    warn!("sub-dump of '{database}' for connection {connection_id} failed: {e}");
                    failures.push((database.clone(), e));
                }
            }
        }

        match first_success {
            Some(backup) => {
                if !failures.is_empty() {
                    let names: Vec<&str> =
                        failures.iter().map(|(db, _)| db.as_str()).collect();
                    warn!(
                        "multi-database run for connection {connection_id} completed partially; failed: {}",
                        names.join(", ")
                    );
                }
                Ok(backup)
            }
            None => {
                let (_, first_error) = failures
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| unreachable!("empty selected_databases handled above"));
                Err(first_error)
            }
        }
    }

    async fn dump_one(
        &self,
        conn: &Connection,
        host: &str,
        port: u16,
        password: Option<&str>,
        database: &str,
        keep_record_on_failure: bool,
    ) -> Result<Backup> {
        self.spool.prepare_dir(&conn.name)?;
        let started = Utc::now();
        let path = self.spool.dump_path(&conn.name, database, started);

        let mut backup = Backup::begin(&conn.id, path.display().to_string(), started);
        self.backups.create(&backup).await?;

        let job = JobSpec {
            engine: conn.engine,
            host,
            port,
            username: &conn.username,
            password,
            database,
            ssl: conn.ssl,
            path: &path,
        };
        // A lone run leaves the in_progress record behind for the caller to
        // see (the scheduled path turns the error into a notification); a
        // fan-out sub-dump leaves no record.
        if let Err(e) = databases::run_dump(&job).await {
            if !keep_record_on_failure {
                if let Err(del) = self.backups.delete(&backup.id).await {
                    warn!(
                        "could not remove record of failed sub-dump {}: {del}",
                        backup.id
                    );
                }
            }
            return Err(e);
        }

        let size = self.spool.dump_size(&path) as i64;
        self.backups.update_size_bytes(&backup.id, size).await?;
        self.backups
            .update_status(&backup.id, BackupStatus::Completed)
            .await?;
        backup.size_bytes = size;
        backup.status = BackupStatus::Completed;
        backup.completed_at = Some(Utc::now());

        if let Err(e) = self.connections.update_database_size(&conn.id, size).await {
            warn!("could not refresh database_size for connection {}: {e}", conn.id);
        }

        self.upload_to_s3_best_effort(&mut backup, conn).await;

        info!(
            "backup {} completed for connection {} ({} bytes)",
            backup.id, conn.id, size
        );
        Ok(backup)
    }

    /// Mirrors a completed dump to S3 when the owner has it configured.
    /// Upload failures leave the record `completed` with a null key; the
    /// local purge happens strictly after the upload is acknowledged and
    /// the key persisted.
    async fn upload_to_s3_best_effort(&self, backup: &mut Backup, conn: &Connection) {
        let (mirror, params) = match self.mirror_for_user(&conn.user_id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return,
            Err(e) => {
                warn!("s3 upload skipped for backup {}: {e}", backup.id);
                return;
            }
        };

        let local = PathBuf::from(&backup.local_path);
        let Some(file_name) = local.file_name().and_then(|n| n.to_str()) else {
            warn!("backup {} has no usable file name, skipping upload", backup.id);
            return;
        };
        let key = params.object_key(&conn.name, file_name);

        match mirror.put_file(&key, &local).await {
            Ok(()) => {
                if let Err(e) = self
                    .backups
                    .update_s3_object_key(&backup.id, Some(&key))
                    .await
                {
                    // Without a persisted key the local copy must survive.
                    warn!("uploaded backup {} but could not record the key: {e}", backup.id);
                    return;
                }
                backup.s3_object_key = Some(key);
                if params.purge_local {
                    self.spool.remove(&local);
                }
            }
            Err(e) => {
                warn!(
                    "s3 upload for backup {} failed, local copy remains authoritative: {e}",
                    backup.id
                );
            }
        }
    }

    /// Restores a backup into a compatible target connection.
    pub async fn restore_backup(&self, backup_id: &str, target_connection_id: &str) -> Result<()> {
        let backup = self
            .backups
            .get(backup_id)
            .await?
            .ok_or(BackupError::NotFound("backup"))?;
        let target = self
            .connections
            .get(target_connection_id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;
        let origin = self
            .connections
            .get(&backup.connection_id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;

        if origin.engine != target.engine {
            return Err(BackupError::Validation(format!(
                "engine mismatch: backup was taken from {} but the target is {}",
                origin.engine, target.engine
            )));
        }
        require_restore_tool(target.engine)?;

        let (path, is_temp) = self.ensure_file_available(&backup, &target.user_id).await?;
        let _cleanup = TempGuard::new(&path, is_temp);

        let password = self.vault.decrypt_opt(&target.password)?;
        let tunnel = self.open_tunnel_if_needed(&target).await?;
        let (host, port) = match &tunnel {
            Some(handle) => (handle.local_host().to_string(), handle.local_port()),
            None => (target.host.clone(), target.port),
        };

        let job = JobSpec {
            engine: target.engine,
            host: &host,
            port,
            username: &target.username,
            password: password.as_deref(),
            database: &target.database,
            ssl: target.ssl,
            path: &path,
        };
        databases::run_restore(&job).await?;

        info!("restored backup {backup_id} into connection {target_connection_id}");
        Ok(())
    }

    /// Returns a readable path for a backup: the local file when present,
    /// otherwise a fresh download from S3 under the temp folder. The second
    /// element tells the caller whether it must delete the path when done.
    pub async fn ensure_file_available(
        &self,
        backup: &Backup,
        user_id: &str,
    ) -> Result<(PathBuf, bool)> {
        let local = PathBuf::from(&backup.local_path);
        if local.exists() {
            return Ok((local, false));
        }

        let Some(key) = backup.s3_object_key.as_deref() else {
            return Err(BackupError::BackupMissing);
        };
        let Some((mirror, _)) = self.mirror_for_user(user_id).await? else {
            return Err(BackupError::BackupMissing);
        };

        let dir = std::env::temp_dir().join(DOWNLOAD_SUBDIR);
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = local.file_name().ok_or(BackupError::BackupMissing)?;
        let dest = dir.join(file_name);
        mirror.fetch_to(key, &dest).await?;

        info!("rehydrated backup {} from s3://{key}", backup.id);
        Ok((dest, true))
    }

    pub async fn get_backup(&self, id: &str) -> Result<Backup> {
        self.backups
            .get(id)
            .await?
            .ok_or(BackupError::NotFound("backup"))
    }

    pub async fn list_backups(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
        search: &str,
    ) -> Result<(Vec<Backup>, i64)> {
        self.backups.list_paginated(user_id, limit, offset, search).await
    }

    pub async fn backup_stats(&self, user_id: &str) -> Result<BackupStats> {
        self.backups.stats(user_id).await
    }

    // ----- schedules -----

    /// Upsert: a connection that already has a schedule gets it re-enabled
    /// and overwritten in place.
    pub async fn schedule_backup(&self, req: ScheduleRequest) -> Result<BackupSchedule> {
        if req.retention_days <= 0 {
            return Err(BackupError::Validation(
                "retention_days must be greater than zero".into(),
            ));
        }
        let parsed = parse_cron(&req.cron_expr)?;
        if self.connections.get(&req.connection_id).await?.is_none() {
            return Err(BackupError::NotFound("connection"));
        }

        let now = Utc::now();
        let schedule = BackupSchedule {
            id: Uuid::new_v4().to_string(),
            connection_id: req.connection_id,
            enabled: true,
            cron_expr: req.cron_expr,
            retention_days: req.retention_days,
            next_run_time: next_fire(&parsed, now),
            last_backup_time: None,
            created_at: now,
            updated_at: now,
        };
        let stored = self.schedules.upsert(&schedule).await?;
        self.scheduler
            .register(&stored, Arc::new(self.clone()))?;
        info!(
            "schedule {} active for connection {} ({})",
            stored.id, stored.connection_id, stored.cron_expr
        );
        Ok(stored)
    }

    /// Like `schedule_backup` but requires an existing schedule.
    pub async fn update_backup_schedule(
        &self,
        connection_id: &str,
        cron_expr: &str,
        retention_days: i64,
    ) -> Result<BackupSchedule> {
        if self
            .schedules
            .get_by_connection(connection_id)
            .await?
            .is_none()
        {
            return Err(BackupError::NotFound("backup schedule"));
        }
        self.schedule_backup(ScheduleRequest {
            connection_id: connection_id.to_string(),
            cron_expr: cron_expr.to_string(),
            retention_days,
        })
        .await
    }

    pub async fn disable_backup_schedule(&self, connection_id: &str) -> Result<()> {
        let schedule = self
            .schedules
            .get_by_connection(connection_id)
            .await?
            .ok_or(BackupError::NotFound("backup schedule"))?;
        self.scheduler.remove(&schedule.id);
        self.schedules.set_enabled(connection_id, false).await
    }

    // ----- s3 maintenance -----

    /// Deletes every recorded S3 object for a connection. Best-effort per
    /// object; keeps going on individual failures and reports the tally.
    pub async fn cleanup_s3_backups_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<S3CleanupOutcome> {
        let conn = self
            .connections
            .get(connection_id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;

        let records = self.backups.list_by_connection(connection_id).await?;
        let keyed: Vec<(String, String)> = records
            .into_iter()
            .filter_map(|b| b.s3_object_key.clone().map(|k| (b.id, k)))
            .collect();

        let mut outcome = S3CleanupOutcome::default();
        if keyed.is_empty() {
            return Ok(outcome);
        }

        let Some((mirror, _)) = self.mirror_for_user(&conn.user_id).await? else {
            warn!(
                "connection {connection_id} has s3-backed backups but s3 is not configured; leaving {} objects behind",
                keyed.len()
            );
            return Ok(outcome);
        };

        for (backup_id, key) in keyed {
            match mirror.remove(&key).await {
                Ok(()) => {
                    outcome.removed += 1;
                    if let Err(e) = self.backups.update_s3_object_key(&backup_id, None).await {
                        warn!("deleted s3 object {key} but could not clear the record: {e}");
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!("could not delete s3 object {key}: {e}");
                }
            }
        }
        info!(
            "s3 cleanup for connection {connection_id}: {} removed, {} failed",
            outcome.removed, outcome.failed
        );
        Ok(outcome)
    }

    /// Moves every recorded object under the new sanitized connection name
    /// (copy, then delete; atomic per object) and persists the new keys.
    /// Running it twice with the same arguments is a no-op the second time.
    pub async fn rename_s3_folder_for_connection(
        &self,
        connection_id: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        let conn = self
            .connections
            .get(connection_id)
            .await?
            .ok_or(BackupError::NotFound("connection"))?;

        let records = self.backups.list_by_connection(connection_id).await?;
        let renames: Vec<(String, String, String)> = records
            .into_iter()
            .filter_map(|b| {
                let key = b.s3_object_key.clone()?;
                let new_key = rewrite_key(&key, old_name, new_name);
                (new_key != key).then_some((b.id, key, new_key))
            })
            .collect();

        if renames.is_empty() {
            return Ok(());
        }

        let Some((mirror, _)) = self.mirror_for_user(&conn.user_id).await? else {
            warn!("s3 not configured; object keys for connection {connection_id} left untouched");
            return Ok(());
        };

        for (backup_id, old_key, new_key) in renames {
            match mirror.rename(&old_key, &new_key).await {
                Ok(()) => {
                    if let Err(e) = self
                        .backups
                        .update_s3_object_key(&backup_id, Some(&new_key))
                        .await
                    {
                        warn!("renamed s3 object to {new_key} but could not persist it: {e}");
                    }
                }
                Err(e) => warn!("could not rename s3 object {old_key}: {e}"),
            }
        }
        Ok(())
    }

    // ----- notifications -----

    pub async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        self.notifications.list_for_user(user_id).await
    }

    pub async fn mark_notifications_read(&self, user_id: &str, ids: &[String]) -> Result<()> {
        self.notifications.mark_read(user_id, ids).await
    }

    pub async fn delete_notifications(&self, user_id: &str, ids: &[String]) -> Result<()> {
        self.notifications.delete(user_id, ids).await
    }

    // ----- internals -----

    async fn open_tunnel_if_needed(&self, conn: &Connection) -> Result<Option<TunnelHandle>> {
        let Some(ssh) = &conn.ssh else {
            return Ok(None);
        };

        let params = TunnelParams {
            ssh_host: ssh.host.clone(),
            ssh_port: ssh.port,
            ssh_username: ssh.username.clone(),
            password: ssh
                .password
                .as_deref()
                .map(|c| self.vault.decrypt(c))
                .transpose()?,
            private_key: ssh
                .private_key
                .as_deref()
                .map(|c| self.vault.decrypt(c))
                .transpose()?,
            target_host: conn.host.clone(),
            target_port: conn.port,
        };

        // Handshake and auth are blocking; keep them off the runtime.
        let handle = tokio::task::spawn_blocking(move || tunnel::open(params))
            .await
            .map_err(|e| BackupError::Tunnel(format!("tunnel task failed: {e}")))??;
        Ok(Some(handle))
    }

    /// The per-firing procedure. Every error is contained here: the
    /// scheduler itself must survive anything a firing does.
    async fn run_schedule_inner(&self, schedule: BackupSchedule) {
        info!(
            "firing schedule {} (connection {})",
            schedule.id, schedule.connection_id
        );

        match self.create_backup(&schedule.connection_id).await {
            Ok(backup) => {
                if let Err(e) = self
                    .backups
                    .update_status_and_schedule(&backup.id, BackupStatus::Completed, &schedule.id)
                    .await
                {
                    warn!("could not stamp schedule on backup {}: {e}", backup.id);
                }
            }
            Err(e) => {
                error!(
                    "scheduled backup for connection {} failed: {e}",
                    schedule.connection_id
                );
                match self.connections.get(&schedule.connection_id).await {
                    Ok(Some(conn)) => {
                        self.notifier
                            .backup_failed_best_effort(&conn, &e.to_string())
                            .await;
                    }
                    _ => warn!(
                        "connection {} unavailable, backup_failed notification dropped",
                        schedule.connection_id
                    ),
                }
            }
        }

        let now = Utc::now();
        match parse_cron(&schedule.cron_expr) {
            Ok(parsed) => {
                let next = next_fire(&parsed, now);
                if let Err(e) = self
                    .schedules
                    .update_after_run(&schedule.id, next, now)
                    .await
                {
                    warn!("could not reschedule {}: {e}", schedule.id);
                }
            }
            Err(e) => warn!("schedule {} carries a bad cron: {e}", schedule.id),
        }

        if schedule.retention_days > 0 {
            if let Ok(Some(conn)) = self.connections.get(&schedule.connection_id).await {
                let mirror = match self.mirror_for_user(&conn.user_id).await {
                    Ok(Some((mirror, _))) => Some(mirror),
                    Ok(None) => None,
                    Err(e) => {
                        warn!("retention runs without s3 for connection {}: {e}", conn.id);
                        None
                    }
                };
                if let Err(e) = run_retention(
                    &self.backups,
                    &self.spool,
                    mirror.as_ref(),
                    &conn,
                    schedule.retention_days,
                )
                .await
                {
                    warn!("retention sweep for connection {} failed: {e}", conn.id);
                }
            }
        }
    }
}

#[async_trait]
impl ScheduleRunner for Orchestrator {
    async fn run_schedule(&self, schedule: BackupSchedule) {
        self.run_schedule_inner(schedule).await;
    }
}

/// Deletes a rehydrated temp file when dropped; no-op for local paths.
struct TempGuard {
    path: PathBuf,
    is_temp: bool,
}

impl TempGuard {
    fn new(path: &Path, is_temp: bool) -> Self {
        TempGuard {
            path: path.to_path_buf(),
            is_temp,
        }
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.is_temp {
            return;
        }
        let result = if self.path.is_dir() {
            std::fs::remove_dir_all(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };
        if let Err(e) = result {
            warn!("could not remove temp download {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backups::Backup;
    use serial_test::serial;
    use std::time::Duration;

    async fn test_orchestrator() -> (Orchestrator, tempfile::TempDir) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            database_path: dir.path().join("engine.db"),
            backup_root: dir.path().join("backups"),
            encryption_secret: "test-secret".into(),
        };
        let orchestrator = Orchestrator::new(&config).await.expect("orchestrator");
        (orchestrator, dir)
    }

    fn new_connection(name: &str, engine: Engine, port: u16) -> NewConnection {
        NewConnection {
            name: name.into(),
            engine,
            host: "127.0.0.1".into(),
            port,
            username: "svc".into(),
            password: "p4ssw0rd".into(),
            database: "shop".into(),
            ssl: false,
            ssh: None,
            selected_databases: Vec::new(),
            s3_cleanup_on_retention: true,
            user_id: "u1".into(),
        }
    }

    #[tokio::test]
    async fn save_connection_encrypts_and_blanks() {
        let (orchestrator, _dir) = test_orchestrator().await;
        let returned = orchestrator
            .save_connection(new_connection("pg1", Engine::PostgreSql, 5432))
            .await
            .expect("save");

        // Returned value carries no secrets.
        assert!(returned.password.is_empty());

        // Stored value carries ciphertext, not the plaintext.
        let stored = orchestrator
            .connections
            .get(&returned.id)
            .await
            .expect("get")
            .expect("present");
        assert!(!stored.password.is_empty());
        assert_ne!(stored.password, "p4ssw0rd");
        assert_eq!(
            orchestrator.vault.decrypt(&stored.password).expect("decrypt"),
            "p4ssw0rd"
        );
    }

    #[tokio::test]
    async fn schedule_upsert_keeps_one_schedule_per_connection() {
        let (orchestrator, _dir) = test_orchestrator().await;
        let conn = orchestrator
            .save_connection(new_connection("pg1", Engine::PostgreSql, 5432))
            .await
            .expect("save");

        let first = orchestrator
            .schedule_backup(ScheduleRequest {
                connection_id: conn.id.clone(),
                cron_expr: "0 0 3 * * *".into(),
                retention_days: 30,
            })
            .await
            .expect("schedule");
        assert!(first.next_run_time.expect("next") > Utc::now());

        let second = orchestrator
            .update_backup_schedule(&conn.id, "0 30 5 * * *", 7)
            .await
            .expect("update");
        assert_eq!(second.id, first.id);
        assert_eq!(second.cron_expr, "0 30 5 * * *");
        assert_eq!(orchestrator.scheduler.job_count(), 1);

        orchestrator
            .disable_backup_schedule(&conn.id)
            .await
            .expect("disable");
        assert_eq!(orchestrator.scheduler.job_count(), 0);

        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn bad_cron_and_bad_retention_are_rejected() {
        let (orchestrator, _dir) = test_orchestrator().await;
        let conn = orchestrator
            .save_connection(new_connection("pg1", Engine::PostgreSql, 5432))
            .await
            .expect("save");

        let err = orchestrator
            .schedule_backup(ScheduleRequest {
                connection_id: conn.id.clone(),
                cron_expr: "0 3 * * *".into(),
                retention_days: 30,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::BadCron { .. }));

        let err = orchestrator
            .schedule_backup(ScheduleRequest {
                connection_id: conn.id,
                cron_expr: "0 0 3 * * *".into(),
                retention_days: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[tokio::test]
    async fn restore_rejects_engine_mismatch() {
        let (orchestrator, _dir) = test_orchestrator().await;
        let pg = orchestrator
            .save_connection(new_connection("pg1", Engine::PostgreSql, 5432))
            .await
            .expect("save");
        let mysql = orchestrator
            .save_connection(new_connection("m1", Engine::MySql, 3306))
            .await
            .expect("save");

        let backup = Backup::begin(&pg.id, "/tmp/none.sql".into(), Utc::now());
        orchestrator.backups.create(&backup).await.expect("create");

        let err = orchestrator
            .restore_backup(&backup.id, &mysql.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[tokio::test]
    async fn redis_restores_are_rejected() {
        let (orchestrator, _dir) = test_orchestrator().await;
        let redis = orchestrator
            .save_connection(new_connection("r1", Engine::Redis, 6379))
            .await
            .expect("save");

        let backup = Backup::begin(&redis.id, "/tmp/none.sql".into(), Utc::now());
        orchestrator.backups.create(&backup).await.expect("create");

        let err = orchestrator
            .restore_backup(&backup.id, &redis.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_file_without_s3_key_is_backup_missing() {
        let (orchestrator, _dir) = test_orchestrator().await;
        let conn = orchestrator
            .save_connection(new_connection("pg1", Engine::PostgreSql, 5432))
            .await
            .expect("save");

        let backup = Backup::begin(&conn.id, "/definitely/gone.sql".into(), Utc::now());
        orchestrator.backups.create(&backup).await.expect("create");

        let err = orchestrator
            .ensure_file_available(&backup, "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::BackupMissing));
    }

    /// Installs a fake `pg_dump` ahead of PATH: writes a small dump for any
    /// database, exits 1 when asked for `baddb`. Returns the old PATH.
    #[cfg(unix)]
    fn install_fake_pg_dump(dir: &std::path::Path) -> std::ffi::OsString {
        use std::io::Write as _;
        use std::os::unix::fs::PermissionsExt;

        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).expect("bin dir");
        let tool = bin.join("pg_dump");
        let script = r##"#!/bin/sh
out=""
for a in "$@"; do
  case "$a" in
    --file=*) out="${a#--file=}" ;;
  esac
done
case "$*" in
  *baddb*) exit 1 ;;
esac
printf 'fake dump\n' > "$out"
exit 0
"##;
        std::fs::File::create(&tool)
            .and_then(|mut f| f.write_all(script.as_bytes()))
            .expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let old_path = std::env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![bin];
        paths.extend(std::env::split_paths(&old_path));
        std::env::set_var("PATH", std::env::join_paths(paths).expect("join paths"));
        old_path
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn multi_db_run_keeps_records_only_for_successful_sub_dumps() {
        let (orchestrator, dir) = test_orchestrator().await;
        let old_path = install_fake_pg_dump(dir.path());

        let mut req = new_connection("pg1", Engine::PostgreSql, 5432);
        req.selected_databases = vec!["shop".into(), "baddb".into(), "analytics".into()];
        let conn = orchestrator.save_connection(req).await.expect("save");

        // One sub-dump fails; the run still succeeds with the first backup.
        let backup = orchestrator
            .create_backup(&conn.id)
            .await
            .expect("partial multi-db run succeeds");
        assert_eq!(backup.status, BackupStatus::Completed);

        let records = orchestrator
            .backups
            .list_by_connection(&conn.id)
            .await
            .expect("list");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|b| b.status == BackupStatus::Completed));
        // The failed sub-dump left no record behind.
        assert!(!records.iter().any(|b| b.local_path.contains("baddb")));

        // A lone-database failure keeps its in_progress record visible.
        let mut single = new_connection("pg2", Engine::PostgreSql, 5432);
        single.database = "baddb".into();
        let single_conn = orchestrator.save_connection(single).await.expect("save");
        let err = orchestrator.create_backup(&single_conn.id).await.unwrap_err();
        assert!(matches!(err, BackupError::DumpFailed { .. }));
        let records = orchestrator
            .backups
            .list_by_connection(&single_conn.id)
            .await
            .expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::InProgress);

        std::env::set_var("PATH", old_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn bootstrap_runs_one_catch_up_and_notifies_on_failure() {
        let (orchestrator, _dir) = test_orchestrator().await;
        // Port 1 refuses connections, so the dump always fails fast.
        let conn = orchestrator
            .save_connection(new_connection("pg1", Engine::PostgreSql, 1))
            .await
            .expect("save");

        let schedule = orchestrator
            .schedule_backup(ScheduleRequest {
                connection_id: conn.id.clone(),
                cron_expr: "0 0 0 * * *".into(),
                retention_days: 30,
            })
            .await
            .expect("schedule");
        orchestrator.shutdown();

        // Simulate a restart that slept through the window.
        let yesterday = Utc::now() - chrono::Duration::days(1);
        orchestrator
            .schedules
            .update_after_run(&schedule.id, Some(yesterday), yesterday)
            .await
            .expect("age schedule");

        orchestrator.bootstrap().await.expect("bootstrap");

        // The catch-up runs in the background; give it a moment.
        let mut notifications = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            notifications = orchestrator
                .list_notifications("u1")
                .await
                .expect("notifications");
            if !notifications.is_empty() {
                break;
            }
        }

        // Exactly one catch-up firing, regardless of how long the process
        // was down. (A missing pg_dump yields the same failure shape.)
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].title, "Backup Failed");

        let after = orchestrator
            .schedules
            .get(&schedule.id)
            .await
            .expect("get")
            .expect("present");
        assert!(after.next_run_time.expect("next") > Utc::now());
        assert!(after.last_backup_time.is_some());

        orchestrator.shutdown();
    }
}
