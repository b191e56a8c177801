use anyhow::Result;
use clap::Parser;
use cli::{
    connection_from_cli, engine_config_from_cli, Cli, Commands, ConnectionCommands,
    ScheduleCommands, SettingsCommands,
};
use dbkpd_core::{Orchestrator, ScheduleRequest, UserSettings};
use log::info;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = engine_config_from_cli(&cli)?;
    let orchestrator = Orchestrator::new(&config).await?;

    match cli.command {
        Commands::Serve => {
            orchestrator.bootstrap().await?;
            info!("scheduler running; press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            orchestrator.shutdown();
            info!("scheduler stopped");
        }
        Commands::Connection { command } => match command {
            ConnectionCommands::Add(args) => {
                let request = connection_from_cli(&args, &cli.user)?;
                let conn = orchestrator.save_connection(request).await?;
                println!("Connection created: {} ({})", conn.id, conn.name);
            }
            ConnectionCommands::List => {
                let connections = orchestrator.list_connections(&cli.user).await?;
                if connections.is_empty() {
                    println!("No connections registered");
                }
                for conn in connections {
                    let schedule = conn
                        .cron_expr
                        .as_deref()
                        .map(|cron| format!(", schedule '{cron}'"))
                        .unwrap_or_default();
                    let last = conn
                        .last_backup_time
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".into());
                    println!(
                        "  {}  {}  {}://{}:{}/{} (last backup: {last}{schedule})",
                        conn.id, conn.name, conn.engine, conn.host, conn.port, conn.database
                    );
                }
            }
            ConnectionCommands::Remove { id, purge_s3 } => {
                orchestrator.delete_connection(&id, purge_s3).await?;
                println!("Connection deleted: {id}");
            }
            ConnectionCommands::Rename { id, new_name } => {
                orchestrator.rename_connection(&id, &new_name).await?;
                println!("Connection renamed: {id} -> {new_name}");
            }
            ConnectionCommands::SetDatabases { id, databases } => {
                let list: Vec<String> = databases
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                orchestrator.update_selected_databases(&id, &list).await?;
                if list.is_empty() {
                    println!("Connection {id} now dumps only its default database");
                } else {
                    println!("Connection {id} now also dumps: {}", list.join(", "));
                }
            }
            ConnectionCommands::S3Cleanup { id, enabled } => {
                orchestrator.update_s3_cleanup_flag(&id, enabled).await?;
                println!("S3 retention cleanup for {id}: {enabled}");
            }
        },
        Commands::Backup { connection_id } => {
            let backup = orchestrator.create_backup(&connection_id).await?;
            println!(
                "Backup completed: {} ({} bytes) at {}",
                backup.id, backup.size_bytes, backup.local_path
            );
            if let Some(key) = backup.s3_object_key {
                println!("Mirrored to s3 object: {key}");
            }
        }
        Commands::Restore {
            backup_id,
            target_connection_id,
        } => {
            orchestrator
                .restore_backup(&backup_id, &target_connection_id)
                .await?;
            println!("Restore completed into connection {target_connection_id}");
        }
        Commands::Backups {
            limit,
            offset,
            search,
        } => {
            let (backups, total) = orchestrator
                .list_backups(&cli.user, limit, offset, &search)
                .await?;
            println!("{} of {total} backups:", backups.len());
            for backup in backups {
                println!(
                    "  {}  {}  {}  {} bytes  {}",
                    backup.id,
                    backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                    backup.status,
                    backup.size_bytes,
                    backup.local_path
                );
            }
        }
        Commands::Schedule { command } => match command {
            ScheduleCommands::Set {
                connection_id,
                cron,
                retention_days,
            } => {
                let schedule = orchestrator
                    .schedule_backup(ScheduleRequest {
                        connection_id,
                        cron_expr: cron,
                        retention_days,
                    })
                    .await?;
                let next = schedule
                    .next_run_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "unknown".into());
                println!("Schedule active, next run {next}");
                // The in-process job dies with this invocation; `serve`
                // keeps it alive.
                orchestrator.shutdown();
            }
            ScheduleCommands::Disable { connection_id } => {
                orchestrator.disable_backup_schedule(&connection_id).await?;
                println!("Schedule disabled for connection {connection_id}");
            }
        },
        Commands::Notifications { mark_read } => {
            let notifications = orchestrator.list_notifications(&cli.user).await?;
            if notifications.is_empty() {
                println!("No notifications");
            }
            let ids: Vec<String> = notifications.iter().map(|n| n.id.clone()).collect();
            for n in notifications {
                let marker = if n.unread { "*" } else { " " };
                println!(
                    "{marker} [{}] {}: {}",
                    n.created_at.format("%Y-%m-%d %H:%M"),
                    n.title,
                    n.message
                );
            }
            if mark_read && !ids.is_empty() {
                orchestrator.mark_notifications_read(&cli.user, &ids).await?;
                println!("Marked {} notifications as read", ids.len());
            }
        }
        Commands::Stats => {
            let stats = orchestrator.backup_stats(&cli.user).await?;
            println!("Backups:       {}", stats.total);
            println!("Failed:        {}", stats.failed);
            println!("Total size:    {} bytes", stats.total_size);
            println!("Avg duration:  {:.1} min", stats.avg_duration_minutes);
            println!("Success rate:  {:.0}%", stats.success_rate_percent);
        }
        Commands::Settings { command } => match command {
            SettingsCommands::Show => {
                let (settings, env_managed) = orchestrator.get_user_settings(&cli.user).await?;
                println!("S3 enabled:    {}", settings.s3_enabled);
                println!("S3 endpoint:   {}", settings.s3_endpoint);
                println!("S3 bucket:     {}", settings.s3_bucket);
                println!("S3 prefix:     {}", settings.s3_path_prefix);
                println!("S3 purge:      {}", settings.s3_purge_local);
                println!("SMTP host:     {}", settings.smtp_host);
                if !env_managed.is_empty() {
                    println!("Env-managed (read-only): {}", env_managed.join(", "));
                }
            }
            SettingsCommands::S3(args) => {
                let mut settings = UserSettings::empty(&cli.user);
                settings.s3_enabled = args.enable;
                settings.s3_endpoint = args.endpoint;
                settings.s3_region = args.region;
                settings.s3_bucket = args.bucket;
                settings.s3_access_key = args.access_key;
                settings.s3_secret_key = args.secret_key;
                settings.s3_use_ssl = args.use_ssl;
                settings.s3_path_prefix = args.path_prefix;
                settings.s3_purge_local = args.purge_local;
                orchestrator.set_user_settings(settings).await?;
                println!("S3 settings saved");
            }
        },
    };

    Ok(())
}
