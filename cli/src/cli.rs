use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use dbkpd_core::{Engine, EngineConfig, NewConnection, NewSshConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Scheduled database backup orchestrator", long_about = None)]
pub struct Cli {
    /// Directory holding the engine's own database
    #[arg(long, env = "DBKPD_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Root directory for local dump storage
    #[arg(long, env = "DBKPD_BACKUP_DIR", global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Secret the credential vault derives its key from
    #[arg(long, env = "DBKPD_SECRET", global = true, hide_env_values = true)]
    pub secret: Option<String>,

    /// Acting user id (connections and settings are per-user)
    #[arg(long, env = "DBKPD_USER", global = true, default_value = "local")]
    pub user: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Serve,
    /// Manage registered database connections
    Connection {
        #[command(subcommand)]
        command: ConnectionCommands,
    },
    /// Run an on-demand backup of a connection
    Backup {
        connection_id: String,
    },
    /// Restore a backup into a compatible connection
    Restore {
        backup_id: String,
        target_connection_id: String,
    },
    /// List backup records
    Backups {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long, default_value = "")]
        search: String,
    },
    /// Manage cron schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Show the notification feed
    Notifications {
        /// Mark the listed notifications as read
        #[arg(long)]
        mark_read: bool,
    },
    /// Aggregate backup statistics
    Stats,
    /// Per-user settings (S3 mirror, SMTP echo)
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Print effective settings, secrets blanked
    Show,
    /// Overwrite the S3 mirror configuration
    S3(S3SettingsArgs),
}

#[derive(Args, Debug)]
pub struct S3SettingsArgs {
    #[arg(long)]
    pub enable: bool,

    /// Host:port of the S3-compatible endpoint
    #[arg(long, default_value = "")]
    pub endpoint: String,

    #[arg(long, default_value = "")]
    pub region: String,

    #[arg(long, default_value = "")]
    pub bucket: String,

    #[arg(long, default_value = "")]
    pub access_key: String,

    #[arg(long, env = "DBKPD_S3_SECRET_KEY", default_value = "", hide_env_values = true)]
    pub secret_key: String,

    #[arg(long)]
    pub use_ssl: bool,

    #[arg(long, default_value = "")]
    pub path_prefix: String,

    /// Delete the local dump once the upload is acknowledged
    #[arg(long)]
    pub purge_local: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConnectionCommands {
    Add(AddConnectionArgs),
    List,
    Remove {
        id: String,
        /// Also delete the connection's objects from S3
        #[arg(long)]
        purge_s3: bool,
    },
    Rename {
        id: String,
        new_name: String,
    },
    /// Replace the list of extra databases dumped in the same run
    SetDatabases {
        id: String,
        /// Comma-separated database names; empty clears the list
        #[arg(default_value = "")]
        databases: String,
    },
    /// Toggle S3 object deletion when retention expires a backup
    S3Cleanup {
        id: String,
        #[arg(long)]
        enabled: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommands {
    /// Create or overwrite the schedule for a connection
    Set {
        connection_id: String,
        /// 6-field cron expression (sec min hour dom mon dow)
        #[arg(long)]
        cron: String,
        #[arg(long, default_value_t = 30)]
        retention_days: i64,
    },
    Disable {
        connection_id: String,
    },
}

#[derive(Args, Debug)]
pub struct AddConnectionArgs {
    #[arg(long)]
    pub name: String,

    /// postgresql, mysql, mariadb, mongodb or redis
    #[arg(long)]
    pub engine: String,

    #[arg(long, default_value = "localhost")]
    pub host: String,

    #[arg(long)]
    pub port: u16,

    #[arg(long, default_value = "")]
    pub username: String,

    #[arg(long, env = "DBKPD_DB_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    #[arg(long)]
    pub database: String,

    #[arg(long)]
    pub ssl: bool,

    /// Comma-separated extra databases to dump in the same run
    #[arg(long, default_value = "")]
    pub databases: String,

    /// Keep S3 objects when retention removes old records
    #[arg(long)]
    pub no_s3_cleanup: bool,

    #[arg(long)]
    pub ssh_host: Option<String>,

    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,

    #[arg(long, default_value = "")]
    pub ssh_username: String,

    #[arg(long, env = "DBKPD_SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// Path to a private key file used for the SSH tunnel
    #[arg(long)]
    pub ssh_key_file: Option<PathBuf>,
}

pub fn engine_config_from_cli(cli: &Cli) -> Result<EngineConfig> {
    let secret = cli
        .secret
        .clone()
        .ok_or_else(|| anyhow!("no vault secret configured; set DBKPD_SECRET or pass --secret"))?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dbkpd")
    });
    let backup_root = cli
        .backup_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("./backups"));

    Ok(EngineConfig {
        database_path: data_dir.join("dbkpd.db"),
        backup_root,
        encryption_secret: secret,
    })
}

pub fn connection_from_cli(args: &AddConnectionArgs, user: &str) -> Result<NewConnection> {
    let engine: Engine = args.engine.parse()?;

    let ssh = match &args.ssh_host {
        Some(host) => {
            let private_key = args
                .ssh_key_file
                .as_ref()
                .map(std::fs::read_to_string)
                .transpose()?;
            Some(NewSshConfig {
                host: host.clone(),
                port: args.ssh_port,
                username: args.ssh_username.clone(),
                password: args.ssh_password.clone(),
                private_key,
            })
        }
        None => None,
    };

    let selected_databases: Vec<String> = args
        .databases
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    Ok(NewConnection {
        name: args.name.clone(),
        engine,
        host: args.host.clone(),
        port: args.port,
        username: args.username.clone(),
        password: args.password.clone(),
        database: args.database.clone(),
        ssl: args.ssl,
        ssh,
        selected_databases,
        s3_cleanup_on_retention: !args.no_s3_cleanup,
        user_id: user.to_string(),
    })
}
