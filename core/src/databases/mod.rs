use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{BackupError, Result};

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod redis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "mariadb")]
    MariaDb,
    #[serde(rename = "mongodb")]
    MongoDb,
    #[serde(rename = "redis")]
    Redis,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::PostgreSql => "postgresql",
            Engine::MySql => "mysql",
            Engine::MariaDb => "mariadb",
            Engine::MongoDb => "mongodb",
            Engine::Redis => "redis",
        }
    }

    pub fn dump_tool(&self) -> &'static str {
        match self {
            Engine::PostgreSql => "pg_dump",
            Engine::MySql | Engine::MariaDb => "mysqldump",
            Engine::MongoDb => "mongodump",
            Engine::Redis => "redis-cli",
        }
    }

    /// `None` for engines without restore support.
    pub fn restore_tool(&self) -> Option<&'static str> {
        match self {
            Engine::PostgreSql => Some("psql"),
            Engine::MySql | Engine::MariaDb => Some("mysql"),
            Engine::MongoDb => Some("mongorestore"),
            Engine::Redis => None,
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgresql" | "postgres" => Ok(Engine::PostgreSql),
            "mysql" => Ok(Engine::MySql),
            "mariadb" => Ok(Engine::MariaDb),
            "mongodb" => Ok(Engine::MongoDb),
            "redis" => Ok(Engine::Redis),
            other => Err(BackupError::Validation(format!(
                "unsupported database engine '{other}'"
            ))),
        }
    }
}

/// One dump or restore invocation against a concrete endpoint. Hosts and
/// ports are the effective ones, i.e. already rewritten to the loopback
/// forward when an SSH tunnel is in place.
pub struct JobSpec<'a> {
    pub engine: Engine,
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: Option<&'a str>,
    pub database: &'a str,
    pub ssl: bool,
    pub path: &'a Path,
}

/// Probes PATH for an executable. Absence is reported when a dump or
/// restore is attempted, never at startup.
pub fn find_tool(tool: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    for dir in env::split_paths(&paths) {
        let candidate = dir.join(tool);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

pub fn require_dump_tool(engine: Engine) -> Result<PathBuf> {
    let tool = engine.dump_tool();
    find_tool(tool).ok_or(BackupError::ToolMissing { engine, tool })
}

pub fn require_restore_tool(engine: Engine) -> Result<PathBuf> {
    let tool = engine.restore_tool().ok_or_else(|| {
        BackupError::Validation(format!("restore is not supported for {engine} backups"))
    })?;
    find_tool(tool).ok_or(BackupError::ToolMissing { engine, tool })
}

/// Argument-vector builder shared by the engine modules. Arguments are
/// handed to the process directly, never through a shell; secret positions
/// carry a masked twin so the logged command line stays free of credentials.
pub(crate) struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    display: Vec<String>,
    envs: Vec<(&'static str, String)>,
    stdin_file: Option<PathBuf>,
}

impl ToolCommand {
    pub(crate) fn new(program: &Path) -> Self {
        ToolCommand {
            program: program.to_path_buf(),
            args: Vec::new(),
            display: Vec::new(),
            envs: Vec::new(),
            stdin_file: None,
        }
    }

    pub(crate) fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        let arg = arg.into();
        self.display.push(arg.clone());
        self.args.push(arg);
        self
    }

    pub(crate) fn secret_arg(&mut self, arg: String, masked: &str) -> &mut Self {
        self.display.push(masked.to_string());
        self.args.push(arg);
        self
    }

    /// Environment variables never show up in the logged line at all.
    pub(crate) fn env(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        self.envs.push((key, value.into()));
        self
    }

    pub(crate) fn stdin_file(&mut self, path: &Path) -> &mut Self {
        self.stdin_file = Some(path.to_path_buf());
        self
    }

    pub(crate) fn display_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.display {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    #[cfg(test)]
    pub(crate) fn raw_args(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn into_command(self) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(path) = &self.stdin_file {
            cmd.stdin(Stdio::from(std::fs::File::open(path)?));
        }
        // Cancelling an on-demand operation drops the future; the external
        // process must die with it.
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

fn build_dump_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    match job.engine {
        Engine::PostgreSql => postgres::dump_command(tool, job),
        Engine::MySql | Engine::MariaDb => mysql::dump_command(tool, job),
        Engine::MongoDb => mongodb::dump_command(tool, job),
        Engine::Redis => redis::dump_command(tool, job),
    }
}

fn build_restore_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    match job.engine {
        Engine::PostgreSql => postgres::restore_command(tool, job),
        Engine::MySql | Engine::MariaDb => mysql::restore_command(tool, job),
        Engine::MongoDb => mongodb::restore_command(tool, job),
        // require_restore_tool rejects redis before dispatch
        Engine::Redis => unreachable!("redis has no restore tool"),
    }
}

/// Executes the dump tool for `job`, writing to `job.path`.
pub async fn run_dump(job: &JobSpec<'_>) -> Result<()> {
    let tool = require_dump_tool(job.engine)?;
    let line = build_dump_command(&tool, job);
    debug!("running dump: {}", line.display_line());

    let output = line.into_command()?.output().await?;
    if !output.status.success() {
        return Err(BackupError::DumpFailed {
            engine: job.engine,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Executes the restore tool for `job`, reading from `job.path`.
pub async fn run_restore(job: &JobSpec<'_>) -> Result<()> {
    let tool = require_restore_tool(job.engine)?;
    let line = build_restore_command(&tool, job);
    debug!("running restore: {}", line.display_line());

    let output = line.into_command()?.output().await?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    match job.engine {
        // psql exits non-zero on warnings too; classify before failing.
        Engine::PostgreSql => {
            if output.status.success() {
                Ok(())
            } else {
                postgres::validate_restore_output(&stderr)
            }
        }
        _ => {
            if output.status.success() {
                Ok(())
            } else {
                Err(BackupError::RestoreFailed {
                    engine: job.engine,
                    detail: stderr.trim().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_name_round_trip() {
        for engine in [
            Engine::PostgreSql,
            Engine::MySql,
            Engine::MariaDb,
            Engine::MongoDb,
            Engine::Redis,
        ] {
            assert_eq!(engine.as_str().parse::<Engine>().unwrap(), engine);
        }
    }

    #[test]
    fn unknown_engine_is_rejected_with_validation() {
        let err = "oracle".parse::<Engine>().unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[test]
    fn redis_restore_is_rejected() {
        let err = require_restore_tool(Engine::Redis).unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[test]
    fn absent_tool_is_not_found() {
        assert!(find_tool("definitely-not-a-real-dump-tool-7f3a").is_none());
    }

    #[test]
    fn display_line_masks_secret_args() {
        let mut cmd = ToolCommand::new(Path::new("mysqldump"));
        cmd.arg("--user=root")
            .secret_arg("-phunter2".into(), "-p********");
        assert_eq!(cmd.display_line(), "mysqldump --user=root -p********");
        assert_eq!(cmd.raw_args(), ["--user=root", "-phunter2"]);
    }
}
