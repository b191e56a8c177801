use std::path::Path;

use crate::error::{BackupError, Result};

use super::{Engine, JobSpec, ToolCommand};

pub(crate) fn dump_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool);
    cmd.arg(format!("--host={}", job.host))
        .arg(format!("--port={}", job.port))
        .arg(format!("--username={}", job.username))
        .arg("--format=plain")
        .arg("--no-owner")
        .arg("--no-privileges")
        .arg(format!("--file={}", job.path.display()))
        .arg(job.database);

    if let Some(pass) = job.password {
        cmd.env("PGPASSWORD", pass);
    }
    if job.ssl {
        cmd.env("PGSSLMODE", "require");
    }

    cmd
}

pub(crate) fn restore_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool);
    cmd.arg(format!("--host={}", job.host))
        .arg(format!("--port={}", job.port))
        .arg(format!("--username={}", job.username))
        .arg(format!("--dbname={}", job.database))
        // Without this psql exits zero no matter how many statements failed.
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg(format!("--file={}", job.path.display()));

    if let Some(pass) = job.password {
        cmd.env("PGPASSWORD", pass);
    }
    if job.ssl {
        cmd.env("PGSSLMODE", "require");
    }

    cmd
}

const NON_CRITICAL_MARKERS: [&str; 4] = [
    "WARNING:",
    "NOTICE:",
    "must be member of role",
    "no privileges",
];

/// Classifies psql stderr after a non-zero exit.
///
/// Ownership and privilege complaints are routine when restoring across
/// clusters and do not indicate data loss; anything else carrying `ERROR:`
/// does. An `already exists` error means the target database was not empty.
pub fn validate_restore_output(stderr: &str) -> Result<()> {
    let critical: Vec<&str> = stderr
        .lines()
        .filter(|line| !NON_CRITICAL_MARKERS.iter().any(|m| line.contains(m)))
        .filter(|line| line.contains("ERROR:"))
        .collect();

    if critical.is_empty() {
        return Ok(());
    }

    if critical.iter().any(|line| line.contains("already exists")) {
        return Err(BackupError::RestoreTargetNotEmpty);
    }

    Err(BackupError::RestoreFailed {
        engine: Engine::PostgreSql,
        detail: format!("{} errors during restore", critical.len()),
    })
}
