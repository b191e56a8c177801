use std::path::Path;

use super::{JobSpec, ToolCommand};

/// `mongodump` writes a BSON tree under `--out`; the spool path therefore
/// becomes a directory, and it is the same directory `mongorestore --dir`
/// reads back.
pub(crate) fn dump_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool);
    cmd.arg("--host")
        .arg(job.host)
        .arg("--port")
        .arg(job.port.to_string());

    add_auth(&mut cmd, job);

    cmd.arg("--db")
        .arg(job.database)
        .arg("--out")
        .arg(job.path.display().to_string());

    cmd
}

pub(crate) fn restore_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool);
    cmd.arg("--host")
        .arg(job.host)
        .arg("--port")
        .arg(job.port.to_string());

    add_auth(&mut cmd, job);

    cmd.arg("--dir").arg(job.path.display().to_string());

    cmd
}

fn add_auth(cmd: &mut ToolCommand, job: &JobSpec<'_>) {
    if !job.username.is_empty() {
        cmd.arg("--username").arg(job.username);
    }
    if let Some(pass) = job.password {
        cmd.arg("--password").secret_arg(pass.to_string(), "********");
        cmd.arg("--authenticationDatabase").arg("admin");
    }
    if job.ssl {
        cmd.arg("--ssl");
    }
}
