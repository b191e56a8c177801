use std::path::Path;

use super::{JobSpec, ToolCommand};

pub(crate) fn dump_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool);
    cmd.arg(format!("--host={}", job.host))
        .arg(format!("--port={}", job.port))
        .arg(format!("--user={}", job.username));

    if let Some(pass) = job.password {
        cmd.secret_arg(format!("-p{pass}"), "-p********");
    }

    cmd.arg("--single-transaction")
        .arg("--routines")
        .arg("--triggers")
        .arg(format!("--result-file={}", job.path.display()))
        .arg(job.database);

    cmd
}

/// The dump is plain SQL; the client replays it from stdin.
pub(crate) fn restore_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool);
    cmd.arg(format!("--host={}", job.host))
        .arg(format!("--port={}", job.port))
        .arg(format!("--user={}", job.username));

    if let Some(pass) = job.password {
        cmd.secret_arg(format!("-p{pass}"), "-p********");
    }

    cmd.arg(job.database).stdin_file(job.path);

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databases::Engine;

    fn job<'a>(path: &'a Path) -> JobSpec<'a> {
        JobSpec {
            engine: Engine::MySql,
            host: "127.0.0.1",
            port: 3306,
            username: "root",
            password: Some("hunter2"),
            database: "crm",
            ssl: false,
            path,
        }
    }

    #[test]
    fn dump_passes_password_as_argument_but_masks_it_in_logs() {
        let path = Path::new("/backups/m1/crm_20260301_000000.sql");
        let cmd = dump_command(Path::new("mysqldump"), &job(path));
        assert!(cmd.raw_args().contains(&"-phunter2".to_string()));
        assert!(!cmd.display_line().contains("hunter2"));
        assert!(cmd.display_line().contains("-p********"));
    }

    #[test]
    fn dump_writes_through_result_file() {
        let path = Path::new("/backups/m1/crm_20260301_000000.sql");
        let cmd = dump_command(Path::new("mysqldump"), &job(path));
        assert!(cmd
            .display_line()
            .contains("--result-file=/backups/m1/crm_20260301_000000.sql"));
        assert!(cmd.display_line().contains("--single-transaction"));
    }

    #[test]
    fn restore_reads_dump_from_stdin() {
        let path = Path::new("/backups/m1/crm_20260301_000000.sql");
        let cmd = restore_command(Path::new("mysql"), &job(path));
        // The file is wired to stdin, not passed as an argument.
        assert!(!cmd.display_line().contains("crm_20260301_000000.sql"));
        assert!(cmd.display_line().ends_with("crm"));
    }
}
