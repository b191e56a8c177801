use std::path::Path;

use super::{JobSpec, ToolCommand};

/// Redis only supports dumps: `redis-cli --rdb` snapshots the keyspace.
/// Restores are rejected upstream in `require_restore_tool`.
pub(crate) fn dump_command(tool: &Path, job: &JobSpec<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool);
    cmd.arg("-h").arg(job.host).arg("-p").arg(job.port.to_string());

    if let Some(pass) = job.password {
        cmd.arg("-a").secret_arg(pass.to_string(), "********");
    }
    if job.ssl {
        cmd.arg("--tls");
    }

    cmd.arg("--rdb").arg(job.path.display().to_string());

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databases::Engine;

    #[test]
    fn dump_snapshots_to_rdb() {
        let path = Path::new("/backups/r1/0_20260301_000000.sql");
        let job = JobSpec {
            engine: Engine::Redis,
            host: "cache.internal",
            port: 6380,
            username: "",
            password: Some("hunter2"),
            database: "0",
            ssl: true,
            path,
        };
        let cmd = dump_command(Path::new("redis-cli"), &job);
        let line = cmd.display_line();
        assert!(line.contains("-h cache.internal"));
        assert!(line.contains("-p 6380"));
        assert!(line.contains("--tls"));
        assert!(line.contains("--rdb /backups/r1/0_20260301_000000.sql"));
        assert!(!line.contains("hunter2"));
    }
}
