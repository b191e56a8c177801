use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;

use crate::error::Result;

/// Timestamp suffix embedded in dump file names, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Projects an arbitrary connection name into `[A-Za-z0-9._-]+`.
///
/// Runs of disallowed characters collapse into a single `_`; the result is
/// capped at 255 bytes and is a fixed point of the function.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_replaced = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            prev_replaced = false;
        } else if !prev_replaced {
            out.push('_');
            prev_replaced = true;
        }
    }

    // Sanitized output is pure ASCII, so byte truncation is char-safe.
    out.truncate(255);
    out
}

/// Local dump storage: one subfolder per connection under a fixed root,
/// `<root>/<sanitized-connection-name>/<db>_<timestamp>.sql`.
#[derive(Clone)]
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Spool { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the per-connection folder if missing and returns it.
    pub fn prepare_dir(&self, connection_name: &str) -> Result<PathBuf> {
        let dir = self.root.join(sanitize(connection_name));
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(dir)
    }

    pub fn dump_path(
        &self,
        connection_name: &str,
        database: &str,
        at: DateTime<Utc>,
    ) -> PathBuf {
        self.root.join(sanitize(connection_name)).join(format!(
            "{}_{}.sql",
            sanitize(database),
            at.format(TIMESTAMP_FORMAT)
        ))
    }

    /// Best-effort removal of a dump file (or directory, for engines that
    /// dump into one). The backup record stays authoritative either way; a
    /// missing file is recovered from S3 at read time.
    pub fn remove(&self, path: &Path) {
        let outcome = match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(_) => return,
        };
        if let Err(e) = outcome {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }

    /// Best-effort rename of a per-connection folder after a connection
    /// rename. Records keep their old `local_path` until rewritten.
    pub fn rename_dir(&self, old_name: &str, new_name: &str) {
        let old = self.root.join(sanitize(old_name));
        let new = self.root.join(sanitize(new_name));
        if old == new || !old.exists() {
            return;
        }
        if let Err(e) = fs::rename(&old, &new) {
            warn!(
                "failed to rename spool folder {} -> {}: {}",
                old.display(),
                new.display(),
                e
            );
        }
    }

    /// Size in bytes of a dump at `path`; directories are walked recursively.
    pub fn dump_size(&self, path: &Path) -> u64 {
        fn walk(path: &Path) -> u64 {
            let Ok(meta) = fs::metadata(path) else {
                return 0;
            };
            if meta.is_file() {
                return meta.len();
            }
            let Ok(entries) = fs::read_dir(path) else {
                return 0;
            };
            entries.flatten().map(|entry| walk(&entry.path())).sum()
        }
        walk(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize("My Shop DB"), "My_Shop_DB");
        assert_eq!(sanitize("New Name!!"), "New_Name_");
        assert_eq!(sanitize("a//b??c"), "a_b_c");
        assert_eq!(sanitize("plain-name_1.0"), "plain-name_1.0");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["My Shop DB", "äöü::x", "  spaced  ", "a_?b"] {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn sanitize_output_charset() {
        let out = sanitize("prod db (replica) #2 + eu/west");
        assert!(out
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(1000);
        assert_eq!(sanitize(&long).len(), 255);
    }

    #[test]
    fn dump_path_layout() {
        let spool = Spool::new("/var/backups");
        let at = chrono::DateTime::parse_from_rfc3339("2026-03-01T04:05:06Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            spool.dump_path("pg one", "shop", at),
            PathBuf::from("/var/backups/pg_one/shop_20260301_040506.sql")
        );
    }

    #[test]
    fn prepare_dir_creates_folder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(tmp.path());
        let dir = spool.prepare_dir("some conn").expect("prepare");
        assert!(dir.is_dir());
        assert!(dir.ends_with("some_conn"));
    }

    #[test]
    fn remove_tolerates_missing_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(tmp.path());
        spool.remove(&tmp.path().join("nope.sql"));
    }

    #[test]
    fn rename_dir_moves_the_folder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(tmp.path());
        spool.prepare_dir("old name").expect("prepare");
        spool.rename_dir("old name", "New Name!!");
        assert!(!tmp.path().join("old_name").exists());
        assert!(tmp.path().join("New_Name_").is_dir());
    }

    #[test]
    fn dump_size_walks_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let spool = Spool::new(tmp.path());
        let dir = tmp.path().join("dump");
        fs::create_dir(&dir).unwrap();
        let mut f = fs::File::create(dir.join("a.bson")).unwrap();
        f.write_all(b"0123456789").unwrap();
        let mut g = fs::File::create(dir.join("b.bson")).unwrap();
        g.write_all(b"01234").unwrap();
        assert_eq!(spool.dump_size(&dir), 15);
    }
}
