//! Cluster identity, backup snapshots and per-run metrics.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs_guard::{self, FsGuardError};

/// Name of the pointer directory holding the most recent backup.
pub const LATEST_DIR: &str = "latest";

/// Engine-internal schemas never compared or dumped.
pub const EXCLUDED_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// Maximum length of a cluster name.
const MAX_NAME_LEN: usize = 64;

pub fn is_excluded_schema(name: &str) -> bool {
    EXCLUDED_SCHEMAS.contains(&name)
}

/// Cluster names become path components and report keys, so they are
/// restricted to alphanumeric, hyphen, underscore and dot (not leading).
pub fn is_valid_cluster_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Undo the server's filename encoding, where each character outside
/// `[A-Za-z0-9_$]` is written as `@` and four hex digits (`my@002ddb` is
/// `my-db`). Sequences that are not a valid escape are kept verbatim.
pub fn decode_dir_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let decoded = rest
            .get(at + 1..at + 5)
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32);
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[at + 5..];
            }
            None => {
                out.push('@');
                rest = &rest[at + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// One cluster to validate. Exactly one `Cluster` drives one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub data_dir: PathBuf,
    pub backup_root: PathBuf,
    pub service_account: String,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        backup_root: impl Into<PathBuf>,
        service_account: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            backup_root: backup_root.into(),
            service_account: service_account.into(),
        }
    }

    /// `<backup_root>/<name>/latest`
    pub fn snapshot_path(&self) -> PathBuf {
        self.backup_root.join(&self.name).join(LATEST_DIR)
    }
}

/// Metrics captured for one cluster during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterMetrics {
    /// `0` when every step succeeded, `1` otherwise.
    pub exit_code: i32,
    pub duration: Duration,
    pub restore_duration: Duration,
    /// Byte size of the backup snapshot.
    pub size: u64,
}

impl ClusterMetrics {
    /// Entry for a cluster whose pipeline never ran to completion.
    pub fn failed() -> Self {
        Self {
            exit_code: 1,
            ..Self::default()
        }
    }
}

/// The read-only `latest` backup of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub cluster: String,
    pub path: PathBuf,
}

impl BackupSnapshot {
    /// Locate the snapshot for `cluster`, failing if it is not a directory.
    pub fn locate(cluster: &Cluster) -> Result<Self, FsGuardError> {
        let path = cluster.snapshot_path();
        fs_guard::ensure_dir(&path)?;
        Ok(Self {
            cluster: cluster.name.clone(),
            path,
        })
    }

    /// Top-level database directories, excluding engine-internal schemas and
    /// engine bookkeeping directories (`#innodb_redo`, dot-directories).
    /// Names are returned decoded, as the server reports them.
    pub fn database_names(&self) -> Result<BTreeSet<String>, FsGuardError> {
        let io_err = |source| FsGuardError::Io {
            path: self.path.clone(),
            source,
        };
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(&self.path).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            let raw = entry.file_name().to_string_lossy().into_owned();
            if raw.starts_with('#') || raw.starts_with('.') {
                continue;
            }
            let name = decode_dir_name(&raw);
            if is_excluded_schema(&name) {
                continue;
            }
            names.insert(name);
        }
        Ok(names)
    }

    /// Total byte size of all regular files in the snapshot.
    pub fn size_bytes(&self) -> Result<u64, FsGuardError> {
        dir_size(&self.path)
    }
}

fn dir_size(path: &Path) -> Result<u64, FsGuardError> {
    let io_err = |source| FsGuardError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut total = 0;
    for entry in std::fs::read_dir(path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let file_type = entry.file_type().map_err(io_err)?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata().map_err(io_err)?.len();
        }
    }
    Ok(total)
}

/// Render a duration as `HH:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_fixture() -> (tempfile::TempDir, Cluster) {
        let root = tempfile::tempdir().expect("tempdir");
        let latest = root.path().join("demo").join(LATEST_DIR);
        for dir in ["app", "crm", "mysql", "sys", "performance_schema", "#innodb_redo"] {
            std::fs::create_dir_all(latest.join(dir)).expect("mkdir");
        }
        std::fs::write(latest.join("ibdata1"), vec![0u8; 100]).expect("write");
        std::fs::write(latest.join("app").join("t1.ibd"), vec![0u8; 28]).expect("write");
        let cluster = Cluster::new("demo", "/data/mysql", root.path(), "mysql");
        (root, cluster)
    }

    #[test]
    fn snapshot_lists_user_databases_only() {
        let (_root, cluster) = snapshot_fixture();
        let snap = BackupSnapshot::locate(&cluster).expect("locate");
        let names: Vec<_> = snap.database_names().expect("names").into_iter().collect();
        assert_eq!(names, ["app", "crm"]);
    }

    #[test]
    fn encoded_database_dirs_are_decoded() {
        let (root, cluster) = snapshot_fixture();
        let latest = root.path().join("demo").join(LATEST_DIR);
        for dir in ["my@002ddb", "caf@00e9", "odd@zz"] {
            std::fs::create_dir_all(latest.join(dir)).expect("mkdir");
        }
        let snap = BackupSnapshot::locate(&cluster).expect("locate");
        let names: Vec<_> = snap.database_names().expect("names").into_iter().collect();
        assert_eq!(names, ["app", "café", "crm", "my-db", "odd@zz"]);
    }

    #[test]
    fn dir_name_decoding() {
        assert_eq!(decode_dir_name("plain_db"), "plain_db");
        assert_eq!(decode_dir_name("a@002eb@002dc"), "a.b-c");
        assert_eq!(decode_dir_name("tail@00"), "tail@00");
        assert_eq!(decode_dir_name("@0040"), "@");
    }

    #[test]
    fn snapshot_size_sums_nested_files() {
        let (_root, cluster) = snapshot_fixture();
        let snap = BackupSnapshot::locate(&cluster).expect("locate");
        assert_eq!(snap.size_bytes().expect("size"), 128);
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let root = tempfile::tempdir().expect("tempdir");
        let cluster = Cluster::new("ghost", "/data/mysql", root.path(), "mysql");
        assert!(matches!(
            BackupSnapshot::locate(&cluster),
            Err(FsGuardError::PathNotFound(_))
        ));
    }

    #[test]
    fn cluster_name_validation() {
        assert!(is_valid_cluster_name("crm_prod"));
        assert!(is_valid_cluster_name("any-test.db"));
        assert!(!is_valid_cluster_name(""));
        assert!(!is_valid_cluster_name(".."));
        assert!(!is_valid_cluster_name("a/b"));
        assert!(!is_valid_cluster_name("crm prod"));
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(format_duration(Duration::from_secs(100 * 3600)), "100:00:00");
    }
}
