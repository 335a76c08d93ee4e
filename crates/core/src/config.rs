//! Validation settings loaded from a `KEY=value` file.
//!
//! The file is parsed with `dotenvy`: `#` comments and blank lines are
//! skipped, values may be quoted, unknown keys are ignored.
//!
//! | Key                    | Required | Default                          |
//! |------------------------|----------|----------------------------------|
//! | `MYSQL_DATA_DIR`       | yes      | --                               |
//! | `BACKUP_DIR`           | yes      | --                               |
//! | `CLUSTER_NAMES`        | yes      | --                               |
//! | `STATS_DIR`            | no       | `/var/log/backup_validation`     |
//! | `TRUE_DUMP`            | no       | `false`                          |
//! | `TRUE_DUMP_DIR`        | no       | `/test_dump`                     |
//! | `ARCHIVE_DUMPS`        | no       | `false`                          |
//! | `MYSQL_SERVICE`        | no       | `mysql`                          |
//! | `MYSQL_USER`           | no       | `mysql`                          |
//! | `PROTECTED_PATHS`      | no       | `/home,/etc,/var,/usr,/bin,/sbin`|
//! | `PRIVILEGE_WRAPPER`    | no       | `sudo` (empty disables)          |
//! | `XTRABACKUP_BIN`       | no       | `xtrabackup`                     |
//! | `MYSQL_BIN`            | no       | `mysql`                          |
//! | `MYSQLDUMP_BIN`        | no       | `mysqldump`                      |
//! | `DUMP_WORKERS`         | no       | `20`                             |
//! | `DUMP_QUEUE_CAPACITY`  | no       | `20`                             |
//! | `DUMP_BATCHES`         | no       | `0` (one task per table)         |
//! | `DUMP_TIMEOUT_SECS`    | no       | `3600`                           |
//! | `DUMP_OPTIONS`         | no       | data-only option set             |
//! | `SERVICE_TIMEOUT_SECS` | no       | `60`                             |
//! | `SERVICE_SETTLE_SECS`  | no       | `2`                              |
//! | `CLEAR_TIMEOUT_SECS`   | no       | `120`                            |
//! | `COPY_TIMEOUT_SECS`    | no       | `7200`                           |
//! | `RESTORE_TIMEOUT_SECS` | no       | `14400`                          |
//! | `REQUIRE_GALERA_INFO`  | no       | `true`                           |
//!
//! Cluster names must be unique. The `*_TIMEOUT_SECS` values must be
//! non-zero; `SERVICE_SETTLE_SECS=0` disables the settle delay.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cluster::{is_valid_cluster_name, Cluster};
use crate::dump::task::DEFAULT_DUMP_OPTIONS;
use crate::dump::DumpSettings;
use crate::fs_guard::{self, FilesystemGuard, FsGuardError, DEFAULT_PROTECTED_PATHS};
use crate::process::SystemRunner;
use crate::restore::GaleraPolicy;
use crate::service::is_safe_service_name;

const DEFAULT_STATS_DIR: &str = "/var/log/backup_validation";
const DEFAULT_DUMP_DIR: &str = "/test_dump";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key}: {source}")]
    Path {
        key: &'static str,
        #[source]
        source: FsGuardError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    pub mysql_data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub cluster_names: Vec<String>,
    pub stats_dir: PathBuf,
    pub keep_dumps: bool,
    pub dump_dir: PathBuf,
    pub archive_dumps: bool,
    pub service_name: String,
    pub service_account: String,
    pub protected_paths: Vec<PathBuf>,
    pub privilege_wrapper: Option<String>,
    pub xtrabackup_bin: String,
    pub mysql_bin: String,
    pub mysqldump_bin: String,
    pub dump_workers: usize,
    pub dump_queue_capacity: usize,
    pub dump_batches: usize,
    pub dump_timeout: Duration,
    pub dump_options: Vec<String>,
    pub service_timeout: Duration,
    pub settle_delay: Duration,
    pub clear_timeout: Duration,
    pub copy_timeout: Duration,
    pub restore_timeout: Duration,
    pub galera_policy: GaleraPolicy,
}

impl ValidationConfig {
    /// Load and validate settings from a `KEY=value` file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let read_err = |source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut pairs = HashMap::new();
        for item in dotenvy::from_path_iter(path).map_err(read_err)? {
            let (key, value) = item.map_err(read_err)?;
            pairs.insert(key, value);
        }
        Self::from_pairs(pairs)
    }

    /// Build settings from already-parsed pairs. Unknown keys are ignored.
    pub fn from_pairs(pairs: HashMap<String, String>) -> Result<Self, ConfigError> {
        let settings = Settings(pairs);

        let mysql_data_dir = settings.required_dir("MYSQL_DATA_DIR")?;
        let backup_dir = settings.required_dir("BACKUP_DIR")?;

        let cluster_names = settings.list("CLUSTER_NAMES", ',');
        if cluster_names.is_empty() {
            return Err(ConfigError::Missing("CLUSTER_NAMES"));
        }
        if let Some(bad) = cluster_names.iter().find(|n| !is_valid_cluster_name(n)) {
            return Err(ConfigError::Invalid {
                key: "CLUSTER_NAMES",
                value: bad.clone(),
                reason: "cluster names may only contain alphanumeric, '-', '_' or '.'".into(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(dup) = cluster_names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(ConfigError::Invalid {
                key: "CLUSTER_NAMES",
                value: dup.clone(),
                reason: "duplicate cluster name".into(),
            });
        }

        let service_name = settings.string("MYSQL_SERVICE", "mysql");
        if !is_safe_service_name(&service_name) {
            return Err(ConfigError::Invalid {
                key: "MYSQL_SERVICE",
                value: service_name,
                reason: "not a valid unit name".into(),
            });
        }

        let protected_paths = match settings.get("PROTECTED_PATHS") {
            Some(_) => settings.list("PROTECTED_PATHS", ','),
            None => DEFAULT_PROTECTED_PATHS.iter().map(|s| s.to_string()).collect(),
        }
        .into_iter()
        .map(PathBuf::from)
        .collect();

        let dump_options = match settings.get("DUMP_OPTIONS") {
            Some(_) => settings.list("DUMP_OPTIONS", ' '),
            None => DEFAULT_DUMP_OPTIONS.iter().map(|s| s.to_string()).collect(),
        };

        let privilege_wrapper = Some(settings.string("PRIVILEGE_WRAPPER", "sudo"))
            .filter(|w| !w.is_empty());

        let galera_policy = if settings.flag("REQUIRE_GALERA_INFO", true)? {
            GaleraPolicy::Required
        } else {
            GaleraPolicy::Optional
        };

        Ok(Self {
            mysql_data_dir,
            backup_dir,
            cluster_names,
            stats_dir: PathBuf::from(settings.string("STATS_DIR", DEFAULT_STATS_DIR)),
            keep_dumps: settings.flag("TRUE_DUMP", false)?,
            dump_dir: PathBuf::from(settings.string("TRUE_DUMP_DIR", DEFAULT_DUMP_DIR)),
            archive_dumps: settings.flag("ARCHIVE_DUMPS", false)?,
            service_name,
            service_account: settings.string("MYSQL_USER", "mysql"),
            protected_paths,
            privilege_wrapper,
            xtrabackup_bin: settings.string("XTRABACKUP_BIN", "xtrabackup"),
            mysql_bin: settings.string("MYSQL_BIN", "mysql"),
            mysqldump_bin: settings.string("MYSQLDUMP_BIN", "mysqldump"),
            dump_workers: settings.number("DUMP_WORKERS", 20)?,
            dump_queue_capacity: settings.number("DUMP_QUEUE_CAPACITY", 20)?,
            dump_batches: settings.number("DUMP_BATCHES", 0)?,
            dump_timeout: settings.timeout("DUMP_TIMEOUT_SECS", 3600)?,
            dump_options,
            service_timeout: settings.timeout("SERVICE_TIMEOUT_SECS", 60)?,
            settle_delay: settings.seconds("SERVICE_SETTLE_SECS", 2)?,
            clear_timeout: settings.timeout("CLEAR_TIMEOUT_SECS", 120)?,
            copy_timeout: settings.timeout("COPY_TIMEOUT_SECS", 7200)?,
            restore_timeout: settings.timeout("RESTORE_TIMEOUT_SECS", 14_400)?,
            galera_policy,
        })
    }

    /// One [`Cluster`] per configured name, in configuration order.
    pub fn clusters(&self) -> Vec<Cluster> {
        self.cluster_names
            .iter()
            .map(|name| {
                Cluster::new(
                    name.clone(),
                    self.mysql_data_dir.clone(),
                    self.backup_dir.clone(),
                    self.service_account.clone(),
                )
            })
            .collect()
    }

    /// Directory for kept dumps, if dumps are kept.
    pub fn kept_dump_dir(&self) -> Option<PathBuf> {
        self.keep_dumps.then(|| self.dump_dir.clone())
    }

    pub fn guard(&self) -> FilesystemGuard {
        FilesystemGuard::new(self.protected_paths.iter().cloned())
    }

    pub fn runner(&self) -> SystemRunner {
        SystemRunner::new(self.privilege_wrapper.clone())
    }

    pub fn dump_settings(&self) -> DumpSettings {
        DumpSettings {
            mysql: self.mysql_bin.clone(),
            mysqldump: self.mysqldump_bin.clone(),
            params: self.dump_options.clone(),
            max_workers: self.dump_workers,
            queue_capacity: self.dump_queue_capacity,
            batches: self.dump_batches,
            task_timeout: self.dump_timeout,
            dump_dir: self.kept_dump_dir(),
            archive: self.keep_dumps && self.archive_dumps,
        }
    }
}

/// Raw key/value pairs with typed accessors.
struct Settings(HashMap<String, String>);

impl Settings {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn list(&self, key: &str, sep: char) -> Vec<String> {
        self.get(key)
            .unwrap_or_default()
            .split(sep)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn required_dir(&self, key: &'static str) -> Result<PathBuf, ConfigError> {
        let value = self
            .get(key)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(key))?;
        let path = PathBuf::from(value);
        fs_guard::ensure_dir(&path).map_err(|source| ConfigError::Path { key, source })?;
        Ok(path)
    }

    fn number<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None | Some("") => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn seconds(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.number(key, default).map(Duration::from_secs)
    }

    /// Like [`Settings::seconds`], but zero is rejected.
    fn timeout(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let timeout = self.seconds(key, default)?;
        if timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key,
                value: "0".into(),
                reason: "timeout must be greater than zero".into(),
            });
        }
        Ok(timeout)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            None | Some("") => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                key,
                value: other.to_string(),
                reason: "expected a boolean".into(),
            }),
        }
    }
}
