//! Scripted host used by the pipeline tests.
//!
//! Plays systemd, the restore tool, the `mysql` client and `mysqldump`.
//! `find` (clear) and `cp` (copy) act on the real scratch directories so
//! the filesystem checks between steps see real state.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use xbval_core::config::ValidationConfig;
use xbval_core::process::{check_exit, CommandOutput, CommandRunner, Invocation, ProcessError};

pub const GALERA_INFO: &str = "6f2b1c3e-0000-11ee-9c4a-0242ac120002:1:73512\n";

#[derive(Default)]
pub struct FakeHost {
    pub calls: Mutex<Vec<Invocation>>,
    pub active: Mutex<bool>,
    /// `(database, table)` rows served by the catalog.
    pub catalog: Vec<(String, String)>,
    /// Tables whose dump exits non-zero.
    pub failing_tables: Vec<String>,
    pub fail_prepare: bool,
    /// `find` leaves the directory untouched.
    pub keep_files_on_clear: bool,
    /// Reply to `is-active` until the next `stop`, e.g. `activating`.
    pub transitional_state: Mutex<Option<&'static str>>,
}

impl FakeHost {
    pub fn with_catalog(rows: &[(&str, &str)]) -> Self {
        Self {
            catalog: rows
                .iter()
                .map(|(db, t)| (db.to_string(), t.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program.clone())
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.programs().iter().filter(|p| *p == program).count()
    }

    /// Verbs passed to `systemctl`, in order.
    pub fn systemctl_verbs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.program == "systemctl")
            .map(|c| c.args[0].clone())
            .collect()
    }

    fn systemctl(&self, inv: &Invocation) -> CommandOutput {
        let mut active = self.active.lock().unwrap();
        let mut transitional = self.transitional_state.lock().unwrap();
        match inv.args[0].as_str() {
            "is-active" => match *transitional {
                Some(state) => reply(3, &format!("{state}\n")),
                None if *active => reply(0, "active\n"),
                None => reply(3, "inactive\n"),
            },
            "stop" => {
                *transitional = None;
                *active = false;
                reply(0, "")
            }
            "start" => {
                *active = true;
                reply(0, "")
            }
            other => CommandOutput {
                exit_code: 1,
                stderr: format!("Unknown command verb {other}."),
                ..CommandOutput::default()
            },
        }
    }

    fn mysql(&self, inv: &Invocation) -> CommandOutput {
        let sql = inv
            .args
            .iter()
            .skip_while(|a| *a != "-e")
            .nth(1)
            .cloned()
            .unwrap_or_default();
        if sql == "SHOW DATABASES" {
            let mut dbs: Vec<&str> = vec!["information_schema", "mysql", "performance_schema", "sys"];
            for (db, _) in &self.catalog {
                if !dbs.contains(&db.as_str()) {
                    dbs.push(db);
                }
            }
            return reply(0, &format!("{}\n", dbs.join("\n")));
        }
        let mut rows = String::from("mysql\tuser\n");
        for (db, table) in &self.catalog {
            rows.push_str(&format!("{db}\t{table}\n"));
        }
        reply(0, &rows)
    }

    fn mysqldump(&self, inv: &Invocation) -> CommandOutput {
        if inv.args.iter().any(|a| self.failing_tables.contains(a)) {
            return CommandOutput {
                exit_code: 2,
                stderr: "mysqldump: Got error: 1146: Table doesn't exist".into(),
                ..CommandOutput::default()
            };
        }
        reply(0, "")
    }

    fn xtrabackup(&self, inv: &Invocation) -> CommandOutput {
        if self.fail_prepare && inv.args.iter().any(|a| a == "--prepare") {
            return CommandOutput {
                exit_code: 1,
                stderr: "InnoDB: Log scan aborted".into(),
                ..CommandOutput::default()
            };
        }
        reply(0, "completed OK!\n")
    }
}

impl CommandRunner for FakeHost {
    async fn run(&self, inv: &Invocation) -> Result<CommandOutput, ProcessError> {
        self.calls.lock().unwrap().push(inv.clone());
        let output = match inv.program.as_str() {
            "systemctl" => self.systemctl(inv),
            "find" => {
                if !self.keep_files_on_clear {
                    clear_dir(Path::new(&inv.args[0]));
                }
                reply(0, "")
            }
            "cp" => {
                let from = inv.args[1].trim_end_matches("/.");
                copy_dir(Path::new(from), Path::new(&inv.args[2]));
                reply(0, "")
            }
            "chown" | "gzip" => reply(0, ""),
            "xtrabackup" => self.xtrabackup(inv),
            "mysql" => self.mysql(inv),
            "mysqldump" => self.mysqldump(inv),
            _ => {
                return Err(ProcessError::Spawn {
                    command: inv.command_line(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
        };
        check_exit(inv, inv.command_line(), output)
    }
}

fn reply(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        ..CommandOutput::default()
    }
}

fn clear_dir(dir: &Path) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path).unwrap();
        } else {
            std::fs::remove_file(&path).unwrap();
        }
    }
}

fn copy_dir(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Scratch layout: `data/`, `backups/<cluster>/latest/...`, `stats/`.
pub struct Sandbox {
    pub root: tempfile::TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("data")).expect("data dir");
        std::fs::create_dir_all(root.path().join("backups")).expect("backup dir");
        Self { root }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.path().join("data")
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.root.path().join("stats")
    }

    /// Create `backups/<cluster>/latest` with one directory per database,
    /// a table file in each and the galera metadata file. Returns the
    /// total byte size written.
    pub fn add_backup(&self, cluster: &str, databases: &[&str]) -> u64 {
        let latest = self.root.path().join("backups").join(cluster).join("latest");
        let mut size = 0;
        for db in databases {
            let dir = latest.join(db);
            std::fs::create_dir_all(&dir).expect("db dir");
            let page = vec![0u8; 4096];
            std::fs::write(dir.join("t1.ibd.qp"), &page).expect("table file");
            size += page.len() as u64;
        }
        std::fs::create_dir_all(latest.join("mysql")).expect("mysql dir");
        std::fs::write(latest.join("ibdata1.qp"), b"ibdata").expect("ibdata");
        std::fs::write(latest.join("xtrabackup_galera_info"), GALERA_INFO).expect("galera info");
        size + 6 + GALERA_INFO.len() as u64
    }

    pub fn config(&self, clusters: &str, extra: &[(&str, &str)]) -> ValidationConfig {
        let mut pairs: HashMap<String, String> = BTreeMap::from([
            ("MYSQL_DATA_DIR", self.data_dir().display().to_string()),
            ("BACKUP_DIR", self.root.path().join("backups").display().to_string()),
            ("CLUSTER_NAMES", clusters.to_string()),
            ("STATS_DIR", self.stats_dir().display().to_string()),
            ("SERVICE_SETTLE_SECS", "0".to_string()),
            ("PRIVILEGE_WRAPPER", String::new()),
        ])
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        for (k, v) in extra {
            pairs.insert(k.to_string(), v.to_string());
        }
        ValidationConfig::from_pairs(pairs).expect("config")
    }
}
