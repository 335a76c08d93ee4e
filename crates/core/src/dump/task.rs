//! Verification task construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::Invocation;

use super::catalog::DatabaseTables;

/// Data-only options applied to every per-table dump.
pub const DEFAULT_DUMP_OPTIONS: &[&str] = &[
    "--no-create-info",
    "--single-transaction",
    "--set-gtid-purged=OFF",
    "--skip-triggers",
    "--compact",
    "--complete-insert",
];

/// Options for the whole-instance schema dump.
pub const SCHEMA_DUMP_OPTIONS: &[&str] = &["--no-data", "--all-databases", "--single-transaction"];

/// Sink used when dumps are verified but not kept.
const DISCARD_PATH: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpScope {
    /// Schema-only dump of the whole instance.
    Schema,
    /// Data of one or more tables of a single database.
    Tables { database: String, tables: Vec<String> },
}

/// One dump to run. Immutable once built; consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationTask {
    pub scope: DumpScope,
    pub params: Vec<String>,
    /// Where the dump is written; `None` discards it.
    pub output_file: Option<PathBuf>,
}

impl VerificationTask {
    pub fn schema(cluster: &str, dump_dir: Option<&Path>) -> Self {
        Self {
            scope: DumpScope::Schema,
            params: SCHEMA_DUMP_OPTIONS.iter().map(|s| s.to_string()).collect(),
            output_file: dump_dir.map(|dir| dir.join(format!("schema_only_{cluster}.dump"))),
        }
    }

    pub fn tables(
        cluster: &str,
        database: &str,
        tables: Vec<String>,
        params: &[String],
        dump_dir: Option<&Path>,
    ) -> Self {
        let first = tables.first().map(String::as_str).unwrap_or_default();
        let output_file = dump_dir.map(|dir| dir.join(format!("{cluster}_{database}_{first}.dump")));
        Self {
            scope: DumpScope::Tables {
                database: database.to_string(),
                tables,
            },
            params: params.to_vec(),
            output_file,
        }
    }

    /// The `mysqldump` invocation for this task, run as root.
    pub fn invocation(&self, mysqldump: &str, timeout: Duration) -> Invocation {
        let mut inv = Invocation::new(mysqldump, timeout).args(self.params.iter().cloned());
        if let DumpScope::Tables { database, tables } = &self.scope {
            inv = inv
                .arg(database.clone())
                .arg("--tables")
                .args(tables.iter().cloned());
        }
        let sink = self
            .output_file
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| DISCARD_PATH.to_string());
        inv.arg(format!("--result-file={sink}")).as_user("root")
    }
}

impl fmt::Display for VerificationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            DumpScope::Schema => f.write_str("schema"),
            DumpScope::Tables { database, tables } => {
                write!(f, "{database}.{}", tables.join(","))
            }
        }
    }
}

/// One task per table.
pub fn build_tasks(
    cluster: &str,
    catalog: &[DatabaseTables],
    params: &[String],
    dump_dir: Option<&Path>,
) -> Vec<VerificationTask> {
    catalog
        .iter()
        .flat_map(|db| {
            db.tables.iter().map(move |table| {
                VerificationTask::tables(cluster, &db.database, vec![table.clone()], params, dump_dir)
            })
        })
        .collect()
}

/// Up to `batches` tasks per database, tables dealt round-robin.
pub fn build_batched_tasks(
    cluster: &str,
    catalog: &[DatabaseTables],
    params: &[String],
    dump_dir: Option<&Path>,
    batches: usize,
) -> Vec<VerificationTask> {
    catalog
        .iter()
        .flat_map(|db| {
            partition_round_robin(&db.tables, batches)
                .into_iter()
                .map(move |group| VerificationTask::tables(cluster, &db.database, group, params, dump_dir))
        })
        .collect()
}

/// Deal `items` into at most `groups` non-empty groups, round-robin.
pub fn partition_round_robin<T: Clone>(items: &[T], groups: usize) -> Vec<Vec<T>> {
    let groups = groups.max(1).min(items.len());
    let mut out: Vec<Vec<T>> = vec![Vec::new(); groups];
    for (i, item) in items.iter().enumerate() {
        out[i % groups].push(item.clone());
    }
    out
}
