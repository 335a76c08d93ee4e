//! Catalog enumeration of the restored, running instance.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::is_excluded_schema;
use crate::process::{CommandRunner, Invocation};

use super::DumpError;

const TABLES_QUERY: &str = "SELECT table_schema, table_name FROM information_schema.tables \
                            WHERE table_type = 'BASE TABLE'";
const DATABASES_QUERY: &str = "SHOW DATABASES";

/// Tables of one database, in catalog order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTables {
    pub database: String,
    pub tables: Vec<String>,
}

/// Queries the instance's catalog through the `mysql` command-line client.
pub struct Catalog<R> {
    runner: Arc<R>,
    mysql: String,
    timeout: Duration,
}

impl<R: CommandRunner> Catalog<R> {
    pub fn new(runner: Arc<R>, mysql: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            mysql: mysql.into(),
            timeout,
        }
    }

    async fn query(&self, sql: &str) -> Result<String, DumpError> {
        let inv = Invocation::new(&self.mysql, self.timeout)
            .args(["--batch", "--skip-column-names", "-e", sql])
            .as_user("root");
        let output = self.runner.run(&inv).await.map_err(DumpError::Catalog)?;
        Ok(output.stdout)
    }

    /// Non-excluded database names.
    pub async fn databases(&self) -> Result<BTreeSet<String>, DumpError> {
        let stdout = self.query(DATABASES_QUERY).await?;
        Ok(parse_databases(&stdout))
    }

    /// `(database, [tables])` pairs in the catalog's natural order. Not
    /// sorted; callers needing determinism must sort.
    pub async fn tables(&self) -> Result<Vec<DatabaseTables>, DumpError> {
        let stdout = self.query(TABLES_QUERY).await?;
        parse_tables(&stdout)
    }
}

pub fn parse_databases(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && !is_excluded_schema(name))
        .map(str::to_string)
        .collect()
}

/// Parse tab-separated `schema<TAB>table` rows, grouping by schema while
/// keeping first-appearance order.
pub fn parse_tables(stdout: &str) -> Result<Vec<DatabaseTables>, DumpError> {
    let mut groups: Vec<DatabaseTables> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let (schema, table) = line
            .split_once('\t')
            .ok_or_else(|| DumpError::CatalogParse(line.to_string()))?;
        if is_excluded_schema(schema) {
            continue;
        }
        let slot = *index.entry(schema.to_string()).or_insert_with(|| {
            groups.push(DatabaseTables {
                database: schema.to_string(),
                tables: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].tables.push(table.to_string());
    }
    Ok(groups)
}

/// Compare the instance's database set with the backup's directory set.
pub fn cross_check(
    cluster: &str,
    instance: &BTreeSet<String>,
    backup: &BTreeSet<String>,
) -> Result<(), DumpError> {
    if instance == backup {
        return Ok(());
    }
    Err(DumpError::ClusterMismatch {
        cluster: cluster.to_string(),
        only_in_instance: instance.difference(backup).cloned().collect(),
        only_in_backup: backup.difference(instance).cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn databases_exclude_internal_schemas() {
        let out = "information_schema\napp\nmysql\nperformance_schema\nsys\ncrm\n";
        assert_eq!(parse_databases(out), set(&["app", "crm"]));
    }

    #[test]
    fn tables_keep_catalog_order() {
        let out = "crm\tusers\napp\tt1\nmysql\tuser\ncrm\torders\napp\tt2\n";
        let groups = parse_tables(out).expect("parse");
        assert_eq!(
            groups,
            vec![
                DatabaseTables {
                    database: "crm".into(),
                    tables: vec!["users".into(), "orders".into()],
                },
                DatabaseTables {
                    database: "app".into(),
                    tables: vec!["t1".into(), "t2".into()],
                },
            ]
        );
    }

    #[test]
    fn malformed_row_rejected() {
        assert_matches!(parse_tables("app t1\n"), Err(DumpError::CatalogParse(_)));
    }

    #[test]
    fn cross_check_reports_both_sides() {
        let err = cross_check("demo", &set(&["a", "b"]), &set(&["a", "c"])).expect_err("mismatch");
        assert_matches!(
            err,
            DumpError::ClusterMismatch { ref only_in_instance, ref only_in_backup, .. }
                if only_in_instance == &["b"] && only_in_backup == &["c"]
        );
        assert!(cross_check("demo", &set(&["a"]), &set(&["a"])).is_ok());
    }
}
