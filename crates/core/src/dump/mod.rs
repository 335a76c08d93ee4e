//! Dump verification of a restored instance.
//!
//! Flow: cross-check database names against the backup snapshot, run the
//! schema-only dump synchronously as a precondition, then fan out one
//! data dump per table (or per batch) across a bounded [`WorkerPool`].
//! Per-task failures are recorded and never abort sibling tasks.

pub mod catalog;
pub mod pool;
pub mod task;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cluster::BackupSnapshot;
use crate::fs_guard::FsGuardError;
use crate::process::{CommandRunner, Invocation, ProcessError};

use self::catalog::Catalog;
use self::pool::{PoolResult, TaskTimedOut, WorkerPool};
use self::task::{build_batched_tasks, build_tasks, VerificationTask, DEFAULT_DUMP_OPTIONS};

/// Default timeout for one dump task.
pub const DEFAULT_DUMP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timeout for catalog queries.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(300);

type TaskFuture = Pin<Box<dyn Future<Output = Result<i32, ProcessError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("catalog query failed: {0}")]
    Catalog(#[source] ProcessError),

    #[error("unexpected catalog row: {0:?}")]
    CatalogParse(String),

    #[error("cannot list backup databases: {0}")]
    BackupListing(#[from] FsGuardError),

    #[error(
        "cluster '{cluster}' does not match its backup \
         (only in instance: {only_in_instance:?}, only in backup: {only_in_backup:?})"
    )]
    ClusterMismatch {
        cluster: String,
        only_in_instance: Vec<String>,
        only_in_backup: Vec<String>,
    },

    #[error("schema dump failed: {0}")]
    SchemaDump(#[source] ProcessError),

    #[error("cannot create dump directory {path}: {source}")]
    DumpDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one verification task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub task: VerificationTask,
    pub success: bool,
    /// Exit code of the dump command; `None` when it never finished.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl VerificationResult {
    fn from_pool(result: PoolResult<VerificationTask, Result<i32, ProcessError>>) -> Self {
        let PoolResult {
            task,
            outcome,
            duration,
        } = result;
        match outcome {
            Ok(Ok(exit_code)) => Self {
                task,
                success: true,
                exit_code: Some(exit_code),
                duration,
                error: None,
            },
            Ok(Err(e)) => Self {
                task,
                success: false,
                exit_code: e.exit_code(),
                duration,
                error: Some(e.to_string()),
            },
            Err(e @ TaskTimedOut { .. }) => Self {
                task,
                success: false,
                exit_code: None,
                duration,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Aggregated verification of one cluster. Task zero is the schema dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
    /// Tasks built, including any whose result was lost.
    pub expected: usize,
    pub duration: Duration,
}

impl VerificationReport {
    pub fn total(&self) -> usize {
        self.expected
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Failed tasks, counting lost results as failures.
    pub fn failed(&self) -> usize {
        self.expected - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Tunables for [`DumpVerificationEngine`].
#[derive(Debug, Clone)]
pub struct DumpSettings {
    pub mysql: String,
    pub mysqldump: String,
    pub params: Vec<String>,
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// `0` builds one task per table.
    pub batches: usize,
    pub task_timeout: Duration,
    /// Keep dump files here; `None` discards them.
    pub dump_dir: Option<PathBuf>,
    /// gzip each kept dump.
    pub archive: bool,
}

impl Default for DumpSettings {
    fn default() -> Self {
        Self {
            mysql: "mysql".to_string(),
            mysqldump: "mysqldump".to_string(),
            params: DEFAULT_DUMP_OPTIONS.iter().map(|s| s.to_string()).collect(),
            max_workers: pool::DEFAULT_MAX_WORKERS,
            queue_capacity: pool::DEFAULT_QUEUE_CAPACITY,
            batches: 0,
            task_timeout: DEFAULT_DUMP_TIMEOUT,
            dump_dir: None,
            archive: false,
        }
    }
}

pub struct DumpVerificationEngine<R> {
    runner: Arc<R>,
    catalog: Catalog<R>,
    settings: DumpSettings,
}

impl<R: CommandRunner + 'static> DumpVerificationEngine<R> {
    pub fn new(runner: Arc<R>, settings: DumpSettings) -> Self {
        let catalog = Catalog::new(Arc::clone(&runner), settings.mysql.clone(), CATALOG_TIMEOUT);
        Self {
            runner,
            catalog,
            settings,
        }
    }

    /// Verify the running instance of `cluster`.
    ///
    /// With a snapshot, the instance's database set must equal the backup's,
    /// otherwise [`DumpError::ClusterMismatch`] is returned before any dump
    /// runs.
    pub async fn verify(
        &self,
        cluster: &str,
        snapshot: Option<&BackupSnapshot>,
    ) -> Result<VerificationReport, DumpError> {
        let start = Instant::now();

        if let Some(snapshot) = snapshot {
            let instance = self.catalog.databases().await?;
            let backup = snapshot.database_names()?;
            catalog::cross_check(cluster, &instance, &backup)?;
            tracing::info!(cluster, databases = instance.len(), "Database sets match backup");
        }

        let dump_dir = self.prepare_dump_dir()?;
        let dump_dir = dump_dir.as_deref();

        let schema_task = VerificationTask::schema(cluster, dump_dir);
        let schema_result = self.run_schema_dump(schema_task).await?;
        tracing::info!(cluster, "Schema dump completed");

        let tables = self.catalog.tables().await?;
        let tasks = if self.settings.batches > 0 {
            build_batched_tasks(cluster, &tables, &self.settings.params, dump_dir, self.settings.batches)
        } else {
            build_tasks(cluster, &tables, &self.settings.params, dump_dir)
        };

        let pool = WorkerPool::new(
            self.settings.max_workers,
            self.settings.queue_capacity,
            self.settings.task_timeout,
        );
        tracing::info!(
            cluster,
            tasks = tasks.len(),
            workers = pool.worker_count(tasks.len()),
            "Dumping tables",
        );

        let expected = tasks.len() + 1;
        let pooled = pool.run(tasks, self.task_job()).await;

        let mut results = Vec::with_capacity(expected);
        results.push(schema_result);
        for result in pooled.into_iter().map(VerificationResult::from_pool) {
            if result.success {
                tracing::debug!(cluster, task = %result.task, elapsed_ms = result.duration.as_millis() as u64, "Table dump ok");
            } else {
                tracing::warn!(
                    cluster,
                    task = %result.task,
                    exit_code = ?result.exit_code,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Table dump failed",
                );
            }
            results.push(result);
        }

        let report = VerificationReport {
            results,
            expected,
            duration: start.elapsed(),
        };
        tracing::info!(
            cluster,
            total = report.total(),
            failed = report.failed(),
            elapsed_ms = report.duration.as_millis() as u64,
            "Dump verification finished",
        );
        Ok(report)
    }

    fn prepare_dump_dir(&self) -> Result<Option<PathBuf>, DumpError> {
        let Some(dir) = &self.settings.dump_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir).map_err(|source| DumpError::DumpDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Some(dir.clone()))
    }

    async fn run_schema_dump(&self, task: VerificationTask) -> Result<VerificationResult, DumpError> {
        let start = Instant::now();
        let exit_code = execute_task(
            &*self.runner,
            &task,
            &self.settings.mysqldump,
            self.settings.task_timeout,
            false,
        )
        .await
        .map_err(DumpError::SchemaDump)?;
        Ok(VerificationResult {
            task,
            success: true,
            exit_code: Some(exit_code),
            duration: start.elapsed(),
            error: None,
        })
    }

    /// The per-task job handed to the pool. Owns everything it touches.
    fn task_job(&self) -> impl Fn(VerificationTask) -> TaskFuture + Send + Sync + 'static {
        let runner = Arc::clone(&self.runner);
        let mysqldump = self.settings.mysqldump.clone();
        let timeout = self.settings.task_timeout;
        let archive = self.settings.archive;
        move |task| {
            let runner = Arc::clone(&runner);
            let mysqldump = mysqldump.clone();
            Box::pin(async move { execute_task(&*runner, &task, &mysqldump, timeout, archive).await })
                as TaskFuture
        }
    }
}

/// Run one dump and, when requested, gzip the kept file.
async fn execute_task<R: CommandRunner>(
    runner: &R,
    task: &VerificationTask,
    mysqldump: &str,
    timeout: Duration,
    archive: bool,
) -> Result<i32, ProcessError> {
    let output = runner.run(&task.invocation(mysqldump, timeout)).await?;
    if archive {
        if let Some(file) = &task.output_file {
            archive_file(runner, file, timeout).await?;
        }
    }
    Ok(output.exit_code)
}

async fn archive_file<R: CommandRunner>(runner: &R, file: &Path, timeout: Duration) -> Result<(), ProcessError> {
    let inv = Invocation::new("gzip", timeout)
        .args(["-f".to_string(), file.display().to_string()])
        .as_user("root");
    runner.run(&inv).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
