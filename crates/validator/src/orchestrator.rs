//! Per-cluster validation state machine.
//!
//! Steps run strictly in order:
//!
//! `Init -> StopIfActive -> ClearData -> CopyBackup -> Restore -> Start ->
//! Verify -> StopAgain -> ClearAgain -> Reported`
//!
//! A failing step is recorded and the machine moves on, so the teardown
//! steps always run. `Restore`, `Start` and `Verify` each need the step
//! before them to have succeeded and are skipped otherwise. The only
//! error that stops the machine is a protected-path violation, which
//! aborts the whole run.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use xbval_core::cluster::{format_duration, BackupSnapshot, Cluster, ClusterMetrics};
use xbval_core::config::ValidationConfig;
use xbval_core::datadir::{DataDir, DataDirError, DEFAULT_CLEAR_TIMEOUT, DEFAULT_COPY_TIMEOUT};
use xbval_core::dump::{DumpError, DumpVerificationEngine, VerificationReport};
use xbval_core::fs_guard::{FilesystemGuard, FsGuardError};
use xbval_core::process::CommandRunner;
use xbval_core::restore::{RestoreEngine, RestoreError};
use xbval_core::service::{ServiceController, ServiceError, ServiceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Init,
    StopIfActive,
    ClearData,
    CopyBackup,
    Restore,
    Start,
    Verify,
    StopAgain,
    ClearAgain,
    Reported,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::StopIfActive => "stop_if_active",
            Self::ClearData => "clear_data",
            Self::CopyBackup => "copy_backup",
            Self::Restore => "restore",
            Self::Start => "start",
            Self::Verify => "verify",
            Self::StopAgain => "stop_again",
            Self::ClearAgain => "clear_again",
            Self::Reported => "reported",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Guard(#[from] FsGuardError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    DataDir(#[from] DataDirError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error("{failed} of {total} verification tasks failed")]
    VerificationFailed { failed: usize, total: usize },
}

impl StepError {
    /// Only a protected-path violation stops the run.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Guard(e) => matches!(e, FsGuardError::ProtectedPath(_)),
            Self::DataDir(e) => e.is_protected_path(),
            Self::Restore(RestoreError::Ownership(e)) => e.is_protected_path(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    /// An earlier step this one depends on did not succeed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
    pub duration: Duration,
}

/// Everything recorded for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRun {
    pub cluster: String,
    pub steps: Vec<StepRecord>,
    pub metrics: ClusterMetrics,
    pub verification: Option<VerificationReport>,
}

impl ClusterRun {
    fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            steps: Vec::new(),
            metrics: ClusterMetrics::default(),
            verification: None,
        }
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }

    pub fn has_failures(&self) -> bool {
        self.steps
            .iter()
            .any(|r| !matches!(r.outcome, StepOutcome::Succeeded))
    }

    fn record(&mut self, step: Step, outcome: StepOutcome, duration: Duration) {
        self.steps.push(StepRecord {
            step,
            outcome,
            duration,
        });
    }
}

/// Run-scoped results: one metrics entry per configured cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Configured cluster names, in configuration order.
    pub clusters: Vec<String>,
    pub metrics: BTreeMap<String, ClusterMetrics>,
    pub runs: Vec<ClusterRun>,
}

impl RunReport {
    pub fn new<I, S>(clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clusters: clusters.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn record(&mut self, run: ClusterRun) {
        self.metrics.insert(run.cluster.clone(), run.metrics);
        self.runs.push(run);
    }

    /// Record every configured cluster without an entry as failed.
    fn fill_missing(&mut self) {
        for name in &self.clusters {
            self.metrics
                .entry(name.clone())
                .or_insert_with(ClusterMetrics::failed);
        }
    }

    /// `0` only if every configured cluster completed without failure.
    pub fn exit_code(&self) -> i32 {
        let all_ok = self
            .clusters
            .iter()
            .all(|name| self.metrics.get(name).is_some_and(|m| m.exit_code == 0));
        if all_ok {
            0
        } else {
            1
        }
    }
}

/// A run stopped by a fatal step error. The report still covers every
/// configured cluster.
#[derive(Debug, thiserror::Error)]
#[error("validation run aborted: {error}")]
pub struct AbortedRun {
    pub report: RunReport,
    #[source]
    pub error: StepError,
}

pub struct Orchestrator<R> {
    runner: Arc<R>,
    guard: FilesystemGuard,
    service: ServiceController<R>,
    restore: RestoreEngine<R>,
    dump: DumpVerificationEngine<R>,
    clear_timeout: Duration,
    copy_timeout: Duration,
}

impl<R: CommandRunner + 'static> Orchestrator<R> {
    pub fn new(
        runner: Arc<R>,
        guard: FilesystemGuard,
        service: ServiceController<R>,
        restore: RestoreEngine<R>,
        dump: DumpVerificationEngine<R>,
    ) -> Self {
        Self {
            runner,
            guard,
            service,
            restore,
            dump,
            clear_timeout: DEFAULT_CLEAR_TIMEOUT,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    pub fn from_config(runner: Arc<R>, config: &ValidationConfig) -> Result<Self, ServiceError> {
        let service = ServiceController::new(Arc::clone(&runner), config.service_name.clone())?
            .with_timeout(config.service_timeout)
            .with_settle_delay(config.settle_delay);
        let restore = RestoreEngine::new(Arc::clone(&runner), config.xtrabackup_bin.clone())
            .with_timeout(config.restore_timeout)
            .with_galera_policy(config.galera_policy);
        let dump = DumpVerificationEngine::new(Arc::clone(&runner), config.dump_settings());
        Ok(Self::new(runner, config.guard(), service, restore, dump)
            .with_timeouts(config.clear_timeout, config.copy_timeout))
    }

    pub fn with_timeouts(mut self, clear: Duration, copy: Duration) -> Self {
        self.clear_timeout = clear;
        self.copy_timeout = copy;
        self
    }

    /// Validate every cluster in order.
    pub async fn run(&self, clusters: &[Cluster]) -> Result<RunReport, AbortedRun> {
        let mut report = RunReport::new(clusters.iter().map(|c| c.name.clone()));
        for cluster in clusters {
            match self.validate_cluster(cluster).await {
                Ok(run) => report.record(run),
                Err(error) => {
                    tracing::error!(
                        cluster = %cluster.name,
                        error = %error,
                        "Fatal error, aborting validation run",
                    );
                    report.fill_missing();
                    return Err(AbortedRun { report, error });
                }
            }
        }
        tracing::info!(
            clusters = report.clusters.len(),
            exit_code = report.exit_code(),
            "Validation run finished",
        );
        Ok(report)
    }

    /// Drive one cluster through every step. Returns `Err` only for a fatal
    /// error; ordinary failures are recorded in the returned [`ClusterRun`].
    pub async fn validate_cluster(&self, cluster: &Cluster) -> Result<ClusterRun, StepError> {
        let start = Instant::now();
        let mut run = ClusterRun::new(&cluster.name);
        let data_dir = DataDir::new(
            Arc::clone(&self.runner),
            self.guard.clone(),
            &cluster.data_dir,
            &cluster.service_account,
        )
        .with_timeouts(self.clear_timeout, self.copy_timeout);

        tracing::info!(cluster = %cluster.name, data_dir = %cluster.data_dir.display(), "Starting cluster validation");

        let snapshot = self
            .step(&mut run, Step::Init, async {
                let snapshot = BackupSnapshot::locate(cluster)?;
                let size = snapshot.size_bytes()?;
                Ok::<_, StepError>((snapshot, size))
            })
            .await?
            .map(|(snapshot, size)| {
                run.metrics.size = size;
                snapshot
            });

        self.step(&mut run, Step::StopIfActive, async {
            if self.service.state().await? != ServiceState::Inactive {
                self.service.stop().await?;
            }
            Ok::<_, StepError>(())
        })
        .await?;

        self.step(&mut run, Step::ClearData, async { Ok::<_, StepError>(data_dir.clear().await?) })
            .await?;

        let mut restore_duration = Duration::ZERO;
        let copied = match &snapshot {
            Some(snapshot) => {
                let copy_start = Instant::now();
                let copied = self
                    .step(&mut run, Step::CopyBackup, async {
                        Ok::<_, StepError>(data_dir.copy_from(&snapshot.path).await?)
                    })
                    .await?;
                restore_duration += copy_start.elapsed();
                copied.is_some()
            }
            None => {
                self.skip(&mut run, Step::CopyBackup, "no backup snapshot");
                false
            }
        };

        // Restore, Start and Verify each need the previous stage.
        let restored = if copied {
            let restore_start = Instant::now();
            let restored = self
                .step(&mut run, Step::Restore, async {
                    Ok::<_, StepError>(self.restore.restore(&data_dir).await?)
                })
                .await?;
            restore_duration += restore_start.elapsed();
            restored.is_some()
        } else {
            self.skip(&mut run, Step::Restore, "backup was not copied");
            false
        };
        run.metrics.restore_duration = restore_duration;

        let started = if restored {
            self.step(&mut run, Step::Start, async { Ok::<_, StepError>(self.service.start().await?) })
                .await?
                .is_some()
        } else {
            self.skip(&mut run, Step::Start, "backup was not restored");
            false
        };

        match snapshot.as_ref().filter(|_| started) {
            Some(snapshot) => {
                let verification = self
                    .step(&mut run, Step::Verify, async {
                        let report = self.dump.verify(&cluster.name, Some(snapshot)).await?;
                        if !report.is_success() {
                            return Err(StepError::VerificationFailed {
                                failed: report.failed(),
                                total: report.total(),
                            });
                        }
                        Ok::<_, StepError>(report)
                    })
                    .await?;
                run.verification = verification;
            }
            None => self.skip(&mut run, Step::Verify, "service was not started"),
        }

        self.step(&mut run, Step::StopAgain, async { Ok::<_, StepError>(self.service.stop().await?) })
            .await?;
        self.step(&mut run, Step::ClearAgain, async { Ok::<_, StepError>(data_dir.clear().await?) })
            .await?;

        run.metrics.duration = start.elapsed();
        run.metrics.exit_code = i32::from(run.has_failures());
        run.record(Step::Reported, StepOutcome::Succeeded, Duration::ZERO);

        tracing::info!(
            cluster = %cluster.name,
            exit_code = run.metrics.exit_code,
            duration = %format_duration(run.metrics.duration),
            restore_duration = %format_duration(run.metrics.restore_duration),
            size = run.metrics.size,
            "Cluster validation finished",
        );
        Ok(run)
    }

    /// Run one step and record its outcome. Returns `Ok(None)` for a
    /// recorded failure and `Err` only when the failure is fatal.
    async fn step<T, F>(&self, run: &mut ClusterRun, step: Step, fut: F) -> Result<Option<T>, StepError>
    where
        F: Future<Output = Result<T, StepError>>,
    {
        let start = Instant::now();
        tracing::debug!(cluster = %run.cluster, step = %step, "Step started");
        let result = fut.await;
        let duration = start.elapsed();

        match result {
            Ok(value) => {
                tracing::info!(
                    cluster = %run.cluster,
                    step = %step,
                    elapsed_ms = duration.as_millis() as u64,
                    "Step succeeded",
                );
                run.record(step, StepOutcome::Succeeded, duration);
                Ok(Some(value))
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(cluster = %run.cluster, step = %step, error = %e, "Step hit a protected path");
                run.record(step, StepOutcome::Failed(e.to_string()), duration);
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    cluster = %run.cluster,
                    step = %step,
                    elapsed_ms = duration.as_millis() as u64,
                    error = %e,
                    "Step failed, continuing",
                );
                run.record(step, StepOutcome::Failed(e.to_string()), duration);
                Ok(None)
            }
        }
    }

    fn skip(&self, run: &mut ClusterRun, step: Step, reason: &str) {
        tracing::warn!(cluster = %run.cluster, step = %step, reason, "Step skipped");
        run.record(step, StepOutcome::Skipped, Duration::ZERO);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
