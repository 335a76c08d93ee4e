//! Physical restore of a copied backup inside the data directory.
//!
//! Steps run in a fixed order, each its own failure domain:
//!
//! 1. decompress (`xtrabackup --decompress`)
//! 2. prepare / redo-log replay (`xtrabackup --prepare`)
//! 3. regenerate `grastate.dat` from `xtrabackup_galera_info`
//! 4. normalize ownership
//!
//! Any failure aborts the remaining steps. Nothing is rolled back; the
//! partially restored directory is left for inspection. Prepare is not
//! idempotent, so a failed restore must start over from a fresh copy.

pub mod galera;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::datadir::{DataDir, DataDirError};
use crate::process::{CommandRunner, Invocation, ProcessError};

use self::galera::{GaleraState, MalformedMetadata, GALERA_INFO_FILE, GRASTATE_FILE};

pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// What to do when the galera metadata file is absent.
///
/// A missing file is expected for non-replicated topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaleraPolicy {
    /// Fail the restore with [`RestoreError::MetadataNotFound`].
    Required,
    /// Log a warning and continue with ownership normalization.
    Optional,
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("decompression failed: {0}")]
    Decompression(#[source] ProcessError),

    #[error("prepare failed: {0}")]
    Prepare(#[source] ProcessError),

    #[error("galera metadata file not found: {0}")]
    MetadataNotFound(PathBuf),

    #[error(transparent)]
    MalformedMetadata(#[from] MalformedMetadata),

    #[error("failed to {action} {path}: {source}")]
    StateFile {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ownership normalization failed: {0}")]
    Ownership(#[source] DataDirError),
}

/// Outcome of a completed restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    /// `None` when the metadata file was absent and the policy allowed it.
    pub galera: Option<GaleraState>,
    pub duration: Duration,
}

/// Decompresses, prepares and finalizes a backup already copied into the
/// data directory.
pub struct RestoreEngine<R> {
    runner: Arc<R>,
    xtrabackup: String,
    threads: usize,
    timeout: Duration,
    galera_policy: GaleraPolicy,
}

impl<R: CommandRunner> RestoreEngine<R> {
    pub fn new(runner: Arc<R>, xtrabackup: impl Into<String>) -> Self {
        Self {
            runner,
            xtrabackup: xtrabackup.into(),
            threads: detect_cores(),
            timeout: DEFAULT_RESTORE_TIMEOUT,
            galera_policy: GaleraPolicy::Required,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_galera_policy(mut self, policy: GaleraPolicy) -> Self {
        self.galera_policy = policy;
        self
    }

    pub async fn restore(&self, data_dir: &DataDir<R>) -> Result<RestoreSummary, RestoreError> {
        let start = Instant::now();
        let target = data_dir.path();
        let account = data_dir.owner().to_string();

        self.decompress(target, &account).await?;
        self.prepare(target, &account).await?;
        let galera = self.write_grastate(target)?;

        data_dir.chown().await.map_err(RestoreError::Ownership)?;

        let duration = start.elapsed();
        tracing::info!(
            target = %target.display(),
            elapsed_ms = duration.as_millis() as u64,
            galera = galera.is_some(),
            "Restore completed",
        );
        Ok(RestoreSummary { galera, duration })
    }

    async fn decompress(&self, target: &Path, account: &str) -> Result<(), RestoreError> {
        let inv = Invocation::new(&self.xtrabackup, self.timeout)
            .arg(format!("--parallel={}", self.threads))
            .args(["--decompress", "--remove-original"])
            .arg(format!("--target-dir={}", target.display()))
            .as_user(account);
        tracing::info!(target = %target.display(), threads = self.threads, "Decompressing backup");
        self.runner
            .run(&inv)
            .await
            .map_err(RestoreError::Decompression)?;
        Ok(())
    }

    async fn prepare(&self, target: &Path, account: &str) -> Result<(), RestoreError> {
        let inv = Invocation::new(&self.xtrabackup, self.timeout)
            .arg("--prepare")
            .arg(format!("--rebuild-threads={}", self.threads))
            .arg(format!("--target-dir={}", target.display()))
            .as_user(account);
        tracing::info!(target = %target.display(), threads = self.threads, "Preparing backup");
        self.runner.run(&inv).await.map_err(RestoreError::Prepare)?;
        Ok(())
    }

    /// Rewrite `grastate.dat` for a bootstrap from the restored data.
    fn write_grastate(&self, target: &Path) -> Result<Option<GaleraState>, RestoreError> {
        let info_path = target.join(GALERA_INFO_FILE);
        let content = match std::fs::read_to_string(&info_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return match self.galera_policy {
                    GaleraPolicy::Required => Err(RestoreError::MetadataNotFound(info_path)),
                    GaleraPolicy::Optional => {
                        tracing::warn!(
                            path = %info_path.display(),
                            "Galera metadata not found, leaving cluster state untouched",
                        );
                        Ok(None)
                    }
                };
            }
            Err(source) => {
                return Err(RestoreError::StateFile {
                    action: "read",
                    path: info_path,
                    source,
                })
            }
        };

        let state = GaleraState::from_metadata(&content)?.for_validation();
        let state_path = target.join(GRASTATE_FILE);
        std::fs::write(&state_path, state.render()).map_err(|source| RestoreError::StateFile {
            action: "write",
            path: state_path,
            source,
        })?;
        tracing::info!(uuid = %state.uuid, "Cluster state file regenerated");
        Ok(Some(state))
    }
}

/// Number of cores available to this process.
pub fn detect_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
