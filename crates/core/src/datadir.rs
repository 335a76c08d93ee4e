//! Destructive operations on the live data directory.
//!
//! The data directory is exclusive to one cluster's restore at a time.
//! Every clear is preceded by [`FilesystemGuard::assert_safe_to_clear`];
//! that check cannot be skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::fs_guard::{self, FilesystemGuard, FsGuardError};
use crate::process::{CommandRunner, Invocation, ProcessError};

pub const DEFAULT_CLEAR_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum DataDirError {
    #[error(transparent)]
    Guard(#[from] FsGuardError),

    #[error("clearing {path} failed: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: ProcessError,
    },

    #[error("copying backup {from} into {to} failed: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: ProcessError,
    },

    #[error("changing ownership of {path} to {owner} failed: {source}")]
    Ownership {
        path: PathBuf,
        owner: String,
        #[source]
        source: ProcessError,
    },
}

impl DataDirError {
    /// A protected-path violation means the configuration itself is unsafe.
    pub fn is_protected_path(&self) -> bool {
        matches!(self, Self::Guard(FsGuardError::ProtectedPath(_)))
    }
}

/// The restore target: one configured absolute directory.
pub struct DataDir<R> {
    runner: Arc<R>,
    guard: FilesystemGuard,
    path: PathBuf,
    owner: String,
    clear_timeout: Duration,
    copy_timeout: Duration,
}

impl<R: CommandRunner> DataDir<R> {
    pub fn new(
        runner: Arc<R>,
        guard: FilesystemGuard,
        path: impl Into<PathBuf>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            guard,
            path: path.into(),
            owner: owner.into(),
            clear_timeout: DEFAULT_CLEAR_TIMEOUT,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, clear: Duration, copy: Duration) -> Self {
        self.clear_timeout = clear;
        self.copy_timeout = copy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Service account that owns the restored files.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Remove every entry directly under the data directory (dot-files
    /// included) as the service account, keeping the directory itself.
    ///
    /// The removal is best-effort; emptiness is verified afterwards.
    pub async fn clear(&self) -> Result<(), DataDirError> {
        fs_guard::ensure_dir(&self.path)?;
        self.guard.assert_safe_to_clear(&self.path)?;

        let target = self.path.to_string_lossy().into_owned();
        let inv = Invocation::new("find", self.clear_timeout)
            .args([
                target.as_str(),
                "-mindepth",
                "1",
                "-maxdepth",
                "1",
                "-exec",
                "rm",
                "-rf",
                "--",
                "{}",
                "+",
            ])
            .as_user(&self.owner)
            .best_effort();
        let output = self
            .runner
            .run(&inv)
            .await
            .map_err(|source| DataDirError::Clear {
                path: self.path.clone(),
                source,
            })?;
        if !output.success() {
            tracing::warn!(
                path = %self.path.display(),
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Some files may not have been deleted",
            );
        }

        fs_guard::ensure_empty_dir(&self.path)?;
        tracing::info!(path = %self.path.display(), "Data directory cleared");
        Ok(())
    }

    /// Copy the snapshot contents into the (empty) data directory, then hand
    /// ownership to the service account. Both commands fail loudly.
    pub async fn copy_from(&self, snapshot: &Path) -> Result<(), DataDirError> {
        fs_guard::ensure_dir(snapshot)?;
        fs_guard::ensure_empty_dir(&self.path)?;

        let source = format!("{}/.", snapshot.display());
        let target = format!("{}/", self.path.display());
        let inv = Invocation::new("cp", self.copy_timeout)
            .args(["-Rp", source.as_str(), target.as_str()])
            .as_user("root");
        self.runner
            .run(&inv)
            .await
            .map_err(|e| DataDirError::Copy {
                from: snapshot.to_path_buf(),
                to: self.path.clone(),
                source: e,
            })?;

        self.chown().await?;
        tracing::info!(
            from = %snapshot.display(),
            to = %self.path.display(),
            "Backup copied into data directory",
        );
        Ok(())
    }

    /// `chown -R <owner>:<owner> <data_dir>` as root.
    pub async fn chown(&self) -> Result<(), DataDirError> {
        let owner = format!("{0}:{0}", self.owner);
        let target = self.path.to_string_lossy().into_owned();
        let inv = Invocation::new("chown", self.copy_timeout)
            .args(["-R", owner.as_str(), target.as_str()])
            .as_user("root");
        self.runner
            .run(&inv)
            .await
            .map_err(|source| DataDirError::Ownership {
                path: self.path.clone(),
                owner: self.owner.clone(),
                source,
            })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::process::{CommandOutput, SystemRunner};

    /// Records invocations and runs nothing.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Invocation>>,
        fail_program: Option<&'static str>,
    }

    impl CommandRunner for Recorder {
        async fn run(&self, inv: &Invocation) -> Result<CommandOutput, ProcessError> {
            self.calls.lock().unwrap().push(inv.clone());
            if self.fail_program == Some(inv.program.as_str()) {
                return Err(ProcessError::CommandFailed {
                    command: inv.command_line(),
                    exit_code: 1,
                    stderr: "no space left on device".into(),
                });
            }
            Ok(CommandOutput::default())
        }
    }

    #[tokio::test]
    async fn protected_path_never_runs_deletion() {
        let recorder = Arc::new(Recorder::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let protected = dir.path().canonicalize().expect("canonicalize");
        let datadir = DataDir::new(
            recorder.clone(),
            FilesystemGuard::new([protected.clone()]),
            protected.join("."),
            "mysql",
        );
        let err = datadir.clear().await.expect_err("protected");
        assert!(err.is_protected_path());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_removes_all_entries_with_real_tools() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("app")).expect("mkdir");
        std::fs::write(dir.path().join("app").join("t1.ibd"), b"x").expect("write");
        std::fs::write(dir.path().join(".hidden"), b"x").expect("write");
        std::fs::write(dir.path().join("ibdata1"), b"x").expect("write");

        let datadir = DataDir::new(
            Arc::new(SystemRunner::direct()),
            FilesystemGuard::new(Vec::<PathBuf>::new()),
            dir.path(),
            "mysql",
        );
        datadir.clear().await.expect("clear");
        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[tokio::test]
    async fn copy_refuses_non_empty_target() {
        let recorder = Arc::new(Recorder::default());
        let data = tempfile::tempdir().expect("tempdir");
        let backup = tempfile::tempdir().expect("tempdir");
        std::fs::write(data.path().join("leftover"), b"x").expect("write");

        let datadir = DataDir::new(
            recorder.clone(),
            FilesystemGuard::default(),
            data.path(),
            "mysql",
        );
        assert_matches!(
            datadir.copy_from(backup.path()).await,
            Err(DataDirError::Guard(FsGuardError::NotEmpty { .. }))
        );
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_then_chown_as_root() {
        let recorder = Arc::new(Recorder::default());
        let data = tempfile::tempdir().expect("tempdir");
        let backup = tempfile::tempdir().expect("tempdir");

        let datadir = DataDir::new(recorder.clone(), FilesystemGuard::default(), data.path(), "mysql");
        datadir.copy_from(backup.path()).await.expect("copy");

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "cp");
        assert_eq!(calls[0].args[1], format!("{}/.", backup.path().display()));
        assert_eq!(calls[1].program, "chown");
        assert_eq!(calls[1].args[1], "mysql:mysql");
        assert!(calls.iter().all(|c| c.as_user.as_deref() == Some("root")));
    }

    #[tokio::test]
    async fn failed_copy_skips_chown() {
        let recorder = Arc::new(Recorder {
            fail_program: Some("cp"),
            ..Default::default()
        });
        let data = tempfile::tempdir().expect("tempdir");
        let backup = tempfile::tempdir().expect("tempdir");

        let datadir = DataDir::new(recorder.clone(), FilesystemGuard::default(), data.path(), "mysql");
        assert_matches!(
            datadir.copy_from(backup.path()).await,
            Err(DataDirError::Copy { .. })
        );
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }
}
