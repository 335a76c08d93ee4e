//! Path validation and the protected-path check run before every
//! destructive clear of a data directory.

use std::path::{Component, Path, PathBuf};

/// Default protected prefixes: system trees that must never be cleared.
pub const DEFAULT_PROTECTED_PATHS: &[&str] = &["/home", "/etc", "/var", "/usr", "/bin", "/sbin"];

#[derive(Debug, thiserror::Error)]
pub enum FsGuardError {
    #[error("path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("directory is not empty: {path} ({entries} entries left)")]
    NotEmpty { path: PathBuf, entries: usize },

    #[error("refusing to operate on protected path: {0}")]
    ProtectedPath(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Validates paths and refuses destructive operations on protected trees.
#[derive(Debug, Clone)]
pub struct FilesystemGuard {
    protected: Vec<PathBuf>,
}

impl FilesystemGuard {
    /// Build a guard over the given protected prefixes. Relative or empty
    /// entries are dropped; the root path is always protected.
    pub fn new<I, P>(protected: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let protected = protected
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| p.is_absolute() && p != Path::new("/"))
            .collect();
        Self { protected }
    }

    pub fn ensure_dir(&self, path: &Path) -> Result<(), FsGuardError> {
        ensure_dir(path)
    }

    pub fn ensure_file(&self, path: &Path) -> Result<(), FsGuardError> {
        ensure_file(path)
    }

    /// Fail with [`FsGuardError::ProtectedPath`] if clearing `path` could
    /// touch the root or a protected tree.
    ///
    /// The path is checked both lexically (with `.`/`..` resolved) and,
    /// when it exists, after symlink resolution. Matching is per path
    /// component, so `/variable` is not covered by `/var`.
    pub fn assert_safe_to_clear(&self, path: &Path) -> Result<(), FsGuardError> {
        let mut candidates = vec![normalize(path)];
        if let Ok(real) = path.canonicalize() {
            candidates.push(real);
        }

        for candidate in &candidates {
            if !candidate.is_absolute() || candidate == Path::new("/") {
                return Err(FsGuardError::ProtectedPath(path.to_path_buf()));
            }
            if self.protected.iter().any(|prefix| candidate.starts_with(prefix)) {
                return Err(FsGuardError::ProtectedPath(path.to_path_buf()));
            }
        }
        Ok(())
    }
}

impl Default for FilesystemGuard {
    fn default() -> Self {
        Self::new(DEFAULT_PROTECTED_PATHS)
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), FsGuardError> {
    if !path.exists() {
        return Err(FsGuardError::PathNotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(FsGuardError::NotADirectory(path.to_path_buf()));
    }
    Ok(())
}

pub fn ensure_file(path: &Path) -> Result<(), FsGuardError> {
    if !path.is_file() {
        return Err(FsGuardError::PathNotFound(path.to_path_buf()));
    }
    Ok(())
}

/// Fail unless `path` is an existing, empty directory.
pub fn ensure_empty_dir(path: &Path) -> Result<(), FsGuardError> {
    ensure_dir(path)?;
    let entries = std::fs::read_dir(path)
        .map_err(|source| FsGuardError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .count();
    if entries > 0 {
        return Err(FsGuardError::NotEmpty {
            path: path.to_path_buf(),
            entries,
        });
    }
    Ok(())
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
