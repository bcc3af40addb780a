//! The per-installation token file.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target, so a concurrent reader sees either the old token or the
//! new one, never a partial write.
//!
//! A verification pass holds [`TokenStore::lock`] for its whole
//! read-modify-write. The lock is an OS advisory lock on a sidecar file
//! (`<token file>.lock`), so it excludes other stores on the same path and
//! other processes alike. The lock is released when the guard is dropped.

use crate::error::{LicenseError, LicenseResult};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Location of the local token and of its lock file.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Exclusive access to the token file for one read-modify-write pass.
pub struct TokenFileGuard<'a> {
    store: &'a TokenStore,
    _lock: File,
}

impl TokenStore {
    /// Creates a store for the token file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = OsString::from(path.as_os_str());
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
        }
    }

    /// Path of the token file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the sidecar lock file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquires exclusive access to the token file, blocking until any
    /// other holder releases it.
    pub fn lock(&self) -> LicenseResult<TokenFileGuard<'_>> {
        fs::create_dir_all(parent_dir(&self.lock_path))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                LicenseError::Storage(format!(
                    "failed to open lock file {}: {e}",
                    self.lock_path.display()
                ))
            })?;
        file.lock().map_err(|e| {
            LicenseError::Storage(format!(
                "failed to lock {}: {e}",
                self.lock_path.display()
            ))
        })?;
        Ok(TokenFileGuard {
            store: self,
            _lock: file,
        })
    }

    /// Reads the token without taking the lock. Renames are atomic, so this
    /// never observes a half-written file.
    pub fn read(&self) -> LicenseResult<Option<String>> {
        read_token(&self.path)
    }
}

impl TokenFileGuard<'_> {
    /// Reads the stored token, or None if no token is installed.
    pub fn read(&self) -> LicenseResult<Option<String>> {
        read_token(&self.store.path)
    }

    /// Atomically replaces the stored token.
    pub fn write(&self, token: &str) -> LicenseResult<()> {
        write_atomic(&self.store.path, token)
    }

    /// Removes the stored token, if any.
    pub fn clear(&self) -> LicenseResult<()> {
        match fs::remove_file(&self.store.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_token(path: &Path) -> LicenseResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let token = contents.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LicenseError::Storage(format!(
            "failed to read token file {}: {e}",
            path.display()
        ))),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn write_atomic(path: &Path, token: &str) -> LicenseResult<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(token.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        LicenseError::Storage(format!(
            "failed to replace token file {}: {}",
            path.display(),
            e.error
        ))
    })?;
    debug!(path = %path.display(), "token file written");
    Ok(())
}
