//! Exclusive leases over volumes and device slots.
//!
//! A lease is an advisory `flock` on `<lease_dir>/<kind>/<key>.lock`. It is
//! held for as long as the [`Lease`] value lives, so concurrent pipeline
//! runs (threads or processes) can never own the same volume or slot.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Default lease directory when none is configured.
pub fn default_lease_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("image-builder")
        .join("leases")
}

/// RAII guard: the lock is released when the file handle is dropped.
#[derive(Debug)]
pub struct Lease {
    _file: File,
    path: PathBuf,
}

impl Lease {
    /// Take the lease for `key` or fail immediately if someone else holds it.
    pub fn acquire(lease_dir: &Path, kind: &str, key: &str) -> Result<Self> {
        validate_segment("lease kind", kind)?;
        validate_segment("lease key", key)?;

        let lock_path = lease_dir.join(kind).join(format!("{}.lock", key));
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lease directory '{}'", parent.display()))?;
        }

        // The lock file is never unlinked: removing a still-locked file would
        // let a second holder lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        if file.try_lock_exclusive().is_err() {
            drop(file);
            bail!("{} '{}' is leased by another run", kind, key);
        }

        tracing::debug!(lock_path = %lock_path.display(), "acquired lease");
        Ok(Self {
            _file: file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self._file.unlock();
        tracing::debug!(lock_path = %self.path.display(), "released lease");
    }
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{what} must not be empty");
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        bail!("{what} must be a safe filename segment: {value}");
    }
    Ok(())
}
