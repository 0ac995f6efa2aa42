//! Atomic publish helper for staging files.
//!
//! A producer fills a store under a private staging name and then publishes
//! it under a fresh unique final name. Publication never replaces an
//! existing file:
//! 1. pick a random candidate name in the target directory
//! 2. rename staging -> candidate without replacement (retry on collision)
//! 3. durable_sync the directory so the new name survives a crash

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{GrowError, GrowResult};
use crate::platform;

/// Attempts before giving up on finding a free name.
const MAX_ATTEMPTS: usize = 64;

fn candidate(dir: &Path, suffix: &str) -> PathBuf {
    dir.join(format!("{:016x}{}", rand::random::<u64>(), suffix))
}

/// Create a new empty file with a unique name in `dir`.
///
/// The directory is created if missing. The returned path existed nowhere
/// before this call; a `Writer` opened on it initializes it.
pub fn create_unique<P: AsRef<Path>>(dir: P, suffix: &str) -> GrowResult<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|e| GrowError::io_at(dir, e, "Failed to create directory"))?;

    for _ in 0..MAX_ATTEMPTS {
        let path = candidate(dir, suffix);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "created unique file");
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(GrowError::io_at(&path, e, "Failed to create unique file")),
        }
    }
    Err(GrowError::Io {
        path: Some(dir.to_path_buf()),
        kind: ErrorKind::AlreadyExists,
        message: format!("No free name after {} attempts", MAX_ATTEMPTS),
    })
}

/// Move `staging` to a fresh unique name in `dir` and return that name.
///
/// On failure the error carries the staging path and the staging file is
/// left where it was.
pub fn publish<P: AsRef<Path>, D: AsRef<Path>>(
    staging: P,
    dir: D,
    suffix: &str,
) -> GrowResult<PathBuf> {
    let staging = staging.as_ref();
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .map_err(|e| GrowError::io_at(staging, e, "Failed to create publish directory"))?;

    for _ in 0..MAX_ATTEMPTS {
        let path = candidate(dir, suffix);
        match platform::rename_noreplace(staging, &path) {
            Ok(()) => {
                platform::sync_dir(dir).map_err(|e| {
                    GrowError::io_at(staging, e, "Failed to sync publish directory")
                })?;
                info!(from = %staging.display(), to = %path.display(), "published");
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(GrowError::io_at(staging, e, "Failed to publish")),
        }
    }
    Err(GrowError::Io {
        path: Some(staging.to_path_buf()),
        kind: ErrorKind::AlreadyExists,
        message: format!("No free name after {} attempts", MAX_ATTEMPTS),
    })
}
