//! Filesystem primitives shared by the cache and the installer.
//!
//! Atomic file replacement, stale temp-file cleanup, a directory-creation
//! cache for hot extraction paths, and the process-wide copy-buffer pool.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use thiserror::Error;

/// Size of each pooled copy buffer (128 KiB)
pub const COPY_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Error)]
#[error("stale temp file {path} could not be cleaned: {source}")]
pub struct CacheCorruptionError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Atomically replace `path` with `bytes`.
///
/// Writes to `<path>.tmp`, fsyncs, then renames over the destination so a
/// reader only ever observes the previous or the new content. The temp file
/// is removed on every error path.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written, synced, or renamed.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        drop(fs::remove_file(&tmp));
    }
    result
}

/// The `<path>.tmp` sibling used by [`atomic_write`].
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Remove leftover `*.tmp` files in `dir` from an interrupted run.
///
/// # Errors
///
/// Returns [`CacheCorruptionError`] if a stale temp file exists but cannot
/// be removed.
pub fn clean_stale_tmp(dir: &Path) -> Result<(), CacheCorruptionError> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tmp")
            && let Err(source) = fs::remove_file(&path)
        {
            return Err(CacheCorruptionError { path, source });
        }
    }
    Ok(())
}

/// A directory-creation cache
///
/// Remembers every directory (and ancestor) it has already created so large
/// archive extractions issue one `create_dir_all` per distinct path instead
/// of one per file.
#[derive(Debug, Default)]
pub struct DirCache {
    created: Mutex<HashSet<PathBuf>>,
}

impl DirCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path` and its ancestors unless already known to exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        {
            let created = self.created.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if created.contains(path) {
                return Ok(());
            }
        }

        fs::create_dir_all(path)?;

        let mut created = self.created.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut current = Some(path);
        while let Some(dir) = current {
            if !created.insert(dir.to_path_buf()) {
                break;
            }
            current = dir.parent();
        }
        Ok(())
    }
}

static BUFFER_POOL: LazyLock<Mutex<Vec<Vec<u8>>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// A copy buffer checked out of the process-wide pool
///
/// Returned to the pool on drop.
pub struct PooledBuffer {
    buffer: Vec<u8>,
}

impl PooledBuffer {
    /// Check a 128-KiB buffer out of the pool, allocating if empty.
    #[must_use]
    pub fn acquire() -> Self {
        let buffer = BUFFER_POOL
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; COPY_BUFFER_SIZE]);
        Self { buffer }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        BUFFER_POOL
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(buffer);
    }
}

/// Stream `reader` into `writer` through a pooled buffer.
///
/// # Errors
///
/// Returns the first read or write error.
pub fn copy_with_pooled_buffer<R: io::Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut buffer = PooledBuffer::acquire();
    let mut total = 0u64;
    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            return Ok(total);
        }
        writer.write_all(&buffer[..count])?;
        total += count as u64;
    }
}
