//! Directory layout and path resolution.
//!
//! Resolves the cache roots and the project vendor tree, honoring the
//! `ORE_*` environment overrides.

use crate::env_vars;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default vendor directory relative to the project root
pub const DEFAULT_VENDOR_DIR: &str = "vendor/ore";

/// Get the registry archive cache root.
///
/// `ORE_CACHE_DIR` override, else `~/.cache/ore/gems`.
///
/// # Errors
///
/// Returns an error if no home directory can be determined.
pub fn archive_cache_dir() -> Result<PathBuf> {
    if let Some(dir) = env_vars::cache_dir() {
        return Ok(PathBuf::from(dir));
    }
    Ok(home_dir()?.join(".cache").join("ore").join("gems"))
}

/// Get the git source cache root (`~/.cache/ore/git`).
///
/// # Errors
///
/// Returns an error if no home directory can be determined.
pub fn git_cache_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".cache").join("ore").join("git"))
}

/// Get the compact-index cache root (`~/.bundle/cache/compact_index`).
///
/// Shared with the canonical tool so a warm cache is reused either way.
///
/// # Errors
///
/// Returns an error if no home directory can be determined.
pub fn compact_index_cache_dir() -> Result<PathBuf> {
    Ok(home_dir()?
        .join(".bundle")
        .join("cache")
        .join("compact_index"))
}

/// Get the project vendor root.
///
/// `ORE_VENDOR_DIR` override, else `<project>/vendor/ore`.
#[must_use]
pub fn vendor_dir(project_root: &Path) -> PathBuf {
    env_vars::vendor_dir().map_or_else(
        || project_root.join(DEFAULT_VENDOR_DIR),
        PathBuf::from,
    )
}

/// Find the manifest in `dir`.
///
/// Priority: `ORE_GEMFILE` env var -> gems.rb -> Gemfile (defaults to
/// Gemfile if neither exists).
#[must_use]
pub fn find_manifest(dir: &Path) -> PathBuf {
    if let Some(path) = env_vars::gemfile() {
        return PathBuf::from(path);
    }

    let gems_rb = dir.join("gems.rb");
    if gems_rb.exists() {
        return gems_rb;
    }

    dir.join("Gemfile")
}

/// Get the lock path for a given manifest.
///
/// Maps gems.rb -> gems.locked, otherwise appends ".lock".
#[must_use]
pub fn lockfile_for_manifest(manifest: &Path) -> PathBuf {
    if manifest.file_name().is_some_and(|name| name == "gems.rb") {
        return manifest.with_file_name("gems.locked");
    }

    let mut lockfile = manifest.as_os_str().to_owned();
    lockfile.push(".lock");
    PathBuf::from(lockfile)
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("Could not determine home directory")
}
