//! Lock command
//!
//! Resolve the manifest's dependency graph and write the canonical lock.

use anyhow::{Context, Result};
use ore::source::Provider;
use ore::{GitManager, Lockfile, Manifest, Resolver, SourceMap, config, fs_utils};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration for the lock command
#[derive(Debug)]
pub(crate) struct LockOptions {
    /// Manifest path override
    pub gemfile: Option<String>,

    /// Gems to re-resolve; everything else stays at its locked version
    pub update: Vec<String>,

    /// Allow prereleases everywhere
    pub pre: bool,

    /// Print instead of writing
    pub print: bool,
}

pub(crate) async fn run(options: LockOptions) -> Result<()> {
    let project = std::env::current_dir().context("Failed to determine working directory")?;
    let manifest_path = options
        .gemfile
        .map_or_else(|| config::find_manifest(&project), PathBuf::from);
    let lock_path = config::lockfile_for_manifest(&manifest_path);

    let manifest = Manifest::parse_file(&manifest_path)
        .with_context(|| format!("Failed to read manifest {}", manifest_path.display()))?;

    let git = Arc::new(
        GitManager::new(config::git_cache_dir()?).context("Failed to set up git cache")?,
    );
    let sources = SourceMap::from_manifest(
        &manifest,
        ore::DEFAULT_REGISTRY,
        &config::compact_index_cache_dir()?,
        git,
    )
    .context("Failed to route gem sources")?;

    // Selective update: pin every locked registry gem that was not named.
    if !options.update.is_empty() && lock_path.exists() {
        let existing = std::fs::read_to_string(&lock_path)
            .with_context(|| format!("Failed to read lock {}", lock_path.display()))?;
        let existing = Lockfile::parse(&existing)
            .with_context(|| format!("Failed to parse lock {}", lock_path.display()))?;

        for gem in existing.all_gems() {
            if options.update.iter().any(|name| name == &gem.name) {
                continue;
            }
            if let Provider::Registry(registry) = &**sources.provider_for(&gem.name) {
                registry.pin(&gem.name, gem.version.clone());
            }
        }
    }

    let resolver = Resolver::new(sources).with_prerelease(options.pre);
    let token = CancellationToken::new();
    let resolution = resolver
        .resolve(&manifest, &token)
        .await
        .context("Dependency resolution failed")?;

    let lock = Lockfile::from_resolution(&manifest, &resolution, env!("CARGO_PKG_VERSION"));
    let text = lock.to_string();

    if options.print {
        print!("{text}");
        return Ok(());
    }

    fs_utils::atomic_write(&lock_path, text.as_bytes())
        .with_context(|| format!("Failed to write lock {}", lock_path.display()))?;

    println!(
        "Resolved {} gems; lock written to {}",
        resolution.gems.len(),
        lock_path.display()
    );
    Ok(())
}
