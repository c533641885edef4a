//! Install command
//!
//! Download and install every gem pinned in the lock.

use anyhow::{Context, Result};
use ore::{
    ExtensionBuilder, GitManager, Installer, Lockfile, Manifest, Pipeline, SourceManager, config,
    env_vars, fs_utils,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for the install command
#[derive(Debug)]
pub(crate) struct InstallOptions {
    /// Manifest path override
    pub gemfile: Option<String>,

    /// Groups to exclude
    pub without: Vec<String>,

    /// Rebuild already-installed gems
    pub force: bool,

    /// Worker count override
    pub jobs: Option<usize>,

    /// Verbose output
    pub verbose: bool,
}

pub(crate) async fn run(options: InstallOptions) -> Result<()> {
    let project = std::env::current_dir().context("Failed to determine working directory")?;
    let manifest_path = options
        .gemfile
        .map_or_else(|| config::find_manifest(&project), PathBuf::from);
    let lock_path = config::lockfile_for_manifest(&manifest_path);

    let manifest = Manifest::parse_file(&manifest_path)
        .with_context(|| format!("Failed to read manifest {}", manifest_path.display()))?;

    let lock_text = std::fs::read_to_string(&lock_path).with_context(|| {
        format!(
            "Failed to read lock {} (run `ore lock` first)",
            lock_path.display()
        )
    })?;
    let lock = Lockfile::parse(&lock_text)
        .with_context(|| format!("Failed to parse lock {}", lock_path.display()))?;

    let cache_dir = config::archive_cache_dir()?;
    std::fs::create_dir_all(&cache_dir).context("Failed to create archive cache")?;
    fs_utils::clean_stale_tmp(&cache_dir).context("Archive cache is corrupted")?;

    // One download coordinator per registry block. A configured mirror
    // becomes the primary with the declared registry as fallback.
    let mirror = env_vars::gem_mirror();
    let mut managers: HashMap<String, Arc<SourceManager>> = HashMap::new();
    for section in &lock.registries {
        let declared = section.remote.trim_end_matches('/');
        let manager = match &mirror {
            Some(mirror) => SourceManager::new(mirror, Some(declared), cache_dir.clone()),
            None => SourceManager::new(declared, None, cache_dir.clone()),
        }
        .with_context(|| format!("Failed to set up downloads for {declared}"))?;
        managers.insert(section.remote.clone(), Arc::new(manager));
    }

    let token = CancellationToken::new();

    if options.verbose {
        for (remote, manager) in &managers {
            if !manager.probe_health(&token).await {
                warn!(%remote, "note: registry endpoint failed its health probe");
            }
        }
    }

    let install_set = (!options.without.is_empty())
        .then(|| lock.install_set(&manifest, &options.without));

    let workers = options.jobs.unwrap_or_else(num_cpus::get);
    let vendor = config::vendor_dir(&project);
    let installer = Installer::new(vendor.clone()).with_force(options.force);
    let git = Arc::new(
        GitManager::new(config::git_cache_dir()?).context("Failed to set up git cache")?,
    );
    let extensions = ExtensionBuilder::new(workers, options.verbose);

    let pipeline = Pipeline::new(installer, extensions, git).with_workers(workers);
    let (report, messages) = pipeline
        .run(&lock, install_set.as_ref(), &managers, &token)
        .await
        .context("Install failed")?;

    for (gem, message) in messages {
        println!("Post-install message from {gem}:");
        println!("{message}");
    }

    println!("{report}");
    Ok(())
}
