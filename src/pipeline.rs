//! Concurrent fetch/install orchestration.
//!
//! A bounded worker pool runs one unit per gem (fetch, then install). The
//! first fatal error cancels the shared token; pending units short-circuit
//! and in-flight units finish and are counted. Extension build failures
//! are counted and warned, never fatal.

use crate::download::{DownloadError, SourceManager};
use crate::extensions::ExtensionBuilder;
use crate::gemspec::{self, GemspecError};
use crate::git::{GitError, GitManager};
use crate::installer::{ArchiveError, InstallOutcome, Installer};
use crate::lockfile::{LockedGem, Lockfile};
use crate::platform;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to download {gem}: {source}")]
    Download {
        gem: String,
        #[source]
        source: DownloadError,
    },

    #[error("failed to install {gem}: {source}")]
    Install {
        gem: String,
        #[source]
        source: ArchiveError,
    },

    #[error("failed to prepare git source for {gem}: {source}")]
    Git {
        gem: String,
        #[source]
        source: GitError,
    },

    #[error("failed to read specification for {gem}: {source}")]
    Gemspec {
        gem: String,
        #[source]
        source: GemspecError,
    },

    #[error("no download source configured for registry {remote}")]
    MissingManager { remote: String },

    #[error("install cancelled")]
    Cancelled,
}

/// Aggregate install statistics
///
/// Counts only; unit completion order never affects the report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub extension_failures: usize,
}

impl InstallReport {
    pub const fn record_installed(&mut self) {
        self.installed += 1;
    }

    pub const fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    pub const fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub const fn record_cancelled(&mut self) {
        self.cancelled += 1;
    }

    pub const fn record_extension_failure(&mut self) {
        self.extension_failures += 1;
    }
}

impl fmt::Display for InstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Installed={}, Skipped={}, Failed={}",
            self.installed, self.skipped, self.failed
        )?;
        if self.cancelled > 0 {
            write!(f, ", Cancelled={}", self.cancelled)?;
        }
        if self.extension_failures > 0 {
            write!(f, ", ExtensionFailures={}", self.extension_failures)?;
        }
        Ok(())
    }
}

/// One unit of work: fetch and install a single gem
enum Unit {
    Registry {
        gem: LockedGem,
        manager: Arc<SourceManager>,
    },
    Git {
        gem: LockedGem,
        remote: String,
        revision: String,
    },
    Path {
        gem: LockedGem,
        path: PathBuf,
    },
}

impl Unit {
    fn gem(&self) -> &LockedGem {
        match self {
            Self::Registry { gem, .. } | Self::Git { gem, .. } | Self::Path { gem, .. } => gem,
        }
    }
}

/// Bounded parallel fetch + install pipeline
pub struct Pipeline {
    installer: Arc<Installer>,
    extensions: Arc<ExtensionBuilder>,
    git: Arc<GitManager>,
    workers: usize,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        installer: Installer,
        extensions: ExtensionBuilder,
        git: Arc<GitManager>,
    ) -> Self {
        Self {
            installer: Arc::new(installer),
            extensions: Arc::new(extensions),
            git,
            workers: num_cpus::get(),
        }
    }

    /// Override the worker count (defaults to the CPU count).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Install every applicable gem in the lock.
    ///
    /// `install_set` (when present) limits installation to those names;
    /// gems for foreign platforms are skipped either way. `managers` maps
    /// each registry remote to its download coordinator.
    ///
    /// Returns the aggregate report, plus collected post-install messages
    /// as (gem name, message) pairs.
    ///
    /// # Errors
    ///
    /// Returns the first fatal per-gem error, or `Cancelled` when the
    /// token fired before completion.
    pub async fn run(
        &self,
        lock: &Lockfile,
        install_set: Option<&HashSet<String>>,
        managers: &HashMap<String, Arc<SourceManager>>,
        token: &CancellationToken,
    ) -> Result<(InstallReport, Vec<(String, String)>), PipelineError> {
        let mut units: Vec<Unit> = Vec::new();
        let report = Arc::new(Mutex::new(InstallReport::default()));

        for section in &lock.registries {
            let manager = managers
                .get(&section.remote)
                .or_else(|| managers.get(section.remote.trim_end_matches('/')))
                .ok_or_else(|| PipelineError::MissingManager {
                    remote: section.remote.clone(),
                })?;
            for gem in &section.gems {
                units.push(Unit::Registry {
                    gem: gem.clone(),
                    manager: Arc::clone(manager),
                });
            }
        }
        for section in &lock.git {
            for gem in &section.gems {
                units.push(Unit::Git {
                    gem: gem.clone(),
                    remote: section.remote.clone(),
                    revision: section.revision.clone(),
                });
            }
        }
        for section in &lock.paths {
            for gem in &section.gems {
                units.push(Unit::Path {
                    gem: gem.clone(),
                    path: PathBuf::from(&section.path),
                });
            }
        }

        // Group exclusion and platform applicability decide up front;
        // skipped units never reach the pool.
        units.retain(|unit| {
            let gem = unit.gem();
            if let Some(set) = install_set
                && !set.contains(&gem.name)
            {
                debug!(gem = %gem.name, "excluded by group filter");
                return false;
            }
            if let Some(tag) = &gem.platform
                && !platform::platform_matches_host(tag)
            {
                report
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .record_skipped();
                debug!(gem = %gem.name, platform = %tag, "foreign platform, skipping");
                return false;
            }
            true
        });

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let messages: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks: JoinSet<Result<(), PipelineError>> = JoinSet::new();

        for unit in units {
            let semaphore = Arc::clone(&semaphore);
            let installer = Arc::clone(&self.installer);
            let extensions = Arc::clone(&self.extensions);
            let git = Arc::clone(&self.git);
            let report = Arc::clone(&report);
            let messages = Arc::clone(&messages);
            let token = token.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(PipelineError::Cancelled);
                };

                // Checked before starting each unit; in-flight work runs on
                // and is recorded by the collector either way.
                if token.is_cancelled() {
                    report
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .record_cancelled();
                    return Ok(());
                }

                let installed = match unit {
                    Unit::Registry { gem, manager } => {
                        let filename = format!("{}.gem", gem.full_name_with_platform());
                        let archive = manager
                            .download(&filename, None, &token)
                            .await
                            .map_err(|source| PipelineError::Download {
                                gem: gem.name.clone(),
                                source,
                            })?;

                        let installer = Arc::clone(&installer);
                        let name = gem.name.clone();
                        tokio::task::spawn_blocking(move || {
                            installer.install_archive(&archive, &gem)
                        })
                        .await
                        .map_err(|_| PipelineError::Cancelled)?
                        .map_err(|source| PipelineError::Install { gem: name, source })?
                    }
                    Unit::Git {
                        gem,
                        remote,
                        revision,
                    } => {
                        let installer = Arc::clone(&installer);
                        let name = gem.name.clone();
                        tokio::task::spawn_blocking(move || {
                            let checkout = git
                                .checkout_revision(&remote, &revision)
                                .map_err(|source| PipelineError::Git {
                                    gem: gem.name.clone(),
                                    source,
                                })?;
                            let spec_path = gemspec::find_gemspec(&checkout)
                                .map_err(|source| PipelineError::Gemspec {
                                    gem: gem.name.clone(),
                                    source,
                                })?;
                            let spec = gemspec::parse_ruby_file(&spec_path).map_err(|source| {
                                PipelineError::Gemspec {
                                    gem: gem.name.clone(),
                                    source,
                                }
                            })?;
                            installer
                                .install_tree(&checkout, &spec, &gem)
                                .map_err(|source| PipelineError::Install {
                                    gem: gem.name.clone(),
                                    source,
                                })
                        })
                        .await
                        .map_err(|_| PipelineError::Cancelled)
                        .and_then(|result| result)
                        .map_err(|error| {
                            debug!(gem = %name, %error, "git unit failed");
                            error
                        })?
                    }
                    Unit::Path { gem, path } => {
                        let installer = Arc::clone(&installer);
                        tokio::task::spawn_blocking(move || {
                            let spec_path = gemspec::find_gemspec(&path).map_err(|source| {
                                PipelineError::Gemspec {
                                    gem: gem.name.clone(),
                                    source,
                                }
                            })?;
                            let spec = gemspec::parse_ruby_file(&spec_path).map_err(|source| {
                                PipelineError::Gemspec {
                                    gem: gem.name.clone(),
                                    source,
                                }
                            })?;
                            installer
                                .install_tree(&path, &spec, &gem)
                                .map_err(|source| PipelineError::Install {
                                    gem: gem.name.clone(),
                                    source,
                                })
                        })
                        .await
                        .map_err(|_| PipelineError::Cancelled)
                        .and_then(|result| result)?
                    }
                };

                match installed {
                    (InstallOutcome::Skipped, _) => {
                        report
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .record_skipped();
                    }
                    (InstallOutcome::Installed, Some(done)) => {
                        report
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .record_installed();

                        if let Some(message) = &done.spec.post_install_message {
                            messages
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .push((done.full_name.clone(), message.clone()));
                        }

                        if let Some(outcome) = extensions.build_if_needed(
                            &done.full_name,
                            &done.gem_dir,
                            &done.spec.extensions,
                        ) && !outcome.success()
                        {
                            report
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .record_extension_failure();
                        }
                    }
                    (InstallOutcome::Installed, None) => {
                        report
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .record_installed();
                    }
                }

                Ok(())
            });
        }

        // First fatal error wins and cancels everything still pending.
        let mut first_error: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    report
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .record_failed();
                    if first_error.is_none() {
                        warn!(%error, "aborting install");
                        token.cancel();
                        first_error = Some(error);
                    }
                }
                Err(join_error) => {
                    report
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .record_failed();
                    if first_error.is_none() {
                        warn!(%join_error, "install worker aborted");
                        token.cancel();
                        first_error = Some(PipelineError::Cancelled);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        let report = *report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let messages = std::mem::take(
            &mut *messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        if token.is_cancelled() && report.cancelled > 0 {
            return Err(PipelineError::Cancelled);
        }
        Ok((report, messages))
    }
}
