//! Gem sources and the provider seam the resolver depends on.
//!
//! A [`Source`] identifies where a resolved gem came from; a
//! [`SourceProvider`] answers the only two questions the resolver ever asks:
//! which versions of a name exist, and what a given version's runtime
//! dependencies are. Routing from manifest declarations to providers is
//! fixed before solving starts.

use crate::compact_index::IndexError;
use crate::gemspec::{self, Gemspec, GemspecError};
use crate::git::{GitError, GitManager, GitProvider};
use crate::manifest::{Manifest, SourceRef, canonical_name};
use crate::registry::RegistryProvider;
use crate::version::{Constraint, Version};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a git source pins its history
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GitReference {
    Branch(String),
    Tag(String),
    Rev(String),
    Head,
}

impl fmt::Display for GitReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(name) => write!(f, "branch {name}"),
            Self::Tag(name) => write!(f, "tag {name}"),
            Self::Rev(rev) => write!(f, "ref {rev}"),
            Self::Head => f.write_str("HEAD"),
        }
    }
}

/// Identity of the source a resolved gem is satisfied from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Registry {
        url: String,
    },
    Git {
        remote: String,
        reference: GitReference,
        /// Resolved 40-hex revision
        revision: String,
    },
    Path {
        path: PathBuf,
    },
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { url } => write!(f, "{url}"),
            Self::Git { remote, revision, .. } => {
                write!(f, "{remote} (at {})", &revision[..revision.len().min(12)])
            }
            Self::Path { path } => write!(f, "{}", path.display()),
        }
    }
}

/// A gem name is claimed by more than one source
#[derive(Debug, Error)]
#[error("gem {gem:?} is declared with more than one source")]
pub struct SourceRoutingError {
    pub gem: String,
}

/// Errors surfaced through the provider seam
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Gemspec(#[from] GemspecError),

    #[error(transparent)]
    Routing(#[from] SourceRoutingError),

    #[error("gem {gem:?} not found in {source_location}")]
    NotFound { gem: String, source_location: String },

    #[error("path source {path} does not provide gem {gem:?}")]
    WrongGem { path: PathBuf, gem: String },
}

/// The two operations the resolver sees, plus the source identity.
///
/// `versions` returns installable candidates ascending; `deps` returns a
/// version's runtime edges. For git sources the identity is only known
/// after the reference has been resolved, so `source` may touch the network
/// on first call.
pub trait SourceProvider {
    fn source(
        &self,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<Source, SourceError>> + Send;

    fn versions(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Version>, SourceError>> + Send;

    fn deps(
        &self,
        name: &str,
        version: &Version,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<(String, Constraint)>, SourceError>> + Send;
}

/// Provider for a filesystem gem directory
#[derive(Debug)]
pub struct PathProvider {
    path: PathBuf,
    spec: Gemspec,
}

impl PathProvider {
    /// Create a provider for `path`, which must exist and contain exactly
    /// one top-level `*.gemspec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or gemspec is missing or invalid.
    pub fn new(path: &Path) -> Result<Self, SourceError> {
        let gemspec_path = gemspec::find_gemspec(path)?;
        let spec = gemspec::parse_ruby_file(&gemspec_path)?;
        Ok(Self {
            path: path.to_path_buf(),
            spec,
        })
    }

    /// The parsed specification.
    #[must_use]
    pub fn spec(&self) -> &Gemspec {
        &self.spec
    }

    /// The gem directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceProvider for PathProvider {
    async fn source(&self, _token: &CancellationToken) -> Result<Source, SourceError> {
        Ok(Source::Path {
            path: self.path.clone(),
        })
    }

    async fn versions(
        &self,
        name: &str,
        _token: &CancellationToken,
    ) -> Result<Vec<Version>, SourceError> {
        if canonical_name(&self.spec.name) != name {
            return Err(SourceError::WrongGem {
                path: self.path.clone(),
                gem: name.to_string(),
            });
        }
        Ok(vec![self.spec.version_or_zero()])
    }

    async fn deps(
        &self,
        _name: &str,
        _version: &Version,
        _token: &CancellationToken,
    ) -> Result<Vec<(String, Constraint)>, SourceError> {
        Ok(self.spec.runtime_deps.clone())
    }
}

/// One of the three provider variants
#[derive(Debug)]
pub enum Provider {
    Registry(RegistryProvider),
    Git(GitProvider),
    Path(PathProvider),
}

impl SourceProvider for Provider {
    async fn source(&self, token: &CancellationToken) -> Result<Source, SourceError> {
        match self {
            Self::Registry(provider) => provider.source(token).await,
            Self::Git(provider) => provider.source(token).await,
            Self::Path(provider) => provider.source(token).await,
        }
    }

    async fn versions(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Version>, SourceError> {
        match self {
            Self::Registry(provider) => provider.versions(name, token).await,
            Self::Git(provider) => provider.versions(name, token).await,
            Self::Path(provider) => provider.versions(name, token).await,
        }
    }

    async fn deps(
        &self,
        name: &str,
        version: &Version,
        token: &CancellationToken,
    ) -> Result<Vec<(String, Constraint)>, SourceError> {
        match self {
            Self::Registry(provider) => provider.deps(name, version, token).await,
            Self::Git(provider) => provider.deps(name, version, token).await,
            Self::Path(provider) => provider.deps(name, version, token).await,
        }
    }
}

/// The fixed name-to-provider routing for one resolution
///
/// Every name resolves through exactly one provider; unqualified names use
/// the default registry.
pub struct SourceMap {
    default: Arc<Provider>,
    by_name: HashMap<String, Arc<Provider>>,
    registries: HashMap<String, Arc<Provider>>,
}

impl SourceMap {
    /// Build the routing from a manifest.
    ///
    /// A name declared with two different sources is a
    /// [`SourceRoutingError`]; declaring the same source twice is allowed.
    ///
    /// # Errors
    ///
    /// Returns an error on conflicting declarations, an invalid registry
    /// URL, or an unreadable path gem.
    pub fn from_manifest(
        manifest: &Manifest,
        default_registry: &str,
        index_cache_root: &Path,
        git_manager: Arc<GitManager>,
    ) -> Result<Self, SourceError> {
        let mut registries = HashMap::new();
        let default_url = manifest
            .default_source
            .clone()
            .unwrap_or_else(|| default_registry.to_string());

        let default = Arc::new(Provider::Registry(RegistryProvider::new(
            &default_url,
            index_cache_root,
        )?));
        registries.insert(default_url, Arc::clone(&default));

        let mut by_name: HashMap<String, Arc<Provider>> = HashMap::new();
        let mut declared: HashMap<String, SourceRef> = HashMap::new();

        for dep in &manifest.dependencies {
            let Some(declaration) = &dep.source else {
                continue;
            };

            if let Some(previous) = declared.get(&dep.name) {
                if previous == declaration {
                    continue;
                }
                return Err(SourceRoutingError {
                    gem: dep.name.clone(),
                }
                .into());
            }
            declared.insert(dep.name.clone(), declaration.clone());

            let provider = match declaration {
                SourceRef::Registry { url } => {
                    if let Some(existing) = registries.get(url) {
                        Arc::clone(existing)
                    } else {
                        let provider = Arc::new(Provider::Registry(RegistryProvider::new(
                            url,
                            index_cache_root,
                        )?));
                        registries.insert(url.clone(), Arc::clone(&provider));
                        provider
                    }
                }
                SourceRef::Git { remote, reference } => Arc::new(Provider::Git(GitProvider::new(
                    Arc::clone(&git_manager),
                    remote.clone(),
                    reference.clone(),
                ))),
                SourceRef::Path { path } => {
                    let absolute = if path.is_absolute() {
                        path.clone()
                    } else {
                        std::env::current_dir()
                            .map(|cwd| cwd.join(path))
                            .unwrap_or_else(|_| path.clone())
                    };
                    Arc::new(Provider::Path(PathProvider::new(&absolute)?))
                }
            };

            by_name.insert(dep.name.clone(), provider);
        }

        Ok(Self {
            default,
            by_name,
            registries,
        })
    }

    /// The provider responsible for `name`.
    #[must_use]
    pub fn provider_for(&self, name: &str) -> &Arc<Provider> {
        self.by_name.get(name).unwrap_or(&self.default)
    }

    /// The default registry provider.
    #[must_use]
    pub fn default_provider(&self) -> &Arc<Provider> {
        &self.default
    }

    /// All registry providers, keyed by URL.
    #[must_use]
    pub fn registries(&self) -> &HashMap<String, Arc<Provider>> {
        &self.registries
    }
}
