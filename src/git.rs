//! Git operations for git gem support
//!
//! Clones gem repositories into a content-addressed cache, resolves
//! references to revisions, and serves versions/dependencies from the
//! gemspec at the repository root.

use crate::gemspec::{self, Gemspec};
use crate::manifest::canonical_name;
use crate::source::{GitReference, Source, SourceError, SourceProvider};
use crate::version::{Constraint, Version};
use anyhow::{Context, Result};
use git2::{Repository, build::CheckoutBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to clone {repo}: {source}")]
    CloneError {
        repo: String,
        #[source]
        source: git2::Error,
    },

    #[error("failed to fetch {repo}: {source}")]
    FetchError {
        repo: String,
        #[source]
        source: git2::Error,
    },

    #[error("could not resolve {reference} in {repo}: {source}")]
    ResolveError {
        repo: String,
        reference: String,
        #[source]
        source: git2::Error,
    },

    #[error("failed to checkout {revision} in {repo}: {source}")]
    CheckoutError {
        repo: String,
        revision: String,
        #[source]
        source: git2::Error,
    },

    #[error("git task for {repo} aborted: {reason}")]
    TaskAborted { repo: String, reason: String },

    #[error("git operation cancelled")]
    Cancelled,
}

/// Manages the content-addressed git repository cache
#[derive(Debug)]
pub struct GitManager {
    cache_dir: PathBuf,
}

impl GitManager {
    /// Create a new git manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir).context("Failed to create git cache directory")?;
        Ok(Self { cache_dir })
    }

    /// The cache directory for one remote: `<git_cache>/<sha256(remote)[..16]>`.
    #[must_use]
    pub fn repo_dir(&self, remote: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(remote.as_bytes()));
        self.cache_dir.join(&digest[..16])
    }

    /// Clone `remote` into the cache, or fetch if already cloned.
    ///
    /// # Errors
    ///
    /// Returns an error if the clone or fetch fails.
    pub fn clone_or_fetch(&self, remote: &str) -> Result<Repository, GitError> {
        let repo_path = self.repo_dir(remote);

        let repo = if repo_path.join(".git").exists() {
            Repository::open(&repo_path).map_err(|source| GitError::CloneError {
                repo: remote.to_string(),
                source,
            })?
        } else {
            debug!(remote, path = %repo_path.display(), "cloning git source");
            Repository::clone(remote, &repo_path).map_err(|source| GitError::CloneError {
                repo: remote.to_string(),
                source,
            })?
        };

        {
            let mut origin = repo
                .find_remote("origin")
                .or_else(|_| repo.remote_anonymous(remote))
                .map_err(|source| GitError::FetchError {
                    repo: remote.to_string(),
                    source,
                })?;

            origin
                .fetch(
                    &["+refs/heads/*:refs/remotes/origin/*", "+refs/tags/*:refs/tags/*"],
                    None,
                    None,
                )
                .map_err(|source| GitError::FetchError {
                    repo: remote.to_string(),
                    source,
                })?;
        }

        Ok(repo)
    }

    /// Resolve a reference to its commit revision (the `rev-parse`
    /// equivalent).
    ///
    /// # Errors
    ///
    /// Returns an error if the reference does not exist in the repository.
    pub fn resolve_reference(
        repo: &Repository,
        remote: &str,
        reference: &GitReference,
    ) -> Result<git2::Oid, GitError> {
        let resolve = |what: &str| {
            repo.revparse_single(what)
                .and_then(|object| object.peel_to_commit())
                .map(|commit| commit.id())
        };

        let result = match reference {
            GitReference::Branch(branch) => resolve(&format!("refs/remotes/origin/{branch}"))
                .or_else(|_| resolve(&format!("refs/heads/{branch}"))),
            GitReference::Tag(tag) => resolve(&format!("refs/tags/{tag}")),
            GitReference::Rev(rev) => resolve(rev),
            GitReference::Head => resolve("HEAD"),
        };

        result.map_err(|source| GitError::ResolveError {
            repo: remote.to_string(),
            reference: reference.to_string(),
            source,
        })
    }

    /// Check the working tree out at `revision` (detached).
    ///
    /// # Errors
    ///
    /// Returns an error if the commit is missing or checkout fails.
    pub fn checkout(
        repo: &Repository,
        remote: &str,
        revision: git2::Oid,
    ) -> Result<(), GitError> {
        let checkout_error = |source| GitError::CheckoutError {
            repo: remote.to_string(),
            revision: revision.to_string(),
            source,
        };

        let commit = repo.find_commit(revision).map_err(checkout_error)?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
            .map_err(checkout_error)?;
        repo.set_head_detached(revision).map_err(checkout_error)?;
        Ok(())
    }

    /// Clone-or-fetch `remote` and check out `reference`.
    ///
    /// Returns the checkout path and the resolved 40-hex revision.
    ///
    /// # Errors
    ///
    /// Returns an error if any git step fails.
    pub fn checkout_reference(
        &self,
        remote: &str,
        reference: &GitReference,
    ) -> Result<(PathBuf, String), GitError> {
        let repo = self.clone_or_fetch(remote)?;
        let revision = Self::resolve_reference(&repo, remote, reference)?;
        Self::checkout(&repo, remote, revision)?;
        Ok((self.repo_dir(remote), revision.to_string()))
    }

    /// Clone-or-fetch `remote` and check out a known revision (install from
    /// lock).
    ///
    /// # Errors
    ///
    /// Returns an error if the revision is not present after fetch.
    pub fn checkout_revision(&self, remote: &str, revision: &str) -> Result<PathBuf, GitError> {
        let repo = self.clone_or_fetch(remote)?;
        let oid = git2::Oid::from_str(revision).map_err(|source| GitError::ResolveError {
            repo: remote.to_string(),
            reference: format!("ref {revision}"),
            source,
        })?;
        Self::checkout(&repo, remote, oid)?;
        Ok(self.repo_dir(remote))
    }

    /// Get the cache directory path.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[derive(Debug)]
struct CheckoutState {
    revision: String,
    spec: Gemspec,
}

/// Provider for one (remote, reference) git source
///
/// The clone, reference resolution and gemspec parse happen once on first
/// use; repeated calls reuse the resolved state.
#[derive(Debug)]
pub struct GitProvider {
    manager: Arc<GitManager>,
    remote: String,
    reference: GitReference,
    state: OnceCell<CheckoutState>,
}

impl GitProvider {
    #[must_use]
    pub fn new(manager: Arc<GitManager>, remote: String, reference: GitReference) -> Self {
        Self {
            manager,
            remote,
            reference,
            state: OnceCell::new(),
        }
    }

    async fn ensure(&self, token: &CancellationToken) -> Result<&CheckoutState, SourceError> {
        if token.is_cancelled() {
            return Err(GitError::Cancelled.into());
        }

        self.state
            .get_or_try_init(|| async {
                let manager = Arc::clone(&self.manager);
                let remote = self.remote.clone();
                let reference = self.reference.clone();

                let (path, revision) =
                    tokio::task::spawn_blocking(move || manager.checkout_reference(&remote, &reference))
                        .await
                        .map_err(|join| GitError::TaskAborted {
                            repo: self.remote.clone(),
                            reason: join.to_string(),
                        })??;

                let gemspec_path = gemspec::find_gemspec(&path)?;
                let spec = gemspec::parse_ruby_file(&gemspec_path)?;
                Ok::<_, SourceError>(CheckoutState { revision, spec })
            })
            .await
    }

    /// The checked-out revision, resolving the reference if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the clone or resolution fails.
    pub async fn revision(&self, token: &CancellationToken) -> Result<String, SourceError> {
        Ok(self.ensure(token).await?.revision.clone())
    }

    /// The remote URL.
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// The declared reference.
    #[must_use]
    pub fn reference(&self) -> &GitReference {
        &self.reference
    }
}

impl SourceProvider for GitProvider {
    async fn source(&self, token: &CancellationToken) -> Result<Source, SourceError> {
        let state = self.ensure(token).await?;
        Ok(Source::Git {
            remote: self.remote.clone(),
            reference: self.reference.clone(),
            revision: state.revision.clone(),
        })
    }

    async fn versions(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Version>, SourceError> {
        let state = self.ensure(token).await?;
        if canonical_name(&state.spec.name) != name {
            return Err(SourceError::NotFound {
                gem: name.to_string(),
                source_location: self.remote.clone(),
            });
        }
        Ok(vec![state.spec.version_or_zero()])
    }

    async fn deps(
        &self,
        _name: &str,
        _version: &Version,
        token: &CancellationToken,
    ) -> Result<Vec<(String, Constraint)>, SourceError> {
        let state = self.ensure(token).await?;
        Ok(state.spec.runtime_deps.clone())
    }
}
