//! Ore CLI internal library code

/// Default gem registry URL
pub const DEFAULT_REGISTRY: &str = "https://rubygems.org";

pub mod compact_index;
pub mod config;
pub mod download;
pub mod env_vars;
pub mod extensions;
pub mod fs_utils;
pub mod gemspec;
pub mod git;
pub mod installer;
pub mod lockfile;
pub mod manifest;
pub mod pipeline;
pub mod platform;
pub mod registry;
pub mod resolver;
pub mod source;
pub mod version;

// Re-export common types for convenience
pub use compact_index::{CompactIndexClient, IndexError};
pub use download::{DownloadError, Endpoint, SourceManager};
pub use extensions::{ExtensionBackend, ExtensionBuilder};
pub use git::{GitError, GitManager};
pub use installer::{ArchiveError, InstallOutcome, Installer};
pub use lockfile::{LockError, LockedGem, Lockfile};
pub use manifest::{Manifest, ManifestDep, ManifestError};
pub use pipeline::{InstallReport, Pipeline, PipelineError};
pub use registry::RegistryProvider;
pub use resolver::{Resolution, ResolvedGem, Resolver, ResolverError};
pub use source::{Provider, Source, SourceError, SourceMap, SourceProvider};
pub use version::{Constraint, Requirement, Version};
