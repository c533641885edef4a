//! Dependency resolution using the `PubGrub` algorithm.
//!
//! The solver only ever sees the provider seam: which versions exist and
//! what a version's runtime edges are. Source routing is fixed before
//! solving, tie-breaks are deterministic (fewest candidates first, then
//! lexicographically smallest name; highest satisfying version wins), and
//! conflicts surface as an explanation chain derived from the learned
//! incompatibilities.

use crate::manifest::Manifest;
use crate::source::{Provider, Source, SourceError, SourceMap, SourceProvider};
use crate::version::{Constraint, Version};
use pubgrub::{
    DefaultStringReporter, Dependencies, DependencyConstraints, DependencyProvider,
    PackageResolutionStatistics, Ranges, Reporter,
};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Virtual package holding the manifest's direct dependencies
const ROOT_PACKAGE: &str = "___root___";

/// Errors that can occur during dependency resolution
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("failed to resolve dependencies:\n{explanation}")]
    Unsatisfiable { explanation: String },

    #[error("error retrieving metadata for {gem}: {source}")]
    Provider {
        gem: String,
        #[source]
        source: SourceError,
    },

    #[error("invalid constraint {constraint:?} for gem {gem:?}: {source}")]
    InvalidConstraint {
        gem: String,
        constraint: String,
        #[source]
        source: crate::version::ConstraintError,
    },
}

/// One runtime edge of a resolved gem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDep {
    pub name: String,
    pub constraint: Constraint,
}

/// A gem at the version and source chosen by the resolver
#[derive(Debug, Clone)]
pub struct ResolvedGem {
    pub name: String,
    pub version: Version,

    /// Platform tag; resolution works over portable releases
    pub platform: String,

    pub source: Source,

    /// Runtime edges, sorted by dependency name
    pub deps: Vec<ResolvedDep>,

    /// Groups of the manifest declaration (empty for transitive gems)
    pub groups: Vec<String>,

    /// Archive checksum recorded by the registry, when known
    pub checksum: Option<String>,
}

/// The resolver's output: resolved gems sorted by name
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub gems: Vec<ResolvedGem>,
}

impl Resolution {
    /// Look up a resolved gem by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResolvedGem> {
        self.gems.iter().find(|gem| gem.name == name)
    }
}

/// Dependency resolver over a fixed source routing
pub struct Resolver {
    sources: SourceMap,
    allow_prerelease: bool,
}

impl Resolver {
    #[must_use]
    pub fn new(sources: SourceMap) -> Self {
        Self {
            sources,
            allow_prerelease: false,
        }
    }

    /// Allow prerelease versions for every package, not just those whose
    /// constraints mention one.
    #[must_use]
    pub const fn with_prerelease(mut self, allow_prerelease: bool) -> Self {
        self.allow_prerelease = allow_prerelease;
        self
    }

    /// The source routing in use.
    #[must_use]
    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    /// Resolve the manifest's direct dependencies to a full graph.
    ///
    /// # Errors
    ///
    /// Returns an error when the graph is unsatisfiable (with the conflict
    /// explanation), a constraint is invalid, or a provider fails.
    pub async fn resolve(
        &self,
        manifest: &Manifest,
        token: &CancellationToken,
    ) -> Result<Resolution, ResolverError> {
        let mut root_deps: HashMap<String, Ranges<Version>> = HashMap::new();
        let mut prerelease_ok = HashSet::new();
        for dep in &manifest.dependencies {
            if dep.constraint.mentions_prerelease() {
                prerelease_ok.insert(dep.name.clone());
            }
            root_deps.insert(dep.name.clone(), dep.constraint.to_ranges());
        }

        // Warm the provider caches for direct dependencies so the solver's
        // blocking bridge mostly hits memory.
        let mut warmers = Vec::with_capacity(manifest.dependencies.len());
        for dep in &manifest.dependencies {
            let provider = Arc::clone(self.sources.provider_for(&dep.name));
            let name = dep.name.clone();
            let token = token.clone();
            warmers.push(tokio::spawn(async move {
                drop(provider.versions(&name, &token).await);
            }));
        }
        for warmer in warmers {
            drop(warmer.await);
        }

        let provider = PubGrubAdapter {
            sources: &self.sources,
            root_deps: root_deps.clone(),
            allow_prerelease: self.allow_prerelease,
            prerelease_ok: RwLock::new(prerelease_ok),
            token: token.clone(),
        };

        let solution = pubgrub::resolve(&provider, ROOT_PACKAGE.to_string(), Version::default())
            .map_err(|err| {
                use pubgrub::PubGrubError;
                match err {
                    PubGrubError::NoSolution(tree) => ResolverError::Unsatisfiable {
                        explanation: DefaultStringReporter::report(&tree),
                    },
                    PubGrubError::ErrorRetrievingDependencies {
                        package, source, ..
                    } => ResolverError::Provider {
                        gem: package,
                        source,
                    },
                    PubGrubError::ErrorChoosingVersion { package, source } => {
                        ResolverError::Provider {
                            gem: package,
                            source,
                        }
                    }
                    PubGrubError::ErrorInShouldCancel(source) => ResolverError::Provider {
                        gem: String::new(),
                        source,
                    },
                }
            })?;

        let mut gems = Vec::new();
        for (package, version) in solution {
            if package == ROOT_PACKAGE {
                continue;
            }

            let source_provider = self.sources.provider_for(&package);
            let provider_error = |source| ResolverError::Provider {
                gem: package.clone(),
                source,
            };

            let mut deps: Vec<ResolvedDep> = source_provider
                .deps(&package, &version, token)
                .await
                .map_err(provider_error)?
                .into_iter()
                .map(|(name, constraint)| ResolvedDep { name, constraint })
                .collect();
            deps.sort_by(|a, b| a.name.cmp(&b.name));

            let source = source_provider
                .source(token)
                .await
                .map_err(|source| ResolverError::Provider {
                    gem: package.clone(),
                    source,
                })?;

            let checksum = match &**source_provider {
                Provider::Registry(registry) => registry
                    .checksum_for(&package, &version, token)
                    .await
                    .unwrap_or(None),
                _ => None,
            };

            let groups = manifest
                .dependencies
                .iter()
                .find(|dep| dep.name == package)
                .map(|dep| dep.groups.clone())
                .unwrap_or_default();

            debug!(gem = %package, version = %version, "resolved");
            gems.push(ResolvedGem {
                name: package,
                version,
                platform: "ruby".to_string(),
                source,
                deps,
                groups,
                checksum,
            });
        }

        // Deterministic output order regardless of solver internals
        gems.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Resolution { gems })
    }
}

/// Bridges the synchronous `PubGrub` trait onto the async providers.
struct PubGrubAdapter<'a> {
    sources: &'a SourceMap,
    root_deps: HashMap<String, Ranges<Version>>,
    allow_prerelease: bool,
    prerelease_ok: RwLock<HashSet<String>>,
    token: CancellationToken,
}

impl PubGrubAdapter<'_> {
    /// Candidate versions for `package`, ascending, with prereleases gated.
    fn candidates(&self, package: &str) -> Result<Vec<Version>, SourceError> {
        let provider = self.sources.provider_for(package);
        let token = self.token.clone();
        let name = package.to_string();
        let versions = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(async { provider.versions(&name, &token).await })
        })?;

        let allow = self.allow_prerelease
            || self
                .prerelease_ok
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .contains(package);

        Ok(versions
            .into_iter()
            .filter(|version| allow || !version.is_prerelease())
            .collect())
    }
}

impl DependencyProvider for PubGrubAdapter<'_> {
    type P = String;
    type V = Version;
    type VS = Ranges<Version>;
    type M = String;
    type Err = SourceError;
    type Priority = (Reverse<u64>, Reverse<String>);

    fn prioritize(
        &self,
        package: &Self::P,
        range: &Self::VS,
        _statistics: &PackageResolutionStatistics,
    ) -> Self::Priority {
        if package == ROOT_PACKAGE {
            return (Reverse(0), Reverse(package.clone()));
        }

        // Fewest in-range candidates first, ties by smallest name. The
        // provider memoizes, so counting is a cache hit after the first ask.
        let count = self.candidates(package).map_or(0, |versions| {
            versions.iter().filter(|v| range.contains(v)).count() as u64
        });
        (Reverse(count), Reverse(package.clone()))
    }

    fn choose_version(
        &self,
        package: &Self::P,
        range: &Self::VS,
    ) -> Result<Option<Self::V>, Self::Err> {
        if package == ROOT_PACKAGE {
            return Ok(Some(Version::default()));
        }

        // Highest satisfying candidate
        Ok(self
            .candidates(package)?
            .into_iter()
            .filter(|version| range.contains(version))
            .next_back())
    }

    fn get_dependencies(
        &self,
        package: &Self::P,
        version: &Self::V,
    ) -> Result<Dependencies<Self::P, Self::VS, Self::M>, Self::Err> {
        if package == ROOT_PACKAGE {
            let mut deps = DependencyConstraints::default();
            for (name, ranges) in &self.root_deps {
                deps.insert(name.clone(), ranges.clone());
            }
            return Ok(Dependencies::Available(deps));
        }

        let provider = self.sources.provider_for(package);
        let token = self.token.clone();
        let name = package.clone();
        let version = version.clone();
        let edges = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(async { provider.deps(&name, &version, &token).await })
        })?;

        let mut deps = DependencyConstraints::default();
        for (dep_name, constraint) in edges {
            if constraint.mentions_prerelease() {
                self.prerelease_ok
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(dep_name.clone());
            }
            deps.insert(dep_name, constraint.to_ranges());
        }
        Ok(Dependencies::Available(deps))
    }
}
