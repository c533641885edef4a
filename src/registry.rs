//! Registry provider backed by the compact index.
//!
//! Serves installable versions and runtime dependencies from the cached
//! index, memoizing parsed info files so each gem is fetched at most once
//! per resolution even across concurrent callers.

use crate::compact_index::{CompactIndexClient, VersionInfo};
use crate::source::{Source, SourceError, SourceProvider};
use crate::version::{Constraint, Version};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

/// Provider for one registry
#[derive(Debug)]
pub struct RegistryProvider {
    url: String,
    client: CompactIndexClient,

    /// Parsed info files, one entry per gem
    info_cache: RwLock<HashMap<String, Arc<Vec<VersionInfo>>>>,

    /// Per-gem single-flight guards for the cache above
    info_flights: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Yanked raw versions per gem, loaded from the `versions` file once
    yanked: OnceCell<HashMap<String, HashSet<String>>>,

    /// Selective-update pin map; a pinned name resolves to only that version
    pins: std::sync::RwLock<HashMap<String, Version>>,
}

impl RegistryProvider {
    /// Create a provider for `url`, caching the index under
    /// `index_cache_root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the cache cannot be set up.
    pub fn new(url: &str, index_cache_root: &Path) -> Result<Self, SourceError> {
        let client = CompactIndexClient::new(url, index_cache_root)?;
        Ok(Self {
            url: url.to_string(),
            client,
            info_cache: RwLock::new(HashMap::new()),
            info_flights: std::sync::Mutex::new(HashMap::new()),
            yanked: OnceCell::new(),
            pins: std::sync::RwLock::new(HashMap::new()),
        })
    }

    /// The registry URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pin `name` to exactly one version (selective update).
    pub fn pin(&self, name: &str, version: Version) {
        self.pins
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string(), version);
    }

    /// The recorded archive checksum for a version, when the index has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the info file cannot be fetched.
    pub async fn checksum_for(
        &self,
        name: &str,
        version: &Version,
        token: &CancellationToken,
    ) -> Result<Option<String>, SourceError> {
        let infos = self.info_for(name, token).await?;
        Ok(infos
            .iter()
            .find(|info| info.platform.is_none() && &info.version == version)
            .and_then(|info| info.requirements.get("checksum").cloned()))
    }

    async fn info_for(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Arc<Vec<VersionInfo>>, SourceError> {
        if let Some(cached) = self.info_cache.read().await.get(name) {
            return Ok(Arc::clone(cached));
        }

        // Single-flight: concurrent callers for the same gem wait for the
        // first fetch instead of issuing their own.
        let flight = {
            let mut flights = self
                .info_flights
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(flights.entry(name.to_string()).or_default())
        };
        let _guard = flight.lock().await;

        if let Some(cached) = self.info_cache.read().await.get(name) {
            return Ok(Arc::clone(cached));
        }

        let infos = Arc::new(self.client.get_info(name, token).await?);
        self.info_cache
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&infos));
        Ok(infos)
    }

    async fn yanked_for(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<HashSet<String>, SourceError> {
        let map = self
            .yanked
            .get_or_try_init(|| async {
                let entries = self.client.get_versions(token).await?;
                let mut map: HashMap<String, HashSet<String>> = HashMap::new();
                for entry in entries {
                    let yanked: HashSet<String> = entry
                        .versions
                        .iter()
                        .filter(|(_, yanked)| *yanked)
                        .map(|(version, _)| version.clone())
                        .collect();
                    if !yanked.is_empty() {
                        map.insert(entry.name, yanked);
                    }
                }
                Ok::<_, SourceError>(map)
            })
            .await?;

        Ok(map.get(name).cloned().unwrap_or_default())
    }
}

impl SourceProvider for RegistryProvider {
    async fn source(&self, _token: &CancellationToken) -> Result<Source, SourceError> {
        Ok(Source::Registry {
            url: self.url.clone(),
        })
    }

    async fn versions(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Version>, SourceError> {
        if let Some(pinned) = self
            .pins
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
        {
            return Ok(vec![pinned.clone()]);
        }

        let infos = self.info_for(name, token).await?;
        let yanked = self.yanked_for(name, token).await?;

        // Portable releases only, ascending; yanked versions are never
        // selectable, pinned or not.
        let versions: BTreeSet<Version> = infos
            .iter()
            .filter(|info| info.platform.is_none())
            .filter(|info| !yanked.contains(&info.raw_version))
            .map(|info| info.version.clone())
            .collect();

        Ok(versions.into_iter().collect())
    }

    async fn deps(
        &self,
        name: &str,
        version: &Version,
        token: &CancellationToken,
    ) -> Result<Vec<(String, Constraint)>, SourceError> {
        let infos = self.info_for(name, token).await?;
        infos
            .iter()
            .find(|info| info.platform.is_none() && &info.version == version)
            .map(|info| info.deps.clone())
            .ok_or_else(|| SourceError::NotFound {
                gem: format!("{name}-{version}"),
                source_location: self.url.clone(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests can panic")]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // Seed the on-disk cache so the provider reads without any network:
    // files younger than the freshness window are served as-is.
    fn seeded_provider(temp: &TempDir, versions: &str, infos: &[(&str, &str)]) -> RegistryProvider {
        let provider = RegistryProvider::new("https://rubygems.org", temp.path()).unwrap();
        let cache = provider.client.cache_dir().to_path_buf();
        fs::write(cache.join("versions"), versions).unwrap();
        for (name, content) in infos {
            fs::write(cache.join("info").join(name), content).unwrap();
        }
        provider
    }

    #[tokio::test]
    async fn versions_are_portable_ascending_and_deduped() {
        let temp = TempDir::new().unwrap();
        let provider = seeded_provider(
            &temp,
            "---\nrack 3.0.0,3.0.5,3.1.0 abc\n",
            &[(
                "rack",
                "---\n3.1.0 \n3.0.0 \n3.0.5 \n3.0.5-arm64-darwin \n",
            )],
        );

        let token = CancellationToken::new();
        let versions = provider.versions("rack", &token).await.unwrap();
        let formatted: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(formatted, vec!["3.0.0", "3.0.5", "3.1.0"]);
    }

    #[tokio::test]
    async fn yanked_versions_are_never_selectable() {
        let temp = TempDir::new().unwrap();
        let provider = seeded_provider(
            &temp,
            "---\nrack 3.0.0,-3.0.5,3.1.0 abc\n",
            &[("rack", "---\n3.0.0 \n3.0.5 \n3.1.0 \n")],
        );

        let token = CancellationToken::new();
        let versions = provider.versions("rack", &token).await.unwrap();
        let formatted: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(formatted, vec!["3.0.0", "3.1.0"]);
    }

    #[tokio::test]
    async fn pin_narrows_to_one_version() {
        let temp = TempDir::new().unwrap();
        let provider = seeded_provider(
            &temp,
            "---\nrack 3.0.0,3.0.5 abc\n",
            &[("rack", "---\n3.0.0 \n3.0.5 \n")],
        );
        provider.pin("rack", Version::parse("3.0.0").unwrap());

        let token = CancellationToken::new();
        let versions = provider.versions("rack", &token).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].to_string(), "3.0.0");
    }

    #[tokio::test]
    async fn deps_for_missing_version_is_not_found() {
        let temp = TempDir::new().unwrap();
        let provider = seeded_provider(
            &temp,
            "---\nrack 3.0.0 abc\n",
            &[("rack", "---\n3.0.0 \n")],
        );

        let token = CancellationToken::new();
        let missing = Version::parse("9.9.9").unwrap();
        assert!(matches!(
            provider.deps("rack", &missing, &token).await,
            Err(SourceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deps_and_checksum_come_from_the_info_file() {
        let temp = TempDir::new().unwrap();
        let provider = seeded_provider(
            &temp,
            "---\nrails 8.0.1 abc\n",
            &[(
                "rails",
                "---\n8.0.1 actionpack:= 8.0.1,activesupport:= 8.0.1 |checksum:feedface\n",
            )],
        );

        let token = CancellationToken::new();
        let version = Version::parse("8.0.1").unwrap();

        let deps = provider.deps("rails", &version, &token).await.unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].0, "actionpack");
        assert_eq!(deps[0].1.to_string(), "= 8.0.1");

        let checksum = provider
            .checksum_for("rails", &version, &token)
            .await
            .unwrap();
        assert_eq!(checksum.as_deref(), Some("feedface"));
    }
}
