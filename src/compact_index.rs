//! Compact-index client.
//!
//! Maintains a persistent local mirror of a registry's append-only version
//! index (`/versions` plus per-gem `/info/<name>` files), updated with
//! conditional byte-range requests: `If-None-Match` carries the MD5 of the
//! cached bytes (which is the registry's ETag for these files) and `Range`
//! re-fetches from one byte before the cached end so a `206` always overlaps
//! by exactly one byte.

use crate::fs_utils;
use crate::version::{Constraint, Version};
use md5::{Digest, Md5};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{IF_NONE_MATCH, RANGE};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// How long a cached index file is served without revalidation
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Per-request timeout for index fetches
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while querying the compact index
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("HTTP {status} fetching {url}")]
    Status { status: u16, url: String },

    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("IO error on index file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid registry URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error(transparent)]
    CacheCorruption(#[from] fs_utils::CacheCorruptionError),

    #[error("index fetch cancelled")]
    Cancelled,
}

impl IndexError {
    fn io(path: &Path) -> impl Fn(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            path: path.clone(),
            source,
        }
    }
}

/// One line of the `versions` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionsEntry {
    pub name: String,

    /// Published versions in server order; yanked entries carry the flag
    pub versions: Vec<(String, bool)>,

    /// MD5 of the gem's current info file
    pub info_checksum: String,
}

impl VersionsEntry {
    /// The most recently published version that has not been yanked.
    #[must_use]
    pub fn latest(&self) -> Option<&str> {
        self.versions
            .iter()
            .rev()
            .find(|(_, yanked)| !yanked)
            .map(|(version, _)| version.as_str())
    }
}

/// One line of an `info/<name>` file
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: Version,

    /// The version exactly as published
    pub raw_version: String,

    /// Platform tag; `None` means portable ("ruby")
    pub platform: Option<String>,

    /// Runtime dependencies as (name, constraint)
    pub deps: Vec<(String, Constraint)>,

    /// Trailing requirements: `checksum`, `ruby`, `rubygems`
    pub requirements: HashMap<String, String>,
}

static SPECIAL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_-]").expect("static regex"));

// One mutex per absolute cache path; conditional-GET-and-apply is serialized
// per file, reads proceed concurrently once the update returns.
static PATH_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = PATH_LOCKS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

/// Client for one registry's compact index
#[derive(Debug, Clone)]
pub struct CompactIndexClient {
    base_url: Url,
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl CompactIndexClient {
    /// Create a client for `base_url`, caching under
    /// `<cache_root>/<server_slug>/`.
    ///
    /// Sweeps stale `*.tmp` files left by an interrupted run.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the cache directories cannot
    /// be created, or a stale temp file cannot be cleaned.
    pub fn new(base_url: &str, cache_root: &Path) -> Result<Self, IndexError> {
        let url = Url::parse(base_url).map_err(|source| IndexError::InvalidUrl {
            url: base_url.to_string(),
            source,
        })?;

        let cache_dir = cache_root.join(server_slug(&url));
        for dir in [
            cache_dir.clone(),
            cache_dir.join("info"),
            cache_dir.join("info-special-characters"),
        ] {
            fs::create_dir_all(&dir).map_err(IndexError::io(&dir))?;
            fs_utils::clean_stale_tmp(&dir)?;
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("ore/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| IndexError::Network {
                url: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            base_url: url,
            cache_dir,
            client,
        })
    }

    /// The registry URL this client mirrors.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The on-disk cache directory for this registry.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Fetch (or revalidate) and parse the `versions` file.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or unreadable cache.
    pub async fn get_versions(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<VersionsEntry>, IndexError> {
        let path = self.cache_dir.join("versions");
        let url = self.endpoint("versions")?;
        self.update_file(&url, &path, token).await?;

        let content = fs::read_to_string(&path).map_err(IndexError::io(&path))?;
        Ok(parse_versions(&content))
    }

    /// Fetch (or revalidate) and parse the info file for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or unreadable cache.
    pub async fn get_info(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<VersionInfo>, IndexError> {
        let path = self.info_path(name);
        let url = self.endpoint(&format!("info/{name}"))?;
        match self.update_file(&url, &path, token).await {
            Ok(()) => {}
            // An unknown gem has no info file; that is "no versions", not
            // a transport failure.
            Err(IndexError::Status { status: 404, .. }) => return Ok(Vec::new()),
            Err(error) => return Err(error),
        }

        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(IndexError::io(&path))?;
        Ok(parse_info(&content))
    }

    /// The local cache path for a gem's info file.
    ///
    /// Names containing characters outside `[a-z0-9_-]` land under
    /// `info-special-characters/<name>-<md5(name)>`.
    #[must_use]
    pub fn info_path(&self, name: &str) -> PathBuf {
        if SPECIAL_NAME.is_match(name) {
            let digest = format!("{:x}", Md5::digest(name.as_bytes()));
            self.cache_dir
                .join("info-special-characters")
                .join(format!("{name}-{digest}"))
        } else {
            self.cache_dir.join("info").join(name)
        }
    }

    fn endpoint(&self, suffix: &str) -> Result<Url, IndexError> {
        self.base_url
            .join(suffix)
            .map_err(|source| IndexError::InvalidUrl {
                url: format!("{}/{suffix}", self.base_url),
                source,
            })
    }

    /// Bring one cached index file up to date.
    async fn update_file(
        &self,
        url: &Url,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<(), IndexError> {
        let lock = lock_for(path);
        let _guard = lock.lock().await;

        if is_fresh(path) {
            return Ok(());
        }

        let mut request = self.client.get(url.clone());
        if let Some(validator) = conditional_validator(path) {
            request = request
                .header(IF_NONE_MATCH, format!("\"{}\"", validator.etag))
                .header(RANGE, format!("bytes={}-", validator.offset));
        }

        let network = IndexError::io(path);
        let response = tokio::select! {
            result = request.send() => result.map_err(|source| IndexError::Network {
                url: url.to_string(),
                source,
            })?,
            () = token.cancelled() => return Err(IndexError::Cancelled),
        };

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => {
                debug!(url = %url, "index not modified");
                touch(path);
                Ok(())
            }
            StatusCode::PARTIAL_CONTENT => {
                let body = tokio::select! {
                    result = response.bytes() => result.map_err(|source| IndexError::Network {
                        url: url.to_string(),
                        source,
                    })?,
                    () = token.cancelled() => return Err(IndexError::Cancelled),
                };
                debug!(url = %url, bytes = body.len(), "index range appended");
                append_partial(path, &body).map_err(network)
            }
            StatusCode::OK => {
                let body = tokio::select! {
                    result = response.bytes() => result.map_err(|source| IndexError::Network {
                        url: url.to_string(),
                        source,
                    })?,
                    () = token.cancelled() => return Err(IndexError::Cancelled),
                };
                debug!(url = %url, bytes = body.len(), "index rewritten");
                fs_utils::atomic_write(path, &body).map_err(network)
            }
            other => Err(IndexError::Status {
                status: other.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

/// The cache slug for a registry URL: `host.port.md5(full-url)`.
#[must_use]
pub fn server_slug(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    let port = url.port().unwrap_or(match url.scheme() {
        "http" => 80,
        _ => 443,
    });
    let digest = format!("{:x}", Md5::digest(url.as_str().as_bytes()));
    format!("{host}.{port}.{digest}")
}

struct Validator {
    etag: String,
    offset: u64,
}

/// Compute the conditional-request validator for an existing cache file.
///
/// Returns `None` when the file is missing or empty (plain GET). The range
/// offset is `size - 1` so a partial response always overlaps one byte.
fn conditional_validator(path: &Path) -> Option<Validator> {
    let bytes = fs::read(path).ok()?;
    if bytes.is_empty() {
        return None;
    }
    Some(Validator {
        etag: format!("{:x}", Md5::digest(&bytes)),
        offset: bytes.len() as u64 - 1,
    })
}

/// Append a `206 Partial Content` body, dropping the one-byte overlap.
fn append_partial(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if body.len() <= 1 {
        return Ok(());
    }
    let mut file = fs::OpenOptions::new().append(true).open(path)?;
    file.write_all(&body[1..])?;
    file.sync_all()
}

fn is_fresh(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age < FRESHNESS_WINDOW)
}

// Refresh the mtime after a 304 so the freshness window restarts.
fn touch(path: &Path) {
    if let Ok(file) = fs::OpenOptions::new().append(true).open(path) {
        drop(file.set_modified(std::time::SystemTime::now()));
    }
}

/// Parse a `versions` file.
///
/// Lines before the `---` sentinel are headers; each following line is
/// `name v1,v2,... <md5-of-info-file>` with yanked versions prefixed `-`.
/// Server order is preserved exactly.
#[must_use]
pub fn parse_versions(content: &str) -> Vec<VersionsEntry> {
    let mut entries: Vec<VersionsEntry> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for line in content
        .lines()
        .skip_while(|line| line.trim() != "---")
        .skip(1)
    {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(versions), Some(checksum)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        let parsed: Vec<(String, bool)> = versions
            .split(',')
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.strip_prefix('-')
                    .map_or_else(|| (v.to_string(), false), |raw| (raw.to_string(), true))
            })
            .collect();

        // The file is append-only: a republished gem appears again with the
        // new versions, so later lines extend the earlier entry.
        if let Some(&index) = seen.get(name) {
            let entry = &mut entries[index];
            entry.versions.extend(parsed);
            entry.info_checksum = checksum.to_string();
        } else {
            seen.insert(name.to_string(), entries.len());
            entries.push(VersionsEntry {
                name: name.to_string(),
                versions: parsed,
                info_checksum: checksum.to_string(),
            });
        }
    }

    entries
}

/// Parse an `info/<name>` file.
///
/// Each line after `---` is `VERSION[-PLATFORM] [DEPS][|REQS]`; DEPS entries
/// are `name:constraint` joined by `,` with `&` as the AND separator inside
/// one constraint, REQS entries are `key:value` pairs.
#[must_use]
pub fn parse_info(content: &str) -> Vec<VersionInfo> {
    let mut result = Vec::new();

    for line in content
        .lines()
        .skip_while(|line| line.trim() != "---")
        .skip(1)
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (left, reqs_text) = line
            .split_once('|')
            .map_or((line, ""), |(left, right)| (left, right));

        let (version_text, deps_text) = left
            .trim()
            .split_once(' ')
            .map_or((left.trim(), ""), |(v, d)| (v, d));

        let (raw_version, platform) = version_text
            .split_once('-')
            .map_or((version_text, None), |(v, p)| (v, Some(p.to_string())));

        let Ok(version) = Version::parse(raw_version) else {
            continue;
        };

        let mut deps = Vec::new();
        for entry in deps_text.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((name, requirement)) = entry.split_once(':') else {
                continue;
            };
            let Ok(constraint) = Constraint::parse_with_separator(requirement, '&') else {
                continue;
            };
            deps.push((name.trim().to_string(), constraint));
        }

        let mut requirements = HashMap::new();
        for entry in reqs_text.split(',') {
            if let Some((key, value)) = entry.trim().split_once(':') {
                requirements.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        result.push(VersionInfo {
            version,
            raw_version: raw_version.to_string(),
            platform,
            deps,
            requirements,
        });
    }

    result
}
