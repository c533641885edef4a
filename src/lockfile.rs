//! Lock parsing and generation.
//!
//! The lock is the canonical, fully resolved dependency graph: GEM blocks
//! (one per registry, ordered by URL), GIT blocks (one per remote and
//! revision), PATH blocks, then PLATFORMS, DEPENDENCIES and BUNDLED WITH.
//! Serialization is a pure function of the in-memory lock; parsing a
//! written lock round-trips to the same bytes.

use crate::manifest::Manifest;
use crate::resolver::Resolution;
use crate::source::{GitReference, Source};
use crate::version::{Constraint, Version};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to parse lock at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("unknown lock section at line {line}: {section:?}")]
    UnknownSection { line: usize, section: String },
}

/// One runtime edge of a locked gem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedDep {
    pub name: String,

    /// `>= 0` prints as a bare name
    pub constraint: Constraint,
}

/// A gem pinned in the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedGem {
    pub name: String,
    pub version: Version,

    /// Platform tag; `None` is portable
    pub platform: Option<String>,

    /// Runtime edges sorted by name
    pub deps: Vec<LockedDep>,
}

impl LockedGem {
    /// `name-version`, e.g. `rack-3.0.5`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// `name-version[-platform]`, e.g. `nokogiri-1.14.0-arm64-darwin`.
    #[must_use]
    pub fn full_name_with_platform(&self) -> String {
        self.platform.as_ref().map_or_else(
            || self.full_name(),
            |platform| format!("{}-{}-{platform}", self.name, self.version),
        )
    }
}

/// One GEM block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySection {
    pub remote: String,
    pub gems: Vec<LockedGem>,
}

/// One GIT block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSection {
    pub remote: String,
    pub revision: String,

    /// Declared reference; `None` means HEAD
    pub reference: Option<GitReference>,
    pub gems: Vec<LockedGem>,
}

/// One PATH block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSection {
    pub path: String,
    pub gems: Vec<LockedGem>,
}

/// A manifest-level direct dependency as recorded in DEPENDENCIES
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedDirectDep {
    pub name: String,
    pub constraint: Constraint,

    /// `!` suffix: pinned to a non-registry source
    pub pinned: bool,
}

/// The complete lock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lockfile {
    pub registries: Vec<RegistrySection>,
    pub git: Vec<GitSection>,
    pub paths: Vec<PathSection>,
    pub platforms: Vec<String>,
    pub dependencies: Vec<LockedDirectDep>,
    pub bundled_with: String,
}

impl Lockfile {
    /// Build the canonical lock from a resolution.
    ///
    /// Partitions resolved gems by source kind, sorts every block and edge
    /// list, and records the manifest's direct dependencies.
    #[must_use]
    pub fn from_resolution(
        manifest: &Manifest,
        resolution: &Resolution,
        bundled_with: &str,
    ) -> Self {
        let mut registries: BTreeMap<String, Vec<LockedGem>> = BTreeMap::new();
        let mut git: BTreeMap<(String, String), (Option<GitReference>, Vec<LockedGem>)> =
            BTreeMap::new();
        let mut paths: BTreeMap<String, Vec<LockedGem>> = BTreeMap::new();

        for gem in &resolution.gems {
            let locked = LockedGem {
                name: gem.name.clone(),
                version: gem.version.clone(),
                platform: (gem.platform != "ruby").then(|| gem.platform.clone()),
                deps: gem
                    .deps
                    .iter()
                    .map(|dep| LockedDep {
                        name: dep.name.clone(),
                        constraint: dep.constraint.clone(),
                    })
                    .collect(),
            };

            match &gem.source {
                Source::Registry { url } => {
                    let remote = if url.ends_with('/') {
                        url.clone()
                    } else {
                        format!("{url}/")
                    };
                    registries.entry(remote).or_default().push(locked);
                }
                Source::Git {
                    remote,
                    reference,
                    revision,
                } => {
                    let reference = match reference {
                        GitReference::Head => None,
                        other => Some(other.clone()),
                    };
                    git.entry((remote.clone(), revision.clone()))
                        .or_insert_with(|| (reference, Vec::new()))
                        .1
                        .push(locked);
                }
                Source::Path { path } => {
                    paths
                        .entry(path.display().to_string())
                        .or_default()
                        .push(locked);
                }
            }
        }

        let sort_gems = |mut gems: Vec<LockedGem>| {
            gems.sort_by(|a, b| a.name.cmp(&b.name));
            gems
        };

        let mut platforms: BTreeSet<String> = manifest.platforms.iter().cloned().collect();
        platforms.insert("ruby".to_string());

        let mut dependencies: Vec<LockedDirectDep> = manifest
            .dependencies
            .iter()
            .map(|dep| LockedDirectDep {
                name: dep.name.clone(),
                constraint: dep.constraint.clone(),
                pinned: matches!(
                    dep.source,
                    Some(crate::manifest::SourceRef::Git { .. })
                        | Some(crate::manifest::SourceRef::Path { .. })
                ),
            })
            .collect();
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        dependencies.dedup_by(|a, b| a.name == b.name);

        Self {
            registries: registries
                .into_iter()
                .map(|(remote, gems)| RegistrySection {
                    remote,
                    gems: sort_gems(gems),
                })
                .collect(),
            git: git
                .into_iter()
                .map(|((remote, revision), (reference, gems))| GitSection {
                    remote,
                    revision,
                    reference,
                    gems: sort_gems(gems),
                })
                .collect(),
            paths: paths
                .into_iter()
                .map(|(path, gems)| PathSection {
                    path,
                    gems: sort_gems(gems),
                })
                .collect(),
            platforms: platforms.into_iter().collect(),
            dependencies,
            bundled_with: bundled_with.to_string(),
        }
    }

    /// Parse lock text.
    ///
    /// Strict on ore's own schema; the canonical tool's extra sections
    /// (`CHECKSUMS`, `RUBY VERSION`) are skipped without error.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed lines or unknown sections.
    pub fn parse(content: &str) -> Result<Self, LockError> {
        Parser::new(content).parse()
    }

    /// All locked gems across every section.
    pub fn all_gems(&self) -> impl Iterator<Item = &LockedGem> {
        self.registries
            .iter()
            .flat_map(|section| section.gems.iter())
            .chain(self.git.iter().flat_map(|section| section.gems.iter()))
            .chain(self.paths.iter().flat_map(|section| section.gems.iter()))
    }

    /// The install set under group exclusion.
    ///
    /// Direct dependencies whose group set is a subset of `without` are
    /// dropped; the result is the transitive runtime closure of the rest
    /// over the locked graph, across registry, git and path nodes alike.
    #[must_use]
    pub fn install_set(&self, manifest: &Manifest, without: &[String]) -> HashSet<String> {
        let excluded: HashSet<&str> = without.iter().map(String::as_str).collect();

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for gem in self.all_gems() {
            adjacency.insert(
                gem.name.as_str(),
                gem.deps.iter().map(|dep| dep.name.as_str()).collect(),
            );
        }

        let mut queue: VecDeque<&str> = VecDeque::new();
        for dep in &manifest.dependencies {
            let fully_excluded = dep
                .groups
                .iter()
                .all(|group| excluded.contains(group.as_str()));
            if !fully_excluded && adjacency.contains_key(dep.name.as_str()) {
                queue.push_back(dep.name.as_str());
            }
        }

        let mut install: HashSet<String> = HashSet::new();
        while let Some(name) = queue.pop_front() {
            if !install.insert(name.to_string()) {
                continue;
            }
            if let Some(deps) = adjacency.get(name) {
                for dep in deps {
                    if !install.contains(*dep) {
                        queue.push_back(dep);
                    }
                }
            }
        }
        install
    }
}

impl fmt::Display for Lockfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();

        for section in &self.registries {
            out.push_str("GEM\n");
            let _ = writeln!(out, "  remote: {}", section.remote);
            out.push_str("  specs:\n");
            write_specs(&mut out, &section.gems);
            out.push('\n');
        }

        for section in &self.git {
            out.push_str("GIT\n");
            let _ = writeln!(out, "  remote: {}", section.remote);
            let _ = writeln!(out, "  revision: {}", section.revision);
            match &section.reference {
                Some(GitReference::Branch(branch)) => {
                    let _ = writeln!(out, "  branch: {branch}");
                }
                Some(GitReference::Tag(tag)) => {
                    let _ = writeln!(out, "  tag: {tag}");
                }
                Some(GitReference::Rev(rev)) => {
                    let _ = writeln!(out, "  ref: {rev}");
                }
                Some(GitReference::Head) | None => {}
            }
            out.push_str("  specs:\n");
            write_specs(&mut out, &section.gems);
            out.push('\n');
        }

        for section in &self.paths {
            out.push_str("PATH\n");
            let _ = writeln!(out, "  remote: {}", section.path);
            out.push_str("  specs:\n");
            write_specs(&mut out, &section.gems);
            out.push('\n');
        }

        out.push_str("PLATFORMS\n");
        for platform in &self.platforms {
            let _ = writeln!(out, "  {platform}");
        }
        out.push('\n');

        out.push_str("DEPENDENCIES\n");
        for dep in &self.dependencies {
            let bang = if dep.pinned { "!" } else { "" };
            if dep.constraint.is_any() {
                let _ = writeln!(out, "  {}{bang}", dep.name);
            } else {
                let _ = writeln!(out, "  {} ({}){bang}", dep.name, dep.constraint);
            }
        }
        out.push('\n');

        out.push_str("BUNDLED WITH\n");
        let _ = writeln!(out, "   {}", self.bundled_with);

        f.write_str(&out)
    }
}

fn write_specs(out: &mut String, gems: &[LockedGem]) {
    for gem in gems {
        let version = gem.platform.as_ref().map_or_else(
            || gem.version.to_string(),
            |platform| format!("{}-{platform}", gem.version),
        );
        let _ = writeln!(out, "    {} ({version})", gem.name);
        for dep in &gem.deps {
            if dep.constraint.is_any() {
                let _ = writeln!(out, "      {}", dep.name);
            } else {
                let _ = writeln!(out, "      {} ({})", dep.name, dep.constraint);
            }
        }
    }
}

/// Line-oriented parser for the lock format
struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            lines: content.lines().collect(),
            pos: 0,
        }
    }

    fn current(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn line_no(&self) -> usize {
        self.pos + 1
    }

    fn error(&self, message: impl Into<String>) -> LockError {
        LockError::ParseError {
            line: self.line_no(),
            message: message.into(),
        }
    }

    fn parse(&mut self) -> Result<Lockfile, LockError> {
        let mut lock = Lockfile::default();

        while let Some(line) = self.current() {
            if line.trim().is_empty() {
                self.advance();
                continue;
            }

            match line {
                "GEM" => {
                    self.advance();
                    let section = self.parse_registry_section()?;
                    lock.registries.push(section);
                }
                "GIT" => {
                    self.advance();
                    let section = self.parse_git_section()?;
                    lock.git.push(section);
                }
                "PATH" => {
                    self.advance();
                    let section = self.parse_path_section()?;
                    lock.paths.push(section);
                }
                "PLATFORMS" => {
                    self.advance();
                    while let Some(entry) = self.indented(2) {
                        lock.platforms.push(entry.to_string());
                        self.advance();
                    }
                }
                "DEPENDENCIES" => {
                    self.advance();
                    while let Some(entry) = self.indented(2) {
                        lock.dependencies.push(Self::parse_direct_dep(entry)?);
                        self.advance();
                    }
                }
                "BUNDLED WITH" => {
                    self.advance();
                    if let Some(version) = self.indented(3) {
                        lock.bundled_with = version.to_string();
                        self.advance();
                    }
                }
                // Extra sections written by the canonical tool are skipped.
                "CHECKSUMS" | "RUBY VERSION" => {
                    self.advance();
                    while self.current().is_some_and(|l| l.starts_with(' ')) {
                        self.advance();
                    }
                }
                other => {
                    return Err(LockError::UnknownSection {
                        line: self.line_no(),
                        section: other.to_string(),
                    });
                }
            }
        }

        Ok(lock)
    }

    /// The current line stripped of exactly `indent` leading spaces, when it
    /// has at least that indentation.
    fn indented(&self, indent: usize) -> Option<&'a str> {
        let line = self.current()?;
        if line.len() > indent && line.as_bytes().iter().take(indent).all(|&b| b == b' ') {
            Some(line[indent..].trim_end())
        } else {
            None
        }
    }

    fn parse_registry_section(&mut self) -> Result<RegistrySection, LockError> {
        let mut remote = String::new();
        while let Some(line) = self.indented(2) {
            if let Some(value) = line.strip_prefix("remote: ") {
                remote = value.to_string();
                self.advance();
            } else if line == "specs:" {
                self.advance();
                let gems = self.parse_specs()?;
                return Ok(RegistrySection { remote, gems });
            } else {
                return Err(self.error(format!("unexpected GEM field: {line}")));
            }
        }
        Err(self.error("GEM section missing specs:"))
    }

    fn parse_git_section(&mut self) -> Result<GitSection, LockError> {
        let mut remote = String::new();
        let mut revision = String::new();
        let mut reference = None;

        while let Some(line) = self.indented(2) {
            if let Some(value) = line.strip_prefix("remote: ") {
                remote = value.to_string();
            } else if let Some(value) = line.strip_prefix("revision: ") {
                revision = value.to_string();
            } else if let Some(value) = line.strip_prefix("branch: ") {
                reference = Some(GitReference::Branch(value.to_string()));
            } else if let Some(value) = line.strip_prefix("tag: ") {
                reference = Some(GitReference::Tag(value.to_string()));
            } else if let Some(value) = line.strip_prefix("ref: ") {
                reference = Some(GitReference::Rev(value.to_string()));
            } else if line == "specs:" {
                self.advance();
                let gems = self.parse_specs()?;
                return Ok(GitSection {
                    remote,
                    revision,
                    reference,
                    gems,
                });
            } else {
                return Err(self.error(format!("unexpected GIT field: {line}")));
            }
            self.advance();
        }
        Err(self.error("GIT section missing specs:"))
    }

    fn parse_path_section(&mut self) -> Result<PathSection, LockError> {
        let mut path = String::new();
        while let Some(line) = self.indented(2) {
            if let Some(value) = line.strip_prefix("remote: ") {
                path = value.to_string();
                self.advance();
            } else if line == "specs:" {
                self.advance();
                let gems = self.parse_specs()?;
                return Ok(PathSection { path, gems });
            } else {
                return Err(self.error(format!("unexpected PATH field: {line}")));
            }
        }
        Err(self.error("PATH section missing specs:"))
    }

    fn parse_specs(&mut self) -> Result<Vec<LockedGem>, LockError> {
        let mut gems: Vec<LockedGem> = Vec::new();

        while let Some(line) = self.current() {
            if line.trim().is_empty() {
                break;
            }

            if line.starts_with("      ") {
                let dep = Self::parse_edge(line.trim())?;
                let Some(gem) = gems.last_mut() else {
                    return Err(self.error("dependency line before any gem"));
                };
                gem.deps.push(dep);
                self.advance();
            } else if line.starts_with("    ") {
                let (name, version, platform) = self.parse_spec_line(line.trim())?;
                gems.push(LockedGem {
                    name,
                    version,
                    platform,
                    deps: Vec::new(),
                });
                self.advance();
            } else {
                break;
            }
        }

        Ok(gems)
    }

    /// Parse `name (version[-platform])`.
    fn parse_spec_line(
        &self,
        line: &str,
    ) -> Result<(String, Version, Option<String>), LockError> {
        let (name, rest) = line
            .split_once(" (")
            .ok_or_else(|| self.error(format!("expected `name (version)`, got: {line}")))?;
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| self.error(format!("unterminated version in: {line}")))?;

        let (version_text, platform) = inner
            .split_once('-')
            .map_or((inner, None), |(v, p)| (v, Some(p.to_string())));

        let version = Version::parse(version_text)
            .map_err(|e| self.error(format!("invalid version in {line:?}: {e}")))?;

        Ok((name.to_string(), version, platform))
    }

    /// Parse `dep_name[ (constraint)]`.
    fn parse_edge(line: &str) -> Result<LockedDep, LockError> {
        if let Some((name, rest)) = line.split_once(" (") {
            let constraint_text = rest.trim_end_matches(')');
            let constraint =
                Constraint::parse(constraint_text).map_err(|e| LockError::ParseError {
                    line: 0,
                    message: format!("invalid constraint {constraint_text:?}: {e}"),
                })?;
            Ok(LockedDep {
                name: name.to_string(),
                constraint,
            })
        } else {
            Ok(LockedDep {
                name: line.to_string(),
                constraint: Constraint::any(),
            })
        }
    }

    /// Parse `name[ (constraint)][!]`.
    fn parse_direct_dep(line: &str) -> Result<LockedDirectDep, LockError> {
        let (body, pinned) = line
            .strip_suffix('!')
            .map_or((line, false), |body| (body, true));

        let edge = Self::parse_edge(body)?;
        Ok(LockedDirectDep {
            name: edge.name,
            constraint: edge.constraint,
            pinned,
        })
    }
}
