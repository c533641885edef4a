//! Manifest records and a small Gemfile reader.
//!
//! The engine consumes the typed records only; the reader covers the
//! Gemfile subset needed to produce them (`source`, `ruby`, `gem` with
//! version/group/git/path options, and `group`/`source` blocks).

use crate::source::GitReference;
use crate::version::Constraint;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Errors that can occur while reading a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest at {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("manifest line {line}: invalid constraint {constraint:?}: {source}")]
    InvalidConstraint {
        line: usize,
        constraint: String,
        #[source]
        source: crate::version::ConstraintError,
    },
}

/// Where a declared dependency should be resolved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Registry { url: String },
    Git { remote: String, reference: GitReference },
    Path { path: PathBuf },
}

/// One direct dependency declared in the manifest
#[derive(Debug, Clone)]
pub struct ManifestDep {
    /// Canonical (lowercased) gem name
    pub name: String,

    /// Combined version constraint (`>= 0` when none was given)
    pub constraint: Constraint,

    /// Groups this dependency belongs to (default `["default"]`)
    pub groups: Vec<String>,

    /// `require:` option, when present
    pub require: Option<bool>,

    /// Explicit source; `None` means the default registry
    pub source: Option<SourceRef>,
}

/// An additional registry declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDecl {
    pub url: String,
}

/// The project's direct-dependency declaration
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Primary registry URL (the first top-level `source` line)
    pub default_source: Option<String>,

    /// Additional registries introduced by `source ... do` blocks
    pub sources: Vec<RegistryDecl>,

    /// Declared interpreter constraint, if any
    pub ruby_version: Option<Constraint>,

    /// Declared platform list, if any
    pub platforms: Vec<String>,

    /// Direct dependencies in declaration order
    pub dependencies: Vec<ManifestDep>,
}

/// Canonicalize a gem name (lowercased).
#[must_use]
pub fn canonical_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

static GEM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^gem\s+['"]([A-Za-z0-9._-]+)['"](.*)$"#).expect("static regex")
});
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*,\s*['"]([^'"]+)['"]"#).expect("static regex"));
static OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        (?P<key>[a-z_]+):\s*
        (?:
            ['"](?P<str>[^'"]*)['"]
          | :(?P<sym>[A-Za-z0-9_]+)
          | \[(?P<list>[^\]]*)\]
          | (?P<bool>true|false)
        )"#,
    )
    .expect("static regex")
});
static SOURCE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^source\s+['"]([^'"]+)['"]\s*(do)?\s*$"#).expect("static regex")
});
static RUBY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^ruby\s+['"]([^'"]+)['"]\s*$"#).expect("static regex"));
static GROUP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^group\s+(.+?)\s+do\s*$").expect("static regex"));
static PLATFORM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^platforms?\s+['":]([A-Za-z0-9._-]+)['"]?\s*$"#).expect("static regex")
});
static PLATFORM_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^platforms?\s+.+\s+do\s*$").expect("static regex"));

enum Block {
    Group(Vec<String>),
    Source(String),
}

impl Manifest {
    /// Read and parse a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn parse_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse manifest content.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed declarations or constraints.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let mut manifest = Self::default();
        let mut blocks: Vec<Block> = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if line == "end" {
                if blocks.pop().is_none() {
                    return Err(ManifestError::ParseError {
                        line: line_no,
                        message: "unmatched `end`".to_string(),
                    });
                }
                continue;
            }

            if let Some(captures) = SOURCE_LINE.captures(line) {
                let url = captures[1].trim_end_matches('/').to_string();
                if captures.get(2).is_some() {
                    manifest.sources.push(RegistryDecl { url: url.clone() });
                    blocks.push(Block::Source(url));
                } else if manifest.default_source.is_none() {
                    manifest.default_source = Some(url);
                } else {
                    manifest.sources.push(RegistryDecl { url });
                }
                continue;
            }

            if let Some(captures) = RUBY_LINE.captures(line) {
                let constraint = Constraint::parse(&captures[1]).map_err(|source| {
                    ManifestError::InvalidConstraint {
                        line: line_no,
                        constraint: captures[1].to_string(),
                        source,
                    }
                })?;
                manifest.ruby_version = Some(constraint);
                continue;
            }

            if let Some(captures) = GROUP_LINE.captures(line) {
                let groups = captures[1]
                    .split(',')
                    .map(|part| part.trim().trim_start_matches(':').to_string())
                    .filter(|part| !part.is_empty())
                    .collect();
                blocks.push(Block::Group(groups));
                continue;
            }

            if let Some(captures) = PLATFORM_LINE.captures(line) {
                manifest.platforms.push(captures[1].to_string());
                continue;
            }

            // Interpreter-platform blocks gate nothing here; track the
            // block so its `end` matches.
            if PLATFORM_BLOCK.is_match(line) {
                blocks.push(Block::Group(Vec::new()));
                continue;
            }

            if let Some(captures) = GEM_LINE.captures(line) {
                let rest = captures.get(2).map_or("", |m| m.as_str());
                let dep = Self::parse_gem(&captures[1], rest, line_no, &blocks)?;
                manifest.dependencies.push(dep);
                continue;
            }

            return Err(ManifestError::ParseError {
                line: line_no,
                message: format!("unrecognized declaration: {line}"),
            });
        }

        Ok(manifest)
    }

    fn parse_gem(
        name: &str,
        rest: &str,
        line_no: usize,
        blocks: &[Block],
    ) -> Result<ManifestDep, ManifestError> {
        // Leading quoted arguments are version requirements
        let mut remaining = rest;
        let mut requirement_parts = Vec::new();
        while let Some(captures) = QUOTED.captures(remaining) {
            let matched = captures.get(0).map_or(0, |m| m.end());
            requirement_parts.push(captures[1].to_string());
            remaining = &remaining[matched..];
        }

        let constraint_text = requirement_parts.join(", ");
        let constraint = Constraint::parse(&constraint_text).map_err(|source| {
            ManifestError::InvalidConstraint {
                line: line_no,
                constraint: constraint_text.clone(),
                source,
            }
        })?;

        let mut groups: Vec<String> = Vec::new();
        let mut require = None;
        let mut git = None;
        let mut path = None;
        let mut branch = None;
        let mut tag = None;
        let mut rev = None;

        for captures in OPTION.captures_iter(remaining) {
            let value = captures
                .name("str")
                .or_else(|| captures.name("sym"))
                .map(|m| m.as_str().to_string());
            match &captures["key"] {
                "group" | "groups" => {
                    if let Some(list) = captures.name("list") {
                        groups.extend(
                            list.as_str()
                                .split(',')
                                .map(|part| {
                                    part.trim()
                                        .trim_start_matches(':')
                                        .trim_matches(['\'', '"'])
                                        .to_string()
                                })
                                .filter(|part| !part.is_empty()),
                        );
                    } else if let Some(value) = value {
                        groups.push(value);
                    }
                }
                "require" => {
                    require = captures.name("bool").map(|m| m.as_str() == "true");
                }
                "git" => git = value,
                "path" => path = value,
                "branch" => branch = value,
                "tag" => tag = value,
                "ref" => rev = value,
                _ => {}
            }
        }

        // Enclosing blocks contribute groups and a registry override
        let mut block_source = None;
        for block in blocks {
            match block {
                Block::Group(block_groups) => groups.extend(block_groups.iter().cloned()),
                Block::Source(url) => block_source = Some(url.clone()),
            }
        }
        if groups.is_empty() {
            groups.push("default".to_string());
        }

        let source = if let Some(remote) = git {
            let reference = if let Some(branch) = branch {
                GitReference::Branch(branch)
            } else if let Some(tag) = tag {
                GitReference::Tag(tag)
            } else if let Some(rev) = rev {
                GitReference::Rev(rev)
            } else {
                GitReference::Head
            };
            Some(SourceRef::Git { remote, reference })
        } else if let Some(path) = path {
            Some(SourceRef::Path {
                path: PathBuf::from(path),
            })
        } else {
            block_source.map(|url| SourceRef::Registry { url })
        };

        Ok(ManifestDep {
            name: canonical_name(name),
            constraint,
            groups,
            require,
            source,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    // Good enough for the subset: `#` inside quoted strings is not used by
    // the declarations this reader accepts.
    line.split('#').next().unwrap_or(line)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests can panic")]
mod tests {
    use super::*;

    #[test]
    fn parses_source_and_gems() {
        let manifest = Manifest::parse(
            r#"
source "https://rubygems.org"

gem "rails", "~> 8.0"
gem "rack", ">= 3.0", "< 4"
gem "puma"
"#,
        )
        .unwrap();

        assert_eq!(
            manifest.default_source.as_deref(),
            Some("https://rubygems.org")
        );
        assert_eq!(manifest.dependencies.len(), 3);

        let rails = &manifest.dependencies[0];
        assert_eq!(rails.name, "rails");
        assert_eq!(rails.constraint.to_string(), "~> 8.0");
        assert_eq!(rails.groups, vec!["default"]);

        let rack = &manifest.dependencies[1];
        assert_eq!(rack.constraint.to_string(), ">= 3.0, < 4");

        assert!(manifest.dependencies[2].constraint.is_any());
    }

    #[test]
    fn group_blocks_and_inline_groups() {
        let manifest = Manifest::parse(
            r#"
source "https://rubygems.org"

gem "rails"
gem "rubocop", group: :development

group :test do
  gem "rspec"
end

group :development, :test do
  gem "debug"
end
"#,
        )
        .unwrap();

        let by_name = |name: &str| {
            manifest
                .dependencies
                .iter()
                .find(|dep| dep.name == name)
                .unwrap()
        };
        assert_eq!(by_name("rails").groups, vec!["default"]);
        assert_eq!(by_name("rubocop").groups, vec!["development"]);
        assert_eq!(by_name("rspec").groups, vec!["test"]);
        assert_eq!(by_name("debug").groups, vec!["development", "test"]);
    }

    #[test]
    fn git_and_path_sources() {
        let manifest = Manifest::parse(
            r#"
source "https://rubygems.org"

gem "rails", git: "https://github.com/rails/rails", branch: "main"
gem "sidekiq", git: "https://github.com/sidekiq/sidekiq", tag: "v7.0.0"
gem "local_thing", path: "../local_thing"
"#,
        )
        .unwrap();

        assert_eq!(
            manifest.dependencies[0].source,
            Some(SourceRef::Git {
                remote: "https://github.com/rails/rails".to_string(),
                reference: GitReference::Branch("main".to_string()),
            })
        );
        assert_eq!(
            manifest.dependencies[1].source,
            Some(SourceRef::Git {
                remote: "https://github.com/sidekiq/sidekiq".to_string(),
                reference: GitReference::Tag("v7.0.0".to_string()),
            })
        );
        assert_eq!(
            manifest.dependencies[2].source,
            Some(SourceRef::Path {
                path: PathBuf::from("../local_thing"),
            })
        );
    }

    #[test]
    fn source_blocks_pin_registries() {
        let manifest = Manifest::parse(
            r#"
source "https://rubygems.org"

source "https://gems.example.com" do
  gem "internal_tool"
end

gem "rack"
"#,
        )
        .unwrap();

        assert_eq!(
            manifest.dependencies[0].source,
            Some(SourceRef::Registry {
                url: "https://gems.example.com".to_string(),
            })
        );
        assert_eq!(manifest.dependencies[1].source, None);
        assert_eq!(
            manifest.sources,
            vec![RegistryDecl {
                url: "https://gems.example.com".to_string(),
            }]
        );
    }

    #[test]
    fn ruby_version_and_require_false() {
        let manifest = Manifest::parse(
            r#"
source "https://rubygems.org"
ruby ">= 3.2"
gem "bootsnap", require: false
"#,
        )
        .unwrap();

        assert_eq!(manifest.ruby_version.unwrap().to_string(), ">= 3.2");
        assert_eq!(manifest.dependencies[0].require, Some(false));
    }

    #[test]
    fn names_are_canonicalized() {
        let manifest = Manifest::parse("gem \"Rails\"\n").unwrap();
        assert_eq!(manifest.dependencies[0].name, "rails");
    }

    #[test]
    fn unmatched_end_is_an_error() {
        assert!(Manifest::parse("end\n").is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let manifest = Manifest::parse(
            "# frozen_string_literal: true\n\nsource \"https://rubygems.org\"\n\ngem \"rack\" # web\n",
        )
        .unwrap();
        assert_eq!(manifest.dependencies.len(), 1);
    }
}
