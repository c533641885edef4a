//! Gem specification extraction.
//!
//! Two degraded-but-honest readers: one for `*.gemspec` Ruby sources (git
//! and path gems) and one for the YAML `metadata` member of a gem archive.
//! Neither evaluates Ruby; both extract the fields the engine needs and
//! fail loudly rather than silently reporting "no dependencies".

use crate::version::{Constraint, Version};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

/// Errors that can occur while extracting a specification
#[derive(Debug, Error)]
pub enum GemspecError {
    #[error("failed to read gemspec at {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("gemspec {path} is missing required field `{field}`")]
    MissingField { path: String, field: &'static str },

    #[error("gemspec {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("gemspec {path}: invalid version {version:?}")]
    InvalidVersion { path: String, version: String },
}

/// The extracted fields of a gem specification
#[derive(Debug, Clone, Default)]
pub struct Gemspec {
    pub name: String,
    pub version: Option<Version>,
    pub platform: String,
    pub authors: Vec<String>,
    pub email: Option<String>,
    pub homepage: Option<String>,
    pub licenses: Vec<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub runtime_deps: Vec<(String, Constraint)>,
    pub post_install_message: Option<String>,
    pub extensions: Vec<String>,
    pub required_rubygems_version: Option<String>,
}

impl Gemspec {
    /// The resolved version, defaulting to `0` when absent.
    #[must_use]
    pub fn version_or_zero(&self) -> Version {
        self.version.clone().unwrap_or_default()
    }
}

static ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)^\s*\w+\.(?P<field>name|version|platform|homepage|summary|description|email|post_install_message)\s*=\s*
           (?:%q\{(?P<pct>[^}]*)\}|['"](?P<str>[^'"]*)['"])"#,
    )
    .expect("static regex")
});
static LIST_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?x)^\s*\w+\.(?P<field>authors|licenses|extensions)\s*=\s*\[(?P<items>[^\]]*)\]")
        .expect("static regex")
});
static SINGLE_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?x)^\s*\w+\.(?P<field>author|license)\s*=\s*['"](?P<value>[^'"]*)['"]"#)
        .expect("static regex")
});
static ADD_DEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)^\s*\w+\.add(?P<kind>_runtime|_development)?_dependency\s*\(?\s*
           ['"](?P<name>[A-Za-z0-9._-]+)['"]\s*(?P<reqs>.*?)\)?\s*$"#,
    )
    .expect("static regex")
});
static QUOTED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("static regex"));

/// Parse a `*.gemspec` Ruby source.
///
/// # Errors
///
/// Returns an error if the file cannot be read, lacks a name, or declares
/// an unparseable version or dependency. A parse error is never reported as
/// an empty dependency list.
pub fn parse_ruby_file(path: &Path) -> Result<Gemspec, GemspecError> {
    let content = std::fs::read_to_string(path).map_err(|source| GemspecError::ReadError {
        path: path.display().to_string(),
        source,
    })?;
    parse_ruby(&content, &path.display().to_string())
}

/// Parse gemspec Ruby source from a string.
///
/// # Errors
///
/// See [`parse_ruby_file`].
pub fn parse_ruby(content: &str, origin: &str) -> Result<Gemspec, GemspecError> {
    let mut spec = Gemspec {
        platform: "ruby".to_string(),
        ..Gemspec::default()
    };

    for line in content.lines() {
        if let Some(captures) = ASSIGN.captures(line) {
            let value = captures
                .name("str")
                .or_else(|| captures.name("pct"))
                .map_or(String::new(), |m| m.as_str().to_string());
            match &captures["field"] {
                "name" => spec.name = value,
                "version" => {
                    spec.version = Some(Version::parse(&value).map_err(|_| {
                        GemspecError::InvalidVersion {
                            path: origin.to_string(),
                            version: value.clone(),
                        }
                    })?);
                }
                "platform" => spec.platform = value,
                "homepage" => spec.homepage = Some(value),
                "summary" => spec.summary = Some(value),
                "description" => spec.description = Some(value),
                "email" => spec.email = Some(value),
                "post_install_message" => spec.post_install_message = Some(value),
                _ => {}
            }
            continue;
        }

        if let Some(captures) = LIST_ASSIGN.captures(line) {
            let items: Vec<String> = QUOTED_ITEM
                .captures_iter(&captures["items"])
                .map(|c| c[1].to_string())
                .collect();
            match &captures["field"] {
                "authors" => spec.authors = items,
                "licenses" => spec.licenses = items,
                "extensions" => spec.extensions = items,
                _ => {}
            }
            continue;
        }

        if let Some(captures) = SINGLE_ASSIGN.captures(line) {
            match &captures["field"] {
                "author" => spec.authors = vec![captures["value"].to_string()],
                "license" => spec.licenses = vec![captures["value"].to_string()],
                _ => {}
            }
            continue;
        }

        if let Some(captures) = ADD_DEP.captures(line) {
            if captures.name("kind").is_some_and(|k| k.as_str() == "_development") {
                continue;
            }
            let requirements: Vec<String> = QUOTED_ITEM
                .captures_iter(&captures["reqs"])
                .map(|c| c[1].to_string())
                .collect();
            let text = requirements.join(", ");
            let constraint =
                Constraint::parse(&text).map_err(|source| GemspecError::ParseError {
                    path: origin.to_string(),
                    message: format!("invalid dependency constraint {text:?}: {source}"),
                })?;
            spec.runtime_deps
                .push((captures["name"].to_string(), constraint));
        }
    }

    if spec.name.is_empty() {
        return Err(GemspecError::MissingField {
            path: origin.to_string(),
            field: "name",
        });
    }

    Ok(spec)
}

/// Find the single top-level `*.gemspec` in a directory.
///
/// # Errors
///
/// Returns an error if none or more than one is present.
pub fn find_gemspec(dir: &Path) -> Result<std::path::PathBuf, GemspecError> {
    let entries = std::fs::read_dir(dir).map_err(|source| GemspecError::ReadError {
        path: dir.display().to_string(),
        source,
    })?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "gemspec") {
            found.push(path);
        }
    }

    match found.len() {
        0 => Err(GemspecError::ParseError {
            path: dir.display().to_string(),
            message: "no .gemspec file found".to_string(),
        }),
        1 => Ok(found.remove(0)),
        count => Err(GemspecError::ParseError {
            path: dir.display().to_string(),
            message: format!("expected exactly one .gemspec, found {count}"),
        }),
    }
}

/// Parse the YAML `metadata` member of a gem archive.
///
/// The document is a `Gem::Specification` object graph with Ruby tags; this
/// line-oriented scanner pulls out the fields the spec shim and the
/// extension builder need.
///
/// # Errors
///
/// Returns an error on non-UTF-8 input or a document missing name/version.
pub fn parse_metadata_yaml(bytes: &[u8], origin: &str) -> Result<Gemspec, GemspecError> {
    let content = std::str::from_utf8(bytes).map_err(|_| GemspecError::ParseError {
        path: origin.to_string(),
        message: "metadata is not valid UTF-8".to_string(),
    })?;

    let mut spec = Gemspec {
        platform: "ruby".to_string(),
        ..Gemspec::default()
    };

    let lines: Vec<&str> = content.lines().collect();
    let mut index = 0;
    while index < lines.len() {
        let line = lines[index];
        index += 1;

        // Only top-level keys are significant here
        if line.starts_with(' ') || line.starts_with('-') {
            continue;
        }
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value = rest.trim();

        match key {
            "name" => spec.name = unquote(value).to_string(),
            "platform" => spec.platform = unquote(value).to_string(),
            "email" => spec.email = non_empty(value),
            "homepage" => spec.homepage = non_empty(value),
            "summary" => spec.summary = non_empty(value),
            "version" => {
                // Inline `version: 1.2.3` or a nested Gem::Version object
                if value.is_empty() || value.starts_with("!ruby") {
                    if let Some(nested) = lines.get(index) {
                        if let Some((_, nested_value)) = nested.trim().split_once(':') {
                            spec.version = Version::parse(unquote(nested_value.trim())).ok();
                            index += 1;
                        }
                    }
                } else {
                    spec.version = Version::parse(unquote(value)).ok();
                }
            }
            "authors" => {
                index = collect_list(&lines, index, &mut spec.authors);
            }
            "licenses" => {
                index = collect_list(&lines, index, &mut spec.licenses);
            }
            "extensions" => {
                if value != "[]" {
                    index = collect_list(&lines, index, &mut spec.extensions);
                }
            }
            "description" => {
                if value.is_empty() || value == "|" || value == "|-" || value == ">-" {
                    let (text, next) = collect_block(&lines, index);
                    spec.description = non_empty(&text);
                    index = next;
                } else {
                    spec.description = non_empty(value);
                }
            }
            "post_install_message" => {
                if value.is_empty() || value == "|" || value == "|-" || value == ">-" {
                    let (text, next) = collect_block(&lines, index);
                    spec.post_install_message = non_empty(&text);
                    index = next;
                } else {
                    spec.post_install_message = non_empty(value);
                }
            }
            "dependencies" => {
                index = collect_dependencies(&lines, index, &mut spec.runtime_deps);
            }
            _ => {}
        }
    }

    if spec.name.is_empty() {
        return Err(GemspecError::MissingField {
            path: origin.to_string(),
            field: "name",
        });
    }
    if spec.version.is_none() {
        return Err(GemspecError::MissingField {
            path: origin.to_string(),
            field: "version",
        });
    }

    Ok(spec)
}

fn unquote(value: &str) -> &str {
    value
        .trim()
        .trim_start_matches(['\'', '"'])
        .trim_end_matches(['\'', '"'])
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = unquote(value).trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Collect `- item` list entries following a key line.
fn collect_list(lines: &[&str], mut index: usize, into: &mut Vec<String>) -> usize {
    while let Some(line) = lines.get(index) {
        let trimmed = line.trim_start();
        if let Some(item) = trimmed.strip_prefix("- ") {
            into.push(unquote(item).to_string());
            index += 1;
        } else {
            break;
        }
    }
    index
}

/// Collect an indented block scalar.
fn collect_block(lines: &[&str], mut index: usize) -> (String, usize) {
    let mut collected = Vec::new();
    while let Some(line) = lines.get(index) {
        if line.starts_with("  ") || line.trim().is_empty() {
            collected.push(line.trim_start().to_string());
            index += 1;
        } else {
            break;
        }
    }
    while collected.last().is_some_and(String::is_empty) {
        collected.pop();
    }
    (collected.join("\n"), index)
}

/// Collect `Gem::Dependency` entries, keeping runtime deps only.
fn collect_dependencies(
    lines: &[&str],
    mut index: usize,
    into: &mut Vec<(String, Constraint)>,
) -> usize {
    let mut name: Option<String> = None;
    let mut requirements: Vec<String> = Vec::new();
    let mut pending_op: Option<String> = None;
    let mut is_runtime = true;

    let flush = |name: &mut Option<String>,
                 requirements: &mut Vec<String>,
                 is_runtime: bool,
                 into: &mut Vec<(String, Constraint)>| {
        if let Some(name) = name.take()
            && is_runtime
            && let Ok(constraint) = Constraint::parse(&requirements.join(", "))
        {
            into.push((name, constraint));
        }
        requirements.clear();
    };

    while let Some(line) = lines.get(index) {
        if !line.starts_with(' ') && !line.starts_with('-') {
            break;
        }
        let trimmed = line.trim_start();

        if trimmed.starts_with("- !ruby/object:Gem::Dependency") {
            flush(&mut name, &mut requirements, is_runtime, into);
            is_runtime = true;
            pending_op = None;
        } else if let Some(value) = trimmed.strip_prefix("name:") {
            name = Some(unquote(value).to_string());
        } else if let Some(value) = trimmed.strip_prefix("type:") {
            is_runtime = value.trim() == ":runtime";
        } else if let Some(value) = trimmed.strip_prefix("- - ") {
            pending_op = Some(unquote(value).to_string());
        } else if let Some(value) = trimmed.strip_prefix("version:")
            && let Some(op) = pending_op.take()
        {
            requirements.push(format!("{op} {}", unquote(value)));
        }
        index += 1;
    }

    flush(&mut name, &mut requirements, is_runtime, into);
    index
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests can panic")]
mod tests {
    use super::*;

    const GEMSPEC: &str = r#"
# frozen_string_literal: true

Gem::Specification.new do |spec|
  spec.name = "widget"
  spec.version = "1.2.0"
  spec.authors = ["Ada Lovelace", "Grace Hopper"]
  spec.email = "dev@example.com"
  spec.summary = "Widgets for Ruby"
  spec.description = "A longer widget description"
  spec.homepage = "https://example.com/widget"
  spec.licenses = ["MIT"]
  spec.extensions = ["ext/widget/extconf.rb"]
  spec.post_install_message = "Thanks for installing widget!"

  spec.add_dependency "rack", "~> 3.0"
  spec.add_runtime_dependency("zeitwerk", ">= 2.6", "< 3")
  spec.add_development_dependency "rspec", "~> 3.13"
end
"#;

    #[test]
    fn parses_ruby_gemspec() {
        let spec = parse_ruby(GEMSPEC, "widget.gemspec").unwrap();
        assert_eq!(spec.name, "widget");
        assert_eq!(spec.version_or_zero().to_string(), "1.2.0");
        assert_eq!(spec.authors.len(), 2);
        assert_eq!(spec.licenses, vec!["MIT"]);
        assert_eq!(spec.extensions, vec!["ext/widget/extconf.rb"]);
        assert_eq!(
            spec.post_install_message.as_deref(),
            Some("Thanks for installing widget!")
        );

        // Development dependencies are not runtime edges
        assert_eq!(spec.runtime_deps.len(), 2);
        assert_eq!(spec.runtime_deps[0].0, "rack");
        assert_eq!(spec.runtime_deps[0].1.to_string(), "~> 3.0");
        assert_eq!(spec.runtime_deps[1].1.to_string(), ">= 2.6, < 3");
    }

    #[test]
    fn singular_author_and_license() {
        let spec = parse_ruby(
            "Gem::Specification.new do |s|\n  s.name = \"tiny\"\n  s.version = \"0.1\"\n  s.author = \"One Person\"\n  s.license = \"Apache-2.0\"\nend\n",
            "tiny.gemspec",
        )
        .unwrap();
        assert_eq!(spec.authors, vec!["One Person"]);
        assert_eq!(spec.licenses, vec!["Apache-2.0"]);
    }

    #[test]
    fn missing_name_is_an_error() {
        let result = parse_ruby("Gem::Specification.new do |s|\nend\n", "broken.gemspec");
        assert!(matches!(result, Err(GemspecError::MissingField { field: "name", .. })));
    }

    #[test]
    fn find_gemspec_requires_exactly_one() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(find_gemspec(temp.path()).is_err());

        std::fs::write(temp.path().join("a.gemspec"), "x").unwrap();
        assert!(find_gemspec(temp.path()).is_ok());

        std::fs::write(temp.path().join("b.gemspec"), "x").unwrap();
        assert!(find_gemspec(temp.path()).is_err());
    }

    const METADATA: &str = r#"--- !ruby/object:Gem::Specification
name: widget
version: !ruby/object:Gem::Version
  version: 1.2.0
platform: ruby
authors:
- Ada Lovelace
autorequire:
bindir: bin
cert_chain: []
dependencies:
- !ruby/object:Gem::Dependency
  name: rack
  requirement: !ruby/object:Gem::Requirement
    requirements:
    - - "~>"
      - !ruby/object:Gem::Version
        version: '3.0'
  type: :runtime
  prerelease: false
- !ruby/object:Gem::Dependency
  name: rspec
  requirement: !ruby/object:Gem::Requirement
    requirements:
    - - "~>"
      - !ruby/object:Gem::Version
        version: '3.13'
  type: :development
  prerelease: false
description: |-
  A longer widget description
  spanning two lines.
email: dev@example.com
executables:
- widget
extensions:
- ext/widget/extconf.rb
homepage: https://example.com/widget
licenses:
- MIT
post_install_message:
summary: Widgets for Ruby
"#;

    #[test]
    fn parses_metadata_yaml() {
        let spec = parse_metadata_yaml(METADATA.as_bytes(), "widget-1.2.0.gem").unwrap();
        assert_eq!(spec.name, "widget");
        assert_eq!(spec.version_or_zero().to_string(), "1.2.0");
        assert_eq!(spec.platform, "ruby");
        assert_eq!(spec.authors, vec!["Ada Lovelace"]);
        assert_eq!(spec.licenses, vec!["MIT"]);
        assert_eq!(spec.extensions, vec!["ext/widget/extconf.rb"]);
        assert_eq!(spec.summary.as_deref(), Some("Widgets for Ruby"));
        assert!(spec.description.as_deref().unwrap().contains("two lines"));
        assert!(spec.post_install_message.is_none());

        assert_eq!(spec.runtime_deps.len(), 1);
        assert_eq!(spec.runtime_deps[0].0, "rack");
        assert_eq!(spec.runtime_deps[0].1.to_string(), "~> 3.0");
    }

    #[test]
    fn metadata_without_version_is_an_error() {
        let result = parse_metadata_yaml(b"name: x\n", "x.gem");
        assert!(matches!(
            result,
            Err(GemspecError::MissingField { field: "version", .. })
        ));
    }

    #[test]
    fn metadata_must_be_utf8() {
        assert!(parse_metadata_yaml(&[0xFF, 0xFE, 0x00], "bad.gem").is_err());
    }
}
