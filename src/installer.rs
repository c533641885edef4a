//! Gem installation and extraction.
//!
//! A gem archive is a POSIX tar holding `metadata.gz` (the YAML spec) and
//! `data.tar.gz` (the payload tree). Extraction streams gzip→tar→file with
//! a pooled copy buffer and a directory-creation cache, never materializing
//! the payload in memory, and refuses anything that would write outside the
//! destination root. Installation also writes the specification shim,
//! copies the archive into the vendor cache, and links executable wrappers.

use crate::fs_utils::{self, DirCache};
use crate::gemspec::{Gemspec, GemspecError};
use crate::lockfile::LockedGem;
use flate2::read::GzDecoder;
use std::fmt::Write as _;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use thiserror::Error;
use tracing::{debug, warn};

/// RubyGems version tag written into synthesized spec shims
const RUBYGEMS_VERSION_TAG: &str = "3.6.2";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read archive for {gem}: {source}")]
    Io {
        gem: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive for {gem} is missing {member}")]
    MissingMember { gem: String, member: &'static str },

    #[error("archive for {gem} uses unsupported payload compression: {member}")]
    UnsupportedPayloadCompression { gem: String, member: String },

    #[error("archive for {gem} attempts to escape the install root: {entry}")]
    PathEscape { gem: String, entry: String },

    #[error("invalid metadata in archive for {gem}: {source}")]
    Metadata {
        gem: String,
        #[source]
        source: GemspecError,
    },
}

impl ArchiveError {
    fn io(gem: impl Into<String>) -> impl Fn(std::io::Error) -> Self {
        let gem = gem.into();
        move |source| Self::Io {
            gem: gem.clone(),
            source,
        }
    }
}

/// What happened for one gem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Skipped,
}

/// A completed install, with what later phases need
#[derive(Debug)]
pub struct InstalledGem {
    pub full_name: String,
    pub gem_dir: PathBuf,

    /// Parsed archive metadata (or gemspec for tree installs)
    pub spec: Gemspec,
}

/// Installs gems into a vendor tree
#[derive(Debug)]
pub struct Installer {
    vendor_dir: PathBuf,
    dir_cache: DirCache,
    force: bool,
}

impl Installer {
    #[must_use]
    pub fn new(vendor_dir: PathBuf) -> Self {
        Self {
            vendor_dir,
            dir_cache: DirCache::new(),
            force: false,
        }
    }

    /// Remove and rebuild existing installs instead of skipping them.
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// The vendor root.
    #[must_use]
    pub fn vendor_dir(&self) -> &Path {
        &self.vendor_dir
    }

    fn gems_dir(&self) -> PathBuf {
        self.vendor_dir.join("gems")
    }

    fn bin_dir(&self) -> PathBuf {
        self.vendor_dir.join("bin")
    }

    fn specifications_dir(&self) -> PathBuf {
        self.vendor_dir.join("specifications")
    }

    fn vendor_cache_dir(&self) -> PathBuf {
        self.vendor_dir.join("cache")
    }

    /// Create the vendor tree skeleton.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.gems_dir(),
            self.vendor_cache_dir(),
            self.bin_dir(),
            self.specifications_dir(),
            self.specifications_dir().join("cache"),
        ] {
            self.dir_cache.create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Install a gem archive.
    ///
    /// Idempotent: an already-present install returns `Skipped` untouched
    /// unless `force` was set, in which case the directory is removed and
    /// rebuilt.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed archives, unsupported compression, or
    /// any entry escaping the destination root.
    pub fn install_archive(
        &self,
        archive_path: &Path,
        locked: &LockedGem,
    ) -> Result<(InstallOutcome, Option<InstalledGem>), ArchiveError> {
        let full_name = locked.full_name_with_platform();
        let gem_dir = self.gems_dir().join(&full_name);

        if gem_dir.exists() {
            if self.force {
                fs::remove_dir_all(&gem_dir).map_err(ArchiveError::io(&full_name))?;
            } else {
                debug!(gem = %full_name, "already installed, skipping");
                return Ok((InstallOutcome::Skipped, None));
            }
        }

        self.ensure_layout().map_err(ArchiveError::io(&full_name))?;
        self.dir_cache
            .create_dir_all(&gem_dir)
            .map_err(ArchiveError::io(&full_name))?;

        let metadata = self.extract_archive(archive_path, &gem_dir, &full_name)?;
        let spec = crate::gemspec::parse_metadata_yaml(&metadata, &full_name).map_err(|source| {
            ArchiveError::Metadata {
                gem: full_name.clone(),
                source,
            }
        })?;

        // Vendor cache copy is a note-and-continue failure, never fatal
        let cached = self.vendor_cache_dir().join(format!("{full_name}.gem"));
        if !cached.exists()
            && let Err(error) = fs::copy(archive_path, &cached)
        {
            warn!(gem = %full_name, %error, "note: could not copy archive into vendor cache");
        }

        self.write_spec_shim(&spec, locked)
            .map_err(ArchiveError::io(&full_name))?;
        self.link_executables(&gem_dir, &full_name)
            .map_err(ArchiveError::io(&full_name))?;

        Ok((
            InstallOutcome::Installed,
            Some(InstalledGem {
                full_name,
                gem_dir,
                spec,
            }),
        ))
    }

    /// Install a gem from a checked-out tree (git and path sources).
    ///
    /// Copies the tree into the vendor gems directory and synthesizes the
    /// same shim and wrappers an archive install would get.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy or linking fails.
    pub fn install_tree(
        &self,
        source_dir: &Path,
        spec: &Gemspec,
        locked: &LockedGem,
    ) -> Result<(InstallOutcome, Option<InstalledGem>), ArchiveError> {
        let full_name = locked.full_name_with_platform();
        let gem_dir = self.gems_dir().join(&full_name);

        if gem_dir.exists() {
            if self.force {
                fs::remove_dir_all(&gem_dir).map_err(ArchiveError::io(&full_name))?;
            } else {
                return Ok((InstallOutcome::Skipped, None));
            }
        }

        self.ensure_layout().map_err(ArchiveError::io(&full_name))?;
        copy_tree(source_dir, &gem_dir).map_err(ArchiveError::io(&full_name))?;

        self.write_spec_shim(spec, locked)
            .map_err(ArchiveError::io(&full_name))?;
        self.link_executables(&gem_dir, &full_name)
            .map_err(ArchiveError::io(&full_name))?;

        Ok((
            InstallOutcome::Installed,
            Some(InstalledGem {
                full_name,
                gem_dir,
                spec: spec.clone(),
            }),
        ))
    }

    /// Walk the outer tar, extract the payload, and return the metadata
    /// bytes.
    fn extract_archive(
        &self,
        archive_path: &Path,
        gem_dir: &Path,
        full_name: &str,
    ) -> Result<Vec<u8>, ArchiveError> {
        let file = fs::File::open(archive_path).map_err(ArchiveError::io(full_name))?;
        let mut archive = Archive::new(file);

        let mut metadata: Option<Vec<u8>> = None;
        let mut extracted_payload = false;

        for entry in archive.entries().map_err(ArchiveError::io(full_name))? {
            let entry = entry.map_err(ArchiveError::io(full_name))?;
            let member = entry
                .path()
                .map_err(ArchiveError::io(full_name))?
                .to_string_lossy()
                .into_owned();

            match member.as_str() {
                "metadata.gz" => {
                    let mut bytes = Vec::new();
                    GzDecoder::new(entry)
                        .read_to_end(&mut bytes)
                        .map_err(ArchiveError::io(full_name))?;
                    metadata = Some(bytes);
                }
                "metadata" => {
                    let mut bytes = Vec::new();
                    let mut entry = entry;
                    entry
                        .read_to_end(&mut bytes)
                        .map_err(ArchiveError::io(full_name))?;
                    metadata = Some(bytes);
                }
                "data.tar.gz" => {
                    self.extract_payload(GzDecoder::new(entry), gem_dir, full_name)?;
                    extracted_payload = true;
                }
                other if other.starts_with("data.tar.") => {
                    return Err(ArchiveError::UnsupportedPayloadCompression {
                        gem: full_name.to_string(),
                        member,
                    });
                }
                _ => {}
            }
        }

        if !extracted_payload {
            return Err(ArchiveError::MissingMember {
                gem: full_name.to_string(),
                member: "data.tar.gz",
            });
        }
        metadata.ok_or_else(|| ArchiveError::MissingMember {
            gem: full_name.to_string(),
            member: "metadata.gz",
        })
    }

    /// Stream the payload tar into the gem directory.
    fn extract_payload<R: Read>(
        &self,
        reader: R,
        gem_dir: &Path,
        full_name: &str,
    ) -> Result<(), ArchiveError> {
        let mut archive = Archive::new(reader);

        for entry in archive.entries().map_err(ArchiveError::io(full_name))? {
            let mut entry = entry.map_err(ArchiveError::io(full_name))?;
            let raw_path = entry
                .path()
                .map_err(ArchiveError::io(full_name))?
                .into_owned();

            let relative = sanitize_entry_path(&raw_path).ok_or_else(|| {
                ArchiveError::PathEscape {
                    gem: full_name.to_string(),
                    entry: raw_path.display().to_string(),
                }
            })?;
            if relative.as_os_str().is_empty() {
                continue;
            }
            let target = gem_dir.join(&relative);

            match entry.header().entry_type() {
                EntryType::Directory => {
                    self.dir_cache
                        .create_dir_all(&target)
                        .map_err(ArchiveError::io(full_name))?;
                    set_mode(&target, entry.header().mode().unwrap_or(0o755));
                }
                EntryType::Regular => {
                    if let Some(parent) = target.parent() {
                        self.dir_cache
                            .create_dir_all(parent)
                            .map_err(ArchiveError::io(full_name))?;
                    }
                    let mut file =
                        fs::File::create(&target).map_err(ArchiveError::io(full_name))?;
                    fs_utils::copy_with_pooled_buffer(&mut entry, &mut file)
                        .map_err(ArchiveError::io(full_name))?;
                    set_mode(&target, entry.header().mode().unwrap_or(0o644));
                }
                EntryType::Symlink => {
                    let Some(link_target) = entry
                        .link_name()
                        .map_err(ArchiveError::io(full_name))?
                        .map(|l| l.into_owned())
                    else {
                        continue;
                    };
                    if let Some(parent) = target.parent() {
                        self.dir_cache
                            .create_dir_all(parent)
                            .map_err(ArchiveError::io(full_name))?;
                    }
                    // Replace an existing file with a single-file unlink,
                    // never a recursive removal.
                    if target.symlink_metadata().is_ok() {
                        fs::remove_file(&target).map_err(ArchiveError::io(full_name))?;
                    }
                    make_symlink(&link_target, &target).map_err(ArchiveError::io(full_name))?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Write the specification shim for downstream tooling.
    fn write_spec_shim(&self, spec: &Gemspec, locked: &LockedGem) -> std::io::Result<()> {
        let path = self
            .specifications_dir()
            .join(format!("{}.gemspec", locked.full_name_with_platform()));
        fs::write(path, synthesize_spec_shim(spec, locked))
    }

    /// Create launcher wrappers for everything under the payload's `bin/`.
    fn link_executables(&self, gem_dir: &Path, full_name: &str) -> std::io::Result<()> {
        let payload_bin = gem_dir.join("bin");
        let Ok(entries) = fs::read_dir(&payload_bin) else {
            return Ok(());
        };

        let vendor_abs = fs::canonicalize(&self.vendor_dir)
            .unwrap_or_else(|_| self.vendor_dir.clone());

        for entry in entries.flatten() {
            if !entry.path().is_file() {
                continue;
            }
            let exe = entry.file_name().to_string_lossy().into_owned();
            let wrapper = self.bin_dir().join(&exe);
            fs::write(&wrapper, launcher_script(&vendor_abs, full_name, &exe))?;
            set_mode(&wrapper, 0o755);
            debug!(exe = %exe, gem = full_name, "linked executable");
        }
        Ok(())
    }
}

/// Normalize a tar entry path, rejecting anything that escapes the root.
///
/// Returns `None` for absolute paths or any `..` component.
fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    drop(fs::set_permissions(path, fs::Permissions::from_mode(mode)));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn make_symlink(link_target: &Path, at: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link_target, at)
}

#[cfg(not(unix))]
fn make_symlink(_link_target: &Path, _at: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Recursively copy a gem tree, skipping VCS and vendor directories.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let src_path = entry.path();
        let dst_path = dst.join(&name);

        if src_path.is_dir() {
            if name == ".git" || name == ".bundle" || name == "vendor" {
                continue;
            }
            copy_tree(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

fn ruby_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '#' => quoted.push_str("\\#"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

/// Synthesize the specification shim.
///
/// A pure function of the parsed metadata and the lock-level edge list:
/// installing the same gem twice produces byte-identical shims.
#[must_use]
pub fn synthesize_spec_shim(spec: &Gemspec, locked: &LockedGem) -> String {
    let version = locked.version.to_string();
    let mut out = String::new();

    out.push_str("# -*- encoding: utf-8 -*-\n");
    let _ = writeln!(
        out,
        "# stub: {} {} {} lib",
        locked.name,
        version,
        locked.platform.as_deref().unwrap_or("ruby")
    );
    out.push('\n');
    out.push_str("Gem::Specification.new do |s|\n");
    let _ = writeln!(out, "  s.name = {}.freeze", ruby_quote(&locked.name));
    let _ = writeln!(out, "  s.version = {}", ruby_quote(&version));
    if let Some(platform) = &locked.platform {
        let _ = writeln!(out, "  s.platform = {}.freeze", ruby_quote(platform));
    }
    out.push_str("  s.require_paths = [\"lib\"]\n");

    if !spec.authors.is_empty() {
        let authors: Vec<String> = spec.authors.iter().map(|a| ruby_quote(a)).collect();
        let _ = writeln!(out, "  s.authors = [{}]", authors.join(", "));
    }
    if let Some(email) = &spec.email {
        let _ = writeln!(out, "  s.email = {}", ruby_quote(email));
    }
    if let Some(homepage) = &spec.homepage {
        let _ = writeln!(out, "  s.homepage = {}", ruby_quote(homepage));
    }
    if !spec.licenses.is_empty() {
        let licenses: Vec<String> = spec.licenses.iter().map(|l| ruby_quote(l)).collect();
        let _ = writeln!(out, "  s.licenses = [{}]", licenses.join(", "));
    }
    if let Some(summary) = &spec.summary {
        let _ = writeln!(out, "  s.summary = {}", ruby_quote(summary));
    }
    if let Some(description) = &spec.description {
        let _ = writeln!(out, "  s.description = {}", ruby_quote(description));
    }

    let required = spec
        .required_rubygems_version
        .as_deref()
        .unwrap_or(">= 0");
    let _ = writeln!(
        out,
        "  s.required_rubygems_version = Gem::Requirement.new({})",
        ruby_quote(required)
    );
    let _ = writeln!(out, "  s.rubygems_version = {}", ruby_quote(RUBYGEMS_VERSION_TAG));

    if !spec.extensions.is_empty() {
        let extensions: Vec<String> = spec.extensions.iter().map(|e| ruby_quote(e)).collect();
        let _ = writeln!(out, "  s.extensions = [{}]", extensions.join(", "));
    }

    for dep in &locked.deps {
        if dep.constraint.is_any() {
            let _ = writeln!(out, "  s.add_runtime_dependency({}, [\">= 0\"])", ruby_quote(&dep.name));
        } else {
            let requirements: Vec<String> = dep
                .constraint
                .requirements()
                .iter()
                .map(|r| ruby_quote(&r.to_string()))
                .collect();
            let _ = writeln!(
                out,
                "  s.add_runtime_dependency({}, [{}])",
                ruby_quote(&dep.name),
                requirements.join(", ")
            );
        }
    }

    out.push_str("end\n");
    out
}

/// The executable wrapper written into `<vendor>/bin/`.
///
/// Points the interpreter's gem environment at the vendor root, prepends
/// every installed gem's `lib/`, then loads the real executable.
#[must_use]
pub fn launcher_script(vendor_abs: &Path, full_name: &str, exe: &str) -> String {
    let vendor = vendor_abs.display();
    format!(
        "#!/usr/bin/env ruby\n\
         # Generated executable wrapper for {exe}.\n\
         \n\
         ENV[\"GEM_HOME\"] = \"{vendor}\"\n\
         ENV[\"GEM_PATH\"] = \"{vendor}\"\n\
         \n\
         Dir.glob(File.join(\"{vendor}\", \"gems\", \"*\", \"lib\")).sort.each do |libdir|\n\
         \x20\x20$LOAD_PATH.unshift(libdir) unless $LOAD_PATH.include?(libdir)\n\
         end\n\
         \n\
         load \"{vendor}/gems/{full_name}/bin/{exe}\"\n"
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests can panic")]
mod tests {
    use super::*;
    use crate::version::{Constraint, Version};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    const METADATA: &str = "--- !ruby/object:Gem::Specification\n\
        name: foo\n\
        version: !ruby/object:Gem::Version\n\
        \x20\x20version: 1.0.0\n\
        platform: ruby\n\
        authors:\n\
        - Tester\n\
        licenses:\n\
        - MIT\n\
        summary: Foo gem\n";

    fn tar_with_entries(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, mode, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn build_gem(dir: &Path, payload: &[(&str, u32, &[u8])]) -> PathBuf {
        let data_tar_gz = gzip(&tar_with_entries(payload));
        let metadata_gz = gzip(METADATA.as_bytes());

        let outer = tar_with_entries(&[
            ("metadata.gz", 0o644, metadata_gz.as_slice()),
            ("data.tar.gz", 0o644, data_tar_gz.as_slice()),
        ]);

        let path = dir.join("foo-1.0.0.gem");
        fs::write(&path, outer).unwrap();
        path
    }

    fn locked_foo() -> LockedGem {
        LockedGem {
            name: "foo".to_string(),
            version: Version::parse("1.0.0").unwrap(),
            platform: None,
            deps: vec![crate::lockfile::LockedDep {
                name: "rack".to_string(),
                constraint: Constraint::parse("~> 3.0").unwrap(),
            }],
        }
    }

    #[test]
    fn extracts_payload_with_modes_and_links_wrappers() {
        let temp = TempDir::new().unwrap();
        let vendor = temp.path().join("vendor");
        let gem_path = build_gem(
            temp.path(),
            &[
                ("lib/foo.rb", 0o644, b"module Foo\nend\n".as_slice()),
                ("bin/foo", 0o755, b"#!/usr/bin/env ruby\nputs :ok\n".as_slice()),
            ],
        );

        let installer = Installer::new(vendor.clone());
        let (outcome, installed) = installer.install_archive(&gem_path, &locked_foo()).unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        let installed = installed.unwrap();
        assert_eq!(installed.full_name, "foo-1.0.0");

        let lib = vendor.join("gems/foo-1.0.0/lib/foo.rb");
        assert_eq!(fs::read_to_string(&lib).unwrap(), "module Foo\nend\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let lib_mode = fs::metadata(&lib).unwrap().permissions().mode() & 0o777;
            assert_eq!(lib_mode, 0o644);
            let bin_mode = fs::metadata(vendor.join("gems/foo-1.0.0/bin/foo"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(bin_mode, 0o755);
        }

        // Launcher wrapper
        let wrapper = vendor.join("bin/foo");
        let script = fs::read_to_string(&wrapper).unwrap();
        assert!(script.starts_with("#!/usr/bin/env ruby"));
        let vendor_abs = fs::canonicalize(&vendor).unwrap();
        assert!(script.contains(&format!("ENV[\"GEM_HOME\"] = \"{}\"", vendor_abs.display())));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&wrapper).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o755);
        }

        // Archive copied into the vendor cache
        assert!(vendor.join("cache/foo-1.0.0.gem").exists());

        // Spec shim
        let shim = fs::read_to_string(vendor.join("specifications/foo-1.0.0.gemspec")).unwrap();
        assert!(shim.contains("s.name = \"foo\".freeze"));
        assert!(shim.contains("s.version = \"1.0.0\""));
        assert!(shim.contains("s.require_paths = [\"lib\"]"));
        assert!(shim.contains("s.add_runtime_dependency(\"rack\", [\"~> 3.0\"])"));
    }

    #[test]
    fn reinstall_is_a_noop_without_force() {
        let temp = TempDir::new().unwrap();
        let vendor = temp.path().join("vendor");
        let gem_path = build_gem(temp.path(), &[("lib/foo.rb", 0o644, b"x".as_slice())]);

        let installer = Installer::new(vendor.clone());
        installer.install_archive(&gem_path, &locked_foo()).unwrap();

        let lib = vendor.join("gems/foo-1.0.0/lib/foo.rb");
        fs::write(&lib, b"locally modified").unwrap();

        let (outcome, _) = installer.install_archive(&gem_path, &locked_foo()).unwrap();
        assert_eq!(outcome, InstallOutcome::Skipped);
        assert_eq!(fs::read(&lib).unwrap(), b"locally modified");
    }

    #[test]
    fn force_rebuilds_the_install() {
        let temp = TempDir::new().unwrap();
        let vendor = temp.path().join("vendor");
        let gem_path = build_gem(temp.path(), &[("lib/foo.rb", 0o644, b"x".as_slice())]);

        Installer::new(vendor.clone())
            .install_archive(&gem_path, &locked_foo())
            .unwrap();
        let lib = vendor.join("gems/foo-1.0.0/lib/foo.rb");
        fs::write(&lib, b"locally modified").unwrap();

        let (outcome, _) = Installer::new(vendor.clone())
            .with_force(true)
            .install_archive(&gem_path, &locked_foo())
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(fs::read(&lib).unwrap(), b"x");
    }

    #[test]
    fn repeated_install_yields_identical_artifacts() {
        let temp = TempDir::new().unwrap();
        let gem_path = build_gem(
            temp.path(),
            &[("lib/foo.rb", 0o644, b"module Foo\nend\n".as_slice())],
        );

        let read_artifacts = |vendor: &Path| {
            (
                fs::read(vendor.join("gems/foo-1.0.0/lib/foo.rb")).unwrap(),
                fs::read(vendor.join("specifications/foo-1.0.0.gemspec")).unwrap(),
            )
        };

        let vendor_a = temp.path().join("a");
        let vendor_b = temp.path().join("b");
        Installer::new(vendor_a.clone())
            .install_archive(&gem_path, &locked_foo())
            .unwrap();
        Installer::new(vendor_b.clone())
            .install_archive(&gem_path, &locked_foo())
            .unwrap();

        assert_eq!(read_artifacts(&vendor_a), read_artifacts(&vendor_b));
    }

    #[test]
    fn path_escape_is_a_hard_error() {
        let temp = TempDir::new().unwrap();
        let vendor = temp.path().join("vendor");
        let gem_path = build_gem(
            temp.path(),
            &[("../evil.rb", 0o644, b"nope".as_slice())],
        );

        let error = Installer::new(vendor.clone())
            .install_archive(&gem_path, &locked_foo())
            .unwrap_err();
        assert!(matches!(error, ArchiveError::PathEscape { .. }));
        assert!(!temp.path().join("evil.rb").exists());
    }

    #[test]
    fn unsupported_payload_compression_is_rejected() {
        let temp = TempDir::new().unwrap();
        for member in ["data.tar.zst", "data.tar.bz2", "data.tar.xz"] {
            let outer = tar_with_entries(&[
                ("metadata.gz", 0o644, gzip(METADATA.as_bytes()).as_slice()),
                (member, 0o644, b"not really compressed".as_slice()),
            ]);
            let path = temp.path().join(format!("{member}.gem"));
            fs::write(&path, outer).unwrap();

            let error = Installer::new(temp.path().join("vendor"))
                .install_archive(&path, &locked_foo())
                .unwrap_err();
            assert!(
                matches!(error, ArchiveError::UnsupportedPayloadCompression { .. }),
                "{member}: {error:?}"
            );
        }
    }

    #[test]
    fn missing_payload_is_an_error() {
        let temp = TempDir::new().unwrap();
        let outer = tar_with_entries(&[(
            "metadata.gz",
            0o644,
            gzip(METADATA.as_bytes()).as_slice(),
        )]);
        let path = temp.path().join("incomplete.gem");
        fs::write(&path, outer).unwrap();

        let error = Installer::new(temp.path().join("vendor"))
            .install_archive(&path, &locked_foo())
            .unwrap_err();
        assert!(matches!(
            error,
            ArchiveError::MissingMember {
                member: "data.tar.gz",
                ..
            }
        ));
    }

    #[test]
    fn tree_install_writes_shim_and_wrappers() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(source.join("lib")).unwrap();
        fs::create_dir_all(source.join(".git")).unwrap();
        fs::write(source.join("lib/local.rb"), "module Local; end\n").unwrap();
        fs::write(source.join(".git/config"), "x").unwrap();

        let spec = Gemspec {
            name: "local_thing".to_string(),
            version: Some(Version::parse("0.1.0").unwrap()),
            platform: "ruby".to_string(),
            ..Gemspec::default()
        };
        let locked = LockedGem {
            name: "local_thing".to_string(),
            version: Version::parse("0.1.0").unwrap(),
            platform: None,
            deps: vec![],
        };

        let vendor = temp.path().join("vendor");
        let (outcome, _) = Installer::new(vendor.clone())
            .install_tree(&source, &spec, &locked)
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert!(vendor.join("gems/local_thing-0.1.0/lib/local.rb").exists());
        assert!(!vendor.join("gems/local_thing-0.1.0/.git").exists());
        assert!(vendor.join("specifications/local_thing-0.1.0.gemspec").exists());
    }

    #[test]
    fn sanitize_rejects_escapes_and_absolutes() {
        assert!(sanitize_entry_path(Path::new("../evil")).is_none());
        assert!(sanitize_entry_path(Path::new("lib/../../evil")).is_none());
        assert!(sanitize_entry_path(Path::new("/etc/passwd")).is_none());
        assert_eq!(
            sanitize_entry_path(Path::new("./lib/foo.rb")).unwrap(),
            PathBuf::from("lib/foo.rb")
        );
    }
}
