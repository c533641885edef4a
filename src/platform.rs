//! Platform detection and compatibility
//!
//! Detects the host platform in `RubyGems` format (e.g., "arm64-darwin",
//! "x86_64-linux") and decides which gem platform tags are installable.

use std::env;
use std::sync::LazyLock;

/// Cached host platform (computed once, reused throughout execution)
static HOST_PLATFORM: LazyLock<String> = LazyLock::new(detect_host_impl);

/// Detect the host platform in `RubyGems` format.
#[must_use]
pub fn host_platform() -> String {
    HOST_PLATFORM.clone()
}

fn detect_host_impl() -> String {
    format!(
        "{}-{}",
        normalize_arch(env::consts::ARCH),
        normalize_os(env::consts::OS)
    )
}

/// Canonical architecture names
///
/// Folds the spellings seen in gem platform tags and toolchain triples onto
/// one name per architecture.
fn normalize_arch(arch: &str) -> &str {
    match arch {
        "amd64" | "x86_64" => "x86_64",
        "aarch64" | "arm64" => "arm64",
        "386" | "i386" | "x86" => "x86",
        other => other,
    }
}

/// Canonical OS names (`RubyGems` spells Windows "mingw32")
fn normalize_os(os: &str) -> &str {
    match os {
        "macos" | "darwin" => "darwin",
        "linux" => "linux",
        "windows" | "mingw32" => "mingw32",
        other => other,
    }
}

/// Check whether a gem platform tag is installable on `host`.
///
/// `"ruby"` is portable and always accepted; otherwise the tag's
/// `<arch>-<os>` prefix must equal the host's after normalization, so
/// `arm64-darwin-23` matches an `arm64-darwin` host.
#[must_use]
pub fn platform_supported(platform: &str, host: &str) -> bool {
    if platform == "ruby" {
        return true;
    }

    let mut gem_parts = platform.split('-');
    let mut host_parts = host.split('-');
    match (
        gem_parts.next(),
        gem_parts.next(),
        host_parts.next(),
        host_parts.next(),
    ) {
        (Some(gem_arch), Some(gem_os), Some(host_arch), Some(host_os)) => {
            normalize_arch(gem_arch) == normalize_arch(host_arch)
                && normalize_os(gem_os) == normalize_os(host_os)
        }
        _ => false,
    }
}

/// Check a gem platform tag against the detected host.
#[must_use]
pub fn platform_matches_host(platform: &str) -> bool {
    platform_supported(platform, &host_platform())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ruby_is_always_supported() {
        assert!(platform_supported("ruby", "arm64-darwin"));
        assert!(platform_supported("ruby", "x86_64-linux"));
    }

    #[test]
    fn exact_match() {
        assert!(platform_supported("arm64-darwin", "arm64-darwin"));
        assert!(!platform_supported("x86_64-linux", "arm64-darwin"));
    }

    #[test]
    fn versioned_variant_matches_prefix() {
        assert!(platform_supported("arm64-darwin-23", "arm64-darwin"));
        assert!(platform_supported("x86_64-linux-gnu", "x86_64-linux"));
    }

    #[test]
    fn arch_normalization() {
        assert!(platform_supported("amd64-linux", "x86_64-linux"));
        assert!(platform_supported("aarch64-linux", "arm64-linux"));
        assert!(platform_supported("386-mingw32", "x86-mingw32"));
    }

    #[test]
    fn os_normalization() {
        assert!(platform_supported("x86_64-windows", "x86_64-mingw32"));
        assert!(platform_supported("arm64-macos", "arm64-darwin"));
    }

    #[test]
    fn single_component_tags_never_match() {
        // "java" and friends have no arch-os prefix to compare.
        assert!(!platform_supported("java", "x86_64-linux"));
    }

    #[test]
    fn host_detection_has_two_components() {
        let host = host_platform();
        assert_eq!(host.split('-').count(), 2);
    }
}
