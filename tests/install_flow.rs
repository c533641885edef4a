//! End-to-end install: loopback registry -> archive cache -> vendor tree.

mod common;

use ore::{ExtensionBuilder, GitManager, Installer, Lockfile, Pipeline, SourceManager};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn registry_lock(remote: &str) -> Lockfile {
    Lockfile::parse(&format!(
        "GEM\n  remote: {remote}/\n  specs:\n    demo (1.0.0)\n\nPLATFORMS\n  ruby\n\nDEPENDENCIES\n  demo\n\nBUNDLED WITH\n   0.1.0\n"
    ))
    .expect("lock")
}

async fn run_install(
    remote: &str,
    temp: &TempDir,
    vendor: &std::path::Path,
) -> ore::InstallReport {
    let cache_dir = temp.path().join("archive-cache");
    let manager = Arc::new(
        SourceManager::new(remote, None, cache_dir).expect("source manager"),
    );
    let lock = registry_lock(remote);
    let mut managers = HashMap::new();
    managers.insert(format!("{remote}/"), manager);

    let git = Arc::new(GitManager::new(temp.path().join("git-cache")).expect("git cache"));
    let pipeline = Pipeline::new(
        Installer::new(vendor.to_path_buf()),
        ExtensionBuilder::new(1, false).with_skip(true),
        git,
    )
    .with_workers(2);

    let token = CancellationToken::new();
    let (report, _messages) = pipeline
        .run(&lock, None, &managers, &token)
        .await
        .expect("pipeline run");
    report
}

#[tokio::test]
async fn downloads_extracts_and_links_the_vendor_tree() {
    let gem_bytes = common::build_gem_archive(
        "demo",
        "1.0.0",
        &[
            ("lib/demo.rb", 0o644, b"module Demo\nend\n".as_slice()),
            ("bin/demo", 0o755, b"#!/usr/bin/env ruby\nputs :ok\n".as_slice()),
        ],
    );
    let (remote, hits) = common::serve_bytes(gem_bytes).await;

    let temp = TempDir::new().expect("tempdir");
    let vendor = temp.path().join("vendor");

    let report = run_install(&remote, &temp, &vendor).await;
    assert_eq!(report.installed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Payload
    assert_eq!(
        fs::read_to_string(vendor.join("gems/demo-1.0.0/lib/demo.rb")).expect("lib"),
        "module Demo\nend\n"
    );

    // Wrapper sets the gem environment to the absolute vendor root
    let wrapper = fs::read_to_string(vendor.join("bin/demo")).expect("wrapper");
    assert!(wrapper.starts_with("#!/usr/bin/env ruby"));
    let vendor_abs = fs::canonicalize(&vendor).expect("canonicalize");
    assert!(wrapper.contains(&format!("ENV[\"GEM_HOME\"] = \"{}\"", vendor_abs.display())));

    // Spec shim and vendor cache copy
    assert!(vendor.join("specifications/demo-1.0.0.gemspec").exists());
    assert!(vendor.join("cache/demo-1.0.0.gem").exists());
}

#[tokio::test]
async fn reinstall_skips_and_touches_nothing() {
    let gem_bytes = common::build_gem_archive(
        "demo",
        "1.0.0",
        &[("lib/demo.rb", 0o644, b"module Demo\nend\n".as_slice())],
    );
    let (remote, hits) = common::serve_bytes(gem_bytes).await;

    let temp = TempDir::new().expect("tempdir");
    let vendor = temp.path().join("vendor");

    let first = run_install(&remote, &temp, &vendor).await;
    assert_eq!(first.installed, 1);

    let before = fs::read(vendor.join("gems/demo-1.0.0/lib/demo.rb")).expect("read");

    let second = run_install(&remote, &temp, &vendor).await;
    assert_eq!(second.installed, 0);
    assert_eq!(second.skipped, 1);

    // Archive cache satisfied the second run; only the first hit the wire
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    let after = fs::read(vendor.join("gems/demo-1.0.0/lib/demo.rb")).expect("read");
    assert_eq!(before, after);
}
