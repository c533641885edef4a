//! Native-extension build hand-off.
//!
//! The installer hands a gem directory and its declared extension specs to
//! a build backend, bounded by a per-gem timeout. Build failures are
//! counted and warned about; they never fail the overall install.

use crate::env_vars;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default per-gem build timeout
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything a backend needs to build one gem's extensions
#[derive(Debug)]
pub struct BuildRequest<'a> {
    pub gem_name: &'a str,
    pub gem_dir: &'a Path,

    /// Extension spec paths relative to the gem root (e.g. `ext/foo/extconf.rb`)
    pub extensions: &'a [String],

    pub ruby_path: &'a str,
    pub ruby_version: Option<&'a str>,
    pub parallelism: usize,
    pub verbose: bool,
    pub timeout: Duration,
}

/// The result of building one extension spec
#[derive(Debug)]
pub struct ExtensionResult {
    pub extension: String,
    pub success: bool,
    pub artifacts: Vec<PathBuf>,
    pub log: Vec<String>,
}

/// Per-gem build outcome
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub results: Vec<ExtensionResult>,
}

impl BuildOutcome {
    /// Whether every extension built.
    #[must_use]
    pub fn success(&self) -> bool {
        self.results.iter().all(|result| result.success)
    }
}

/// The build backend seam
///
/// Failures are data, not errors: a failed build is reported in the
/// outcome and the install continues.
pub trait ExtensionBackend: Send + Sync {
    fn build(&self, request: &BuildRequest<'_>) -> BuildOutcome;
}

/// Backend that shells out to `ruby extconf.rb` followed by `make`
#[derive(Debug, Default)]
pub struct CommandBackend;

impl ExtensionBackend for CommandBackend {
    fn build(&self, request: &BuildRequest<'_>) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        let deadline = Instant::now() + request.timeout;

        for extension in request.extensions {
            let ext_dir = extension
                .rsplit_once('/')
                .map_or_else(|| request.gem_dir.to_path_buf(), |(dir, _)| request.gem_dir.join(dir));
            let script = extension
                .rsplit_once('/')
                .map_or(extension.as_str(), |(_, file)| file);

            let mut log = Vec::new();
            let mut success = run_step(
                Command::new(request.ruby_path).arg(script).current_dir(&ext_dir),
                deadline,
                &mut log,
            );

            if success {
                success = run_step(
                    Command::new("make")
                        .arg(format!("-j{}", request.parallelism.max(1)))
                        .current_dir(&ext_dir),
                    deadline,
                    &mut log,
                );
            }

            let artifacts = if success {
                collect_artifacts(&ext_dir)
            } else {
                Vec::new()
            };

            if request.verbose {
                for line in &log {
                    debug!(gem = request.gem_name, %extension, "{line}");
                }
            }

            outcome.results.push(ExtensionResult {
                extension: extension.clone(),
                success,
                artifacts,
                log,
            });
        }

        outcome
    }
}

/// Run one build step until it exits or the deadline passes.
fn run_step(command: &mut Command, deadline: Instant, log: &mut Vec<String>) -> bool {
    let program = format!("{command:?}");
    let spawned = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(error) => {
            log.push(format!("failed to spawn {program}: {error}"));
            return false;
        }
    };

    // Drain pipes on threads so a chatty build cannot deadlock on a full
    // pipe while we poll for exit.
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut drains = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        drains.push(spawn_drain(stdout, Arc::clone(&collected)));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(spawn_drain(stderr, Arc::clone(&collected)));
    }

    let exited = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    drop(child.kill());
                    drop(child.wait());
                    break None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(error) => {
                log.push(format!("failed waiting on {program}: {error}"));
                drop(child.kill());
                break None;
            }
        }
    };

    for drain in drains {
        drop(drain.join());
    }
    log.extend(
        collected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..),
    );

    match exited {
        Some(status) if status.success() => true,
        Some(status) => {
            log.push(format!("{program} exited with {status}"));
            false
        }
        None => {
            log.push(format!("{program} timed out"));
            false
        }
    }
}

fn spawn_drain<R: std::io::Read + Send + 'static>(
    reader: R,
    into: Arc<Mutex<Vec<String>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        use std::io::BufRead;
        let buffered = std::io::BufReader::new(reader);
        for line in buffered.lines().map_while(Result::ok) {
            into.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(line);
        }
    })
}

fn collect_artifacts(ext_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(ext_dir) else {
        return Vec::new();
    };
    let mut artifacts: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == "so" || ext == "bundle" || ext == "dll")
        })
        .collect();
    artifacts.sort();
    artifacts
}

/// Coordinates extension builds during install
pub struct ExtensionBuilder {
    backend: Box<dyn ExtensionBackend>,
    skip: bool,
    timeout: Duration,
    parallelism: usize,
    verbose: bool,
}

impl ExtensionBuilder {
    #[must_use]
    pub fn new(parallelism: usize, verbose: bool) -> Self {
        Self {
            backend: Box::new(CommandBackend),
            skip: env_vars::skip_extensions(),
            timeout: DEFAULT_BUILD_TIMEOUT,
            parallelism,
            verbose,
        }
    }

    /// Replace the backend (tests, alternative toolchains).
    #[must_use]
    pub fn with_backend(mut self, backend: Box<dyn ExtensionBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Disable building regardless of the environment.
    #[must_use]
    pub const fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a gem's extensions if it declares any.
    ///
    /// Returns `None` when there is nothing to do (no extensions, or
    /// builds disabled). A failed build is an outcome, not an error.
    #[must_use]
    pub fn build_if_needed(
        &self,
        gem_name: &str,
        gem_dir: &Path,
        extensions: &[String],
    ) -> Option<BuildOutcome> {
        if extensions.is_empty() {
            return None;
        }
        if self.skip {
            debug!(gem = gem_name, "extension builds disabled, skipping");
            return None;
        }

        let request = BuildRequest {
            gem_name,
            gem_dir,
            extensions,
            ruby_path: "ruby",
            ruby_version: None,
            parallelism: self.parallelism,
            verbose: self.verbose,
            timeout: self.timeout,
        };

        let outcome = self.backend.build(&request);
        if !outcome.success() {
            warn!(gem = gem_name, "note: extension build failed");
        }
        Some(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests can panic")]
mod tests {
    use super::*;

    struct RecordingBackend {
        calls: Arc<Mutex<Vec<String>>>,
        succeed: bool,
    }

    impl ExtensionBackend for RecordingBackend {
        fn build(&self, request: &BuildRequest<'_>) -> BuildOutcome {
            self.calls
                .lock()
                .unwrap()
                .push(request.gem_name.to_string());
            BuildOutcome {
                results: request
                    .extensions
                    .iter()
                    .map(|extension| ExtensionResult {
                        extension: extension.clone(),
                        success: self.succeed,
                        artifacts: Vec::new(),
                        log: Vec::new(),
                    })
                    .collect(),
            }
        }
    }

    #[test]
    fn no_extensions_means_no_build() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let builder = ExtensionBuilder::new(1, false)
            .with_skip(false)
            .with_backend(Box::new(RecordingBackend {
                calls: Arc::clone(&calls),
                succeed: true,
            }));

        assert!(builder.build_if_needed("foo", Path::new("."), &[]).is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn skip_disables_the_backend() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let builder = ExtensionBuilder::new(1, false)
            .with_skip(true)
            .with_backend(Box::new(RecordingBackend {
                calls: Arc::clone(&calls),
                succeed: true,
            }));

        let extensions = vec!["ext/foo/extconf.rb".to_string()];
        assert!(
            builder
                .build_if_needed("foo", Path::new("."), &extensions)
                .is_none()
        );
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_builds_are_outcomes_not_errors() {
        let builder = ExtensionBuilder::new(1, false)
            .with_skip(false)
            .with_backend(Box::new(RecordingBackend {
                calls: Arc::new(Mutex::new(Vec::new())),
                succeed: false,
            }));

        let extensions = vec!["ext/foo/extconf.rb".to_string()];
        let outcome = builder
            .build_if_needed("foo", Path::new("."), &extensions)
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.results.len(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn run_step_reports_exit_status() {
        let mut log = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(run_step(
            Command::new("sh").args(["-c", "echo hello"]),
            deadline,
            &mut log
        ));
        assert!(log.iter().any(|line| line == "hello"));

        let mut log = Vec::new();
        assert!(!run_step(
            Command::new("sh").args(["-c", "exit 3"]),
            deadline,
            &mut log
        ));
    }

    #[test]
    #[cfg(unix)]
    fn run_step_kills_on_timeout() {
        let mut log = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(100);
        let started = Instant::now();
        assert!(!run_step(
            Command::new("sh").args(["-c", "sleep 30"]),
            deadline,
            &mut log
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(log.iter().any(|line| line.contains("timed out")));
    }
}
