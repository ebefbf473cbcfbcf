//! Copy-out of the scratch workspace into durable storage.
//!
//! The copy is best effort: a file that cannot be copied or verified is
//! recorded in the [`PreserveReport`] and the walk continues. Nothing here
//! returns an error to the caller; problems surface as `warn` events and in
//! the report written next to the copied results.

pub use crate::config::VerifyMode;
use jobwrap_core::{atomic_write_json_pretty, normalize_path, sha256_file};
use serde::Serialize;
use std::fmt;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

pub const PRESERVE_REPORT_FILE: &str = "preserve_report.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreserveIssue {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for PreserveIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreserveReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub verify: VerifyMode,
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub files_verified: usize,
    pub failures: Vec<PreserveIssue>,
    pub mismatches: Vec<PreserveIssue>,
}

impl PreserveReport {
    fn new(source: &Path, destination: &Path, verify: VerifyMode) -> Self {
        Self {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            verify,
            files_copied: 0,
            bytes_copied: 0,
            files_verified: 0,
            failures: Vec::new(),
            mismatches: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.mismatches.is_empty()
    }

    pub fn status(&self) -> &'static str {
        if self.is_clean() {
            "complete"
        } else if self.files_copied == 0 {
            "failed"
        } else {
            "partial"
        }
    }

    fn fail(&mut self, path: &Path, message: impl Into<String>) {
        self.failures.push(PreserveIssue {
            path: path.to_path_buf(),
            message: message.into(),
        });
    }

    fn mismatch(&mut self, path: &Path, message: impl Into<String>) {
        self.mismatches.push(PreserveIssue {
            path: path.to_path_buf(),
            message: message.into(),
        });
    }
}

/// Recursively copies `src` into `dst`, verifying each file per `verify`.
pub fn copy_tree(src: &Path, dst: &Path, verify: VerifyMode) -> PreserveReport {
    let mut report = PreserveReport::new(src, dst, verify);
    if !src.is_dir() {
        report.fail(src, "source directory does not exist");
        return report;
    }
    if let Err(e) = fs::create_dir_all(dst) {
        report.fail(dst, format!("failed to create destination: {}", e));
        return report;
    }

    // A destination nested inside the source must not be walked into.
    let dst_norm = normalize_path(dst);
    let walker = walkdir::WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| normalize_path(e.path()) != dst_norm);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
                report.fail(&path, e.to_string());
                continue;
            }
        };
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            if let Err(e) = fs::create_dir_all(&target) {
                report.fail(path, format!("failed to create directory: {}", e));
            }
        } else if file_type.is_symlink() {
            copy_symlink(path, &target, &mut report);
        } else if file_type.is_file() {
            copy_file(path, &target, verify, &mut report);
        }
    }
    report
}

fn copy_file(path: &Path, target: &Path, verify: VerifyMode, report: &mut PreserveReport) {
    if let Some(parent) = target.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            report.fail(path, format!("failed to create parent directory: {}", e));
            return;
        }
    }
    let copied = match fs::copy(path, target) {
        Ok(n) => n,
        Err(e) => {
            report.fail(path, format!("copy failed: {}", e));
            return;
        }
    };
    report.files_copied += 1;
    report.bytes_copied += copied;
    match verify_copy(path, target, verify) {
        Ok(true) => report.files_verified += 1,
        Ok(false) => {}
        Err(message) => report.mismatch(path, message),
    }
}

/// `Ok(true)` when verified, `Ok(false)` when verification is off.
fn verify_copy(src: &Path, dst: &Path, verify: VerifyMode) -> Result<bool, String> {
    match verify {
        VerifyMode::None => Ok(false),
        VerifyMode::Count => {
            let a = fs::metadata(src).map_err(|e| e.to_string())?.len();
            let b = fs::metadata(dst).map_err(|e| e.to_string())?.len();
            if a == b {
                Ok(true)
            } else {
                Err(format!("size mismatch: source {} bytes, copy {} bytes", a, b))
            }
        }
        VerifyMode::Checksum => {
            let a = sha256_file(src).map_err(|e| e.to_string())?;
            let b = sha256_file(dst).map_err(|e| e.to_string())?;
            if a == b {
                Ok(true)
            } else {
                Err(format!("checksum mismatch: source {}, copy {}", a, b))
            }
        }
    }
}

fn copy_symlink(path: &Path, target: &Path, report: &mut PreserveReport) {
    let link_target = match fs::read_link(path) {
        Ok(t) => t,
        Err(e) => {
            report.fail(path, format!("failed to read link: {}", e));
            return;
        }
    };
    if target.symlink_metadata().is_ok() {
        let _ = fs::remove_file(target);
    }
    #[cfg(unix)]
    {
        if let Err(e) = symlink(&link_target, target) {
            report.fail(path, format!("failed to recreate link: {}", e));
        }
    }
    #[cfg(not(unix))]
    {
        report.fail(
            path,
            format!("symlink to {} not preserved", link_target.display()),
        );
    }
}

/// Everything the exit-path cleanup needs, resolved before setup starts.
#[derive(Debug, Clone)]
pub struct CleanupPlan {
    pub scratch_root: PathBuf,
    pub durable_dir: PathBuf,
    pub verify: VerifyMode,
    /// Full argv of an optional tracking sync, run before the copy.
    pub sync_command: Option<Vec<String>>,
}

impl CleanupPlan {
    pub fn execute(&self) -> PreserveReport {
        if let Some(argv) = &self.sync_command {
            run_tracking_sync(argv);
        }
        info!(
            from = %self.scratch_root.display(),
            to = %self.durable_dir.display(),
            verify = self.verify.as_str(),
            "preserving scratch results"
        );
        let report = copy_tree(&self.scratch_root, &self.durable_dir, self.verify);
        log_report(&report);
        if self.durable_dir.is_dir() {
            let path = self.durable_dir.join(PRESERVE_REPORT_FILE);
            match serde_json::to_value(&report) {
                Ok(value) => {
                    if let Err(e) = atomic_write_json_pretty(&path, &value) {
                        warn!(path = %path.display(), error = %e, "failed to write preserve report");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize preserve report"),
            }
        }
        report
    }
}

fn log_report(report: &PreserveReport) {
    for issue in report.failures.iter().chain(report.mismatches.iter()) {
        warn!(path = %issue.path.display(), "{}", issue.message);
    }
    if report.is_clean() {
        info!(
            files = report.files_copied,
            bytes = report.bytes_copied,
            verified = report.files_verified,
            "scratch results preserved"
        );
    } else {
        warn!(
            status = report.status(),
            files = report.files_copied,
            failures = report.failures.len(),
            mismatches = report.mismatches.len(),
            "scratch results only partially preserved"
        );
    }
}

fn run_tracking_sync(argv: &[String]) {
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    info!(command = ?argv, "syncing offline tracking runs");
    match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "tracking sync failed; offline runs remain in scratch copy"),
        Err(e) => warn!(error = %e, "tracking sync could not be started"),
    }
}

/// Runs its cleanup exactly once: on [`CleanupGuard::finish`], or on drop
/// when an early return or panic skips `finish`.
pub struct CleanupGuard<'a, T> {
    cleanup: Option<Box<dyn FnOnce() -> T + 'a>>,
}

impl<'a, T> CleanupGuard<'a, T> {
    pub fn arm(cleanup: impl FnOnce() -> T + 'a) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Returns `None` if the cleanup already ran.
    pub fn finish(&mut self) -> Option<T> {
        self.cleanup.take().map(|f| f())
    }
}

impl<T> Drop for CleanupGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(f) = self.cleanup.take() {
            let _ = f();
        }
    }
}
