use crate::config::LaunchConfig;
use crate::env::EnvSnapshot;
use crate::preserve::{copy_tree, VerifyMode};
use anyhow::{anyhow, Result};
use jobwrap_core::ensure_dir;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Job-local directory tree. Lives for exactly one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    pub root: PathBuf,
    pub results: PathBuf,
    pub data: PathBuf,
    pub tracking: PathBuf,
}

impl ScratchLayout {
    pub fn resolve(cfg: &LaunchConfig, env: &EnvSnapshot, job_id: &str) -> Self {
        let root = match env.get(&cfg.scratch.root_env) {
            Some(root) => PathBuf::from(root),
            None => {
                let fallback = cfg
                    .scratch
                    .fallback_root
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join(format!("jobwrap_{}", job_id)));
                warn!(
                    var = %cfg.scratch.root_env,
                    root = %fallback.display(),
                    "scheduler scratch root not set; using fallback"
                );
                fallback
            }
        };
        Self::under(&root, cfg)
    }

    pub fn under(root: &Path, cfg: &LaunchConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            results: root.join(&cfg.scratch.results_dir),
            data: root.join(&cfg.scratch.data_dir),
            tracking: root.join(&cfg.tracking.dir),
        }
    }

    /// Creates every directory; safe to call when they already exist.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.root, &self.results, &self.data, &self.tracking] {
            ensure_dir(dir)?;
        }
        Ok(())
    }

    /// Copies a dataset into the data directory, failing on any file error.
    pub fn stage_data(&self, source: &Path) -> Result<()> {
        if !source.is_dir() {
            return Err(anyhow!(
                "data staging source is not a directory: {}",
                source.display()
            ));
        }
        let report = copy_tree(source, &self.data, VerifyMode::Count);
        if let Some(first) = report.failures.first().or(report.mismatches.first()) {
            return Err(anyhow!(
                "failed to stage data from {}: {} ({} problem(s))",
                source.display(),
                first,
                report.failures.len() + report.mismatches.len()
            ));
        }
        info!(
            source = %source.display(),
            files = report.files_copied,
            bytes = report.bytes_copied,
            "staged input data into scratch"
        );
        Ok(())
    }
}
