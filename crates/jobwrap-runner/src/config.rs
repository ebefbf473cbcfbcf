use crate::env::EnvSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "jobwrap.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    pub version: String,
    pub job: JobResources,
    #[serde(default)]
    pub scheduler: SchedulerEnv,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    pub project: ProjectConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub scratch: ScratchConfig,
    pub durable: DurableConfig,
    #[serde(default)]
    pub preserve: PreserveConfig,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_shutdown_grace() -> u64 {
    30
}

/// Resource request rendered into `#SBATCH` directives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobResources {
    pub name: Option<String>,
    pub account: Option<String>,
    pub partition: Option<String>,
    pub gpus: u32,
    pub cpus_per_task: u32,
    pub mem: String,
    pub time: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub array: Option<String>,
    pub extra_directives: Vec<String>,
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            name: None,
            account: None,
            partition: None,
            gpus: 1,
            cpus_per_task: 1,
            mem: "8G".to_string(),
            time: "01:00:00".to_string(),
            output: None,
            error: None,
            array: None,
            extra_directives: Vec::new(),
        }
    }
}

/// Names of the variables the scheduler sets inside a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerEnv {
    pub array_index_env: String,
    pub array_job_id_env: String,
    pub job_id_env: String,
}

impl Default for SchedulerEnv {
    fn default() -> Self {
        Self {
            array_index_env: "SLURM_ARRAY_TASK_ID".to_string(),
            array_job_id_env: "SLURM_ARRAY_JOB_ID".to_string(),
            job_id_env: "SLURM_JOB_ID".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub modules: Vec<String>,
    pub venv: Option<PathBuf>,
    pub setup: Vec<String>,
}

impl EnvironmentConfig {
    pub fn needs_shell(&self) -> bool {
        !self.modules.is_empty() || !self.setup.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub workdir: PathBuf,
    #[serde(default = "default_program")]
    pub program: Vec<String>,
    pub subcommand: String,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

fn default_program() -> Vec<String> {
    vec!["python".to_string(), "main.py".to_string()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    #[default]
    Offline,
    Disabled,
}

impl TrackingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingMode::Offline => "offline",
            TrackingMode::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingConfig {
    pub mode: TrackingMode,
    pub api_key_env: Option<String>,
    pub api_key_file: Option<PathBuf>,
    /// Local run storage, relative to the scratch root.
    pub dir: String,
    pub sync_on_exit: bool,
    pub sync_command: Vec<String>,
    /// Only present so a literal key can be rejected with a clear message.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            mode: TrackingMode::Offline,
            api_key_env: Some("WANDB_API_KEY".to_string()),
            api_key_file: None,
            dir: "wandb".to_string(),
            sync_on_exit: false,
            sync_command: vec!["wandb".to_string(), "sync".to_string()],
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScratchConfig {
    pub root_env: String,
    pub fallback_root: Option<PathBuf>,
    pub results_dir: String,
    pub data_dir: String,
    pub stage_data_from: Option<PathBuf>,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root_env: "SLURM_TMPDIR".to_string(),
            fallback_root: None,
            results_dir: "results".to_string(),
            data_dir: "data".to_string(),
            stage_data_from: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurableConfig {
    pub root: PathBuf,
    #[serde(default = "default_true")]
    pub job_subdir: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    None,
    Count,
    #[default]
    Checksum,
}

impl VerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyMode::None => "none",
            VerifyMode::Count => "count",
            VerifyMode::Checksum => "checksum",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreserveConfig {
    pub verify: VerifyMode,
}

/// How the wrapper's own exit code relates to the training program's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    #[default]
    Relay,
    AlwaysSuccess,
}

impl ExitPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitPolicy::Relay => "relay",
            ExitPolicy::AlwaysSuccess => "always_success",
        }
    }
}

pub fn resolve_config_path(explicit: Option<&Path>, env: &EnvSnapshot) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    env.get("JOBWRAP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: &Path, env: &EnvSnapshot) -> Result<LaunchConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&raw, path, env)
}

pub fn parse_config(raw: &str, path: &Path, env: &EnvSnapshot) -> Result<LaunchConfig, ConfigError> {
    let mut cfg: LaunchConfig = serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.apply_env_overrides(env);
    cfg.expand_home(env);
    cfg.validate()?;
    Ok(cfg)
}

impl LaunchConfig {
    fn apply_env_overrides(&mut self, env: &EnvSnapshot) {
        if let Some(root) = env.get("JOBWRAP_DURABLE_ROOT") {
            self.durable.root = PathBuf::from(root);
        }
        if let Some(workdir) = env.get("JOBWRAP_WORKDIR") {
            self.project.workdir = PathBuf::from(workdir);
        }
    }

    fn expand_home(&mut self, env: &EnvSnapshot) {
        let home = env.get("HOME");
        let expand = |p: &mut PathBuf| {
            if let (Some(home), Ok(rest)) = (home, p.strip_prefix("~")) {
                *p = Path::new(home).join(rest);
            }
        };
        expand(&mut self.project.workdir);
        expand(&mut self.durable.root);
        if let Some(p) = self.environment.venv.as_mut() {
            expand(p);
        }
        if let Some(p) = self.scratch.fallback_root.as_mut() {
            expand(p);
        }
        if let Some(p) = self.scratch.stage_data_from.as_mut() {
            expand(p);
        }
        if let Some(p) = self.tracking.api_key_file.as_mut() {
            expand(p);
        }
    }

    /// Collects every problem rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.version.trim().is_empty() {
            problems.push("/version must not be empty".to_string());
        }
        if self.project.program.is_empty() || self.project.program[0].trim().is_empty() {
            problems.push("/project/program must name an executable".to_string());
        }
        if self.project.subcommand.trim().is_empty() {
            problems.push("/project/subcommand must not be empty".to_string());
        }
        if self.project.workdir.as_os_str().is_empty() {
            problems.push("/project/workdir must not be empty".to_string());
        }
        if self.durable.root.as_os_str().is_empty() {
            problems.push("/durable/root must not be empty".to_string());
        }
        if self.job.cpus_per_task == 0 {
            problems.push("/job/cpus_per_task must be at least 1".to_string());
        }
        if parse_memory_mb(&self.job.mem).is_none() {
            problems.push(format!(
                "/job/mem '{}' is not a memory size like 32G or 4000M",
                self.job.mem
            ));
        }
        if parse_wall_time(&self.job.time).is_none() {
            problems.push(format!(
                "/job/time '{}' is not a wall time like 02:00:00 or 1-12:00:00",
                self.job.time
            ));
        }
        for (field, value) in [
            ("/scratch/results_dir", &self.scratch.results_dir),
            ("/scratch/data_dir", &self.scratch.data_dir),
            ("/tracking/dir", &self.tracking.dir),
        ] {
            if !is_contained_relative(value) {
                problems.push(format!(
                    "{} '{}' must be a relative path inside the scratch root",
                    field, value
                ));
            }
        }
        if let Some(fallback) = &self.scratch.fallback_root {
            let durable = jobwrap_core::normalize_path(&self.durable.root);
            if !fallback.as_os_str().is_empty()
                && durable.starts_with(jobwrap_core::normalize_path(fallback))
            {
                problems.push(format!(
                    "/durable/root '{}' must not be inside /scratch/fallback_root '{}'",
                    self.durable.root.display(),
                    fallback.display()
                ));
            }
        }
        if self.scratch.root_env.trim().is_empty() {
            problems.push("/scratch/root_env must name an environment variable".to_string());
        }
        if self.tracking.api_key.is_some() {
            problems.push(
                "/tracking/api_key: literal credentials are not accepted; use api_key_env or api_key_file"
                    .to_string(),
            );
        }
        if self.tracking.sync_on_exit && self.tracking.sync_command.is_empty() {
            problems.push("/tracking/sync_command is required when sync_on_exit is set".to_string());
        }
        for key in self.project.extra_env.keys() {
            if key.is_empty() || key.contains('=') {
                problems.push(format!("/project/extra_env key '{}' is not a valid name", key));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn is_contained_relative(value: &str) -> bool {
    let p = Path::new(value);
    !value.trim().is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Parses scheduler memory syntax (`<n>[K|M|G|T]`, default MB) into MB.
pub fn parse_memory_mb(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let mb = match unit.to_ascii_uppercase().as_str() {
        "" | "M" | "MB" => n,
        "K" | "KB" => n / 1024,
        "G" | "GB" => n.checked_mul(1024)?,
        "T" | "TB" => n.checked_mul(1024 * 1024)?,
        _ => return None,
    };
    if mb == 0 {
        None
    } else {
        Some(mb)
    }
}

/// Parses `MM`, `MM:SS`, `HH:MM:SS`, `D-HH`, `D-HH:MM` and `D-HH:MM:SS` into seconds.
pub fn parse_wall_time(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let num = |s: &str| -> Option<u64> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
            None
        } else {
            s.parse().ok()
        }
    };
    let total = if let Some((days, rest)) = raw.split_once('-') {
        let days = num(days)?;
        let parts: Vec<&str> = rest.split(':').collect();
        let (h, m, s) = match parts.as_slice() {
            [h] => (num(h)?, 0, 0),
            [h, m] => (num(h)?, num(m)?, 0),
            [h, m, s] => (num(h)?, num(m)?, num(s)?),
            _ => return None,
        };
        days * 86_400 + h * 3600 + m * 60 + s
    } else {
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [m] => num(m)? * 60,
            [m, s] => num(m)? * 60 + num(s)?,
            [h, m, s] => num(h)? * 3600 + num(m)? * 60 + num(s)?,
            _ => return None,
        }
    };
    if total == 0 {
        None
    } else {
        Some(total)
    }
}

pub fn template() -> &'static str {
    "\
version: '1'
job:
  name: ''                            # optional scheduler job name
  account: ''                         # REQUIRED on most clusters
  gpus: 1
  cpus_per_task: 6
  mem: 32G
  time: '00:15:00'
  output: slurm-%A_%a.out
  error: slurm-%A_%a.err
  # array: 0-4
environment:
  modules: []                         # e.g. [python/3.8]
  venv: ~/ENV
  setup: []
project:
  workdir: ''                         # REQUIRED: directory containing main.py
  program: [python, main.py]
  subcommand: ''                      # REQUIRED: fixed subcommand passed to main.py
  extra_env: {}
tracking:
  mode: offline                       # offline | disabled (no key, no sync)
  api_key_env: WANDB_API_KEY
  dir: wandb
  sync_on_exit: false
scratch:
  root_env: SLURM_TMPDIR
  results_dir: results
  data_dir: data
durable:
  root: ''                            # REQUIRED: persistent results location
preserve:
  verify: checksum                    # none | count | checksum
exit_policy: relay                    # relay | always_success
shutdown_grace_seconds: 30
"
}
