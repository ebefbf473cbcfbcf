use crate::config::{EnvironmentConfig, SchedulerEnv, TrackingConfig, TrackingMode};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Process environment captured once at startup. Empty values count as unset.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().to_string(),
                    v.to_string_lossy().to_string(),
                )
            })
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }
}

/// Job-array index, or 0 when the job is not part of an array.
pub fn resolve_run_number(env: &EnvSnapshot, scheduler: &SchedulerEnv) -> Result<u32> {
    match env.get(&scheduler.array_index_env) {
        None => Ok(0),
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
            anyhow!(
                "{} must be a non-negative integer, got '{}'",
                scheduler.array_index_env,
                raw
            )
        }),
    }
}

pub fn resolve_job_id(env: &EnvSnapshot, scheduler: &SchedulerEnv) -> String {
    if let (Some(array_job), Some(task)) = (
        env.get(&scheduler.array_job_id_env),
        env.get(&scheduler.array_index_env),
    ) {
        return format!("{}_{}", array_job, task);
    }
    if let Some(job) = env.get(&scheduler.job_id_env) {
        return job.to_string();
    }
    format!("local_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Tracking-service credential. Never printed.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Reads the API key from a mounted secret file or a named variable.
/// The file wins when both are configured. Disabled tracking never reads one.
pub fn resolve_tracking_secret(
    tracking: &TrackingConfig,
    env: &EnvSnapshot,
) -> Result<Option<Secret>> {
    if tracking.mode == TrackingMode::Disabled {
        return Ok(None);
    }
    if let Some(path) = &tracking.api_key_file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read tracking secret file {}", path.display()))?;
        let key = raw.trim();
        if key.is_empty() {
            return Err(anyhow!(
                "tracking secret file {} is empty",
                path.display()
            ));
        }
        debug!(source = %path.display(), "tracking secret loaded from file");
        return Ok(Some(Secret(key.to_string())));
    }
    if let Some(var) = &tracking.api_key_env {
        if let Some(key) = env.get(var) {
            debug!(source = %var, "tracking secret loaded from environment");
            return Ok(Some(Secret(key.trim().to_string())));
        }
        warn!(
            var = %var,
            "tracking API key not set; offline runs will still be recorded locally"
        );
    }
    Ok(None)
}

pub const TRACKING_MODE_VAR: &str = "WANDB_MODE";
pub const TRACKING_DIR_VAR: &str = "WANDB_DIR";
pub const TRACKING_KEY_VAR: &str = "WANDB_API_KEY";
/// The only mode the child is ever given. `disabled` withholds the key instead.
pub const TRACKING_MODE: &str = "offline";

pub fn tracking_env(
    tracking: &TrackingConfig,
    tracking_dir: &Path,
    secret: Option<&Secret>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(TRACKING_MODE_VAR.to_string(), TRACKING_MODE.to_string());
    out.insert(
        TRACKING_DIR_VAR.to_string(),
        tracking_dir.to_string_lossy().to_string(),
    );
    if let Some(secret) = secret.filter(|_| tracking.mode == TrackingMode::Offline) {
        out.insert(TRACKING_KEY_VAR.to_string(), secret.expose().to_string());
    }
    out
}

/// Variables to set and unset so the child sees an activated virtualenv.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

pub fn activation_env(environment: &EnvironmentConfig, env: &EnvSnapshot) -> Activation {
    let Some(venv) = &environment.venv else {
        return Activation::default();
    };
    let bin = venv.join("bin");
    let path = match env.get("PATH") {
        Some(existing) => format!("{}:{}", bin.display(), existing),
        None => bin.display().to_string(),
    };
    let mut set = BTreeMap::new();
    set.insert("VIRTUAL_ENV".to_string(), venv.to_string_lossy().to_string());
    set.insert("PATH".to_string(), path);
    Activation {
        set,
        remove: vec!["PYTHONHOME".to_string()],
    }
}
