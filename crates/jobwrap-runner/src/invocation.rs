use crate::config::LaunchConfig;
use crate::env::{activation_env, tracking_env, EnvSnapshot, Secret};
use crate::scratch::ScratchLayout;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

/// The single external-process call a job makes. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// `program subcommand --data_dir .. --log_dir_root .. --run_number .. trailing..`
    pub training_argv: Vec<String>,
    /// What is actually executed; differs from `training_argv` when a shell
    /// has to load modules first.
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub env_remove: Vec<String>,
}

impl Invocation {
    pub fn display(&self) -> String {
        shell_join(&self.argv)
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.current_dir(&self.cwd);
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.env);
        cmd
    }
}

pub fn training_argv(
    cfg: &LaunchConfig,
    layout: &ScratchLayout,
    run_number: u32,
    trailing: &[String],
) -> Vec<String> {
    let mut argv = cfg.project.program.clone();
    argv.push(cfg.project.subcommand.clone());
    argv.push("--data_dir".to_string());
    argv.push(layout.data.to_string_lossy().to_string());
    argv.push("--log_dir_root".to_string());
    argv.push(layout.results.to_string_lossy().to_string());
    argv.push("--run_number".to_string());
    argv.push(run_number.to_string());
    argv.extend(trailing.iter().cloned());
    argv
}

pub fn build_invocation(
    cfg: &LaunchConfig,
    layout: &ScratchLayout,
    run_number: u32,
    trailing: &[String],
    env: &EnvSnapshot,
    secret: Option<&Secret>,
) -> Invocation {
    let training = training_argv(cfg, layout, run_number, trailing);
    let activation = activation_env(&cfg.environment, env);

    // tracking vars go last so extra_env cannot switch the tracker online
    let mut vars = activation.set;
    vars.extend(
        cfg.project
            .extra_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    vars.extend(tracking_env(&cfg.tracking, &layout.tracking, secret));

    let argv = if cfg.environment.needs_shell() {
        vec![
            "sh".to_string(),
            "-lc".to_string(),
            shell_script(cfg, &training),
        ]
    } else {
        training.clone()
    };

    Invocation {
        training_argv: training,
        argv,
        cwd: cfg.project.workdir.clone(),
        env: vars,
        env_remove: activation.remove,
    }
}

fn shell_script(cfg: &LaunchConfig, training: &[String]) -> String {
    let mut parts = Vec::new();
    if !cfg.environment.modules.is_empty() {
        parts.push(format!("module load {}", shell_join(&cfg.environment.modules)));
    }
    parts.extend(cfg.environment.setup.iter().cloned());
    // login shells may rebuild PATH, so activate again after the modules
    if let Some(venv) = &cfg.environment.venv {
        let activate = venv.join("bin").join("activate");
        parts.push(format!(". {}", shell_quote(&activate.to_string_lossy())));
    }
    parts.push(format!("exec {}", shell_join(training)));
    parts.join(" && ")
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=%@+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
