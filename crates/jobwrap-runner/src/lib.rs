pub mod batch;
pub mod config;
pub mod env;
pub mod invocation;
pub mod preserve;
pub mod scratch;
pub mod supervise;

use anyhow::{anyhow, Result};
use chrono::Utc;
use jobwrap_core::{atomic_write_json_pretty, canonical_json_digest};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{info, warn};

pub use config::{load_config, resolve_config_path, ConfigError, ExitPolicy, LaunchConfig};
pub use env::{EnvSnapshot, Secret};
pub use invocation::Invocation;
pub use preserve::{CleanupGuard, CleanupPlan, PreserveReport, VerifyMode};
pub use scratch::ScratchLayout;
pub use supervise::ChildOutcome;

pub const JOB_REPORT_FILE: &str = "job_report.json";

pub struct JobOutcome {
    pub job_id: String,
    pub run_number: u32,
    pub durable_dir: PathBuf,
    pub command: String,
    pub child: ChildOutcome,
    pub preserve: Option<PreserveReport>,
    pub exit_code: i32,
}

pub struct JobSummary {
    pub job_id: String,
    pub run_number: u32,
    pub scratch: ScratchLayout,
    pub durable_dir: PathBuf,
    pub argv: Vec<String>,
    pub training_argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub exit_policy: ExitPolicy,
    pub verify: VerifyMode,
    pub tracking_secret: bool,
}

pub fn durable_dir_for(cfg: &LaunchConfig, job_id: &str) -> PathBuf {
    if cfg.durable.job_subdir {
        cfg.durable.root.join(job_id)
    } else {
        cfg.durable.root.clone()
    }
}

pub fn exit_code_for(policy: ExitPolicy, child: &ChildOutcome) -> i32 {
    match policy {
        ExitPolicy::Relay => child.exit_code(),
        ExitPolicy::AlwaysSuccess => 0,
    }
}

/// Reads the snapshot and config the CLI works from.
pub fn load_job_config(explicit: Option<&Path>) -> Result<(PathBuf, LaunchConfig, EnvSnapshot)> {
    let env = EnvSnapshot::from_process();
    let path = resolve_config_path(explicit, &env);
    let cfg = load_config(&path, &env)?;
    Ok((path, cfg, env))
}

pub fn describe_job(cfg: &LaunchConfig, env: &EnvSnapshot, trailing: &[String]) -> Result<JobSummary> {
    let run_number = env::resolve_run_number(env, &cfg.scheduler)?;
    let job_id = env::resolve_job_id(env, &cfg.scheduler);
    let layout = ScratchLayout::resolve(cfg, env, &job_id);
    let secret = env::resolve_tracking_secret(&cfg.tracking, env)?;
    let invocation =
        invocation::build_invocation(cfg, &layout, run_number, trailing, env, secret.as_ref());
    let mut vars = invocation.env.clone();
    if let Some(key) = vars.get_mut(env::TRACKING_KEY_VAR) {
        *key = "<redacted>".to_string();
    }
    Ok(JobSummary {
        durable_dir: durable_dir_for(cfg, &job_id),
        job_id,
        run_number,
        scratch: layout,
        argv: invocation.argv,
        training_argv: invocation.training_argv,
        cwd: invocation.cwd,
        env: vars,
        exit_policy: cfg.exit_policy,
        verify: cfg.preserve.verify,
        tracking_secret: secret.is_some(),
    })
}

/// Runs one job end to end. Scratch results are copied out exactly once,
/// whether the training program succeeds, fails, is interrupted, or setup
/// returns early with an error.
pub fn run_job(
    cfg: &LaunchConfig,
    env: &EnvSnapshot,
    trailing: &[String],
    shutdown: &AtomicBool,
) -> Result<JobOutcome> {
    let started_at = Utc::now();
    let job_id = env::resolve_job_id(env, &cfg.scheduler);
    let layout = ScratchLayout::resolve(cfg, env, &job_id);
    let durable_dir = durable_dir_for(cfg, &job_id);

    let plan = CleanupPlan {
        scratch_root: layout.root.clone(),
        durable_dir: durable_dir.clone(),
        verify: cfg.preserve.verify,
        sync_command: sync_command(cfg, &layout),
    };
    let mut guard = CleanupGuard::arm(move || plan.execute());

    let run_number = env::resolve_run_number(env, &cfg.scheduler)?;
    info!(
        job_id = %job_id,
        run_number,
        scratch = %layout.root.display(),
        durable = %durable_dir.display(),
        "starting job"
    );
    layout.prepare()?;
    if let Some(source) = &cfg.scratch.stage_data_from {
        layout.stage_data(source)?;
    }
    check_entrypoint(cfg)?;
    let secret = env::resolve_tracking_secret(&cfg.tracking, env)?;
    let invocation =
        invocation::build_invocation(cfg, &layout, run_number, trailing, env, secret.as_ref());
    info!(command = %invocation.display(), cwd = %invocation.cwd.display(), "launching training program");

    let grace = Duration::from_secs(cfg.shutdown_grace_seconds);
    let child = supervise::run_foreground(&invocation, shutdown, grace);
    let preserve = guard.finish();
    let exit_code = exit_code_for(cfg.exit_policy, &child);
    if exit_code != child.exit_code() {
        warn!(
            child_exit_code = child.exit_code(),
            policy = cfg.exit_policy.as_str(),
            "reporting success despite training program status"
        );
    }

    let outcome = JobOutcome {
        job_id,
        run_number,
        durable_dir,
        command: invocation.display(),
        child,
        preserve,
        exit_code,
    };
    let report = job_report(cfg, &outcome, &invocation, started_at);
    let report_path = outcome.durable_dir.join(JOB_REPORT_FILE);
    if let Err(e) = atomic_write_json_pretty(&report_path, &report) {
        warn!(path = %report_path.display(), error = %e, "failed to write job report");
    }
    info!(
        outcome = outcome.child.as_str(),
        exit_code = outcome.exit_code,
        "job finished"
    );
    Ok(outcome)
}

fn sync_command(cfg: &LaunchConfig, layout: &ScratchLayout) -> Option<Vec<String>> {
    if !cfg.tracking.sync_on_exit || cfg.tracking.mode == config::TrackingMode::Disabled {
        return None;
    }
    let mut argv = cfg.tracking.sync_command.clone();
    argv.push(layout.tracking.to_string_lossy().to_string());
    Some(argv)
}

fn command_part_looks_like_path(part: &str) -> bool {
    part.starts_with('.')
        || part.starts_with('/')
        || part.contains('/')
        || part.ends_with(".py")
        || part.ends_with(".sh")
}

/// Fails early when the program or its script is a path that does not
/// exist relative to the project workdir.
fn check_entrypoint(cfg: &LaunchConfig) -> Result<()> {
    let workdir = &cfg.project.workdir;
    if !workdir.is_dir() {
        return Err(anyhow!(
            "project workdir not found: {} (update project.workdir)",
            workdir.display()
        ));
    }
    let program = &cfg.project.program;
    let candidate = program
        .iter()
        .take(2)
        .find(|p| command_part_looks_like_path(p));
    if let Some(part) = candidate {
        let resolved = jobwrap_core::normalize_path(&workdir.join(part));
        if !resolved.exists() {
            return Err(anyhow!(
                "training entrypoint not found: {} (update project.program)",
                resolved.display()
            ));
        }
    }
    Ok(())
}

fn job_report(
    cfg: &LaunchConfig,
    outcome: &JobOutcome,
    invocation: &Invocation,
    started_at: chrono::DateTime<Utc>,
) -> Value {
    let config_digest = serde_json::to_value(cfg)
        .map(|v| canonical_json_digest(&v))
        .unwrap_or_default();
    let preserve = outcome.preserve.as_ref().map(|p| {
        json!({
            "status": p.status(),
            "verify": p.verify.as_str(),
            "files_copied": p.files_copied,
            "bytes_copied": p.bytes_copied,
            "files_verified": p.files_verified,
            "failures": p.failures.len(),
            "mismatches": p.mismatches.len(),
        })
    });
    json!({
        "schema_version": "job_report_v1",
        "runner_version": env!("CARGO_PKG_VERSION"),
        "job_id": outcome.job_id,
        "run_number": outcome.run_number,
        "config_digest": config_digest,
        "argv": invocation.training_argv,
        "command": outcome.command,
        "cwd": invocation.cwd.to_string_lossy(),
        "outcome": outcome.child.as_str(),
        "child_exit_code": outcome.child.exit_code(),
        "exit_policy": cfg.exit_policy.as_str(),
        "tracking": cfg.tracking.mode.as_str(),
        "exit_code": outcome.exit_code,
        "preserve": preserve,
        "started_at": started_at.to_rfc3339(),
        "finished_at": Utc::now().to_rfc3339(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    const BASE: &str = "
version: '1'
job:
  gpus: 1
  cpus_per_task: 2
  mem: 4G
  time: '00:10:00'
project:
  workdir: /placeholder
  subcommand: rl
durable:
  root: /placeholder
";

    // argv0 is `launcher`, so "$1" is the subcommand and "$5" the log dir.
    const RECORDER: &str = r#"printf '%s\n' "$@" > "$JOBWRAP_TEST_OUT/argv.txt"
echo "$WANDB_MODE" > "$JOBWRAP_TEST_OUT/mode.txt"
echo done > "$5/metrics.txt"
exit "${JOBWRAP_TEST_EXIT:-0}""#;

    struct Fixture {
        root: PathBuf,
        cfg: LaunchConfig,
        env: EnvSnapshot,
    }

    impl Fixture {
        fn new(tag: &str, exit: i32) -> Self {
            let root = std::env::temp_dir().join(format!(
                "jobwrap_run_{}_{}_{}",
                tag,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            let workdir = root.join("repo");
            let out = root.join("observed");
            fs::create_dir_all(&workdir).expect("workdir");
            fs::create_dir_all(&out).expect("observed");
            let mut cfg =
                config::parse_config(BASE, Path::new("t.yaml"), &EnvSnapshot::default())
                    .expect("config");
            cfg.project.workdir = workdir;
            cfg.durable.root = root.join("durable");
            cfg.project.program = vec![
                "sh".to_string(),
                "-c".to_string(),
                RECORDER.to_string(),
                "launcher".to_string(),
            ];
            cfg.project
                .extra_env
                .insert("JOBWRAP_TEST_OUT".to_string(), out.to_string_lossy().to_string());
            cfg.project
                .extra_env
                .insert("JOBWRAP_TEST_EXIT".to_string(), exit.to_string());
            let env = EnvSnapshot::from_pairs([
                ("SLURM_TMPDIR", root.join("scratch").to_string_lossy().to_string()),
                ("SLURM_JOB_ID", "77".to_string()),
                ("PATH", std::env::var("PATH").unwrap_or_default()),
            ]);
            Self { root, cfg, env }
        }

        fn observed(&self, name: &str) -> String {
            fs::read_to_string(self.root.join("observed").join(name)).expect("observed file")
        }

        fn run(&self, trailing: &[&str]) -> Result<JobOutcome> {
            let trailing: Vec<String> = trailing.iter().map(|s| s.to_string()).collect();
            run_job(&self.cfg, &self.env, &trailing, &AtomicBool::new(false))
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn successful_job_forwards_args_and_preserves_results() {
        let fx = Fixture::new("ok", 0);
        let outcome = fx.run(&["--epochs", "5", "--seed", "1"]).expect("run");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.job_id, "77");
        assert_eq!(outcome.run_number, 0);

        let scratch = fx.root.join("scratch");
        let expected = format!(
            "rl\n--data_dir\n{}\n--log_dir_root\n{}\n--run_number\n0\n--epochs\n5\n--seed\n1\n",
            scratch.join("data").display(),
            scratch.join("results").display()
        );
        assert_eq!(fx.observed("argv.txt"), expected);
        assert_eq!(fx.observed("mode.txt"), "offline\n");

        let durable = fx.root.join("durable").join("77");
        assert_eq!(
            fs::read_to_string(durable.join("results").join("metrics.txt")).expect("metrics"),
            "done\n"
        );
        let preserve = outcome.preserve.expect("preserve report");
        assert!(preserve.is_clean(), "{:?}", preserve);

        let report: Value = serde_json::from_slice(
            &fs::read(durable.join(JOB_REPORT_FILE)).expect("job report"),
        )
        .expect("json");
        assert_eq!(report["outcome"], "succeeded");
        assert_eq!(report["tracking"], "offline");
        assert_eq!(report["preserve"]["status"], "complete");
        assert!(durable.join(preserve::PRESERVE_REPORT_FILE).is_file());
    }

    #[test]
    fn array_index_becomes_run_number() {
        let mut fx = Fixture::new("array", 0);
        fx.env = EnvSnapshot::from_pairs([
            ("SLURM_TMPDIR", fx.root.join("scratch").to_string_lossy().to_string()),
            ("SLURM_ARRAY_JOB_ID", "500".to_string()),
            ("SLURM_ARRAY_TASK_ID", "4".to_string()),
        ]);
        let outcome = fx.run(&[]).expect("run");
        assert_eq!(outcome.run_number, 4);
        assert_eq!(outcome.job_id, "500_4");
        assert!(fx.observed("argv.txt").ends_with("--run_number\n4\n"));
        assert!(fx.root.join("durable").join("500_4").join("results").is_dir());
    }

    #[test]
    fn failing_child_status_is_relayed_after_cleanup() {
        let fx = Fixture::new("fail", 5);
        let outcome = fx.run(&[]).expect("run");
        assert_eq!(outcome.child, ChildOutcome::Exited(5));
        assert_eq!(outcome.exit_code, 5);
        assert!(fx
            .root
            .join("durable")
            .join("77")
            .join("results")
            .join("metrics.txt")
            .is_file());
    }

    #[test]
    fn always_success_policy_masks_child_failure() {
        let mut fx = Fixture::new("mask", 5);
        fx.cfg.exit_policy = ExitPolicy::AlwaysSuccess;
        let outcome = fx.run(&[]).expect("run");
        assert_eq!(outcome.child.exit_code(), 5);
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn setup_failure_still_runs_cleanup() {
        let mut fx = Fixture::new("setup", 0);
        fx.cfg.project.workdir = fx.root.join("missing_repo");
        let err = fx.run(&[]).err().expect("setup should fail");
        assert!(err.to_string().contains("project workdir not found"), "{}", err);
        let durable = fx.root.join("durable").join("77");
        assert!(durable.join(preserve::PRESERVE_REPORT_FILE).is_file());
        assert!(!durable.join(JOB_REPORT_FILE).exists());
    }

    #[test]
    fn bad_array_index_fails_after_cleanup_is_armed() {
        let mut fx = Fixture::new("badindex", 0);
        fx.env = EnvSnapshot::from_pairs([
            ("SLURM_TMPDIR", fx.root.join("scratch").to_string_lossy().to_string()),
            ("SLURM_JOB_ID", "77".to_string()),
            ("SLURM_ARRAY_TASK_ID", "three".to_string()),
        ]);
        let err = fx.run(&[]).err().expect("bad index");
        assert!(err.to_string().contains("SLURM_ARRAY_TASK_ID"), "{}", err);
        assert!(fx
            .root
            .join("durable")
            .join("77")
            .join(preserve::PRESERVE_REPORT_FILE)
            .is_file());
    }

    #[test]
    fn disabled_tracking_skips_sync_and_key() {
        let mut fx = Fixture::new("notrack", 0);
        fx.cfg.tracking.mode = config::TrackingMode::Disabled;
        fx.cfg.tracking.sync_on_exit = true;
        fx.cfg.tracking.sync_command = vec!["wandb".to_string(), "sync".to_string()];
        let layout = ScratchLayout::resolve(&fx.cfg, &fx.env, "77");
        assert!(sync_command(&fx.cfg, &layout).is_none());

        fx.cfg.tracking.mode = config::TrackingMode::Offline;
        let argv = sync_command(&fx.cfg, &layout).expect("sync argv");
        assert_eq!(argv.last(), Some(&layout.tracking.to_string_lossy().to_string()));

        fx.cfg.tracking.mode = config::TrackingMode::Disabled;
        fx.cfg.tracking.sync_on_exit = false;
        fx.env = EnvSnapshot::from_pairs([
            ("SLURM_TMPDIR", fx.root.join("scratch").to_string_lossy().to_string()),
            ("SLURM_JOB_ID", "77".to_string()),
            ("WANDB_API_KEY", "very-secret".to_string()),
        ]);
        let summary = describe_job(&fx.cfg, &fx.env, &[]).expect("describe");
        assert!(!summary.tracking_secret);
        assert_eq!(
            summary.env.get(env::TRACKING_MODE_VAR).map(String::as_str),
            Some("offline")
        );
        assert!(!summary.env.contains_key(env::TRACKING_KEY_VAR));
    }

    #[test]
    fn interrupted_job_preserves_results() {
        let fx = Fixture::new("interrupt", 0);
        let outcome = run_job(&fx.cfg, &fx.env, &[], &AtomicBool::new(true)).expect("run");
        assert_eq!(outcome.child, ChildOutcome::Interrupted { code: None });
        assert_eq!(outcome.exit_code, 143);
        assert!(outcome.preserve.is_some());
        assert!(fx.root.join("durable").join("77").join("results").is_dir());
    }

    #[test]
    fn missing_entrypoint_script_is_reported() {
        let mut fx = Fixture::new("entry", 0);
        fx.cfg.project.program = vec!["python".to_string(), "main.py".to_string()];
        let err = fx.run(&[]).err().expect("missing main.py");
        assert!(format!("{:#}", err).contains("training entrypoint not found"), "{:#}", err);
    }

    #[test]
    fn describe_redacts_secret_and_has_no_side_effects() {
        let mut fx = Fixture::new("describe", 0);
        fx.env = EnvSnapshot::from_pairs([
            ("SLURM_TMPDIR", fx.root.join("scratch").to_string_lossy().to_string()),
            ("WANDB_API_KEY", "very-secret".to_string()),
        ]);
        let summary = describe_job(&fx.cfg, &fx.env, &["--seed".to_string()]).expect("describe");
        assert!(summary.tracking_secret);
        assert_eq!(
            summary.env.get(env::TRACKING_KEY_VAR).map(String::as_str),
            Some("<redacted>")
        );
        assert_eq!(summary.training_argv.last().map(String::as_str), Some("--seed"));
        assert!(!fx.root.join("scratch").exists());
    }
}
