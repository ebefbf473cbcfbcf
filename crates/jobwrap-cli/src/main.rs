use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use jobwrap_runner::batch;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobwrap", version, about = "Cluster job launch wrapper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare scratch, run the training program, preserve results.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        /// Forwarded verbatim to the training program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Show the resolved invocation without touching the filesystem.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Render the batch script for the configured resource request.
    Render {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Render the batch script and submit it with sbatch.
    Submit {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".jobwrap/job.sbatch")]
        out: PathBuf,
        #[arg(long = "sbatch-arg")]
        sbatch_args: Vec<String>,
        #[arg(long)]
        json: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Init {
        #[arg(long, default_value = jobwrap_runner::config::DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok((payload, code)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<(Option<Value>, i32)> {
    match command {
        Commands::Run { config, json, args } => {
            let (_, cfg, env) = jobwrap_runner::load_job_config(config.as_deref())?;
            let shutdown = jobwrap_runner::supervise::install_shutdown_handler()?;
            let outcome = jobwrap_runner::run_job(&cfg, &env, &args, &shutdown)?;
            if json {
                return Ok((
                    Some(json!({
                        "ok": true,
                        "command": "run",
                        "job": outcome_to_json(&outcome),
                    })),
                    outcome.exit_code,
                ));
            }
            println!("job_id: {}", outcome.job_id);
            println!("run_number: {}", outcome.run_number);
            println!("outcome: {}", outcome.child.as_str());
            println!("exit_code: {}", outcome.exit_code);
            if let Some(p) = &outcome.preserve {
                println!("preserve: {}", p.status());
            }
            println!("durable_dir: {}", outcome.durable_dir.display());
            Ok((None, outcome.exit_code))
        }
        Commands::Describe { config, json, args } => {
            let (path, cfg, env) = jobwrap_runner::load_job_config(config.as_deref())?;
            let summary = jobwrap_runner::describe_job(&cfg, &env, &args)?;
            if json {
                return Ok((
                    Some(json!({
                        "ok": true,
                        "command": "describe",
                        "config": path.display().to_string(),
                        "summary": summary_to_json(&summary),
                    })),
                    0,
                ));
            }
            println!("config: {}", path.display());
            print_summary(&summary);
            Ok((None, 0))
        }
        Commands::Render { config, out, json } => {
            let (path, cfg, _) = jobwrap_runner::load_job_config(config.as_deref())?;
            let script = render_for(&cfg, &path)?;
            if let Some(out) = &out {
                batch::write_batch_script(out, &script)?;
            }
            if json {
                return Ok((
                    Some(json!({
                        "ok": true,
                        "command": "render",
                        "script": script,
                        "out": out.as_ref().map(|p| p.display().to_string()),
                    })),
                    0,
                ));
            }
            match out {
                Some(out) => println!("wrote: {}", out.display()),
                None => print!("{}", script),
            }
            Ok((None, 0))
        }
        Commands::Submit {
            config,
            out,
            sbatch_args,
            json,
            args,
        } => {
            let (path, cfg, _) = jobwrap_runner::load_job_config(config.as_deref())?;
            let script = render_for(&cfg, &path)?;
            batch::write_batch_script(&out, &script)?;
            let job_id = batch::submit(&out, &sbatch_args, &args)?;
            if json {
                return Ok((
                    Some(json!({
                        "ok": true,
                        "command": "submit",
                        "job_id": job_id,
                        "script": out.display().to_string(),
                    })),
                    0,
                ));
            }
            println!("job_id: {}", job_id);
            println!("script: {}", out.display());
            Ok((None, 0))
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, jobwrap_runner::config::template())?;
            println!("wrote: {}", path.display());
            println!(
                "next: edit {} \u{2014} fill in all fields marked REQUIRED",
                path.display()
            );
            println!("next: jobwrap describe --config {}", path.display());
            Ok((None, 0))
        }
    }
}

/// The script refers to the config and this binary by absolute path so it
/// works from the scheduler's working directory.
fn render_for(cfg: &jobwrap_runner::LaunchConfig, config_path: &Path) -> Result<String> {
    let config_abs = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());
    let launcher = std::env::current_exe()?;
    Ok(batch::render_batch_script(&cfg.job, &config_abs, &launcher))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Render { json, .. }
        | Commands::Submit { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn outcome_to_json(outcome: &jobwrap_runner::JobOutcome) -> Value {
    json!({
        "job_id": outcome.job_id,
        "run_number": outcome.run_number,
        "command": outcome.command,
        "outcome": outcome.child.as_str(),
        "child_exit_code": outcome.child.exit_code(),
        "exit_code": outcome.exit_code,
        "durable_dir": outcome.durable_dir.display().to_string(),
        "preserve": outcome.preserve.as_ref().map(|p| json!({
            "status": p.status(),
            "files_copied": p.files_copied,
            "bytes_copied": p.bytes_copied,
            "failures": p.failures.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
            "mismatches": p.mismatches.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
        })),
    })
}

fn summary_to_json(summary: &jobwrap_runner::JobSummary) -> Value {
    json!({
        "job_id": summary.job_id,
        "run_number": summary.run_number,
        "scratch_root": summary.scratch.root.display().to_string(),
        "data_dir": summary.scratch.data.display().to_string(),
        "log_dir_root": summary.scratch.results.display().to_string(),
        "tracking_dir": summary.scratch.tracking.display().to_string(),
        "durable_dir": summary.durable_dir.display().to_string(),
        "argv": summary.argv,
        "training_argv": summary.training_argv,
        "cwd": summary.cwd.display().to_string(),
        "env": summary.env,
        "exit_policy": summary.exit_policy.as_str(),
        "verify": summary.verify.as_str(),
        "tracking_secret": summary.tracking_secret,
    })
}

fn print_summary(summary: &jobwrap_runner::JobSummary) {
    println!("job_id: {}", summary.job_id);
    println!("run_number: {}", summary.run_number);
    println!("scratch_root: {}", summary.scratch.root.display());
    println!("data_dir: {}", summary.scratch.data.display());
    println!("log_dir_root: {}", summary.scratch.results.display());
    println!("durable_dir: {}", summary.durable_dir.display());
    println!("cwd: {}", summary.cwd.display());
    println!("command: {:?}", summary.argv);
    for (k, v) in &summary.env {
        println!("env: {}={}", k, v);
    }
    println!("exit_policy: {}", summary.exit_policy.as_str());
    println!("verify: {}", summary.verify.as_str());
    println!("tracking_secret: {}", summary.tracking_secret);
}
