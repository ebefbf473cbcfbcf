use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
#[cfg(unix)]
use std::process::Stdio;
#[cfg(unix)]
use std::thread;
#[cfg(unix)]
use std::time::{Duration, Instant};

fn temp_root(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let root = std::env::temp_dir().join(format!(
        "jobwrap_cli_{}_{}_{}",
        tag,
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&root).expect("temp root");
    root
}

fn jobwrap_command(root: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_jobwrap"));
    cmd.args(args)
        .current_dir(root)
        .env_remove("SLURM_ARRAY_TASK_ID")
        .env_remove("SLURM_ARRAY_JOB_ID")
        .env_remove("JOBWRAP_CONFIG")
        .env_remove("JOBWRAP_DURABLE_ROOT")
        .env_remove("JOBWRAP_WORKDIR")
        .env_remove("WANDB_API_KEY")
        .env("SLURM_JOB_ID", "314")
        .env("SLURM_TMPDIR", root.join("scratch"))
        .env("RUST_LOG", "warn");
    cmd
}

fn jobwrap(root: &Path, args: &[&str]) -> Output {
    jobwrap_command(root, args).output().expect("run jobwrap")
}

#[cfg(unix)]
fn wait_for(limit: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    ready()
}

fn write_config(root: &Path, program: &str) -> PathBuf {
    fs::create_dir_all(root.join("repo")).expect("repo");
    let path = root.join("jobwrap.yaml");
    let yaml = format!(
        "version: '1'
job:
  account: def-lab
  gpus: 1
  cpus_per_task: 6
  mem: 32G
  time: '00:15:00'
project:
  workdir: {repo}
  program: {program}
  subcommand: rl
durable:
  root: {durable}
",
        repo = root.join("repo").display(),
        durable = root.join("durable").display(),
        program = program,
    );
    fs::write(&path, yaml).expect("config");
    path
}

fn stdout_json(out: &Output) -> Value {
    serde_json::from_slice(&out.stdout).expect("json stdout")
}

#[test]
fn init_writes_template_and_refuses_to_overwrite() {
    let root = temp_root("init");
    let first = jobwrap(&root, &["init"]);
    assert!(first.status.success());
    assert!(root.join("jobwrap.yaml").is_file());
    let second = jobwrap(&root, &["init"]);
    assert!(!second.status.success());
    let forced = jobwrap(&root, &["init", "--force"]);
    assert!(forced.status.success());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn describe_reports_offline_tracking_and_run_number() {
    let root = temp_root("describe");
    let config = write_config(&root, "[python, main.py]");
    let out = jobwrap(
        &root,
        &["describe", "--json", "--config", config.to_str().unwrap(), "--", "--epochs", "5"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let v = stdout_json(&out);
    assert_eq!(v["ok"], true);
    assert_eq!(v["summary"]["run_number"], 0);
    assert_eq!(v["summary"]["env"]["WANDB_MODE"], "offline");
    assert_eq!(v["summary"]["training_argv"][2], "rl");
    assert_eq!(v["summary"]["training_argv"][9], "--epochs");
    assert!(!root.join("scratch").exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn render_emits_resource_directives() {
    let root = temp_root("render");
    let config = write_config(&root, "[python, main.py]");
    let out = jobwrap(&root, &["render", "--config", config.to_str().unwrap()]);
    assert!(out.status.success());
    let script = String::from_utf8_lossy(&out.stdout);
    for line in [
        "#SBATCH --account=def-lab",
        "#SBATCH --gres=gpu:1",
        "#SBATCH --cpus-per-task=6",
        "#SBATCH --mem=32G",
        "#SBATCH --time=00:15:00",
    ] {
        assert!(script.contains(line), "missing {}: {}", line, script);
    }
    assert!(script.contains(" run --config "), "{}", script);
    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn run_relays_child_exit_status_after_preserving() {
    let root = temp_root("run");
    let config = write_config(
        &root,
        "['sh', '-c', 'echo partial > \"$5/log.txt\"; exit 4', 'launcher']",
    );
    let out = jobwrap(&root, &["run", "--json", "--config", config.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(4), "{}", String::from_utf8_lossy(&out.stderr));
    let v = stdout_json(&out);
    assert_eq!(v["job"]["outcome"], "failed");
    assert_eq!(v["job"]["exit_code"], 4);
    assert_eq!(v["job"]["preserve"]["status"], "complete");
    assert_eq!(
        fs::read_to_string(root.join("durable").join("314").join("results").join("log.txt"))
            .expect("preserved log"),
        "partial\n"
    );
    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn sigterm_to_wrapper_stops_training_tree_and_preserves() {
    let root = temp_root("sigterm");
    let config = write_config(
        &root,
        "['sh', '-c', 'echo x > \"$5/a.txt\"; (sleep 2; echo late > \"$5/late.txt\") & sleep 30', 'launcher']",
    );
    let mut child = jobwrap_command(&root, &["run", "--config", config.to_str().unwrap()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn jobwrap");
    let scratch_results = root.join("scratch").join("results");
    assert!(
        wait_for(Duration::from_secs(10), || scratch_results.join("a.txt").is_file()),
        "training program never started"
    );

    let signalled = Instant::now();
    let pid = libc::pid_t::try_from(child.id()).expect("pid");
    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);
    let mut status = None;
    assert!(
        wait_for(Duration::from_secs(15), || {
            status = child.try_wait().expect("poll jobwrap");
            status.is_some()
        }),
        "wrapper did not exit after SIGTERM"
    );
    assert_eq!(status.and_then(|s| s.code()), Some(143));
    assert!(signalled.elapsed() < Duration::from_secs(10));

    let durable_results = root.join("durable").join("314").join("results");
    assert_eq!(
        fs::read_to_string(durable_results.join("a.txt")).expect("preserved"),
        "x\n"
    );
    thread::sleep(Duration::from_millis(2500));
    assert!(!scratch_results.join("late.txt").exists());
    assert!(!durable_results.join("late.txt").exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn invalid_config_fails_with_json_error() {
    let root = temp_root("invalid");
    let config = root.join("bad.yaml");
    fs::write(&config, "version: '1'\njob: {}\n").expect("bad config");
    let out = jobwrap(&root, &["describe", "--json", "--config", config.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let v = stdout_json(&out);
    assert_eq!(v["ok"], false);
    assert_eq!(v["error"]["code"], "command_failed");
    let _ = fs::remove_dir_all(root);
}
