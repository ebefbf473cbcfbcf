use crate::config::JobResources;
use crate::invocation::shell_quote;
use anyhow::{anyhow, Context, Result};
use jobwrap_core::atomic_write_bytes;
use std::path::Path;
use std::process::Command;
use tracing::info;

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub fn sbatch_directives(job: &JobResources) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(name) = non_empty(&job.name) {
        lines.push(format!("--job-name={}", name));
    }
    if let Some(account) = non_empty(&job.account) {
        lines.push(format!("--account={}", account));
    }
    if let Some(partition) = non_empty(&job.partition) {
        lines.push(format!("--partition={}", partition));
    }
    if job.gpus > 0 {
        lines.push(format!("--gres=gpu:{}", job.gpus));
    }
    lines.push(format!("--cpus-per-task={}", job.cpus_per_task));
    lines.push(format!("--mem={}", job.mem.trim()));
    lines.push(format!("--time={}", job.time.trim()));
    if let Some(output) = non_empty(&job.output) {
        lines.push(format!("--output={}", output));
    }
    if let Some(error) = non_empty(&job.error) {
        lines.push(format!("--error={}", error));
    }
    if let Some(array) = non_empty(&job.array) {
        lines.push(format!("--array={}", array));
    }
    lines.extend(
        job.extra_directives
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
    );
    lines
}

/// Batch script whose body hands control to `launcher run`, forwarding the
/// script's own arguments as trailing training flags.
pub fn render_batch_script(job: &JobResources, config_path: &Path, launcher: &Path) -> String {
    let mut out = String::from("#!/bin/bash\n");
    for directive in sbatch_directives(job) {
        out.push_str("#SBATCH ");
        out.push_str(&directive);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&format!(
        "exec {} run --config {} -- \"$@\"\n",
        shell_quote(&launcher.to_string_lossy()),
        shell_quote(&config_path.to_string_lossy())
    ));
    out
}

pub fn write_batch_script(path: &Path, contents: &str) -> Result<()> {
    atomic_write_bytes(path, contents.as_bytes())
        .with_context(|| format!("failed to write batch script {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// `--parsable` prints `jobid[;cluster]`.
pub fn parse_sbatch_job_id(stdout: &str) -> Result<String> {
    let raw = stdout.trim();
    let id = raw.split(';').next().unwrap_or(raw).trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return Err(anyhow!("unexpected sbatch output: '{}'", raw));
    }
    Ok(id.to_string())
}

pub fn submit(script: &Path, sbatch_args: &[String], script_args: &[String]) -> Result<String> {
    let mut cmd = Command::new("sbatch");
    cmd.arg("--parsable");
    cmd.args(sbatch_args);
    cmd.arg(script);
    cmd.args(script_args);
    let out = cmd.output().context("running sbatch")?;
    if !out.status.success() {
        return Err(anyhow!(
            "sbatch failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    let job_id = parse_sbatch_job_id(&String::from_utf8_lossy(&out.stdout))?;
    info!(job_id = %job_id, script = %script.display(), "batch job submitted");
    Ok(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobResources {
        JobResources {
            name: Some("sequoia-rl".to_string()),
            account: Some("def-lab".to_string()),
            partition: Some("".to_string()),
            gpus: 1,
            cpus_per_task: 6,
            mem: "32G".to_string(),
            time: "00:15:00".to_string(),
            output: Some("slurm-%A_%a.out".to_string()),
            error: Some("slurm-%A_%a.err".to_string()),
            array: Some("0-4".to_string()),
            extra_directives: vec!["--mail-type=FAIL".to_string(), " ".to_string()],
        }
    }

    #[test]
    fn directives_cover_every_resource() {
        assert_eq!(
            sbatch_directives(&job()),
            vec![
                "--job-name=sequoia-rl",
                "--account=def-lab",
                "--gres=gpu:1",
                "--cpus-per-task=6",
                "--mem=32G",
                "--time=00:15:00",
                "--output=slurm-%A_%a.out",
                "--error=slurm-%A_%a.err",
                "--array=0-4",
                "--mail-type=FAIL",
            ]
        );
    }

    #[test]
    fn zero_gpus_omits_gres() {
        let mut j = job();
        j.gpus = 0;
        assert!(!sbatch_directives(&j).iter().any(|d| d.starts_with("--gres")));
    }

    #[test]
    fn script_execs_launcher_with_forwarded_args() {
        let script = render_batch_script(
            &job(),
            Path::new("/home/u/my jobs/jobwrap.yaml"),
            Path::new("/opt/bin/jobwrap"),
        );
        assert!(script.starts_with("#!/bin/bash\n#SBATCH --job-name=sequoia-rl\n"));
        assert!(script.contains("#SBATCH --mem=32G\n"));
        assert!(script.ends_with(
            "\nexec /opt/bin/jobwrap run --config '/home/u/my jobs/jobwrap.yaml' -- \"$@\"\n"
        ));
    }

    #[test]
    fn sbatch_job_id_parsing() {
        assert_eq!(parse_sbatch_job_id("12345\n").unwrap(), "12345");
        assert_eq!(parse_sbatch_job_id("12345;cedar\n").unwrap(), "12345");
        assert!(parse_sbatch_job_id("").is_err());
        assert!(parse_sbatch_job_id("Submitted batch job 1").is_err());
    }
}
