use crate::invocation::Invocation;
use anyhow::{Context, Result};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    Exited(i32),
    Signaled(i32),
    /// A shutdown request arrived while the child ran. `code` is the
    /// child's own exit code when it exited instead of being killed.
    Interrupted { code: Option<i32> },
    SpawnFailed(String),
}

impl ChildOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildOutcome::Exited(code) => *code,
            ChildOutcome::Signaled(sig) => 128 + sig,
            ChildOutcome::Interrupted { code } => code.unwrap_or(143),
            ChildOutcome::SpawnFailed(_) => 127,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, ChildOutcome::Exited(0))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChildOutcome::Exited(0) => "succeeded",
            ChildOutcome::Exited(_) => "failed",
            ChildOutcome::Signaled(_) => "signaled",
            ChildOutcome::Interrupted { .. } => "interrupted",
            ChildOutcome::SpawnFailed(_) => "spawn_failed",
        }
    }
}

/// Registers SIGINT/SIGTERM/SIGHUP handling. The handler only sets the flag.
pub fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;
    Ok(flag)
}

/// Runs the child in the foreground with inherited stdio and blocks until
/// it exits. The child leads its own process group. On a shutdown request
/// the group is sent SIGTERM and gets `grace` to exit before it is killed.
/// Processes left in the group after the child exits are killed too, so
/// nothing keeps writing into scratch once results are copied out.
pub fn run_foreground(
    invocation: &Invocation,
    shutdown: &AtomicBool,
    grace: Duration,
) -> ChildOutcome {
    let mut cmd = invocation.to_command();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    if shutdown.load(Ordering::SeqCst) {
        warn!("shutdown requested before launch; not starting training program");
        return ChildOutcome::Interrupted { code: None };
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(program = %invocation.argv[0], error = %e, "failed to start training program");
            return ChildOutcome::SpawnFailed(e.to_string());
        }
    };
    let pid = child.id();
    info!(pid, "training program started");

    let mut deadline: Option<Instant> = None;
    let outcome = loop {
        match child.try_wait() {
            Ok(Some(status)) => break classify(status, deadline.is_some()),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "failed to poll training program");
                kill_tree(&mut child);
                break match child.wait() {
                    Ok(status) => classify(status, deadline.is_some()),
                    Err(_) => ChildOutcome::Interrupted { code: None },
                };
            }
        }

        if deadline.is_none() && shutdown.load(Ordering::SeqCst) {
            warn!(
                grace_seconds = grace.as_secs(),
                "shutdown requested; terminating training program"
            );
            terminate_tree(&child);
            deadline = Some(Instant::now() + grace);
        }
        if let Some(limit) = deadline {
            if Instant::now() >= limit {
                warn!("grace period elapsed; killing training program");
                kill_tree(&mut child);
                let status = child.wait();
                break ChildOutcome::Interrupted {
                    code: status.ok().and_then(|s| s.code()),
                };
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    reap_leftovers(pid);
    info!(
        outcome = outcome.as_str(),
        exit_code = outcome.exit_code(),
        "training program finished"
    );
    outcome
}

/// Sends `signal` to the process group led by `pid`. Returns whether any
/// process received it.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-pgid, signal) } == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        warn!(pgid, signal, error = %err, "failed to signal training process group");
    }
    false
}

#[cfg(unix)]
fn terminate_tree(child: &Child) {
    signal_group(child.id(), libc::SIGTERM);
}

#[cfg(not(unix))]
fn terminate_tree(_child: &Child) {}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    signal_group(child.id(), libc::SIGKILL);
    let _ = child.kill();
}

#[cfg(unix)]
fn reap_leftovers(pid: u32) {
    if signal_group(pid, libc::SIGKILL) {
        warn!(pgid = pid, "killed processes left behind by the training program");
    }
}

#[cfg(not(unix))]
fn reap_leftovers(_pid: u32) {}

fn classify(status: ExitStatus, interrupted: bool) -> ChildOutcome {
    if interrupted {
        return ChildOutcome::Interrupted {
            code: status.code(),
        };
    }
    if let Some(code) = status.code() {
        return ChildOutcome::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ChildOutcome::Signaled(sig);
        }
    }
    ChildOutcome::Exited(1)
}
