//! Platform-agnostic process control functions.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::oneshot::{self, error::TryRecvError};

use super::inspect::ProcessInspector;
use crate::error::{AppError, Result};

fn refuse_self(pid: u32) -> Result<()> {
    if pid == std::process::id() || pid == 0 {
        return Err(AppError::process(format!("Refusing to signal pid {pid}")));
    }
    Ok(())
}

/// Configure a command to run detached in its own process group.
pub(super) fn detach(cmd: &mut Command) {
    cmd.stdin(std::process::Stdio::null()).kill_on_drop(false);

    #[cfg(target_os = "windows")]
    {
        use windows::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};
        cmd.creation_flags(CREATE_NO_WINDOW.0 | CREATE_NEW_PROCESS_GROUP.0);
    }

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
}

/// Reap the child in the background so its exit is observed and no zombie is left.
/// The receiver resolves with the exit code once the child has exited.
pub(super) fn spawn_reaper(mut child: Child, label: String) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                log::warn!("Failed to wait for {}: {}", label, e);
                None
            }
        };
        log::info!("{} exited (code: {:?})", label, code);
        let _ = tx.send(code);
    });
    rx
}

#[cfg(target_os = "windows")]
fn run_taskkill(pid: u32, args: &[&str]) -> Result<()> {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .args(args)
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            stdout.trim()
        } else {
            detail
        };
        Err(AppError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            if detail.is_empty() {
                "(no output)"
            } else {
                detail
            }
        )))
    }
}

/// Ask a process to exit (WM_CLOSE via taskkill without /F).
#[cfg(target_os = "windows")]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    refuse_self(pid)?;
    run_taskkill(pid, &[])
}

/// Send a graceful shutdown signal to a process.
#[cfg(not(target_os = "windows"))]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};

    refuse_self(pid)?;
    kill(to_nix_pid(pid)?, Signal::SIGTERM)
        .map_err(|e| AppError::process(format!("Failed to send SIGTERM to PID {}: {}", pid, e)))
}

#[cfg(not(target_os = "windows"))]
fn to_nix_pid(pid: u32) -> Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .map(nix::unistd::Pid::from_raw)
        .map_err(|_| AppError::process(format!("Invalid pid {pid}")))
}

/// Force kill a single process.
#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    refuse_self(pid)?;
    run_taskkill(pid, &["/F"])
}

/// Force kill a single process. A process that is already gone is not an error.
#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    refuse_self(pid)?;
    match kill(to_nix_pid(pid)?, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!("Failed to kill process {}: {}", pid, e))),
    }
}

/// Force kill a process together with its process group (or tree on Windows).
#[cfg(target_os = "windows")]
fn force_kill_group(pid: u32) -> Result<()> {
    refuse_self(pid)?;
    run_taskkill(pid, &["/T", "/F"])
}

/// Force kill a process together with its process group.
///
/// Falls back to a plain kill when the target shares our own process group.
#[cfg(not(target_os = "windows"))]
fn force_kill_group(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::getpgid;

    refuse_self(pid)?;
    let target = to_nix_pid(pid)?;
    match (getpgid(Some(target)), getpgid(None)) {
        (Ok(pgid), Ok(own)) if pgid != own => match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(AppError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))),
        },
        _ => force_kill(pid),
    }
}

/// Kill every descendant of `pid`, deepest first, leaving `pid` itself alive.
pub(super) fn kill_descendants(inspector: &dyn ProcessInspector, pid: u32) {
    for child in inspector.descendants(pid) {
        if let Err(e) = force_kill(child) {
            log::warn!("Failed to kill child {} of {}: {}", child, pid, e);
        }
    }
}

/// Kill all descendants of `pid`, then `pid` and its process group.
pub fn kill_tree(inspector: &dyn ProcessInspector, pid: u32) -> Result<()> {
    kill_descendants(inspector, pid);
    if inspector.is_alive(pid) {
        force_kill_group(pid)?;
    }
    Ok(())
}

/// Poll until `pid` has exited or `timeout` elapses. Returns `true` once it is gone.
pub(super) async fn wait_for_exit(
    inspector: &dyn ProcessInspector,
    pid: u32,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !inspector.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Outcome of polling a freshly spawned process for readiness.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Readiness {
    Ready,
    /// The process died with a failure code or a signal before becoming ready.
    Exited(Option<i32>),
    TimedOut,
}

/// Poll `probe` every `interval` until it succeeds, the process fails, or `timeout` elapses.
///
/// A clean exit (code 0) is a launcher handing off to the real process, so polling
/// continues until the deadline.
pub(super) async fn wait_until_ready<F, Fut>(
    exit: &mut oneshot::Receiver<Option<i32>>,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Readiness
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let mut handed_off = false;
    loop {
        if probe().await {
            return Readiness::Ready;
        }
        if !handed_off {
            match exit.try_recv() {
                Ok(Some(0)) => {
                    log::debug!("Launcher exited cleanly, waiting for the handed-off process");
                    handed_off = true;
                }
                Ok(code) => return Readiness::Exited(code),
                Err(TryRecvError::Closed) => return Readiness::Exited(None),
                Err(TryRecvError::Empty) => {}
            }
        }
        if Instant::now() >= deadline {
            return Readiness::TimedOut;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Kill a whole process group by id. The group may outlive its leader.
#[cfg(not(target_os = "windows"))]
fn kill_group(pgid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::getpgid;

    refuse_self(pgid)?;
    let target = to_nix_pid(pgid)?;
    if getpgid(None).is_ok_and(|own| own == target) {
        return Err(AppError::process(format!("Refusing to kill own process group {pgid}")));
    }
    match killpg(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!("Failed to kill process group {}: {}", pgid, e))),
    }
}

/// Windows has no process groups that outlive their leader; the tree kill covers the rest.
#[cfg(target_os = "windows")]
fn kill_group(_pgid: u32) -> Result<()> {
    Ok(())
}

/// Tear down a failed launch: the spawned process and its tree while it lives, the process
/// group it led, and whatever ended up listening on `port`.
///
/// `port` was verified free before the spawn, so any listener on it belongs to this launch.
pub(super) fn abort_launch(
    inspector: &dyn ProcessInspector,
    spawned_pid: u32,
    exited: bool,
    port: u16,
) {
    if !exited {
        if let Err(e) = kill_tree(inspector, spawned_pid) {
            log::warn!("Failed to kill {}: {}", spawned_pid, e);
        }
    }
    if let Err(e) = kill_group(spawned_pid) {
        log::warn!("Failed to kill process group {}: {}", spawned_pid, e);
    }
    if let Some(owner) = inspector.pid_for_port(port) {
        log::warn!("Killing {} left listening on port {} by a failed launch", owner, port);
        if let Err(e) = kill_tree(inspector, owner) {
            log::warn!("Failed to kill {}: {}", owner, e);
        }
    }
}

/// Send the graceful signal, wait up to `budget`, then kill the whole tree if the process
/// is still alive.
pub(super) async fn terminate(
    inspector: &dyn ProcessInspector,
    pid: u32,
    budget: Duration,
    interval: Duration,
) -> Result<()> {
    if !inspector.is_alive(pid) {
        return Ok(());
    }

    if let Err(e) = graceful_signal(pid) {
        log::warn!("Graceful signal failed for PID {pid}: {e}, will force kill immediately");
        return kill_tree(inspector, pid);
    }

    if wait_for_exit(inspector, pid, budget, interval).await {
        return Ok(());
    }

    log::warn!(
        "{}",
        AppError::graceful_shutdown_timeout(pid, budget.as_secs())
    );
    kill_tree(inspector, pid)?;

    if !wait_for_exit(inspector, pid, budget, interval).await {
        return Err(AppError::process(format!(
            "PID {pid} is still alive after force kill"
        )));
    }
    Ok(())
}
