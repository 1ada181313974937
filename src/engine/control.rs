//! Platform-specific process control for engine processes.

#[cfg(unix)]
use std::process::Stdio;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Upper bound for one sweep command.
#[cfg(unix)]
const SWEEP_TIMEOUT: Duration = Duration::from_secs(2);

/// Check if a process is alive by PID.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Check if a process is alive by PID.
#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Send a graceful shutdown signal to a process.
#[cfg(unix)]
pub fn graceful_signal(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| AppError::other(format!("Failed to send SIGTERM to PID {}: {}", pid, e)))
}

#[cfg(not(unix))]
pub fn graceful_signal(pid: u32) -> Result<()> {
    run_taskkill(&["/PID", &pid.to_string(), "/T"])
}

/// Kill the process group led by `pid`, or just `pid` if that fails.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::other(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Ok(_) => kill(target, Signal::SIGKILL)
            .map_err(|e| AppError::other(format!("Failed to kill process {}: {}", pid, e))),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            AppError::other(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> Result<()> {
    run_taskkill(&["/PID", &pid.to_string(), "/T", "/F"])
}

/// Ask the engine for a soft restart (renegotiate without tearing down the interface).
#[cfg(unix)]
pub fn soft_restart(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGUSR1)
        .map_err(|e| AppError::other(format!("Failed to send SIGUSR1 to PID {}: {}", pid, e)))
}

#[cfg(not(unix))]
pub fn soft_restart(_pid: u32) -> Result<()> {
    Err(AppError::other("soft restart is not supported on this platform"))
}

#[cfg(not(unix))]
fn run_taskkill(args: &[&str]) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(args)
        .output()
        .map_err(|e| AppError::other(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AppError::other(format!("taskkill failed: {}", stderr.trim())))
    }
}

/// Best-effort kill of leftover engine processes bound to `interface`.
///
/// A killed-but-unreaped engine can keep its virtual interface and block the
/// next attempt from binding it.
#[cfg(unix)]
pub async fn sweep_stray_engines(interface: &str) {
    if interface.is_empty() {
        return;
    }

    let mut cmd = tokio::process::Command::new("pkill");
    cmd.args(["-KILL", "-f", "--"])
        .arg(format!("--dev {interface}( |$)"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(SWEEP_TIMEOUT, cmd.status()).await {
        // pkill exits 1 when nothing matched
        Ok(Ok(status)) if status.success() => {
            log::warn!("Killed stray engine processes on interface {}", interface);
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => log::debug!("Stray engine sweep unavailable: {}", e),
        Err(_) => log::warn!("Stray engine sweep for {} timed out", interface),
    }
}

#[cfg(not(unix))]
pub async fn sweep_stray_engines(interface: &str) {
    log::debug!("Stray engine sweep for {} not supported on this platform", interface);
}
