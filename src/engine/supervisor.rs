//! One supervised engine process.
//!
//! The process owns its log stream and is always torn down in two phases:
//! graceful signal, bounded wait, then a process-group kill. Dropping an
//! `EngineProcess` that is still running kills it.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::control::{force_kill, graceful_signal, soft_restart};
use super::{EngineSpec, GRACE_PERIOD, KILL_WAIT};
use crate::catalog::Credentials;
use crate::error::{AppError, Result};

/// Buffered engine lines before readers apply backpressure.
const LINE_BUFFER: usize = 256;

pub struct EngineProcess {
    child: Child,
    pid: u32,
    label: String,
    lines: mpsc::Receiver<String>,
}

impl EngineProcess {
    /// Spawn the engine, hand it credentials on stdin and close stdin.
    pub async fn spawn(
        spec: &EngineSpec,
        config_path: &Path,
        connect_timeout: Duration,
        credentials: &Credentials,
        label: &str,
    ) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.args(config_path, connect_timeout))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AppError::process_start(format!(
                "Failed to start {}: {}",
                spec.program.display(),
                e
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::process_start("Failed to get process ID"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::process_start("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::process_start("Failed to capture stderr"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::process_start("Failed to capture stdin"))?;

        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        forward_lines(stdout, tx.clone(), label.to_string());
        forward_lines(stderr, tx, label.to_string());

        // Credentials are requested exactly once; closing stdin turns any
        // re-prompt into a visible read failure instead of a hang.
        let payload = format!("{}\n{}\n", credentials.username, credentials.password);
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            log::warn!("[engine {}] failed to write credentials: {}", label, e);
        }
        drop(stdin);

        log::info!(
            "Engine started for {} (pid: {}, interface: {})",
            label,
            pid,
            spec.interface
        );

        Ok(Self {
            child,
            pid,
            label: label.to_string(),
            lines,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next merged stdout/stderr line. `None` once both streams are closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Whether the process has not been reaped yet.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the engine to renegotiate in place.
    pub fn soft_restart(&self) -> Result<()> {
        soft_restart(self.pid)
    }

    /// Collect the exit status after the log stream ended.
    ///
    /// An engine that closes its output but keeps running is stopped.
    pub async fn finish(&mut self) -> Option<ExitStatus> {
        match tokio::time::timeout(GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                log::warn!("[engine {}] wait failed: {}", self.label, e);
                None
            }
            Err(_) => self.stop(GRACE_PERIOD).await,
        }
    }

    /// Two-phase shutdown. Returns once the process is reaped or the kill
    /// wait ran out.
    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        match graceful_signal(self.pid) {
            Ok(()) => {
                if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                    log::info!("Engine for {} exited gracefully", self.label);
                    return Some(status);
                }
                log::warn!(
                    "Engine for {} ignored graceful stop for {:?}, killing",
                    self.label,
                    grace
                );
            }
            Err(e) => log::warn!("{}", e),
        }

        if let Err(e) = force_kill(self.pid) {
            log::warn!("{}", e);
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                log::error!("[engine {}] wait after kill failed: {}", self.label, e);
                None
            }
            Err(_) => {
                log::error!(
                    "Engine for {} (pid {}) still running after kill",
                    self.label,
                    self.pid
                );
                None
            }
        }
    }
}

/// Last-resort cleanup: `Drop` cannot await a grace period, so this goes
/// straight to SIGKILL. Orderly paths call [`EngineProcess::stop`] first.
impl Drop for EngineProcess {
    fn drop(&mut self) {
        if self.is_running() {
            log::warn!(
                "Engine for {} dropped while running, killing pid {}",
                self.label,
                self.pid
            );
            if force_kill(self.pid).is_err() {
                let _ = self.child.start_kill();
            }
        }
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>, label: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            log::debug!("[engine {}] {}", label, line);
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::is_process_alive;
    use crate::engine::test_support::{engine_printing, fake_engine};

    async fn spawn(spec: &EngineSpec) -> EngineProcess {
        EngineProcess::spawn(
            spec,
            Path::new("/tmp/unused.ovpn"),
            Duration::from_secs(5),
            &Credentials::new("alice", "s3cret"),
            "test",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_credentials_arrive_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_engine(
            dir.path(),
            "tunsupcred0",
            "echo \"user=$USER_LINE pass=$PASS_LINE\"\nif read -r EXTRA; then echo more; else echo eof; fi",
        );
        let mut process = spawn(&spec).await;
        assert_eq!(process.next_line().await.unwrap(), "user=alice pass=s3cret");
        assert_eq!(process.next_line().await.unwrap(), "eof");
        assert!(process.next_line().await.is_none());
        let status = process.finish().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_stderr_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_engine(dir.path(), "tunsuperr0", "echo oops >&2");
        let mut process = spawn(&spec).await;
        assert_eq!(process.next_line().await.unwrap(), "oops");
        assert!(process.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_terminates_running_engine() {
        let dir = tempfile::tempdir().unwrap();
        let spec = engine_printing(dir.path(), "tunsupstop0", &["hello"]);
        let mut process = spawn(&spec).await;
        assert_eq!(process.next_line().await.unwrap(), "hello");
        let pid = process.pid();
        assert!(process.is_running());

        let status = process.stop(Duration::from_secs(2)).await;
        assert!(status.is_some());
        assert!(!process.is_running());
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_stop_escalates_when_term_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_engine(
            dir.path(),
            "tunsupterm0",
            "trap '' TERM\necho ready\nwhile true; do sleep 1; done",
        );
        let mut process = spawn(&spec).await;
        assert_eq!(process.next_line().await.unwrap(), "ready");

        let status = process.stop(Duration::from_millis(200)).await;
        assert!(status.is_some());
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_missing_program_is_start_failure() {
        let spec = EngineSpec::new("/nonexistent/engine", "tunsupmiss0");
        let err = EngineProcess::spawn(
            &spec,
            Path::new("/tmp/unused.ovpn"),
            Duration::from_secs(5),
            &Credentials::default(),
            "test",
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProcessStartFailed);
    }

    /// Dead means gone or a zombie waiting to be reaped.
    #[cfg(target_os = "linux")]
    fn is_dead(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_kills_running_engine() {
        let dir = tempfile::tempdir().unwrap();
        let spec = engine_printing(dir.path(), "tunsupdrop0", &["up"]);
        let mut process = spawn(&spec).await;
        assert_eq!(process.next_line().await.unwrap(), "up");
        let pid = process.pid();
        drop(process);

        let mut dead = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if is_dead(pid) {
                dead = true;
                break;
            }
        }
        assert!(dead);
    }
}
