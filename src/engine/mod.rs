//! Tunnel engine process layer: discovery, spawning, signalling, log markers.

mod control;
mod locate;
pub mod markers;
mod supervisor;

use std::ffi::OsString;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::{AppError, Result};

pub use control::{
    force_kill, graceful_signal, is_process_alive, soft_restart, sweep_stray_engines,
};
pub use locate::{is_executable, locate_engine, CONVENTIONAL_PATHS, ENGINE_BINARY};
pub use markers::{classify, LogMarker, COMPLETION_MARKER};
pub use supervisor::EngineProcess;

/// How long a graceful stop may take before the process group is killed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Bound on reaping after a forced kill.
pub const KILL_WAIT: Duration = Duration::from_secs(2);

/// The engine may still be reading its config when it reports started.
pub const CONFIG_DELETE_DELAY: Duration = Duration::from_secs(5);

/// How to launch one engine instance.
#[derive(Debug, Clone)]
pub struct EngineSpec {
    pub program: PathBuf,
    /// Arguments placed before the engine's own flags (`-n <engine>` under sudo).
    pub prefix_args: Vec<OsString>,
    /// Virtual interface the engine binds; also the key for stray sweeps.
    pub interface: String,
    pub verbosity: u8,
}

impl EngineSpec {
    pub fn new(program: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            interface: interface.into(),
            verbosity: 3,
        }
    }

    /// Resolve the engine from configuration, wrapping it in `sudo -n` if asked.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let engine = locate_engine(config.engine_path.as_deref())?;
        let mut spec = if config.use_sudo {
            let mut spec = Self::new("sudo", config.interface_name.clone());
            spec.prefix_args = vec![OsString::from("-n"), engine.into_os_string()];
            spec
        } else {
            Self::new(engine, config.interface_name.clone())
        };
        spec.verbosity = config.verbosity;
        Ok(spec)
    }

    /// Same engine, different interface. Used to keep probes disjoint.
    pub fn with_interface(&self, interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..self.clone()
        }
    }

    /// Full argument list for one run against `config_path`.
    pub fn args(&self, config_path: &Path, connect_timeout: Duration) -> Vec<OsString> {
        let mut args = self.prefix_args.clone();
        args.extend(
            [
                "--config".to_string(),
                config_path.display().to_string(),
                "--auth-user-pass".to_string(),
                "/dev/stdin".to_string(),
                "--verb".to_string(),
                self.verbosity.min(crate::compose::MAX_VERBOSITY).to_string(),
                "--connect-timeout".to_string(),
                connect_timeout.as_secs().max(1).to_string(),
                "--dev".to_string(),
                self.interface.clone(),
                "--dev-type".to_string(),
                "tun".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args
    }
}

/// Write a composed config under `dir` with a name unique across attempts.
pub fn write_run_config(dir: &Path, text: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| AppError::io(e.to_string()))?;

    let name = format!(
        "endpoint_{}_{}.ovpn",
        chrono::Local::now().format("%Y%m%d_%H%M%S%3f"),
        uuid::Uuid::new_v4().simple()
    );
    let path = dir.join(name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }

    let mut file = options
        .open(&path)
        .map_err(|e| AppError::io(format!("Failed to create {}: {}", path.display(), e)))?;
    file.write_all(text.as_bytes())
        .map_err(|e| AppError::io(format!("Failed to write {}: {}", path.display(), e)))?;

    Ok(path)
}

/// Delete `path` after `delay` in the background.
pub fn schedule_removal(path: PathBuf, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => log::debug!("Removed engine config {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove engine config {}: {}", path.display(), e),
        }
    });
}
