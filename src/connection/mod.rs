//! Single active tunnel: state machine, events and settings.

mod manager;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::catalog::EndpointRecord;
use crate::compose::ComposePolicy;
use crate::config::AppConfig;
use crate::engine::{EngineSpec, CONFIG_DELETE_DELAY, GRACE_PERIOD};
use crate::error::{ErrorKind, Result};
use crate::paths::get_run_dir;

pub use manager::ConnectionManager;

/// How long a compression framing problem may last after a soft reset
/// before the tunnel is torn down and rebuilt.
pub const COMPRESSION_RECOVERY_WINDOW: Duration = Duration::from_secs(20);

/// Identifies one connect attempt across its events.
pub type AttemptId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting {
        endpoint: String,
        attempt: AttemptId,
        started_at: DateTime<Local>,
    },
    Connected {
        endpoint: String,
        attempt: AttemptId,
        since: DateTime<Local>,
    },
}

impl ConnectionStatus {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Disconnected => None,
            Self::Connecting { endpoint, .. } | Self::Connected { endpoint, .. } => Some(endpoint),
        }
    }

    pub fn attempt(&self) -> Option<AttemptId> {
        match self {
            Self::Disconnected => None,
            Self::Connecting { attempt, .. } | Self::Connected { attempt, .. } => Some(*attempt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "kind", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    UserRequested,
    /// The attempt ended before the tunnel came up.
    Failed(ErrorKind),
    /// An established tunnel went away on its own.
    ConnectionLost,
    /// Torn down to be rebuilt against the same endpoint.
    Recycled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    Status {
        kind: StatusKind,
        message: String,
    },
    Log {
        endpoint: String,
        line: String,
    },
    Connected {
        endpoint: String,
        attempt: AttemptId,
    },
    Disconnected {
        endpoint: String,
        attempt: AttemptId,
        reason: DisconnectReason,
    },
}

/// Details of the live session, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub endpoint: EndpointRecord,
    pub attempt: AttemptId,
    pub pid: u32,
    pub interface: String,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub engine: EngineSpec,
    pub connect_timeout: Duration,
    pub compose: ComposePolicy,
    /// Where composed configs are written.
    pub run_dir: PathBuf,
    pub grace_period: Duration,
    pub config_delete_delay: Duration,
    pub compression_window: Duration,
}

impl ManagerSettings {
    pub fn new(engine: EngineSpec, connect_timeout: Duration, run_dir: PathBuf) -> Self {
        let mut compose = ComposePolicy::with_timeout(connect_timeout);
        compose.verbosity = engine.verbosity;
        Self {
            engine,
            connect_timeout,
            compose,
            run_dir,
            grace_period: GRACE_PERIOD,
            config_delete_delay: CONFIG_DELETE_DELAY,
            compression_window: COMPRESSION_RECOVERY_WINDOW,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let engine = EngineSpec::from_config(config)?;
        Ok(Self::new(engine, config.connect_timeout(), get_run_dir()?))
    }
}
