//! Automatic failover across the catalog.

mod controller;
mod cursor;

use std::time::Duration;

use serde::Serialize;

use crate::config::AppConfig;
use crate::error::ErrorKind;

pub use controller::AutoReconnectController;
pub use cursor::{refresh_backoff, select_candidate, ReconnectCursor, Selection};

/// Slack on top of the connect timeout before an attempt is written off.
pub const CHECK_MARGIN: Duration = Duration::from_secs(5);

/// A connection that survives this long clears the failure history.
pub const STABILITY_WINDOW: Duration = Duration::from_secs(60);

/// Pause before retrying after an established tunnel dropped.
pub const LOSS_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Upper bound on the delay between catalog refreshes.
pub const MAX_REFRESH_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    pub connect_timeout: Duration,
    pub check_margin: Duration,
    pub stability_window: Duration,
    pub loss_retry_delay: Duration,
    pub max_refresh_backoff: Duration,
}

impl ReconnectSettings {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            check_margin: CHECK_MARGIN,
            stability_window: STABILITY_WINDOW,
            loss_retry_delay: LOSS_RETRY_DELAY,
            max_refresh_backoff: MAX_REFRESH_BACKOFF,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.connect_timeout())
    }

    /// When an attempt that has not connected is given up.
    pub fn check_after(&self) -> Duration {
        self.connect_timeout + self.check_margin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectEvent {
    Enabled,
    Disabled,
    Attempting {
        endpoint: String,
        index: usize,
        attempt: u32,
    },
    Connected {
        endpoint: String,
    },
    AttemptFailed {
        endpoint: String,
        reason: ErrorKind,
    },
    /// The connection held for the stability window; failures were forgotten.
    Stable {
        endpoint: String,
        cleared: usize,
    },
    RefreshRequested,
    CatalogRefreshed {
        endpoints: usize,
        generation: u64,
    },
    RefreshFailed {
        message: String,
    },
    /// Next selection is delayed by this long.
    Backoff {
        delay_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectSnapshot {
    pub enabled: bool,
    pub cursor: ReconnectCursor,
    pub connected: Option<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub catalog_size: usize,
}
