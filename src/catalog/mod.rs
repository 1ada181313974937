//! Endpoint records and the shared catalog snapshot.

mod fetch;
mod parse;
mod store;

use std::fmt;

use base64::Engine as _;
use serde::Serialize;

use crate::error::{AppError, Result};

pub use fetch::{CatalogSource, HttpCatalogSource, StaticCatalogSource};
pub use parse::parse_catalog;
pub use store::{CatalogStore, CatalogView};

/// Port the engine listens on when the embedded config does not say otherwise.
pub const DEFAULT_ENGINE_PORT: u16 = 1194;

/// Credential pair fed to the engine on stdin.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    /// Public relay endpoints share one well-known login.
    fn default() -> Self {
        Self::new("vpn", "vpn")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    /// Parses the value of a `proto` directive (`udp`, `tcp-client`, `udp6`, ...).
    pub fn from_directive(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value.starts_with("udp") {
            Some(Self::Udp)
        } else if value.starts_with("tcp") {
            Some(Self::Tcp)
        } else {
            None
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// One candidate tunnel endpoint. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointRecord {
    pub name: String,
    pub country: String,
    pub ip: String,
    pub port: u16,
    pub transport: Transport,
    pub score: i64,
    pub ping_ms: u32,
    pub speed_mbps: f64,
    pub sessions: String,
    pub uptime: String,
    #[serde(skip_serializing)]
    pub config_base64: String,
    pub credentials: Credentials,
}

impl EndpointRecord {
    /// Decode the embedded engine config.
    pub fn decode_config(&self) -> Result<String> {
        decode_config_blob(&self.config_base64)
    }
}

/// Decode a base64 engine config blob into text. Whitespace inside the blob is ignored.
pub fn decode_config_blob(blob: &str) -> Result<String> {
    let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(AppError::empty_config());
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(compact.as_bytes())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Sort by descending throughput into a new sequence. Ties keep catalog order.
pub fn sorted_by_speed(endpoints: &[EndpointRecord]) -> Vec<EndpointRecord> {
    let mut sorted = endpoints.to_vec();
    sorted.sort_by(|a, b| b.speed_mbps.total_cmp(&a.speed_mbps));
    sorted
}
