//! Application error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Application error carrying a classified kind and a small key/value payload.
#[derive(Debug, Clone)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Tunnel engine executable could not be resolved
    EngineNotFound,
    /// Endpoint configuration decoded to nothing
    EmptyConfig,
    /// Endpoint configuration blob could not be decoded
    InvalidConfig,
    /// Engine process could not be spawned
    ProcessStartFailed,
    /// Engine reported an authentication failure
    AuthFailed,
    /// Engine reported a TLS handshake or network failure
    NetworkOrTls,
    /// Engine re-prompted for credentials or rejected a directive
    Misconfiguration,
    /// Connect or probe exceeded its bound
    Timeout,
    /// Engine exited before the tunnel was confirmed
    EngineExited,
    /// An established tunnel went away without being asked to
    ConnectionLost,
    /// A tunnel is already up
    AlreadyConnected,
    /// A connection attempt is already in flight
    AlreadyConnecting,
    /// Operation cancelled by the caller
    Cancelled,
    /// Catalog could not be fetched or parsed
    Catalog,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// The owning actor has shut down
    ManagerClosed,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::EngineNotFound => 1001,
            Self::EmptyConfig => 1002,
            Self::InvalidConfig => 1003,
            Self::ProcessStartFailed => 1004,
            Self::AuthFailed => 2001,
            Self::NetworkOrTls => 2002,
            Self::Misconfiguration => 2003,
            Self::Timeout => 2004,
            Self::EngineExited => 2005,
            Self::ConnectionLost => 2006,
            Self::AlreadyConnected => 3001,
            Self::AlreadyConnecting => 3002,
            Self::Cancelled => 3003,
            Self::ManagerClosed => 3004,
            Self::Catalog => 4001,
            Self::Config => 5001,
            Self::Io => 5002,
            Self::Network => 5003,
            Self::Other => 9999,
        }
    }

    /// Failures that end one connection attempt but leave the reconnect
    /// controller free to move on to the next candidate.
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            Self::EngineNotFound
                | Self::EmptyConfig
                | Self::InvalidConfig
                | Self::ProcessStartFailed
                | Self::AuthFailed
                | Self::NetworkOrTls
                | Self::Misconfiguration
                | Self::Timeout
                | Self::EngineExited
                | Self::ConnectionLost
                | Self::Io
        )
    }

    /// Human readable summary used in status events.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::EngineNotFound => "tunnel engine not found",
            Self::EmptyConfig => "endpoint configuration is empty",
            Self::InvalidConfig => "endpoint configuration could not be decoded",
            Self::ProcessStartFailed => "tunnel engine failed to start",
            Self::AuthFailed => "authentication failed",
            Self::NetworkOrTls => "TLS or network failure",
            Self::Misconfiguration => "engine misconfiguration detected",
            Self::Timeout => "connection timed out",
            Self::EngineExited => "engine exited before the tunnel was confirmed",
            Self::ConnectionLost => "connection lost",
            Self::AlreadyConnected => "already connected",
            Self::AlreadyConnecting => "connection attempt already in progress",
            Self::Cancelled => "cancelled",
            Self::ManagerClosed => "connection manager is shut down",
            Self::Catalog => "catalog unavailable",
            Self::Config => "configuration error",
            Self::Io => "file system error",
            Self::Network => "network error",
            Self::Other => "error",
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn engine_not_found(searched: &str) -> Self {
        Self::new(
            ErrorKind::EngineNotFound,
            HashMap::from([("searched".to_string(), searched.to_string())]),
        )
    }

    pub fn empty_config() -> Self {
        Self::new(ErrorKind::EmptyConfig, HashMap::new())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::InvalidConfig, message)
    }

    pub fn process_start(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ProcessStartFailed, message)
    }

    /// Attempt failure classified from engine output or exit.
    pub fn engine(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::with_detail(kind, message)
    }

    pub fn already_connected(endpoint: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyConnected,
            HashMap::from([("endpoint".to_string(), endpoint.to_string())]),
        )
    }

    pub fn already_connecting(endpoint: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyConnecting,
            HashMap::from([("endpoint".to_string(), endpoint.to_string())]),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, HashMap::new())
    }

    pub fn manager_closed() -> Self {
        Self::new(ErrorKind::ManagerClosed, HashMap::new())
    }

    pub fn catalog(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Catalog, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            HashMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.payload.get("detail").map(String::as_str)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        Self::invalid_config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_payload() {
        assert_eq!(AppError::empty_config().to_string(), "EmptyConfig");
    }

    #[test]
    fn test_display_sorts_payload_pairs() {
        let err = AppError::new(
            ErrorKind::Network,
            HashMap::from([
                ("url".to_string(), "https://a".to_string()),
                ("detail".to_string(), "boom".to_string()),
            ]),
        );
        assert_eq!(err.to_string(), "Network: detail=boom, url=https://a");
    }

    #[test]
    fn test_attempt_failures_are_recoverable() {
        assert!(ErrorKind::AuthFailed.is_attempt_failure());
        assert!(ErrorKind::Timeout.is_attempt_failure());
        assert!(ErrorKind::EngineNotFound.is_attempt_failure());
        assert!(!ErrorKind::AlreadyConnected.is_attempt_failure());
        assert!(!ErrorKind::Cancelled.is_attempt_failure());
    }

    #[test]
    fn test_serialize_uses_code() {
        let json = serde_json::to_value(AppError::already_connected("S1")).unwrap();
        assert_eq!(json["code"], 3001);
        assert_eq!(json["payload"]["endpoint"], "S1");
    }
}
