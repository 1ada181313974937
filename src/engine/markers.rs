//! Classification of engine log lines.
//!
//! The engine's only structured signal is text. Classification is an ordered
//! table: the first matching row wins, and fatal rows sit above informational
//! ones so a fatal marker always beats an informational one on the same line.

use crate::error::ErrorKind;

/// Printed by the engine once the tunnel is fully up.
pub const COMPLETION_MARKER: &str = "Initialization Sequence Completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMarker {
    AuthFailed,
    CredentialReprompt,
    TlsError,
    RoutingError,
    CompressionFraming,
    Completed,
    Exiting,
}

impl LogMarker {
    /// Markers that end a connection attempt still in progress.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthFailed | Self::CredentialReprompt | Self::TlsError | Self::RoutingError
        )
    }

    /// Error kind reported when this marker ends an attempt.
    pub fn error_kind(self) -> Option<ErrorKind> {
        match self {
            Self::AuthFailed => Some(ErrorKind::AuthFailed),
            Self::CredentialReprompt => Some(ErrorKind::Misconfiguration),
            Self::TlsError | Self::RoutingError => Some(ErrorKind::NetworkOrTls),
            Self::CompressionFraming | Self::Completed | Self::Exiting => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::AuthFailed => "authentication rejected by the server",
            Self::CredentialReprompt => "engine asked for credentials again",
            Self::TlsError => "TLS handshake failed",
            Self::RoutingError => "network unreachable",
            Self::CompressionFraming => "compression framing mismatch",
            Self::Completed => "tunnel established",
            Self::Exiting => "engine is shutting down",
        }
    }
}

/// Ordered (substring, marker) rows. Matching is case-insensitive.
const MARKER_TABLE: &[(&str, LogMarker)] = &[
    ("auth_failed", LogMarker::AuthFailed),
    ("enter auth username", LogMarker::CredentialReprompt),
    ("enter auth password", LogMarker::CredentialReprompt),
    ("could not read auth username", LogMarker::CredentialReprompt),
    ("could not read auth password", LogMarker::CredentialReprompt),
    ("tls error", LogMarker::TlsError),
    ("tls handshake failed", LogMarker::TlsError),
    ("no route to host", LogMarker::RoutingError),
    ("network is unreachable", LogMarker::RoutingError),
    ("connection refused", LogMarker::RoutingError),
    ("bad lzo decompression", LogMarker::CompressionFraming),
    ("bad compression stub", LogMarker::CompressionFraming),
    ("decompression error", LogMarker::CompressionFraming),
    ("compression stub decompression", LogMarker::CompressionFraming),
    ("initialization sequence completed", LogMarker::Completed),
    ("process exiting", LogMarker::Exiting),
    ("sigterm", LogMarker::Exiting),
];

/// Classify one log line; `None` means informational only.
pub fn classify(line: &str) -> Option<LogMarker> {
    let lowered = line.to_ascii_lowercase();
    MARKER_TABLE
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
        .map(|(_, marker)| *marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_marker() {
        assert_eq!(
            classify("2024-01-01 10:00:00 Initialization Sequence Completed"),
            Some(LogMarker::Completed)
        );
        assert!(!LogMarker::Completed.is_fatal());
    }

    #[test]
    fn test_fatal_markers() {
        assert_eq!(
            classify("AUTH: Received control message: AUTH_FAILED"),
            Some(LogMarker::AuthFailed)
        );
        assert_eq!(
            classify("TLS Error: TLS key negotiation failed to occur within 60 seconds"),
            Some(LogMarker::TlsError)
        );
        assert_eq!(
            classify("ERROR: could not read Auth username from stdin"),
            Some(LogMarker::CredentialReprompt)
        );
        assert_eq!(
            classify("write UDP: No route to host (code=113)"),
            Some(LogMarker::RoutingError)
        );
    }

    #[test]
    fn test_fatal_wins_on_same_line() {
        let line = "AUTH_FAILED after Initialization Sequence Completed";
        assert_eq!(classify(line), Some(LogMarker::AuthFailed));
        let line = "SIGTERM received, TLS Error: handshake aborted";
        assert_eq!(classify(line), Some(LogMarker::TlsError));
    }

    #[test]
    fn test_informational_lines() {
        assert_eq!(classify("OpenVPN 2.6.9 x86_64-pc-linux-gnu"), None);
        assert_eq!(
            classify("SIGTERM[hard,] received, process exiting"),
            Some(LogMarker::Exiting)
        );
        assert_eq!(
            classify("Bad LZO decompression header byte: 69"),
            Some(LogMarker::CompressionFraming)
        );
        assert!(!LogMarker::CompressionFraming.is_fatal());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(LogMarker::AuthFailed.error_kind(), Some(ErrorKind::AuthFailed));
        assert_eq!(
            LogMarker::CredentialReprompt.error_kind(),
            Some(ErrorKind::Misconfiguration)
        );
        assert_eq!(LogMarker::RoutingError.error_kind(), Some(ErrorKind::NetworkOrTls));
        assert_eq!(LogMarker::Completed.error_kind(), None);
    }

    #[test]
    fn test_fatal_row_beats_completion_on_same_line() {
        let line = format!("TLS Error: peer reset before {COMPLETION_MARKER}");
        assert_eq!(classify(&line), Some(LogMarker::TlsError));
    }
}
