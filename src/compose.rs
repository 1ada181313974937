//! Rewrites a server-supplied engine config into the one we actually run.
//!
//! Pure text transformation: no I/O, identical input gives identical output.

use std::time::Duration;

use crate::catalog::Transport;
use crate::error::{AppError, Result};

/// Per-packet chatter starts above this level.
pub const MAX_VERBOSITY: u8 = 4;

/// Policy values appended after the server's own directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposePolicy {
    pub connect_timeout: Duration,
    pub verbosity: u8,
    pub connect_retry: u32,
    pub connect_retry_max: u32,
    pub keepalive_interval: u32,
    pub keepalive_timeout: u32,
    pub tun_mtu: u16,
    pub mssfix: u16,
    /// Only emitted for UDP transports.
    pub fragment: Option<u16>,
}

impl Default for ComposePolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(45),
            verbosity: 3,
            connect_retry: 2,
            connect_retry_max: 3,
            keepalive_interval: 10,
            keepalive_timeout: 60,
            tun_mtu: 1400,
            mssfix: 1360,
            fragment: Some(1300),
        }
    }
}

impl ComposePolicy {
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Self::default()
        }
    }

    pub fn effective_verbosity(&self) -> u8 {
        self.verbosity.min(MAX_VERBOSITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    Adaptive,
    Enabled,
    Disabled,
}

/// Directives whose values this composer owns outright.
const OWNED_DIRECTIVES: &[&str] = &[
    "ping",
    "ping-restart",
    "ping-exit",
    "ping-timer-rem",
    "keepalive",
    "inactive",
    "fragment",
    "mssfix",
    "tun-mtu",
    "link-mtu",
    "auth-user-pass",
    "auth-retry",
    "auth-nocache",
    "connect-timeout",
    "server-poll-timeout",
    "connect-retry",
    "connect-retry-max",
    "verb",
    "mute",
    "reneg-sec",
    "tls-client",
];

/// Produce the engine-ready config for `raw`.
///
/// Unknown or malformed directives pass through untouched; only an empty
/// config is an error.
pub fn compose(raw: &str, policy: &ComposePolicy) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(AppError::empty_config());
    }

    let mut out: Vec<String> = Vec::new();
    let mut inline_block: Option<String> = None;
    let mut transport = Transport::Udp;
    let mut compression = None;

    for line in raw.lines() {
        let trimmed = line.trim();

        // Inline material such as <ca>...</ca> is copied verbatim.
        if let Some(tag) = &inline_block {
            out.push(trimmed.to_string());
            if trimmed.eq_ignore_ascii_case(&format!("</{tag}>")) {
                inline_block = None;
            }
            continue;
        }
        if let Some(tag) = opening_tag(trimmed) {
            inline_block = Some(tag);
            out.push(trimmed.to_string());
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            out.push(trimmed.to_string());
            continue;
        }

        let mut tokens = trimmed.split_whitespace();
        let directive = tokens.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = tokens.collect();

        match directive.as_str() {
            "proto" => {
                if let Some(t) = args.first().and_then(|v| Transport::from_directive(v)) {
                    transport = t;
                }
                out.push(trimmed.to_string());
            }
            "cipher" if !args.is_empty() => {
                let cipher = args[0];
                out.push(format!("# {trimmed}"));
                out.push(format!("cipher {cipher}"));
                out.push(format!(
                    "data-ciphers AES-256-GCM:AES-128-GCM:CHACHA20-POLY1305:{cipher}"
                ));
                out.push(format!("data-ciphers-fallback {cipher}"));
            }
            "auth" if !args.is_empty() => {
                out.push(format!("# {trimmed}"));
                out.push(format!("auth {}", args[0]));
            }
            "comp-lzo" => {
                let mode = comp_lzo_mode(args.first().copied());
                out.push(format!("# {trimmed}"));
                out.push(render_comp_lzo(mode).to_string());
                compression = Some(mode);
            }
            "compress" => {
                let mode = compress_mode(args.first().copied());
                out.push(format!("# {trimmed}"));
                // The algorithm fixes the packet framing, so it is always restated.
                out.push(match args.first() {
                    Some(algo) => format!("compress {algo}"),
                    None => "compress".to_string(),
                });
                compression = Some(mode);
            }
            d if OWNED_DIRECTIVES.contains(&d) => {
                out.push(format!("# {trimmed}  # overridden by policy"));
            }
            _ => out.push(trimmed.to_string()),
        }
    }

    append_policy(&mut out, policy, transport, compression);

    let mut text = out.join("\n");
    text.push('\n');
    Ok(text)
}

fn opening_tag(line: &str) -> Option<String> {
    let inner = line.strip_prefix('<')?.strip_suffix('>')?;
    if inner.is_empty() || inner.starts_with('/') || inner.contains(char::is_whitespace) {
        return None;
    }
    Some(inner.to_ascii_lowercase())
}

fn comp_lzo_mode(arg: Option<&str>) -> CompressionMode {
    match arg.map(str::to_ascii_lowercase).as_deref() {
        None | Some("adaptive") => CompressionMode::Adaptive,
        Some("no") => CompressionMode::Disabled,
        Some(_) => CompressionMode::Enabled,
    }
}

fn compress_mode(arg: Option<&str>) -> CompressionMode {
    match arg.map(str::to_ascii_lowercase).as_deref() {
        None | Some("stub") | Some("stub-v2") => CompressionMode::Disabled,
        Some(_) => CompressionMode::Enabled,
    }
}

fn render_comp_lzo(mode: CompressionMode) -> &'static str {
    match mode {
        CompressionMode::Adaptive => "comp-lzo adaptive",
        CompressionMode::Enabled => "comp-lzo yes",
        CompressionMode::Disabled => "comp-lzo no",
    }
}

fn append_policy(
    out: &mut Vec<String>,
    policy: &ComposePolicy,
    transport: Transport,
    compression: Option<CompressionMode>,
) {
    let timeout = policy.connect_timeout.as_secs().max(1);

    out.push(String::new());
    out.push("# --- connection policy ---".to_string());
    out.push("tls-client".to_string());
    out.push("remote-cert-tls server".to_string());
    out.push("reneg-sec 0".to_string());
    out.push("auth-nocache".to_string());
    out.push("auth-retry none".to_string());
    out.push(format!("connect-retry {}", policy.connect_retry));
    out.push(format!("connect-retry-max {}", policy.connect_retry_max));
    out.push(format!("connect-timeout {timeout}"));
    out.push(format!(
        "keepalive {} {}",
        policy.keepalive_interval, policy.keepalive_timeout
    ));
    out.push(format!("tun-mtu {}", policy.tun_mtu));
    out.push(format!("mssfix {}", policy.mssfix));
    if let (Transport::Udp, Some(fragment)) = (transport, policy.fragment) {
        out.push(format!("fragment {fragment}"));
    }
    if matches!(
        compression,
        Some(CompressionMode::Adaptive | CompressionMode::Enabled)
    ) {
        out.push("allow-compression yes".to_string());
    }
    out.push("persist-key".to_string());
    out.push("persist-tun".to_string());
    out.push("nobind".to_string());
    out.push(format!("verb {}", policy.effective_verbosity()));
    out.push("mute 20".to_string());
}
