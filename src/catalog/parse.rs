//! Parser for the comma-separated relay catalog feed.

use super::{
    decode_config_blob, sorted_by_speed, Credentials, EndpointRecord, Transport,
    DEFAULT_ENGINE_PORT,
};

/// Data lines carry at least this many fields.
const MIN_FIELDS: usize = 15;
/// The feed opens with a banner line and a column header line.
const HEADER_LINES: usize = 2;
const CONFIG_FIELD: usize = 14;

/// Parse the catalog feed into endpoints sorted by descending throughput.
///
/// Malformed lines are skipped rather than failing the whole catalog.
pub fn parse_catalog(data: &str) -> Vec<EndpointRecord> {
    let mut endpoints = Vec::new();

    for line in data.lines().filter(|l| !l.trim().is_empty()).skip(HEADER_LINES) {
        let line = line.trim();
        if line.starts_with('*') {
            continue;
        }

        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < MIN_FIELDS {
            continue;
        }

        if let Some(endpoint) = parse_record(&parts) {
            endpoints.push(endpoint);
        }
    }

    log::debug!("Parsed {} endpoints from catalog", endpoints.len());
    sorted_by_speed(&endpoints)
}

fn parse_record(parts: &[&str]) -> Option<EndpointRecord> {
    let host = parts[0].trim();
    let ip = parts[1].trim();
    if host.is_empty() && ip.is_empty() {
        return None;
    }

    let config_base64 = parts[CONFIG_FIELD].trim().to_string();
    let (port, transport) = discover_transport(&config_base64);
    let speed_bps: f64 = parts[4].trim().parse().unwrap_or(0.0);

    Some(EndpointRecord {
        name: format!("{}_{}", host, parts[5].trim()),
        country: parts[6].trim().to_string(),
        ip: ip.to_string(),
        port,
        transport,
        score: parts[2].trim().parse().unwrap_or(0),
        ping_ms: parts[3].trim().parse().unwrap_or(0),
        speed_mbps: (speed_bps / 1_000_000.0).max(0.0),
        sessions: parts[7].trim().to_string(),
        uptime: parts[8].trim().to_string(),
        config_base64,
        credentials: Credentials::default(),
    })
}

/// Pull port and transport out of the embedded config, falling back to defaults.
fn discover_transport(config_base64: &str) -> (u16, Transport) {
    let mut port = DEFAULT_ENGINE_PORT;
    let mut transport = Transport::Udp;

    let Ok(config) = decode_config_blob(config_base64) else {
        return (port, transport);
    };

    for line in config.lines() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("proto") => {
                if let Some(t) = tokens.next().and_then(Transport::from_directive) {
                    transport = t;
                }
            }
            Some("remote") => {
                if let Some(p) = tokens.nth(1).and_then(|p| p.parse().ok()) {
                    port = p;
                }
            }
            _ => {}
        }
    }

    (port, transport)
}
