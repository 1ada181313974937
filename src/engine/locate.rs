use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Engine binary name looked up on PATH as a last resort.
pub const ENGINE_BINARY: &str = "openvpn";

/// Conventional install locations, checked in order.
pub const CONVENTIONAL_PATHS: &[&str] = &[
    "/usr/sbin/openvpn",
    "/usr/bin/openvpn",
    "/sbin/openvpn",
    "/usr/local/sbin/openvpn",
    "/opt/homebrew/sbin/openvpn",
];

/// Resolve the engine executable.
///
/// An explicit override must itself be valid; it never falls back to discovery.
pub fn locate_engine(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        return Err(AppError::engine_not_found(&path.display().to_string()));
    }

    if let Some(found) = CONVENTIONAL_PATHS
        .iter()
        .map(Path::new)
        .find(|p| is_executable(p))
    {
        return Ok(found.to_path_buf());
    }

    match which::which(ENGINE_BINARY) {
        Ok(path) if is_executable(&path) => Ok(path),
        _ => Err(AppError::engine_not_found(&format!(
            "{}, PATH",
            CONVENTIONAL_PATHS.join(", ")
        ))),
    }
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}
