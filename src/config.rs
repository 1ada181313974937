use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::{config_path, ensure_data_dirs};

static CONFIG_LOCK: Mutex<()> = Mutex::new(());
static CONFIG_CACHE: OnceLock<RwLock<Arc<AppConfig>>> = OnceLock::new();

/// Catalog mirrors, tried in order.
pub const DEFAULT_CATALOG_URLS: [&str; 3] = [
    "https://download.vpngate.jp/api/iphone/",
    "http://download.vpngate.jp/api/iphone/",
    "https://www.vpngate.net/api/iphone/",
];

fn load_config_from_disk() -> Result<AppConfig> {
    let path = config_path()?;
    if !path.exists() {
        let config = AppConfig::default();
        save_config_to_disk(&config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(&path).map_err(|e| AppError::config(e.to_string()))?;
    AppConfig::from_toml(&content)
}

fn save_config_to_disk(config: &AppConfig) -> Result<()> {
    ensure_data_dirs()?;
    let content = toml::to_string_pretty(config).map_err(|e| AppError::config(e.to_string()))?;
    fs::write(config_path()?, content).map_err(|e| AppError::config(e.to_string()))
}

fn get_config_cache() -> Result<&'static RwLock<Arc<AppConfig>>> {
    if let Some(cache) = CONFIG_CACHE.get() {
        return Ok(cache);
    }

    let config = load_config_from_disk()?;
    let _ = CONFIG_CACHE.set(RwLock::new(Arc::new(config)));

    CONFIG_CACHE
        .get()
        .ok_or_else(|| AppError::config("CONFIG_CACHE not initialized"))
}

/// Execute a read-modify-write operation on the config file while holding a lock.
/// This prevents concurrent modifications from causing data loss.
pub fn with_config_mut<F, T>(f: F) -> Result<T>
where
    F: FnOnce(&mut AppConfig) -> Result<T>,
{
    let _guard = CONFIG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cache = get_config_cache()?;

    let current = {
        let config = cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&config)
    };

    let mut updated = (*current).clone();
    let result = f(&mut updated)?;
    save_config_to_disk(&updated)?;

    *cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

    Ok(result)
}

pub fn load_config() -> Result<Arc<AppConfig>> {
    let cache = get_config_cache()?;
    let config = cache.read().unwrap_or_else(|e| e.into_inner());
    Ok(Arc::clone(&config))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Seconds to wait for the completion marker on a real connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds a reachability probe may take.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Countries never selected by the reconnect controller.
    #[serde(default)]
    pub blocked_countries: BTreeSet<String>,
    /// Explicit engine executable; discovered when unset.
    #[serde(default)]
    pub engine_path: Option<PathBuf>,
    /// Run the engine through `sudo -n`.
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    #[serde(default = "default_probe_interface_prefix")]
    pub probe_interface_prefix: String,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    #[serde(default = "default_catalog_urls")]
    pub catalog_urls: Vec<String>,
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
}

fn default_connect_timeout() -> u64 {
    45
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_interface_name() -> String {
    "tunpilot0".to_string()
}

fn default_probe_interface_prefix() -> String {
    "tunprobe".to_string()
}

fn default_probe_concurrency() -> usize {
    1
}

fn default_catalog_urls() -> Vec<String> {
    DEFAULT_CATALOG_URLS.iter().map(ToString::to_string).collect()
}

fn default_verbosity() -> u8 {
    3
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            auto_reconnect: false,
            blocked_countries: BTreeSet::new(),
            engine_path: None,
            use_sudo: false,
            interface_name: default_interface_name(),
            probe_interface_prefix: default_probe_interface_prefix(),
            probe_concurrency: default_probe_concurrency(),
            catalog_urls: default_catalog_urls(),
            verbosity: default_verbosity(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AppError::config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}
