use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use crate::catalog::{
    sorted_by_speed, CatalogSource, CatalogStore, EndpointRecord, HttpCatalogSource,
    StaticCatalogSource,
};
use crate::cli::{Args, Commands};
use crate::config::{load_config, with_config_mut, AppConfig};
use crate::connection::{
    ConnectionManager, DisconnectReason, ManagerEvent, ManagerSettings, StatusKind,
};
use crate::engine::locate_engine;
use crate::error::{AppError, ErrorKind, Result};
use crate::paths;
use crate::probe::{probe_catalog, EndpointProber, ProbeCancel, ProbeReport, ProbeSettings};
use crate::reconnect::{AutoReconnectController, ReconnectEvent, ReconnectSettings};

/// Shared state for one CLI invocation.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<CatalogStore>,
    pub source: Arc<dyn CatalogSource>,
}

impl AppState {
    pub fn new(config: AppConfig, catalog_file: Option<&Path>) -> Result<Self> {
        let source: Arc<dyn CatalogSource> = match catalog_file {
            Some(path) => {
                let feed = fs::read_to_string(path).map_err(|e| {
                    AppError::catalog(format!("Failed to read {}: {e}", path.display()))
                })?;
                Arc::new(StaticCatalogSource::from_feed(&feed))
            }
            None => Arc::new(HttpCatalogSource::new(config.catalog_urls.clone())?),
        };

        let store = Arc::new(CatalogStore::new());
        store.set_blocked(config.blocked_countries.iter().cloned());

        Ok(Self {
            config,
            store,
            source,
        })
    }

    /// Fetch the catalog, sort it best-first and install it in the store.
    pub async fn load_catalog(&self) -> Result<Arc<Vec<EndpointRecord>>> {
        let endpoints = self.source.fetch().await?;
        let generation = self.store.replace(sorted_by_speed(&endpoints));
        log::info!(
            "Catalog loaded: {} endpoints (generation {})",
            endpoints.len(),
            generation
        );
        Ok(self.store.endpoints())
    }

    /// Named endpoint, or the fastest one not in a blocked country.
    async fn pick_endpoint(&self, name: Option<&str>) -> Result<EndpointRecord> {
        self.load_catalog().await?;
        match name {
            Some(name) => self
                .store
                .find(name)
                .ok_or_else(|| AppError::catalog(format!("No endpoint named '{name}'"))),
            None => self
                .store
                .with_view(|view| {
                    view.endpoints
                        .iter()
                        .find(|endpoint| view.is_eligible(endpoint))
                        .cloned()
                })
                .ok_or_else(|| AppError::catalog("No eligible endpoint in the catalog")),
        }
    }
}

/// Apply command-line overrides on top of the persisted config.
fn effective_config(args: &Args) -> Result<AppConfig> {
    let mut config = (*load_config()?).clone();
    if let Some(secs) = args.timeout {
        config.connect_timeout_secs = secs;
        config.probe_timeout_secs = secs;
    }
    Ok(config)
}

pub async fn dispatch(args: Args) -> Result<()> {
    let config = effective_config(&args)?;

    match args.command {
        Commands::Block { ref country } => block_country(country),
        Commands::Unblock { ref country } => unblock_country(country),
        Commands::Config => show_config(&config),
        Commands::Doctor => doctor(&config),
        Commands::List { limit, ref country } => {
            let state = AppState::new(config, args.catalog_file.as_deref())?;
            list_endpoints(&state, limit, country.as_deref()).await
        }
        Commands::Probe {
            ref name,
            all,
            concurrency,
        } => {
            let state = AppState::new(config, args.catalog_file.as_deref())?;
            if all {
                probe_all(&state, concurrency).await
            } else {
                probe_endpoint(&state, name.as_deref()).await
            }
        }
        Commands::Connect { ref name } => {
            let state = AppState::new(config, args.catalog_file.as_deref())?;
            // With auto reconnect on, an unnamed connect hands over to the controller.
            if name.is_none() && state.config.auto_reconnect {
                run_auto(&state).await
            } else {
                connect(&state, name.as_deref()).await
            }
        }
        Commands::Auto => {
            let state = AppState::new(config, args.catalog_file.as_deref())?;
            run_auto(&state).await
        }
    }
}

// === Catalog ===

pub async fn list_endpoints(state: &AppState, limit: usize, country: Option<&str>) -> Result<()> {
    let endpoints = state.load_catalog().await?;
    let blocked = state.store.blocked();

    println!(
        "{:<24} {:<16} {:<16} {:>6} {:>9} {:>7}",
        "NAME", "COUNTRY", "ADDRESS", "PORT", "MBPS", "PING"
    );
    let rows = endpoints
        .iter()
        .filter(|e| country.map_or(true, |c| e.country.eq_ignore_ascii_case(c)))
        .take(limit);
    for endpoint in rows {
        let marker = if blocked.contains(&endpoint.country) {
            " (blocked)"
        } else {
            ""
        };
        println!(
            "{:<24} {:<16} {:<16} {:>6} {:>9.1} {:>7}{}",
            endpoint.name,
            endpoint.country,
            endpoint.ip,
            endpoint.port,
            endpoint.speed_mbps,
            endpoint.ping_ms,
            marker
        );
    }
    println!("{} endpoints total", endpoints.len());
    Ok(())
}

// === Probing ===

/// Cancel `cancel` when Ctrl-C arrives.
fn cancel_on_ctrl_c(cancel: &ProbeCancel) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling probes");
            cancel.cancel();
        }
    })
}

pub async fn probe_endpoint(state: &AppState, name: Option<&str>) -> Result<()> {
    let endpoint = state.pick_endpoint(name).await?;
    let prober = EndpointProber::new(ProbeSettings::from_config(&state.config)?);
    let cancel = ProbeCancel::new();
    let interrupt = cancel_on_ctrl_c(&cancel);

    let outcome = prober.probe(&endpoint, &cancel).await;
    interrupt.abort();

    println!(
        "{} ({}): {} in {} ms",
        outcome.endpoint,
        endpoint.country,
        outcome.message,
        outcome.elapsed_ms
    );
    match outcome.error {
        None => Ok(()),
        Some(kind) => Err(AppError::engine(kind, outcome.message)),
    }
}

pub async fn probe_all(state: &AppState, concurrency: Option<usize>) -> Result<()> {
    let endpoints = state.load_catalog().await?;
    let prober = EndpointProber::new(ProbeSettings::from_config(&state.config)?);
    let cancel = ProbeCancel::new();
    let interrupt = cancel_on_ctrl_c(&cancel);

    let concurrency = concurrency.unwrap_or(state.config.probe_concurrency);
    let report = probe_catalog(&prober, &endpoints, concurrency, &cancel).await;
    interrupt.abort();

    print_report(&report);
    if report.cancelled {
        return Err(AppError::cancelled());
    }
    Ok(())
}

fn print_report(report: &ProbeReport) {
    println!(
        "Tested {}, working {}, failed {}{}",
        report.tested,
        report.working.len(),
        report.failed,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for working in &report.working {
        println!(
            "  {:<24} {:<16} {:>9.1} Mbps  {:>6} ms",
            working.endpoint.name,
            working.endpoint.country,
            working.endpoint.speed_mbps,
            working.elapsed_ms
        );
    }
    if !report.countries.is_empty() {
        let countries: Vec<&str> = report.countries.iter().map(String::as_str).collect();
        println!("Countries: {}", countries.join(", "));
    }
}

// === Connection ===

fn print_status(kind: StatusKind, message: &str) {
    let tag = match kind {
        StatusKind::Info => "info",
        StatusKind::Success => "ok",
        StatusKind::Warning => "warn",
        StatusKind::Error => "error",
    };
    println!("[{tag}] {message}");
}

/// How a foreground `connect` ends after a `Disconnected` event, or `None`
/// when the manager is already bringing the tunnel back.
fn disconnect_outcome(reason: &DisconnectReason) -> Option<Result<()>> {
    match reason {
        DisconnectReason::UserRequested => Some(Ok(())),
        DisconnectReason::Failed(kind) => Some(Err(AppError::engine(*kind, kind.describe()))),
        DisconnectReason::ConnectionLost => Some(Err(AppError::engine(
            ErrorKind::ConnectionLost,
            ErrorKind::ConnectionLost.describe(),
        ))),
        DisconnectReason::Recycled => None,
    }
}

async fn follow_connection(events: &mut Receiver<ManagerEvent>) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, disconnecting");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ManagerEvent::Status { kind, message }) => print_status(kind, &message),
                Ok(ManagerEvent::Disconnected { reason, .. }) => {
                    if let Some(outcome) = disconnect_outcome(&reason) {
                        return outcome;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Connection event listener lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return Err(AppError::manager_closed()),
            }
        }
    }
}

pub async fn connect(state: &AppState, name: Option<&str>) -> Result<()> {
    let endpoint = state.pick_endpoint(name).await?;
    let manager = ConnectionManager::spawn(ManagerSettings::from_config(&state.config)?);
    let mut events = manager.subscribe();

    println!(
        "Connecting to {} ({}, {:.1} Mbps)",
        endpoint.name, endpoint.country, endpoint.speed_mbps
    );
    let outcome = match manager.connect(endpoint).await {
        Ok(_) => follow_connection(&mut events).await,
        Err(e) => Err(e),
    };

    if let Err(e) = manager.disconnect().await {
        log::warn!("Disconnect on exit failed: {}", e);
    }
    while let Ok(event) = events.try_recv() {
        if let ManagerEvent::Status { kind, message } = event {
            print_status(kind, &message);
        }
    }
    manager.shutdown().await?;
    outcome
}

// === Auto reconnect ===

fn print_reconnect_event(event: &ReconnectEvent) {
    match event {
        ReconnectEvent::Enabled => println!("[auto] enabled"),
        ReconnectEvent::Disabled => println!("[auto] paused"),
        ReconnectEvent::Attempting {
            endpoint,
            index,
            attempt,
        } => println!("[auto] trying {endpoint} (#{index}, attempt {attempt})"),
        ReconnectEvent::Connected { endpoint } => println!("[auto] connected to {endpoint}"),
        ReconnectEvent::AttemptFailed { endpoint, reason } => {
            println!("[auto] {endpoint} failed: {}", reason.describe());
        }
        ReconnectEvent::Stable { endpoint, cleared } => {
            println!("[auto] {endpoint} is stable, forgot {cleared} failures");
        }
        ReconnectEvent::RefreshRequested => println!("[auto] catalog exhausted, refreshing"),
        ReconnectEvent::CatalogRefreshed {
            endpoints,
            generation,
        } => println!("[auto] catalog refreshed: {endpoints} endpoints (generation {generation})"),
        ReconnectEvent::RefreshFailed { message } => {
            println!("[auto] catalog refresh failed: {message}");
        }
        ReconnectEvent::Backoff { delay_ms } => {
            println!("[auto] next attempt in {:.1}s", *delay_ms as f64 / 1000.0);
        }
    }
}

async fn follow_auto(
    manager_events: &mut Receiver<ManagerEvent>,
    reconnect_events: &mut Receiver<ReconnectEvent>,
) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping auto reconnect");
                return;
            }
            event = manager_events.recv() => match event {
                Ok(ManagerEvent::Status { kind, message }) => print_status(kind, &message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Connection event listener lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return,
            },
            event = reconnect_events.recv() => match event {
                Ok(event) => print_reconnect_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Reconnect event listener lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

pub async fn run_auto(state: &AppState) -> Result<()> {
    if let Err(e) = state.load_catalog().await {
        log::warn!("Initial catalog fetch failed, the controller will retry: {}", e);
    }

    let manager = ConnectionManager::spawn(ManagerSettings::from_config(&state.config)?);
    let controller = AutoReconnectController::spawn(
        manager.clone(),
        Arc::clone(&state.store),
        Arc::clone(&state.source),
        ReconnectSettings::from_config(&state.config),
    );
    let mut manager_events = manager.subscribe();
    let mut reconnect_events = controller.subscribe();

    controller.enable().await?;
    follow_auto(&mut manager_events, &mut reconnect_events).await;

    controller.shutdown().await?;
    if let Err(e) = manager.disconnect().await {
        log::warn!("Disconnect on exit failed: {}", e);
    }
    manager.shutdown().await
}

// === Config ===

pub fn block_country(country: &str) -> Result<()> {
    let added = with_config_mut(|config| Ok(config.blocked_countries.insert(country.to_string())))?;
    if added {
        println!("Blocked {country}");
    } else {
        println!("{country} was already blocked");
    }
    Ok(())
}

pub fn unblock_country(country: &str) -> Result<()> {
    let removed = with_config_mut(|config| Ok(config.blocked_countries.remove(country)))?;
    if removed {
        println!("Unblocked {country}");
    } else {
        println!("{country} was not blocked");
    }
    Ok(())
}

pub fn show_config(config: &AppConfig) -> Result<()> {
    println!("# {}", paths::config_path()?.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub fn doctor(config: &AppConfig) -> Result<()> {
    println!("data dir:   {}", paths::get_data_dir()?.display());
    println!("run dir:    {}", paths::get_run_dir()?.display());

    let engine = locate_engine(config.engine_path.as_deref());
    match &engine {
        Ok(path) => println!("engine:     {}", path.display()),
        Err(e) => println!("engine:     not found ({e})"),
    }
    if config.use_sudo {
        match which::which("sudo") {
            Ok(path) => println!("sudo:       {}", path.display()),
            Err(_) => println!("sudo:       not found"),
        }
    }
    println!(
        "interfaces: {} (probes: {}N)",
        config.interface_name, config.probe_interface_prefix
    );
    println!(
        "timeouts:   connect {}s, probe {}s",
        config.connect_timeout().as_secs(),
        config.probe_timeout().as_secs()
    );

    engine.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::endpoint;

    fn state_with(endpoints: Vec<EndpointRecord>, blocked: &[&str]) -> AppState {
        let config = AppConfig {
            blocked_countries: blocked.iter().map(|c| c.to_string()).collect(),
            ..AppConfig::default()
        };
        let store = Arc::new(CatalogStore::new());
        store.set_blocked(config.blocked_countries.iter().cloned());
        AppState {
            config,
            store,
            source: Arc::new(StaticCatalogSource::new(endpoints)),
        }
    }

    #[tokio::test]
    async fn test_load_catalog_sorts_best_first() {
        let state = state_with(
            vec![
                endpoint("slow", "JP", 1.0),
                endpoint("fast", "KR", 80.0),
                endpoint("mid", "US", 20.0),
            ],
            &[],
        );
        let endpoints = state.load_catalog().await.unwrap();
        let names: Vec<&str> = endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["fast", "mid", "slow"]);
    }

    #[tokio::test]
    async fn test_pick_endpoint_skips_blocked_countries() {
        let state = state_with(
            vec![endpoint("cn", "China", 90.0), endpoint("jp", "Japan", 10.0)],
            &["China"],
        );
        let picked = state.pick_endpoint(None).await.unwrap();
        assert_eq!(picked.name, "jp");

        // An explicit name bypasses the country filter.
        let picked = state.pick_endpoint(Some("cn")).await.unwrap();
        assert_eq!(picked.name, "cn");

        let err = state.pick_endpoint(Some("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Catalog);
    }

    #[tokio::test]
    async fn test_pick_endpoint_fails_when_all_blocked() {
        let state = state_with(vec![endpoint("cn", "China", 90.0)], &["China"]);
        let err = state.pick_endpoint(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Catalog);
    }

    #[test]
    fn test_disconnect_outcome() {
        assert!(matches!(
            disconnect_outcome(&DisconnectReason::UserRequested),
            Some(Ok(()))
        ));
        assert!(disconnect_outcome(&DisconnectReason::Recycled).is_none());

        let lost = disconnect_outcome(&DisconnectReason::ConnectionLost).unwrap();
        assert_eq!(lost.unwrap_err().kind(), ErrorKind::ConnectionLost);

        let failed = disconnect_outcome(&DisconnectReason::Failed(ErrorKind::AuthFailed)).unwrap();
        assert_eq!(failed.unwrap_err().kind(), ErrorKind::AuthFailed);
    }

    #[test]
    fn test_catalog_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("feed.csv");
        let err = AppState::new(AppConfig::default(), Some(&missing))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Catalog);
    }
}
