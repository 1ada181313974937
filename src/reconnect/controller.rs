//! Auto-reconnect actor.
//!
//! Drives the connection manager through the catalog: pick the best eligible
//! endpoint, wait for it to connect or fail, mark failures, move on, and
//! refresh the catalog when nothing is left.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use super::cursor::{refresh_backoff, select_candidate, ReconnectCursor, Selection};
use super::{ReconnectEvent, ReconnectSettings, ReconnectSnapshot};
use crate::catalog::{sorted_by_speed, CatalogSource, CatalogStore, EndpointRecord};
use crate::connection::{AttemptId, ConnectionManager, DisconnectReason, ManagerEvent};
use crate::error::{AppError, ErrorKind, Result};

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 128;

enum Command {
    Enable { reply: oneshot::Sender<()> },
    Disable { reply: oneshot::Sender<()> },
    TryNext { reply: oneshot::Sender<()> },
    Snapshot { reply: oneshot::Sender<ReconnectSnapshot> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to the reconnect actor.
#[derive(Clone)]
pub struct AutoReconnectController {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ReconnectEvent>,
}

impl AutoReconnectController {
    pub fn spawn(
        manager: ConnectionManager,
        store: Arc<CatalogStore>,
        source: Arc<dyn CatalogSource>,
        settings: ReconnectSettings,
    ) -> Self {
        let (commands, mailbox) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let manager_events = manager.subscribe();
        let generation = store.generation();

        let actor = Controller {
            manager,
            store,
            source,
            settings,
            mailbox,
            manager_events,
            events: events.clone(),
            enabled: false,
            cursor: ReconnectCursor {
                generation,
                ..ReconnectCursor::default()
            },
            current: None,
            stable_at: None,
            retry_at: None,
            refresh_streak: 0,
            abandoned: Vec::new(),
        };
        tokio::spawn(actor.run());

        Self { commands, events }
    }

    pub async fn enable(&self) -> Result<()> {
        self.request(|reply| Command::Enable { reply }).await
    }

    /// Stop selecting endpoints. An established tunnel is left alone.
    pub async fn disable(&self) -> Result<()> {
        self.request(|reply| Command::Disable { reply }).await
    }

    /// Run one selection step now. No-op while disabled or mid-connection.
    pub async fn try_next(&self) -> Result<()> {
        self.request(|reply| Command::TryNext { reply }).await
    }

    pub async fn snapshot(&self) -> Result<ReconnectSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AppError::manager_closed())?;
        rx.await.map_err(|_| AppError::manager_closed())
    }
}

/// The attempt the controller is waiting on or holding.
struct Current {
    endpoint: String,
    index: usize,
    /// `None` while the manager rebuilds the tunnel under a new attempt id.
    attempt: Option<AttemptId>,
    connected: bool,
    check_at: Instant,
}

impl Current {
    fn owns(&self, endpoint: &str, attempt: AttemptId) -> bool {
        match self.attempt {
            Some(id) => id == attempt,
            None => self.endpoint == endpoint,
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Manager(std::result::Result<ManagerEvent, RecvError>),
    Timer,
}

struct Controller {
    manager: ConnectionManager,
    store: Arc<CatalogStore>,
    source: Arc<dyn CatalogSource>,
    settings: ReconnectSettings,
    mailbox: mpsc::Receiver<Command>,
    manager_events: broadcast::Receiver<ManagerEvent>,
    events: broadcast::Sender<ReconnectEvent>,
    enabled: bool,
    cursor: ReconnectCursor,
    current: Option<Current>,
    stable_at: Option<Instant>,
    retry_at: Option<Instant>,
    /// Refreshes since the last successful connection.
    refresh_streak: u32,
    /// Endpoints whose attempt the controller dropped itself; their
    /// `Disconnected` events are already accounted for.
    abandoned: Vec<String>,
}

impl Controller {
    async fn run(mut self) {
        loop {
            let timer = self.next_timer();
            let wake = tokio::select! {
                command = self.mailbox.recv() => Wake::Command(command),
                event = self.manager_events.recv() => Wake::Manager(event),
                () = sleep_until(timer) => Wake::Timer,
            };

            match wake {
                Wake::Command(Some(command)) => {
                    if !self.handle(command).await {
                        break;
                    }
                }
                Wake::Command(None) => break,
                Wake::Manager(Ok(event)) => self.on_manager_event(event),
                Wake::Manager(Err(RecvError::Lagged(missed))) => {
                    log::warn!("Reconnect controller missed {} connection events", missed);
                }
                Wake::Manager(Err(RecvError::Closed)) => {
                    log::warn!("Connection manager gone, auto-reconnect stopped");
                    break;
                }
                Wake::Timer => self.on_timer().await,
            }
        }
        log::debug!("Reconnect controller stopped");
    }

    fn next_timer(&self) -> Option<Instant> {
        let check = self
            .current
            .as_ref()
            .filter(|c| !c.connected)
            .map(|c| c.check_at);
        [check, self.stable_at, self.retry_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Returns `false` when the actor should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Enable { reply } => {
                self.enable();
                let _ = reply.send(());
            }
            Command::Disable { reply } => {
                self.disable();
                let _ = reply.send(());
            }
            Command::TryNext { reply } => {
                self.try_next().await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.disable();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        self.refresh_streak = 0;
        self.abandoned.clear();
        self.cursor.reset(self.store.generation());
        log::info!("Auto-reconnect enabled");
        self.emit(ReconnectEvent::Enabled);
        self.retry_at = Some(Instant::now());
    }

    fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        self.current = None;
        self.stable_at = None;
        self.retry_at = None;
        self.abandoned.clear();
        self.cursor.reset(self.store.generation());
        log::info!("Auto-reconnect disabled");
        self.emit(ReconnectEvent::Disabled);
    }

    fn snapshot(&self) -> ReconnectSnapshot {
        let mut failed: Vec<String> = self.store.failed().into_iter().collect();
        failed.sort();
        ReconnectSnapshot {
            enabled: self.enabled,
            cursor: self.cursor.clone(),
            connected: self
                .current
                .as_ref()
                .filter(|c| c.connected)
                .map(|c| c.endpoint.clone()),
            failed,
            blocked: self.store.blocked().into_iter().collect(),
            catalog_size: self.store.endpoints().len(),
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if self
            .current
            .as_ref()
            .is_some_and(|c| !c.connected && c.check_at <= now)
        {
            self.on_check_deadline().await;
        }
        if self.stable_at.is_some_and(|at| at <= now) {
            self.on_stable();
        }
        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            self.try_next().await;
        }
    }

    async fn try_next(&mut self) {
        if !self.enabled || self.current.is_some() {
            return;
        }
        if !self.manager.status().is_disconnected() {
            // Resumed by the Disconnected event of whoever holds the tunnel.
            log::debug!("Connection busy, selection skipped");
            return;
        }
        self.retry_at = None;

        if self.cursor.generation != self.store.generation() {
            self.cursor.reset(self.store.generation());
        }
        let start = self.cursor.index.unwrap_or(0);
        let selection = self.store.with_view(|view| select_candidate(view, start));

        match selection {
            Selection::Candidate { index, endpoint } => self.attempt(index, endpoint).await,
            Selection::Exhausted => self.refresh().await,
        }
    }

    async fn attempt(&mut self, index: usize, endpoint: EndpointRecord) {
        let name = endpoint.name.clone();
        self.cursor.index = Some(index);
        self.cursor.attempts += 1;
        self.cursor.target = Some(name.clone());

        log::info!(
            "Auto-reconnect attempt {}: {} ({}, {:.1} Mbps)",
            self.cursor.attempts,
            name,
            endpoint.country,
            endpoint.speed_mbps
        );
        self.emit(ReconnectEvent::Attempting {
            endpoint: name.clone(),
            index,
            attempt: self.cursor.attempts,
        });

        match self.manager.connect(endpoint).await {
            Ok(attempt) => {
                self.current = Some(Current {
                    endpoint: name,
                    index,
                    attempt: Some(attempt),
                    connected: false,
                    check_at: Instant::now() + self.settings.check_after(),
                });
            }
            Err(e) if e.kind().is_attempt_failure() => {
                self.abandoned.push(name.clone());
                self.mark_failed(&name, Some(index), e.kind());
                self.retry_at = Some(Instant::now());
            }
            Err(e) if e.kind() == ErrorKind::ManagerClosed => {
                log::error!("Connection manager closed, disabling auto-reconnect");
                self.disable();
            }
            Err(e) => {
                // Someone else holds the connection; its Disconnected event resumes us.
                log::info!("Auto-reconnect deferred: {}", e);
                self.cursor.target = None;
            }
        }
    }

    fn mark_failed(&mut self, endpoint: &str, index: Option<usize>, reason: ErrorKind) {
        self.store.mark_failed(endpoint);
        if let Some(index) = index {
            self.cursor.advance_past(index);
        }
        log::warn!("Endpoint {} failed: {}", endpoint, reason.describe());
        self.emit(ReconnectEvent::AttemptFailed {
            endpoint: endpoint.to_string(),
            reason,
        });
    }

    async fn on_check_deadline(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        // The Connected event was lost to lag; trust the status instead.
        if self.manager.status().is_connected() {
            self.current = Some(Current {
                connected: true,
                ..current
            });
            self.stable_at = Some(Instant::now() + self.settings.stability_window);
            return;
        }

        log::warn!(
            "{} not connected after {:?}, giving up on it",
            current.endpoint,
            self.settings.check_after()
        );
        self.abandoned.push(current.endpoint.clone());
        if let Err(e) = self.manager.disconnect().await {
            log::warn!("Failed to stop stalled attempt: {}", e);
        }
        self.mark_failed(&current.endpoint, Some(current.index), ErrorKind::Timeout);
        self.retry_at = Some(Instant::now());
    }

    fn on_stable(&mut self) {
        self.stable_at = None;
        let Some(current) = self.current.as_ref().filter(|c| c.connected) else {
            return;
        };
        let endpoint = current.endpoint.clone();
        let cleared = self.store.clear_failed();
        self.cursor.attempts = 0;
        log::info!(
            "{} stable for {:?}, cleared {} failed endpoints",
            endpoint,
            self.settings.stability_window,
            cleared
        );
        self.emit(ReconnectEvent::Stable { endpoint, cleared });
    }

    async fn refresh(&mut self) {
        log::info!("No eligible endpoint left, refreshing catalog");
        self.emit(ReconnectEvent::RefreshRequested);

        match self.source.fetch().await {
            Ok(endpoints) if !endpoints.is_empty() => {
                let count = endpoints.len();
                let generation = self.store.replace(sorted_by_speed(&endpoints));
                self.emit(ReconnectEvent::CatalogRefreshed {
                    endpoints: count,
                    generation,
                });
            }
            Ok(_) => {
                self.emit(ReconnectEvent::RefreshFailed {
                    message: "catalog source returned no endpoints".to_string(),
                });
            }
            Err(e) => {
                log::warn!("Catalog refresh failed: {}", e);
                self.emit(ReconnectEvent::RefreshFailed {
                    message: e.to_string(),
                });
            }
        }

        let cleared = self.store.clear_failed();
        log::debug!("Cleared {} failed endpoints", cleared);
        self.cursor.reset(self.store.generation());

        let delay = refresh_backoff(self.refresh_streak, self.settings.max_refresh_backoff);
        self.refresh_streak = self.refresh_streak.saturating_add(1);
        self.emit(ReconnectEvent::Backoff {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        self.retry_at = Some(Instant::now() + delay);
    }

    fn on_manager_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Connected { endpoint, attempt } => {
                let Some(current) = self.current.as_mut() else {
                    return;
                };
                if !current.owns(&endpoint, attempt) {
                    return;
                }
                current.attempt = Some(attempt);
                current.connected = true;
                self.refresh_streak = 0;
                self.abandoned.clear();
                self.stable_at = Some(Instant::now() + self.settings.stability_window);
                self.emit(ReconnectEvent::Connected { endpoint });
            }
            ManagerEvent::Disconnected {
                endpoint,
                attempt,
                reason,
            } => {
                match self.current.as_ref() {
                    Some(current) if current.owns(&endpoint, attempt) => {
                        self.on_owned_disconnect(reason);
                    }
                    Some(_) => {}
                    None => self.on_foreign_disconnect(&endpoint, reason),
                }
            }
            ManagerEvent::Status { .. } | ManagerEvent::Log { .. } => {}
        }
    }

    fn on_owned_disconnect(&mut self, reason: DisconnectReason) {
        match reason {
            DisconnectReason::Recycled => {
                if let Some(current) = self.current.as_mut() {
                    current.attempt = None;
                    current.connected = false;
                    current.check_at = Instant::now() + self.settings.check_after();
                }
                self.stable_at = None;
            }
            DisconnectReason::Failed(kind) => {
                if let Some(current) = self.current.take() {
                    self.mark_failed(&current.endpoint, Some(current.index), kind);
                }
                self.retry_at = Some(Instant::now());
            }
            DisconnectReason::ConnectionLost => {
                if let Some(current) = self.current.take() {
                    self.mark_failed(
                        &current.endpoint,
                        Some(current.index),
                        ErrorKind::ConnectionLost,
                    );
                }
                self.stable_at = None;
                self.retry_at = Some(Instant::now() + self.settings.loss_retry_delay);
            }
            DisconnectReason::UserRequested => {
                log::info!("Tunnel closed by request, pausing auto-reconnect");
                self.disable();
            }
        }
    }

    /// A tunnel the controller was not tracking went down: one connected by
    /// hand, or one left up across `disable`/`enable`.
    fn on_foreign_disconnect(&mut self, endpoint: &str, reason: DisconnectReason) {
        if let Some(pos) = self.abandoned.iter().position(|name| name == endpoint) {
            self.abandoned.swap_remove(pos);
            return;
        }
        if !self.enabled {
            return;
        }
        match reason {
            DisconnectReason::Recycled => {}
            DisconnectReason::UserRequested => {
                log::info!("Tunnel closed by request, pausing auto-reconnect");
                self.disable();
            }
            DisconnectReason::Failed(kind) => {
                self.mark_failed(endpoint, None, kind);
                self.retry_at = Some(Instant::now());
            }
            DisconnectReason::ConnectionLost => {
                self.mark_failed(endpoint, None, ErrorKind::ConnectionLost);
                self.stable_at = None;
                self.retry_at = Some(Instant::now() + self.settings.loss_retry_delay);
            }
        }
    }

    fn emit(&self, event: ReconnectEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::catalog::test_support::endpoint;
    use crate::catalog::StaticCatalogSource;
    use crate::connection::ManagerSettings;
    use crate::engine::test_support::fake_engine;
    use crate::engine::{EngineSpec, COMPLETION_MARKER};

    const CONNECT_TIMEOUT: Duration = Duration::from_millis(600);

    /// Connects only endpoints whose name starts with `prefix`; others stay silent.
    fn engine_connecting(dir: &Path, interface: &str, prefix: &str) -> EngineSpec {
        let body = format!(
            "if grep -q '^# {prefix}' \"$CONFIG\"; then echo '{COMPLETION_MARKER}'; fi\nexec sleep 30"
        );
        fake_engine(dir, interface, &body)
    }

    struct Harness {
        controller: AutoReconnectController,
        manager: ConnectionManager,
        store: Arc<CatalogStore>,
        source: Arc<StaticCatalogSource>,
        events: broadcast::Receiver<ReconnectEvent>,
    }

    fn harness(
        dir: &Path,
        engine: EngineSpec,
        store: CatalogStore,
        source: StaticCatalogSource,
        tweak: impl FnOnce(&mut ReconnectSettings),
    ) -> Harness {
        let mut manager_settings = ManagerSettings::new(engine, CONNECT_TIMEOUT, dir.join("run"));
        manager_settings.grace_period = Duration::from_secs(1);
        manager_settings.config_delete_delay = Duration::from_secs(2);
        let manager = ConnectionManager::spawn(manager_settings);

        let mut settings = ReconnectSettings::new(CONNECT_TIMEOUT);
        settings.check_margin = Duration::from_millis(400);
        settings.loss_retry_delay = Duration::from_millis(100);
        tweak(&mut settings);

        let store = Arc::new(store);
        let source = Arc::new(source);
        let dyn_source: Arc<dyn CatalogSource> = Arc::clone(&source) as Arc<dyn CatalogSource>;
        let controller =
            AutoReconnectController::spawn(manager.clone(), Arc::clone(&store), dyn_source, settings);
        let events = controller.subscribe();
        Harness {
            controller,
            manager,
            store,
            source,
            events,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ReconnectEvent>) -> ReconnectEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(15), rx.recv()).await {
                Ok(Ok(event)) => return event,
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => panic!("event channel closed"),
                Err(_) => panic!("no reconnect event within 15s"),
            }
        }
    }

    /// Collect events up to and including the first that matches `stop`.
    async fn events_until(
        rx: &mut broadcast::Receiver<ReconnectEvent>,
        stop: impl Fn(&ReconnectEvent) -> bool,
    ) -> Vec<ReconnectEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = stop(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn attempted(events: &[ReconnectEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ReconnectEvent::Attempting { endpoint, .. } => Some(endpoint.clone()),
                _ => None,
            })
            .collect()
    }

    fn is_connected(event: &ReconnectEvent) -> bool {
        matches!(event, ReconnectEvent::Connected { .. })
    }

    #[tokio::test]
    async fn test_timed_out_endpoint_is_failed_and_next_is_tried() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcA0", "S2");
        let store = CatalogStore::with_endpoints(vec![
            endpoint("S1", "JP", 80.0),
            endpoint("S2", "KR", 20.0),
        ]);
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.controller.enable().await.unwrap();
        let events = events_until(&mut h.events, is_connected).await;

        assert_eq!(attempted(&events), ["S1", "S2"]);
        assert!(events.contains(&ReconnectEvent::AttemptFailed {
            endpoint: "S1".to_string(),
            reason: ErrorKind::Timeout,
        }));
        assert!(h.store.is_failed("S1"));
        assert!(!h.store.is_failed("S2"));
        assert_eq!(h.manager.status().endpoint(), Some("S2"));

        let snapshot = h.controller.snapshot().await.unwrap();
        assert_eq!(snapshot.cursor.index, Some(1));
        assert_eq!(snapshot.connected.as_deref(), Some("S2"));
        assert_eq!(snapshot.failed, ["S1"]);
        assert_eq!(h.source.fetch_count(), 0);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_unfailed_endpoint_is_selected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcN0", "S");
        let store = CatalogStore::with_endpoints(vec![
            endpoint("S1", "JP", 90.0),
            endpoint("S2", "JP", 60.0),
            endpoint("S3", "JP", 30.0),
        ]);
        store.mark_failed("S1");
        store.mark_failed("S2");
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.controller.enable().await.unwrap();
        let events = events_until(&mut h.events, is_connected).await;
        assert_eq!(attempted(&events), ["S3"]);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_all_failed_triggers_refresh_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcR0", "F");
        let store = CatalogStore::with_endpoints(vec![
            endpoint("S1", "JP", 90.0),
            endpoint("S2", "JP", 60.0),
        ]);
        store.mark_failed("S1");
        store.mark_failed("S2");
        let source = StaticCatalogSource::new(vec![
            endpoint("F1", "KR", 10.0),
            endpoint("F2", "US", 70.0),
        ]);
        let mut h = harness(dir.path(), engine, store, source, |_| {});

        h.controller.enable().await.unwrap();
        let events = events_until(&mut h.events, is_connected).await;

        let refreshed = events
            .iter()
            .position(|e| matches!(e, ReconnectEvent::CatalogRefreshed { .. }))
            .unwrap();
        let first_attempt = events
            .iter()
            .position(|e| matches!(e, ReconnectEvent::Attempting { .. }))
            .unwrap();
        assert!(refreshed < first_attempt);
        // Refreshed catalog is re-ranked by speed.
        assert_eq!(attempted(&events), ["F2"]);
        assert_eq!(h.source.fetch_count(), 1);
        assert!(h.store.failed().is_empty());

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_connection_moves_to_next_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "echo '{COMPLETION_MARKER}'\n\
             if grep -q '^# L1' \"$CONFIG\"; then sleep 0.3; exit 1; fi\n\
             exec sleep 30"
        );
        let engine = fake_engine(dir.path(), "tunrcL0", &body);
        let store = CatalogStore::with_endpoints(vec![
            endpoint("L1", "JP", 90.0),
            endpoint("L2", "JP", 10.0),
        ]);
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.controller.enable().await.unwrap();
        let first = events_until(&mut h.events, is_connected).await;
        assert_eq!(attempted(&first), ["L1"]);

        let second = events_until(&mut h.events, is_connected).await;
        assert!(second.contains(&ReconnectEvent::AttemptFailed {
            endpoint: "L1".to_string(),
            reason: ErrorKind::ConnectionLost,
        }));
        assert_eq!(attempted(&second), ["L2"]);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    async fn wait_connected(manager: &ConnectionManager) {
        for _ in 0..100 {
            if manager.status().is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("manual connection never came up");
    }

    #[tokio::test]
    async fn test_lost_manual_connection_resumes_selection() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "echo '{COMPLETION_MARKER}'\n\
             if grep -q '^# M1' \"$CONFIG\"; then sleep 0.8; exit 1; fi\n\
             exec sleep 30"
        );
        let engine = fake_engine(dir.path(), "tunrcF0", &body);
        let store = CatalogStore::with_endpoints(vec![
            endpoint("M1", "JP", 90.0),
            endpoint("S2", "KR", 10.0),
        ]);
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.manager.connect(endpoint("M1", "JP", 90.0)).await.unwrap();
        wait_connected(&h.manager).await;
        h.controller.enable().await.unwrap();

        let events = events_until(&mut h.events, is_connected).await;
        assert!(events.contains(&ReconnectEvent::AttemptFailed {
            endpoint: "M1".to_string(),
            reason: ErrorKind::ConnectionLost,
        }));
        assert_eq!(attempted(&events), ["S2"]);
        assert!(h.store.is_failed("M1"));
        assert_eq!(h.manager.status().endpoint(), Some("S2"));

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reenable_with_tunnel_up_waits_for_loss() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "echo '{COMPLETION_MARKER}'\n\
             if grep -q '^# R1' \"$CONFIG\"; then sleep 1; exit 1; fi\n\
             exec sleep 30"
        );
        let engine = fake_engine(dir.path(), "tunrcB0", &body);
        let store = CatalogStore::with_endpoints(vec![
            endpoint("R1", "JP", 90.0),
            endpoint("R2", "KR", 10.0),
        ]);
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.controller.enable().await.unwrap();
        events_until(&mut h.events, is_connected).await;
        h.controller.disable().await.unwrap();
        h.controller.enable().await.unwrap();

        let events = events_until(&mut h.events, is_connected).await;
        assert!(events.contains(&ReconnectEvent::AttemptFailed {
            endpoint: "R1".to_string(),
            reason: ErrorKind::ConnectionLost,
        }));
        assert_eq!(attempted(&events), ["R2"]);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_attempt_does_not_pause_controller() {
        // The controller's own disconnect of a stalled attempt is not a user request.
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcT0", "T2");
        let store = CatalogStore::with_endpoints(vec![
            endpoint("T1", "JP", 80.0),
            endpoint("T2", "KR", 20.0),
        ]);
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.controller.enable().await.unwrap();
        let events = events_until(&mut h.events, is_connected).await;
        assert!(!events.contains(&ReconnectEvent::Disabled));
        assert!(h.controller.snapshot().await.unwrap().enabled);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stability_window_clears_failures() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcS0", "A");
        let store = CatalogStore::with_endpoints(vec![
            endpoint("X", "JP", 90.0),
            endpoint("A", "JP", 10.0),
        ]);
        store.mark_failed("X");
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |s| {
            s.stability_window = Duration::from_millis(300);
        });

        h.controller.enable().await.unwrap();
        let events =
            events_until(&mut h.events, |e| matches!(e, ReconnectEvent::Stable { .. })).await;
        assert!(events.contains(&ReconnectEvent::Stable {
            endpoint: "A".to_string(),
            cleared: 1,
        }));
        assert!(h.store.failed().is_empty());
        assert_eq!(h.controller.snapshot().await.unwrap().cursor.attempts, 0);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_controller_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcD0", "S");
        let store = CatalogStore::with_endpoints(vec![endpoint("S1", "JP", 90.0)]);
        let h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.controller.try_next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.manager.status().is_disconnected());
        assert!(!h.controller.snapshot().await.unwrap().enabled);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_disconnect_pauses_controller() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcU0", "S");
        let store = CatalogStore::with_endpoints(vec![endpoint("S1", "JP", 90.0)]);
        let mut h = harness(dir.path(), engine, store, StaticCatalogSource::new(vec![]), |_| {});

        h.controller.enable().await.unwrap();
        events_until(&mut h.events, is_connected).await;
        h.manager.disconnect().await.unwrap();
        events_until(&mut h.events, |e| *e == ReconnectEvent::Disabled).await;

        assert!(!h.store.is_failed("S1"));
        assert!(h.manager.status().is_disconnected());
        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_refresh_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_connecting(dir.path(), "tunrcE0", "S");
        let mut h = harness(
            dir.path(),
            engine,
            CatalogStore::new(),
            StaticCatalogSource::new(vec![]),
            |_| {},
        );

        h.controller.enable().await.unwrap();
        let events =
            events_until(&mut h.events, |e| matches!(e, ReconnectEvent::Backoff { .. })).await;
        assert!(events.iter().any(|e| matches!(e, ReconnectEvent::RefreshFailed { .. })));
        assert!(events.contains(&ReconnectEvent::Backoff { delay_ms: 1000 }));
        assert_eq!(h.source.fetch_count(), 1);

        h.controller.shutdown().await.unwrap();
        h.manager.shutdown().await.unwrap();
    }
}
