//! Connection manager actor.
//!
//! All transitions run on one task: commands, engine log lines and timers are
//! funnelled through a single `select!` so no two transitions interleave.

use std::process::ExitStatus;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{
    AttemptId, ConnectionInfo, ConnectionStatus, DisconnectReason, ManagerEvent, ManagerSettings,
    StatusKind,
};
use crate::catalog::EndpointRecord;
use crate::compose::compose;
use crate::engine::{
    classify, schedule_removal, sweep_stray_engines, write_run_config, EngineProcess, LogMarker,
};
use crate::error::{AppError, ErrorKind, Result};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

enum Command {
    Connect {
        endpoint: Box<EndpointRecord>,
        reply: oneshot::Sender<Result<AttemptId>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Info {
        reply: oneshot::Sender<Option<ConnectionInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the connection actor. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<ManagerEvent>,
}

impl ConnectionManager {
    /// Start the actor. Must be called inside a tokio runtime.
    pub fn spawn(settings: ManagerSettings) -> Self {
        let (commands, mailbox) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let actor = Actor {
            settings,
            mailbox,
            status: status_tx,
            events: events.clone(),
            session: None,
            next_attempt: 1,
        };
        tokio::spawn(actor.run());

        Self {
            commands,
            status,
            events,
        }
    }

    /// Begin connecting. Returns once the engine is running, not once the
    /// tunnel is up; watch the status or events for the outcome.
    pub async fn connect(&self, endpoint: EndpointRecord) -> Result<AttemptId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            endpoint: Box::new(endpoint),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::manager_closed())?
    }

    /// Stop the engine if any. Completes after the process is gone.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| AppError::manager_closed())
    }

    pub async fn connection_info(&self) -> Result<Option<ConnectionInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Info { reply }).await?;
        rx.await.map_err(|_| AppError::manager_closed())
    }

    /// Stop the engine and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| AppError::manager_closed())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::manager_closed())
    }
}

enum Phase {
    Connecting {
        started_at: DateTime<Local>,
        deadline: Instant,
    },
    Connected {
        since: DateTime<Local>,
    },
}

struct Session {
    endpoint: EndpointRecord,
    attempt: AttemptId,
    process: EngineProcess,
    phase: Phase,
    /// Set while a soft reset for compression framing is outstanding.
    recovery_deadline: Option<Instant>,
    /// The engine announced its own shutdown.
    exiting: bool,
}

impl Session {
    fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected { .. })
    }

    fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Connecting { deadline, .. } => Some(deadline),
            Phase::Connected { .. } => self.recovery_deadline,
        }
    }

    fn status(&self) -> ConnectionStatus {
        match self.phase {
            Phase::Connecting { started_at, .. } => ConnectionStatus::Connecting {
                endpoint: self.endpoint.name.clone(),
                attempt: self.attempt,
                started_at,
            },
            Phase::Connected { since } => ConnectionStatus::Connected {
                endpoint: self.endpoint.name.clone(),
                attempt: self.attempt,
                since,
            },
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Line(Option<String>),
    Deadline,
}

struct Actor {
    settings: ManagerSettings,
    mailbox: mpsc::Receiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ManagerEvent>,
    session: Option<Session>,
    next_attempt: AttemptId,
}

impl Actor {
    async fn run(mut self) {
        sweep_stray_engines(&self.settings.engine.interface).await;

        loop {
            let wake = match self.session.as_mut() {
                None => Wake::Command(self.mailbox.recv().await),
                Some(session) => {
                    let deadline = session.deadline();
                    tokio::select! {
                        command = self.mailbox.recv() => Wake::Command(command),
                        line = session.process.next_line() => Wake::Line(line),
                        () = sleep_until(deadline) => Wake::Deadline,
                    }
                }
            };

            match wake {
                Wake::Command(Some(command)) => {
                    if !self.handle(command).await {
                        return;
                    }
                }
                Wake::Command(None) => break,
                Wake::Line(Some(line)) => self.on_line(line).await,
                Wake::Line(None) => self.on_exit().await,
                Wake::Deadline => self.on_deadline().await,
            }
        }

        self.teardown().await;
        log::debug!("Connection manager stopped");
    }

    /// Returns `false` when the actor should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { endpoint, reply } => {
                let result = self.connect(*endpoint).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Info { reply } => {
                let _ = reply.send(self.info());
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self, endpoint: EndpointRecord) -> Result<AttemptId> {
        if let Some(session) = &self.session {
            return Err(if session.is_connected() {
                AppError::already_connected(&session.endpoint.name)
            } else {
                AppError::already_connecting(&session.endpoint.name)
            });
        }

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let started_at = Local::now();

        self.publish(ConnectionStatus::Connecting {
            endpoint: endpoint.name.clone(),
            attempt,
            started_at,
        });
        self.status_event(
            StatusKind::Info,
            format!("Connecting to {} ({})...", endpoint.name, endpoint.country),
        );

        match self.start_engine(&endpoint).await {
            Ok(process) => {
                let deadline = Instant::now() + self.settings.connect_timeout;
                self.session = Some(Session {
                    endpoint,
                    attempt,
                    process,
                    phase: Phase::Connecting {
                        started_at,
                        deadline,
                    },
                    recovery_deadline: None,
                    exiting: false,
                });
                Ok(attempt)
            }
            Err(e) => {
                self.status_event(
                    StatusKind::Error,
                    format!("Failed to start {}: {}", endpoint.name, e),
                );
                self.publish(ConnectionStatus::Disconnected);
                self.emit(ManagerEvent::Disconnected {
                    endpoint: endpoint.name,
                    attempt,
                    reason: DisconnectReason::Failed(e.kind()),
                });
                Err(e)
            }
        }
    }

    async fn start_engine(&self, endpoint: &EndpointRecord) -> Result<EngineProcess> {
        sweep_stray_engines(&self.settings.engine.interface).await;

        let raw = endpoint.decode_config()?;
        let text = compose(&raw, &self.settings.compose)?;
        let path = write_run_config(&self.settings.run_dir, &text)?;
        schedule_removal(path.clone(), self.settings.config_delete_delay);

        EngineProcess::spawn(
            &self.settings.engine,
            &path,
            self.settings.connect_timeout,
            &endpoint.credentials,
            &endpoint.name,
        )
        .await
    }

    async fn disconnect(&mut self) {
        let Some(name) = self.session.as_ref().map(|s| s.endpoint.name.clone()) else {
            log::debug!("Disconnect ignored: already disconnected");
            return;
        };
        self.end_session(
            DisconnectReason::UserRequested,
            StatusKind::Info,
            format!("Disconnected from {name}"),
        )
        .await;
    }

    async fn teardown(&mut self) {
        if self.session.is_some() {
            self.end_session(
                DisconnectReason::UserRequested,
                StatusKind::Info,
                "Connection manager shutting down".to_string(),
            )
            .await;
        }
    }

    fn info(&self) -> Option<ConnectionInfo> {
        self.session.as_ref().map(|s| ConnectionInfo {
            endpoint: s.endpoint.clone(),
            attempt: s.attempt,
            pid: s.process.pid(),
            interface: self.settings.engine.interface.clone(),
            status: s.status(),
        })
    }

    async fn on_line(&mut self, line: String) {
        let Some((endpoint, connected)) = self
            .session
            .as_ref()
            .map(|s| (s.endpoint.name.clone(), s.is_connected()))
        else {
            return;
        };

        let marker = classify(&line);
        self.emit(ManagerEvent::Log {
            endpoint: endpoint.clone(),
            line,
        });
        let Some(marker) = marker else {
            return;
        };

        match marker {
            LogMarker::Completed if connected => self.finish_recovery(),
            LogMarker::Completed => self.mark_connected(),
            LogMarker::CompressionFraming if connected => self.start_recovery(),
            LogMarker::CompressionFraming => self.status_event(
                StatusKind::Warning,
                format!("{}: {} during negotiation", endpoint, marker.describe()),
            ),
            LogMarker::Exiting => {
                if let Some(session) = self.session.as_mut() {
                    session.exiting = true;
                }
                log::info!("{}: {}", endpoint, marker.describe());
            }
            _ => {
                let Some(kind) = marker.error_kind() else {
                    return;
                };
                if connected {
                    self.status_event(
                        StatusKind::Warning,
                        format!("{}: {}", endpoint, marker.describe()),
                    );
                } else {
                    self.end_session(
                        DisconnectReason::Failed(kind),
                        StatusKind::Error,
                        format!("{}: {}", endpoint, marker.describe()),
                    )
                    .await;
                }
            }
        }
    }

    fn mark_connected(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.phase = Phase::Connected { since: Local::now() };
        let status = session.status();
        let endpoint = session.endpoint.name.clone();
        let attempt = session.attempt;

        self.publish(status);
        self.status_event(StatusKind::Success, format!("Connected to {endpoint}"));
        self.emit(ManagerEvent::Connected { endpoint, attempt });
    }

    fn start_recovery(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.recovery_deadline.is_some() {
            return;
        }
        session.recovery_deadline = Some(Instant::now() + self.settings.compression_window);
        let endpoint = session.endpoint.name.clone();

        let message = match session.process.soft_restart() {
            Ok(()) => format!("{endpoint}: compression framing mismatch, soft reset requested"),
            Err(e) => format!("{endpoint}: compression framing mismatch, soft reset unavailable ({e})"),
        };
        self.status_event(StatusKind::Warning, message);
    }

    fn finish_recovery(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.recovery_deadline.take().is_some() {
            let endpoint = session.endpoint.name.clone();
            self.status_event(
                StatusKind::Info,
                format!("{endpoint}: tunnel recovered after soft reset"),
            );
        }
    }

    async fn on_deadline(&mut self) {
        let Some((endpoint, connected)) = self
            .session
            .as_ref()
            .map(|s| (s.endpoint.clone(), s.is_connected()))
        else {
            return;
        };

        if connected {
            self.recycle(endpoint).await;
        } else {
            self.end_session(
                DisconnectReason::Failed(ErrorKind::Timeout),
                StatusKind::Error,
                format!(
                    "{}: connection timed out after {:?}",
                    endpoint.name, self.settings.connect_timeout
                ),
            )
            .await;
        }
    }

    /// Full stop and reconnect to the same endpoint.
    async fn recycle(&mut self, endpoint: EndpointRecord) {
        self.end_session(
            DisconnectReason::Recycled,
            StatusKind::Warning,
            format!(
                "{}: compression mismatch persisted, reconnecting",
                endpoint.name
            ),
        )
        .await;
        if let Err(e) = self.connect(endpoint).await {
            log::warn!("Reconnect after compression recovery failed: {}", e);
        }
    }

    /// Both output streams closed: the engine is exiting or gone.
    async fn on_exit(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let exit = session.process.finish().await;
        let connected = session.is_connected();
        let exiting = session.exiting;
        let endpoint = session.endpoint.name.clone();

        let (reason, message) = if connected && exiting {
            (
                DisconnectReason::ConnectionLost,
                format!("{endpoint}: engine shut down ({})", describe_exit(exit)),
            )
        } else if connected {
            (
                DisconnectReason::ConnectionLost,
                format!("{endpoint}: connection lost ({})", describe_exit(exit)),
            )
        } else if exit.is_some_and(|s| s.success()) {
            (
                DisconnectReason::Failed(ErrorKind::EngineExited),
                format!("{endpoint}: engine exited cleanly but no tunnel was confirmed"),
            )
        } else {
            (
                DisconnectReason::Failed(ErrorKind::EngineExited),
                format!(
                    "{endpoint}: engine exited before the tunnel was confirmed ({})",
                    describe_exit(exit)
                ),
            )
        };
        self.end_session(reason, StatusKind::Error, message).await;
    }

    /// Stop the engine, sweep, then publish `Disconnected`.
    async fn end_session(&mut self, reason: DisconnectReason, kind: StatusKind, message: String) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.process.stop(self.settings.grace_period).await;
        sweep_stray_engines(&self.settings.engine.interface).await;

        self.status_event(kind, message);
        self.publish(ConnectionStatus::Disconnected);
        self.emit(ManagerEvent::Disconnected {
            endpoint: session.endpoint.name,
            attempt: session.attempt,
            reason,
        });
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn status_event(&self, kind: StatusKind, message: String) {
        match kind {
            StatusKind::Info | StatusKind::Success => log::info!("{}", message),
            StatusKind::Warning => log::warn!("{}", message),
            StatusKind::Error => log::error!("{}", message),
        }
        self.emit(ManagerEvent::Status { kind, message });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn describe_exit(exit: Option<ExitStatus>) -> String {
    exit.map_or_else(|| "exit status unknown".to_string(), |s| s.to_string())
}
