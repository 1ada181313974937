//! Disposable reachability probes.
//!
//! A probe is a real connection attempt that is torn down as soon as the
//! outcome is known. It never shares an interface with the connection manager.

mod batch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::catalog::EndpointRecord;
use crate::compose::{compose, ComposePolicy};
use crate::config::AppConfig;
use crate::engine::{
    classify, schedule_removal, sweep_stray_engines, write_run_config, EngineProcess, EngineSpec,
    LogMarker, CONFIG_DELETE_DELAY, GRACE_PERIOD,
};
use crate::error::{AppError, ErrorKind, Result};
use crate::paths::get_run_dir;

pub use batch::{probe_catalog, ProbeReport, WorkingEndpoint};

/// Caller-settable cancellation flag shared by a probe or a sweep.
#[derive(Debug, Clone)]
pub struct ProbeCancel {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for ProbeCancel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeCancel {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub endpoint: String,
    pub success: bool,
    pub message: String,
    pub elapsed_ms: u64,
    pub error: Option<ErrorKind>,
}

impl ProbeOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.error == Some(ErrorKind::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub engine: EngineSpec,
    /// Concurrent probes use `<prefix><slot>` as their interface.
    pub interface_prefix: String,
    pub probe_timeout: Duration,
    pub compose: ComposePolicy,
    pub run_dir: PathBuf,
    pub grace_period: Duration,
    pub config_delete_delay: Duration,
}

impl ProbeSettings {
    pub fn new(
        engine: EngineSpec,
        interface_prefix: impl Into<String>,
        probe_timeout: Duration,
        run_dir: PathBuf,
    ) -> Self {
        let interface_prefix = interface_prefix.into();
        let engine = engine.with_interface(format!("{interface_prefix}0"));
        let mut compose = ComposePolicy::with_timeout(probe_timeout);
        compose.verbosity = engine.verbosity;
        Self {
            engine,
            interface_prefix,
            probe_timeout,
            compose,
            run_dir,
            grace_period: GRACE_PERIOD,
            config_delete_delay: CONFIG_DELETE_DELAY,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            EngineSpec::from_config(config)?,
            config.probe_interface_prefix.clone(),
            config.probe_timeout(),
            get_run_dir()?,
        ))
    }

    /// Engine spec bound to the interface for `slot`.
    pub fn slot_engine(&self, slot: usize) -> EngineSpec {
        self.engine
            .with_interface(format!("{}{}", self.interface_prefix, slot))
    }
}

pub struct EndpointProber {
    settings: ProbeSettings,
}

impl EndpointProber {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub async fn probe(&self, endpoint: &EndpointRecord, cancel: &ProbeCancel) -> ProbeOutcome {
        self.probe_with(&self.settings.engine, endpoint, cancel).await
    }

    /// Probe using a specific engine spec (and so a specific interface).
    pub async fn probe_with(
        &self,
        engine: &EngineSpec,
        endpoint: &EndpointRecord,
        cancel: &ProbeCancel,
    ) -> ProbeOutcome {
        let started = Instant::now();

        let result = if cancel.is_cancelled() {
            Err(AppError::cancelled())
        } else {
            sweep_stray_engines(&engine.interface).await;
            let result = self.run(engine, endpoint, cancel).await;
            sweep_stray_engines(&engine.interface).await;
            result
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(()) => {
                log::info!("Probe {}: tunnel established in {} ms", endpoint.name, elapsed_ms);
                ProbeOutcome {
                    endpoint: endpoint.name.clone(),
                    success: true,
                    message: format!("tunnel established in {elapsed_ms} ms"),
                    elapsed_ms,
                    error: None,
                }
            }
            Err(e) => {
                let message = e
                    .detail()
                    .map_or_else(|| e.kind().describe().to_string(), ToString::to_string);
                log::info!("Probe {}: {}", endpoint.name, message);
                ProbeOutcome {
                    endpoint: endpoint.name.clone(),
                    success: false,
                    message,
                    elapsed_ms,
                    error: Some(e.kind()),
                }
            }
        }
    }

    async fn run(
        &self,
        engine: &EngineSpec,
        endpoint: &EndpointRecord,
        cancel: &ProbeCancel,
    ) -> Result<()> {
        let raw = endpoint.decode_config()?;
        let text = compose(&raw, &self.settings.compose)?;
        let path = write_run_config(&self.settings.run_dir, &text)?;
        schedule_removal(path.clone(), self.settings.config_delete_delay);

        let mut process = EngineProcess::spawn(
            engine,
            &path,
            self.settings.probe_timeout,
            &endpoint.credentials,
            &endpoint.name,
        )
        .await?;

        let deadline = Instant::now() + self.settings.probe_timeout;
        let verdict = loop {
            tokio::select! {
                line = process.next_line() => match line {
                    Some(line) => match classify(&line) {
                        Some(LogMarker::Completed) => break Ok(()),
                        Some(marker) => {
                            if let (true, Some(kind)) = (marker.is_fatal(), marker.error_kind()) {
                                break Err(AppError::engine(kind, marker.describe()));
                            }
                        }
                        None => {}
                    },
                    None => {
                        let clean = process.finish().await.is_some_and(|s| s.success());
                        break Err(AppError::engine(
                            ErrorKind::EngineExited,
                            if clean {
                                "engine exited cleanly but no tunnel was confirmed"
                            } else {
                                "engine exited before the tunnel was confirmed"
                            },
                        ));
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    break Err(AppError::engine(
                        ErrorKind::Timeout,
                        format!("no tunnel within {:?}", self.settings.probe_timeout),
                    ));
                }
                () = cancel.cancelled() => break Err(AppError::cancelled()),
            }
        };

        process.stop(self.settings.grace_period).await;
        verdict
    }
}
