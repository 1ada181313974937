pub mod catalog;
mod cli;
mod commands;
pub mod compose;
pub mod config;
pub mod connection;
pub mod engine;
mod error;
pub mod paths;
pub mod probe;
pub mod reconnect;

use std::process::ExitCode;

use clap::Parser as _;

pub use catalog::{CatalogSource, CatalogStore, EndpointRecord};
pub use cli::{Args, Commands};
pub use connection::{ConnectionManager, ConnectionStatus, DisconnectReason, ManagerEvent};
pub use error::{AppError, ErrorKind, Result};
pub use probe::{EndpointProber, ProbeCancel, ProbeOutcome};
pub use reconnect::{AutoReconnectController, ReconnectEvent};

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp_millis();
    if let Err(e) = builder.try_init() {
        eprintln!("Logger already initialized: {e}");
    }
}

pub fn run() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = paths::ensure_data_dirs() {
        log::error!("Failed to create data directories: {}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(commands::dispatch(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.kind() == ErrorKind::Cancelled => {
            log::warn!("Cancelled");
            ExitCode::from(130)
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
