//! warden-service: hosts the engine behind the local control and event
//! sockets, and replays operation scripts through the interceptor traits.

pub mod event_socket;
pub mod handler;
pub mod replay;
pub mod secret;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};
use warden_core::config::tracing_level;
use warden_core::control::LogLevelHook;
use warden_core::paths;

/// Where the service keeps its state and listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub data_dir: PathBuf,
    pub store_path: PathBuf,
    pub secret_path: PathBuf,
    pub control_socket: PathBuf,
    pub event_socket: PathBuf,
}

impl ServiceSettings {
    /// An explicit data directory also relocates the sockets unless they
    /// are given separately.
    pub fn resolve(
        data_dir: Option<PathBuf>,
        control_socket: Option<PathBuf>,
        event_socket: Option<PathBuf>,
    ) -> Result<Self> {
        let (data_dir, default_control, default_event) = match data_dir {
            Some(dir) => (dir.clone(), dir.join("control.sock"), dir.join("events.sock")),
            None => (
                paths::data_dir()?,
                paths::control_socket_path()?,
                paths::event_socket_path()?,
            ),
        };
        Ok(Self {
            store_path: data_dir.join("config.blobs"),
            secret_path: data_dir.join("ipc.secret"),
            control_socket: control_socket.unwrap_or(default_control),
            event_socket: event_socket.unwrap_or(default_event),
            data_dir,
        })
    }
}

/// Installs the subscriber and returns a hook that retunes it from the
/// engine's `LogLevel`. `RUST_LOG` sets the starting filter.
pub fn init_logging() -> Result<LogLevelHook> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(Arc::new(move |level| {
        let directive = tracing_level(level).to_string().to_lowercase();
        if let Err(e) = handle.modify(|f| *f = EnvFilter::new(&directive)) {
            eprintln!("log level change failed: {e}");
        }
    }))
}
