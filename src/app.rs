//! Process wiring: config, backend, command reader thread and event loop

use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use wlosd_overlay::{Backend, EventLoop, HeadlessBackend, OsdError, Renderer, Request, SessionManager, SystemClock};
use wlosd_types::OsdConfig;

use crate::commands::CommandReader;
use crate::config::{self, ConfigError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Osd(#[from] OsdError),

    #[error("failed to start command reader")]
    Spawn(#[source] io::Error),
}

/// What `main` resolved from the command line
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config: Option<PathBuf>,
    /// Logical size of a single virtual output instead of a compositor
    pub headless: Option<(u32, u32)>,
}

/// Run until `exit`, end of stdin, or loss of the compositor
pub fn run(options: Options) -> Result<(), AppError> {
    let config = config::load(options.config.as_deref())?;
    let (tx, rx) = mpsc::channel();

    let config_path = options.config.clone();
    std::thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || {
            let stdin = io::stdin();
            let mut reader = CommandReader::new(stdin.lock(), io::stdout(), tx, config_path.as_deref());
            if let Err(e) = reader.run() {
                warn!(error = %e, "Command reader stopped");
            }
        })
        .map_err(AppError::Spawn)?;

    match options.headless {
        Some((width, height)) => {
            info!(width, height, "Running headless");
            drive(HeadlessBackend::with_output(width, height), &config, rx)
        }
        None => connect_and_drive(&config, rx),
    }
}

#[cfg(all(feature = "wayland", unix, not(target_os = "macos")))]
fn connect_and_drive(config: &OsdConfig, rx: Receiver<Request>) -> Result<(), AppError> {
    let backend = wlosd_overlay::WaylandBackend::connect(&config.namespace)?;
    drive(backend, config, rx)
}

#[cfg(not(all(feature = "wayland", unix, not(target_os = "macos"))))]
fn connect_and_drive(_config: &OsdConfig, _rx: Receiver<Request>) -> Result<(), AppError> {
    Err(OsdError::ProtocolFailure("layer-shell overlays need a Wayland session; try --headless".into()).into())
}

fn drive<B: Backend>(backend: B, config: &OsdConfig, rx: Receiver<Request>) -> Result<(), AppError> {
    let manager = SessionManager::new(backend, Renderer::new(), SystemClock)
        .with_style(config.style.clone())
        .with_default_timeout(default_timeout(config));
    let mut event_loop = EventLoop::new(manager, rx, Duration::from_millis(config.poll_interval_ms));
    event_loop.run()?;
    info!("wlosd finished");
    Ok(())
}

/// The configured default timeout, ignoring values that are not a valid duration
pub fn default_timeout(config: &OsdConfig) -> Option<Duration> {
    let secs = config.default_timeout_secs?;
    match Duration::try_from_secs_f32(secs) {
        Ok(timeout) => Some(timeout),
        Err(e) => {
            warn!(secs, error = %e, "Ignoring invalid default_timeout_secs");
            None
        }
    }
}
