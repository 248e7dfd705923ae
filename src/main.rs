//! # Location Tracker
//!
//! Publishes periodic position fixes from gpsd to a Firebase Realtime
//! Database and serves a live diagnostic log over a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Run the agent
//! location-tracker --config config/default.toml
//!
//! # Follow the diagnostic log of a running agent
//! location-tracker watch
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use location_tracker::config::{Config, LoggingConfig};
use location_tracker::device::DeviceIdentity;
use location_tracker::diagnostics::protocol::WireFrame;
use location_tracker::diagnostics::server::{ObserverServer, ObserverSession};
use location_tracker::diagnostics::LogHub;
use location_tracker::lifecycle::{Collaborators, ServiceState, TrackerService};
use location_tracker::positioning::gpsd::GpsdService;
use location_tracker::status::{StatusIndicator, TracingStatusSink};
use location_tracker::store::firebase::FirebaseClient;
use location_tracker::wake::WakeGuard;

/// Background location tracking agent.
#[derive(Parser, Debug)]
#[command(name = "location-tracker", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/default.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the tracking agent (default)
    Run,

    /// Follow the diagnostic log of a running agent
    Watch {
        /// Observer socket (defaults to the configured one)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
}

/// Installs the tracing subscriber. With a log directory configured, events
/// also go to a daily rolling file; the returned guard must be held until
/// exit so buffered lines are flushed.
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    if logging.dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&logging.dir, "location-tracker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();
    Some(guard)
}

/// Resolves once Ctrl+C or SIGTERM is received.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn run_agent(config: Config) -> Result<()> {
    let status = Arc::new(StatusIndicator::new(Box::new(TracingStatusSink)));
    let hub = LogHub::new(status);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ObserverServer::bind(
        &config.diagnostics.socket_path,
        hub.clone(),
        config.diagnostics.client_queue,
    )
    .with_context(|| format!("Failed to bind observer socket {}", config.diagnostics.socket_path))?;
    let server_task = tokio::spawn(server.run(shutdown_rx));

    let firebase = Arc::new(FirebaseClient::from_config(&config.store).context("Failed to build HTTP client")?);
    let collaborators = Collaborators {
        positioning: Arc::new(GpsdService::new(config.positioning.gpsd_address.clone())),
        auth: firebase.clone(),
        store: firebase,
        wake: Arc::new(WakeGuard::from_config(&config.wake)),
        device: DeviceIdentity::discover(),
    };

    let service = Arc::new(TrackerService::new(config, hub, collaborators));
    let mut state = service.subscribe();

    // Authentication runs in the background so a signal can stop a slow startup
    tokio::spawn({
        let service = service.clone();
        async move {
            match service.start().await {
                Ok(()) => {}
                Err(e) if e.is_startup_precondition() => info!("Startup precondition not met: {}", e),
                Err(e) => warn!("Service did not start: {}", e),
            }
        }
    });

    info!("Press Ctrl+C to exit");
    tokio::select! {
        _ = shutdown_signal() => info!("Received shutdown signal, shutting down..."),
        _ = state.wait_for(|s| *s == ServiceState::Stopped) => info!("Service stopped, exiting"),
    }

    service.teardown().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = server_task.await {
        warn!("Observer server task failed: {}", e);
    }
    Ok(())
}

fn print_line(timestamp: DateTime<Utc>, text: &str) {
    println!("{} {}", timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"), text);
}

async fn watch_log(socket: &Path) -> Result<()> {
    let mut session = ObserverSession::attach(socket)
        .await
        .with_context(|| format!("Failed to attach to {}", socket.display()))?;

    loop {
        tokio::select! {
            frame = session.next_frame() => {
                match frame? {
                    Some(WireFrame::LogRing { entries }) => {
                        for entry in entries {
                            print_line(entry.timestamp, &entry.text);
                        }
                    }
                    Some(WireFrame::Log { text }) => print_line(Utc::now(), &text),
                    Some(_) => {}
                    None => {
                        info!("Agent closed the connection");
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.detach().await?;
    Ok(())
}

/// Main entry point for Location Tracker
///
/// # Errors
///
/// Returns error if the configuration cannot be loaded, the observer socket
/// cannot be bound, or (for `watch`) the agent cannot be reached.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = Config::load(&cli.config)
                .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
            let _guard = init_tracing(&config.logging);
            info!("Location Tracker v{} starting...", env!("CARGO_PKG_VERSION"));
            run_agent(config).await
        }
        Command::Watch { socket } => {
            let _guard = init_tracing(&LoggingConfig::default());
            let socket = match socket {
                Some(socket) => socket,
                None => {
                    let config = Config::load(&cli.config).unwrap_or_default();
                    PathBuf::from(config.diagnostics.socket_path)
                }
            };
            watch_log(&socket).await
        }
    }
}
