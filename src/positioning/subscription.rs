//! # Subscription Manager
//!
//! Reacts to the positioning service's connection callbacks:
//!
//! - `Connected`: registers a periodic high-accuracy update request and keeps
//!   its handle for cancellation
//! - `Suspended`: logs a warning and reconnects immediately
//! - `Failed`: records a diagnostic line; no automatic retry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::{ConnectionEvent, LocationRequest, PositioningService, RequestHandle, SampleSender};
use crate::diagnostics::LogHub;
use crate::error::Result;
use crate::lifecycle::ServiceState;

/// Connection events queued between the service and the manager
const EVENT_QUEUE: usize = 16;

/// Owns the active update request for one positioning connection.
pub struct SubscriptionManager {
    service: Arc<dyn PositioningService>,
    request: LocationRequest,
    hub: LogHub,
    events: mpsc::Sender<ConnectionEvent>,
    samples: SampleSender,
    active: Mutex<Option<RequestHandle>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    /// Creates a manager requesting updates every `interval_seconds`.
    ///
    /// Returns the manager and the receiving end of its connection event
    /// queue, to be driven by [`SubscriptionManager::run`].
    pub fn new(
        service: Arc<dyn PositioningService>,
        interval_seconds: u64,
        hub: LogHub,
        samples: SampleSender,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE);
        let manager = Self {
            service,
            request: LocationRequest::periodic(interval_seconds),
            hub,
            events,
            samples,
            active: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        (manager, receiver)
    }

    /// Asks the service to (re)connect.
    pub fn connect(&self) {
        debug!("Connecting to positioning service");
        self.service.connect(self.events.clone());
    }

    /// Registers the periodic update request, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns the service error if the request cannot be registered.
    pub async fn on_connected(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            debug!("Manager closed, ignoring connection");
            return Ok(());
        }
        if let Some(previous) = active.take() {
            if let Err(e) = self.service.remove_updates(previous).await {
                warn!("Failed to remove previous location request: {}", e);
            }
        }

        match self.service.request_updates(self.request, self.samples.clone()).await {
            Ok(handle) => {
                info!(
                    "Location updates requested (interval {} ms, fastest {} ms)",
                    self.request.interval_ms, self.request.fastest_interval_ms
                );
                *active = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Location update request failed: {}", e);
                self.hub.log_text("Failed to request location updates");
                Err(e)
            }
        }
    }

    pub fn on_connection_suspended(&self, cause: i32) {
        warn!("Location connection suspended {}", cause);
        self.connect();
    }

    pub fn on_connection_failed(&self, reason: &str) {
        error!("Location connection failed: {}", reason);
        self.hub.log_text("No Location found");
    }

    pub async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                // Already logged and surfaced as a diagnostic line
                let _ = self.on_connected().await;
            }
            ConnectionEvent::Suspended { cause } => self.on_connection_suspended(cause),
            ConnectionEvent::Failed { reason } => self.on_connection_failed(&reason),
        }
    }

    /// Processes connection events until the service state becomes
    /// [`ServiceState::Stopped`].
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ConnectionEvent>,
        mut state: watch::Receiver<ServiceState>,
    ) {
        loop {
            if *state.borrow() == ServiceState::Stopped {
                break;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }
        }
        debug!("Subscription event loop finished");
    }

    /// Cancels the active request, if any, and ignores any later `Connected`
    /// event. Returns whether a request was active.
    ///
    /// # Errors
    ///
    /// Returns the service error if removal fails; the request is forgotten
    /// either way.
    pub async fn close(&self) -> Result<bool> {
        let handle = {
            let mut active = self.active.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            active.take()
        };
        match handle {
            Some(handle) => {
                self.service.remove_updates(handle).await?;
                info!("Location updates removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn is_subscribed(&self) -> bool {
        self.active.lock().await.is_some()
    }
}
