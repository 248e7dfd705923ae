//! # Positioning Module
//!
//! Periodic position fixes from the host positioning service.
//!
//! This module handles:
//! - The position sample and update request types
//! - The [`PositioningService`] seam (connect, request updates, remove updates)
//! - Reacting to connection callbacks ([`subscription`])
//! - A gpsd-backed implementation ([`gpsd`])

pub mod gpsd;
pub mod subscription;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Fastest rate at which updates are accepted, in milliseconds
pub const FASTEST_INTERVAL_MS: u64 = 5000;

/// One position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Fix time, milliseconds since the Unix epoch
    pub time: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in m/s
    pub speed: f32,
    /// Altitude in metres
    pub altitude: f64,
    /// Horizontal accuracy in metres
    pub accuracy: f32,
    pub provider: String,
}

/// Requested accuracy/power trade-off. gpsd reports every fix it has, so
/// only high accuracy is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    HighAccuracy,
}

/// Parameters of a periodic update subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRequest {
    pub interval_ms: u64,
    pub fastest_interval_ms: u64,
    pub priority: Priority,
}

impl LocationRequest {
    /// High-accuracy request delivering roughly every `interval_seconds`.
    ///
    /// # Examples
    ///
    /// ```
    /// use location_tracker::positioning::{LocationRequest, Priority};
    ///
    /// let request = LocationRequest::periodic(30);
    /// assert_eq!(request.interval_ms, 30_000);
    /// assert_eq!(request.fastest_interval_ms, 5_000);
    /// assert_eq!(request.priority, Priority::HighAccuracy);
    /// ```
    pub fn periodic(interval_seconds: u64) -> Self {
        Self {
            interval_ms: interval_seconds.saturating_mul(1000),
            fastest_interval_ms: FASTEST_INTERVAL_MS,
            priority: Priority::HighAccuracy,
        }
    }

    /// Delivery period honouring the fastest-interval floor.
    pub fn effective_period_ms(&self) -> u64 {
        self.interval_ms.max(self.fastest_interval_ms)
    }
}

/// Opaque handle of a registered update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Connection callbacks from the positioning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Suspended { cause: i32 },
    Failed { reason: String },
}

/// Channel on which samples are delivered. `None` means the position has not
/// changed since the last delivery.
pub type SampleSender = mpsc::Sender<Option<PositionSample>>;

/// Host positioning service.
#[async_trait]
pub trait PositioningService: Send + Sync {
    /// Whether the service is installed and reachable.
    async fn is_available(&self) -> bool;

    /// Starts connecting. The outcome arrives on `events` as
    /// [`ConnectionEvent::Connected`] or [`ConnectionEvent::Failed`]; a
    /// connection lost later is reported as [`ConnectionEvent::Suspended`].
    fn connect(&self, events: mpsc::Sender<ConnectionEvent>);

    /// Registers a periodic update request delivering into `samples`.
    async fn request_updates(&self, request: LocationRequest, samples: SampleSender) -> Result<RequestHandle>;

    /// Cancels a request previously returned by `request_updates`.
    async fn remove_updates(&self, handle: RequestHandle) -> Result<()>;
}
