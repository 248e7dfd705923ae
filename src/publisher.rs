//! # Event Publisher
//!
//! Turns position samples into store records.
//!
//! Each sample is appended under
//! `locations/{userId}/{deviceId}/{dayBucketKey}/{pushId}`, where the day
//! bucket is the start of the sample's local calendar day in epoch
//! milliseconds and the push id is generated by the store. A wake hold is
//! taken for the duration of every publish cycle.
//!
//! Publish failures are not retried: the sample is dropped and a diagnostic
//! line is recorded.

use std::sync::Arc;

use chrono::{Local, Offset, TimeZone};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, trace, warn};

use crate::diagnostics::LogHub;
use crate::lifecycle::ServiceState;
use crate::positioning::PositionSample;
use crate::store::RemoteStore;
use crate::wake::WakeGuard;

/// Publish cycles allowed in flight before the loop waits for one to finish
const MAX_IN_FLIGHT: usize = 4;

/// Stored form of a sample; every value is string-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationRecord {
    pub time: String,
    pub latitude: String,
    pub longitude: String,
    pub speed: String,
    pub altitude: String,
    pub accuracy: String,
    pub provider: String,
}

impl From<&PositionSample> for LocationRecord {
    fn from(sample: &PositionSample) -> Self {
        Self {
            time: sample.time.to_string(),
            latitude: sample.latitude.to_string(),
            longitude: sample.longitude.to_string(),
            speed: sample.speed.to_string(),
            altitude: sample.altitude.to_string(),
            accuracy: sample.accuracy.to_string(),
            provider: sample.provider.clone(),
        }
    }
}

/// Day bucket of `time_ms` in the host's local time zone.
pub fn day_bucket_key(time_ms: i64) -> i64 {
    day_bucket_key_in(time_ms, &Local)
}

/// Start of the calendar day containing `time_ms` in `tz`, as epoch millis.
///
/// When local midnight does not exist (a DST gap at midnight) the earliest
/// valid instant is used; if there is none, midnight at the sample's own
/// offset.
///
/// # Examples
///
/// ```
/// use chrono::{FixedOffset, TimeZone};
/// use location_tracker::publisher::day_bucket_key_in;
///
/// let tz = FixedOffset::east_opt(3600).unwrap();
/// let morning = tz.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap().timestamp_millis();
/// let midnight = tz.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap().timestamp_millis();
/// assert_eq!(day_bucket_key_in(morning, &tz), midnight);
/// ```
pub fn day_bucket_key_in<Tz: TimeZone>(time_ms: i64, tz: &Tz) -> i64 {
    let Some(local) = tz.timestamp_millis_opt(time_ms).single() else {
        return time_ms;
    };
    let Some(midnight) = local.date_naive().and_hms_opt(0, 0, 0) else {
        return time_ms;
    };

    match tz.from_local_datetime(&midnight).earliest() {
        Some(start) => start.timestamp_millis(),
        None => {
            let offset_ms = i64::from(local.offset().fix().local_minus_utc()) * 1000;
            midnight.and_utc().timestamp_millis() - offset_ms
        }
    }
}

/// Coordinate rounded to 6 decimals without trailing zeros.
pub fn format_coordinate(value: f64) -> String {
    let fixed = format!("{:.6}", value);
    fixed.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Publishes samples for one authenticated user and device.
pub struct EventPublisher {
    store: Arc<dyn RemoteStore>,
    hub: LogHub,
    wake: Arc<WakeGuard>,
    user_id: String,
    device_id: String,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        hub: LogHub,
        wake: Arc<WakeGuard>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            hub,
            wake,
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Store path of the bucket holding samples for `day_key`.
    pub fn bucket_path(&self, day_key: i64) -> String {
        format!("locations/{}/{}/{}", self.user_id, self.device_id, day_key)
    }

    /// Publishes one sample. `None` means the position has not changed and
    /// nothing is written.
    ///
    /// # Returns
    ///
    /// The store-generated key of the new record, or `None` if nothing was
    /// written.
    pub async fn send_location(&self, sample: Option<PositionSample>) -> Option<String> {
        let _hold = match self.wake.acquire() {
            Ok(hold) => Some(hold),
            Err(e) => {
                warn!("Failed to acquire wake lock: {}", e);
                None
            }
        };

        let Some(sample) = sample else {
            trace!("Location has not changed");
            return None;
        };

        let path = self.bucket_path(day_bucket_key(sample.time));
        let result = match serde_json::to_value(LocationRecord::from(&sample)) {
            Ok(value) => self.store.push(&path, value).await,
            Err(e) => Err(e.into()),
        };

        self.hub.log_text(format!(
            "Location {}, {}",
            format_coordinate(sample.latitude),
            format_coordinate(sample.longitude)
        ));

        match result {
            Ok(id) => {
                debug!("Stored location {}/{}", path, id);
                Some(id)
            }
            Err(e) => {
                warn!("Failed to store location under {}: {}", path, e);
                self.hub.log_text("Failed to send location data.");
                None
            }
        }
    }

    /// Publishes samples from `samples` until the service stops or the
    /// channel closes.
    ///
    /// Each sample gets its own publish cycle, so a slow write does not hold
    /// back later samples. At most `MAX_IN_FLIGHT` cycles run at once;
    /// cycles still running when the loop ends are awaited.
    pub async fn run(
        self: Arc<Self>,
        mut samples: mpsc::Receiver<Option<PositionSample>>,
        mut state: watch::Receiver<ServiceState>,
    ) {
        let mut inflight = JoinSet::new();

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
                Some(finished) = inflight.join_next(), if !inflight.is_empty() => {
                    log_cycle_result(finished);
                }
                sample = samples.recv(), if inflight.len() < MAX_IN_FLIGHT => {
                    match sample {
                        Some(sample) => {
                            let publisher = self.clone();
                            inflight.spawn(async move {
                                publisher.send_location(sample).await;
                            });
                        }
                        None => break,
                    }
                }
            }
        }

        while let Some(finished) = inflight.join_next().await {
            log_cycle_result(finished);
        }
        debug!("Publisher loop finished");
    }
}

fn log_cycle_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        warn!("Publish cycle failed: {}", e);
    }
}
