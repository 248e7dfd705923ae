//! # gpsd Positioning Service
//!
//! Positioning backed by a local [gpsd](https://gpsd.io) daemon.
//!
//! ## Protocol
//!
//! gpsd speaks newline-delimited JSON over TCP (default port 2947). After
//! connecting, the client enables streaming with:
//!
//! ```text
//! ?WATCH={"enable":true,"json":true};
//! ```
//!
//! and the daemon then emits one report object per line. Only `TPV`
//! (time-position-velocity) reports with a 2D or 3D fix are used:
//!
//! ```text
//! {"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2024-05-01T10:00:00.000Z",
//!  "lat":52.370216,"lon":4.895168,"altHAE":12.3,"speed":0.4,"eph":3.1}
//! ```
//!
//! ## Delivery
//!
//! The reader task keeps only the most recent fix. Each update request runs
//! its own ticker and, on every tick, delivers that fix if it is newer than
//! the last one it delivered, or `None` if the position has not changed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ConnectionEvent, LocationRequest, PositionSample, PositioningService, RequestHandle, SampleSender};
use crate::error::Result;

/// Command enabling JSON report streaming
pub const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Suspension cause: gpsd closed the connection
pub const CAUSE_SERVICE_DISCONNECTED: i32 = 1;

/// Suspension cause: the socket failed mid-stream
pub const CAUSE_NETWORK_LOST: i32 = 2;

/// Timeout for the availability check
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum fix mode accepted (2 = 2D fix, 3 = 3D fix)
const MIN_FIX_MODE: u8 = 2;

/// Provider name used when a report carries no device path
const DEFAULT_PROVIDER: &str = "gpsd";

/// Subset of a gpsd report used for position fixes.
#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    time: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    #[serde(rename = "altHAE")]
    alt_hae: Option<f64>,
    speed: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    device: Option<String>,
}

/// Parse one gpsd report line into a sample.
///
/// Returns `None` for non-TPV reports, reports without a fix, and lines that
/// are not valid JSON.
pub fn parse_report(line: &str) -> Option<PositionSample> {
    let report: Report = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < MIN_FIX_MODE {
        return None;
    }

    let latitude = report.lat.filter(|v| v.is_finite())?;
    let longitude = report.lon.filter(|v| v.is_finite())?;

    let time = report
        .time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let accuracy = report.eph.or_else(|| match (report.epx, report.epy) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    });

    Some(PositionSample {
        time,
        latitude,
        longitude,
        speed: report.speed.unwrap_or(0.0) as f32,
        altitude: report.alt_hae.or(report.alt).unwrap_or(0.0),
        accuracy: accuracy.unwrap_or(0.0) as f32,
        provider: report.device.unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
    })
}

/// [`PositioningService`] talking to gpsd.
pub struct GpsdService {
    address: String,
    latest: Arc<watch::Sender<Option<PositionSample>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    tickers: Mutex<HashMap<RequestHandle, JoinHandle<()>>>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for GpsdService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpsdService")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GpsdService {
    /// Creates a service for the gpsd instance at `address` (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            address: address.into(),
            latest: Arc::new(latest),
            reader: Mutex::new(None),
            tickers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Most recent fix received from gpsd.
    pub fn latest_fix(&self) -> Option<PositionSample> {
        self.latest.borrow().clone()
    }
}

impl Drop for GpsdService {
    fn drop(&mut self) {
        if let Some(reader) = locked(&self.reader).take() {
            reader.abort();
        }
        for (_, ticker) in locked(&self.tickers).drain() {
            ticker.abort();
        }
    }
}

async fn stream_reports(
    address: String,
    latest: Arc<watch::Sender<Option<PositionSample>>>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(ConnectionEvent::Failed { reason: format!("{}: {}", address, e) }).await;
            return;
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    if let Err(e) = write_half.write_all(WATCH_COMMAND).await {
        let _ = events.send(ConnectionEvent::Failed { reason: format!("WATCH failed: {}", e) }).await;
        return;
    }

    info!("Connected to gpsd at {}", address);
    let _ = events.send(ConnectionEvent::Connected).await;

    let mut lines = BufReader::new(read_half).lines();
    let cause = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(sample) = parse_report(&line) {
                    debug!("gpsd fix {:.6}, {:.6}", sample.latitude, sample.longitude);
                    latest.send_replace(Some(sample));
                }
            }
            Ok(None) => break CAUSE_SERVICE_DISCONNECTED,
            Err(e) => {
                warn!("gpsd read failed: {}", e);
                break CAUSE_NETWORK_LOST;
            }
        }
    };

    let _ = events.send(ConnectionEvent::Suspended { cause }).await;
}

async fn deliver_fixes(
    period: Duration,
    mut fixes: watch::Receiver<Option<PositionSample>>,
    samples: SampleSender,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_delivered: Option<i64> = None;

    loop {
        ticker.tick().await;
        let fix = fixes.borrow_and_update().clone();
        let sample = match fix {
            Some(sample) if last_delivered != Some(sample.time) => {
                last_delivered = Some(sample.time);
                Some(sample)
            }
            _ => None,
        };
        if samples.send(sample).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl PositioningService for GpsdService {
    async fn is_available(&self) -> bool {
        matches!(
            tokio::time::timeout(AVAILABILITY_TIMEOUT, TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        )
    }

    fn connect(&self, events: mpsc::Sender<ConnectionEvent>) {
        let task = tokio::spawn(stream_reports(self.address.clone(), self.latest.clone(), events));
        if let Some(previous) = locked(&self.reader).replace(task) {
            previous.abort();
        }
    }

    async fn request_updates(&self, request: LocationRequest, samples: SampleSender) -> Result<RequestHandle> {
        let handle = RequestHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let period = Duration::from_millis(request.effective_period_ms().max(1));
        let ticker = tokio::spawn(deliver_fixes(period, self.latest.subscribe(), samples));
        locked(&self.tickers).insert(handle, ticker);
        debug!("Registered gpsd request {:?} every {:?}", handle, period);
        Ok(handle)
    }

    async fn remove_updates(&self, handle: RequestHandle) -> Result<()> {
        match locked(&self.tickers).remove(&handle) {
            Some(ticker) => ticker.abort(),
            None => debug!("Request {:?} was not active", handle),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioning::Priority;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const TPV: &str = r#"{"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2024-05-01T10:00:00.000Z","lat":52.370216,"lon":4.895168,"altHAE":12.5,"alt":10.0,"speed":0.4,"eph":3.1}"#;

    fn fast_request(ms: u64) -> LocationRequest {
        LocationRequest {
            interval_ms: ms,
            fastest_interval_ms: ms,
            priority: Priority::HighAccuracy,
        }
    }

    #[test]
    fn test_parse_tpv_report() {
        let sample = parse_report(TPV).unwrap();
        assert_eq!(sample.time, 1_714_557_600_000);
        assert_eq!(sample.latitude, 52.370216);
        assert_eq!(sample.longitude, 4.895168);
        assert_eq!(sample.altitude, 12.5);
        assert!((sample.speed - 0.4).abs() < 1e-6);
        assert!((sample.accuracy - 3.1).abs() < 1e-6);
        assert_eq!(sample.provider, "/dev/ttyACM0");
    }

    #[test]
    fn test_parse_falls_back_to_alt_and_epx_epy() {
        let line = r#"{"class":"TPV","mode":2,"time":"2024-05-01T10:00:00Z","lat":1.0,"lon":2.0,"alt":7.0,"epx":4.0,"epy":6.5}"#;
        let sample = parse_report(line).unwrap();
        assert_eq!(sample.altitude, 7.0);
        assert_eq!(sample.accuracy, 6.5);
        assert_eq!(sample.provider, "gpsd");
    }

    #[test]
    fn test_parse_rejects_non_fixes() {
        assert!(parse_report(r#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_report(r#"{"class":"SKY","satellites":[]}"#).is_none());
        assert!(parse_report(r#"{"class":"TPV","mode":1}"#).is_none());
        assert!(parse_report(r#"{"class":"TPV","mode":3,"lat":1.0}"#).is_none());
        assert!(parse_report("garbage").is_none());
    }

    #[test]
    fn test_watch_command_format() {
        assert!(WATCH_COMMAND.starts_with(b"?WATCH="));
        assert!(WATCH_COMMAND.ends_with(b";\n"));
    }

    #[tokio::test]
    async fn test_availability_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(GpsdService::new(address.clone()).is_available().await);

        drop(listener);
        assert!(!GpsdService::new(address).is_available().await);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let service = GpsdService::new(address);
        let (tx, mut rx) = mpsc::channel(4);
        service.connect(tx);

        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, ConnectionEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn test_stream_fixes_then_suspend_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n").await.unwrap();

            let mut buf = vec![0u8; WATCH_COMMAND.len()];
            tokio::io::AsyncReadExt::read_exact(&mut socket, &mut buf).await.unwrap();
            assert_eq!(buf, WATCH_COMMAND);

            socket.write_all(format!("{}\n", TPV).as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let service = GpsdService::new(address);
        let (events_tx, mut events_rx) = mpsc::channel(4);
        service.connect(events_tx);
        assert_eq!(
            timeout(Duration::from_secs(5), events_rx.recv()).await.unwrap(),
            Some(ConnectionEvent::Connected)
        );

        let (samples_tx, mut samples_rx) = mpsc::channel(8);
        let handle = service.request_updates(fast_request(50), samples_tx).await.unwrap();

        let mut delivered = None;
        for _ in 0..20 {
            if let Some(sample) = timeout(Duration::from_secs(5), samples_rx.recv()).await.unwrap().unwrap() {
                delivered = Some(sample);
                break;
            }
        }
        assert_eq!(delivered.unwrap().time, 1_714_557_600_000);

        // Same fix again: reported as unchanged
        let next = timeout(Duration::from_secs(5), samples_rx.recv()).await.unwrap().unwrap();
        assert!(next.is_none());

        server.await.unwrap();
        assert_eq!(
            timeout(Duration::from_secs(5), events_rx.recv()).await.unwrap(),
            Some(ConnectionEvent::Suspended { cause: CAUSE_SERVICE_DISCONNECTED })
        );

        service.remove_updates(handle).await.unwrap();
        let closed = timeout(Duration::from_secs(5), async {
            while samples_rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_remove_unknown_request_is_ok() {
        let service = GpsdService::new("127.0.0.1:2947");
        assert!(service.remove_updates(RequestHandle(42)).await.is_ok());
        assert!(service.latest_fix().is_none());
    }
}
