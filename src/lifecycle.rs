//! # Lifecycle Controller
//!
//! Drives the tracker from configuration to a running subscription and back.
//!
//! ## States
//!
//! ```text
//! Created ──► Authenticating ──► Connecting ──► Running
//!    │              │                 │             │
//!    └──────────────┴───────┬─────────┴─────────────┘
//!                           ▼
//!                        Stopped
//! ```
//!
//! `Stopped` is terminal. Every startup failure records one diagnostic line
//! before the transition, so observers can see why the service stopped.
//! The current state is published on a `watch` channel; the spawned
//! publisher and subscription loops exit when it reaches `Stopped`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{parse_update_frequency, Config};
use crate::device::DeviceIdentity;
use crate::diagnostics::LogHub;
use crate::error::{Result, TrackerError};
use crate::positioning::subscription::SubscriptionManager;
use crate::positioning::PositioningService;
use crate::publisher::EventPublisher;
use crate::store::{AuthProvider, RemoteStore};
use crate::wake::WakeGuard;

/// Samples buffered between the positioning service and the publisher
const SAMPLE_QUEUE: usize = 32;

/// Service state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Authenticating,
    Connecting,
    Running,
    Stopped,
}

/// Startup settings after validation.
#[derive(Clone)]
pub struct Settings {
    pub endpoint: String,
    pub email: String,
    pub password: String,
    /// Frequency as configured, e.g. `"5m"`
    pub frequency: String,
    pub update_interval_seconds: u64,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("endpoint", &self.endpoint)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("frequency", &self.frequency)
            .field("update_interval_seconds", &self.update_interval_seconds)
            .finish()
    }
}

/// External services the tracker depends on.
pub struct Collaborators {
    pub positioning: Arc<dyn PositioningService>,
    pub auth: Arc<dyn AuthProvider>,
    pub store: Arc<dyn RemoteStore>,
    pub wake: Arc<WakeGuard>,
    pub device: DeviceIdentity,
}

/// The tracking agent.
pub struct TrackerService {
    config: Config,
    hub: LogHub,
    positioning: Arc<dyn PositioningService>,
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn RemoteStore>,
    wake: Arc<WakeGuard>,
    device: DeviceIdentity,
    state: watch::Sender<ServiceState>,
    running: AtomicBool,
    started: AtomicBool,
    user_id: std::sync::Mutex<Option<String>>,
    subscription: Mutex<Option<Arc<SubscriptionManager>>>,
}

impl std::fmt::Debug for TrackerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerService")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TrackerService {
    pub fn new(config: Config, hub: LogHub, collaborators: Collaborators) -> Self {
        let (state, _) = watch::channel(ServiceState::Created);
        Self {
            config,
            hub,
            positioning: collaborators.positioning,
            auth: collaborators.auth,
            store: collaborators.store,
            wake: collaborators.wake,
            device: collaborators.device,
            state,
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            user_id: std::sync::Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Authenticated user, once known.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    /// Moves to `next` unless the service has already stopped.
    fn advance(&self, next: ServiceState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ServiceState::Stopped {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn abort(&self, text: &str) {
        self.hub.log_text(text);
        self.state.send_replace(ServiceState::Stopped);
    }

    /// Checks the startup preconditions in order: positioning service,
    /// endpoint, update frequency, credentials.
    ///
    /// # Errors
    ///
    /// Returns the first failed precondition.
    pub async fn check_preconditions(&self) -> Result<Settings> {
        if !self.positioning.is_available().await {
            return Err(TrackerError::PositioningUnavailable);
        }

        let endpoint = self.config.store.endpoint.trim();
        if endpoint.is_empty() {
            return Err(TrackerError::InvalidEndpoint);
        }

        let frequency = self.config.tracking.update_frequency.trim();
        let update_interval_seconds = parse_update_frequency(frequency);
        if update_interval_seconds < 1 {
            return Err(TrackerError::InvalidFrequency(update_interval_seconds));
        }

        let auth = &self.config.auth;
        if auth.email.is_empty() || auth.password.is_empty() {
            return Err(TrackerError::MissingCredentials);
        }

        Ok(Settings {
            endpoint: endpoint.to_string(),
            email: auth.email.clone(),
            password: auth.password.clone(),
            frequency: frequency.to_string(),
            update_interval_seconds,
        })
    }

    /// Runs startup: preconditions, authentication, device registration and
    /// subscription bring-up. Only the first call has any effect.
    ///
    /// # Errors
    ///
    /// Returns the precondition or authentication error that stopped the
    /// service. The service is `Stopped` whenever an error is returned.
    pub async fn start(&self) -> Result<()> {
        if self.state() != ServiceState::Created || self.started.swap(true, Ordering::SeqCst) {
            warn!("Start requested in state {:?}, ignoring", self.state());
            return Ok(());
        }

        let settings = match self.check_preconditions().await {
            Ok(settings) => settings,
            Err(e) => {
                error!("Startup aborted: {}", e);
                self.abort(&precondition_message(&e));
                return Err(e);
            }
        };
        debug!("Startup settings: {:?}", settings);

        if !self.advance(ServiceState::Authenticating) {
            return Ok(());
        }
        self.hub.log_text("Service authenticating...");

        let session = match self.auth.authenticate(&settings.email, &settings.password).await {
            Ok(session) => session,
            Err(e) => {
                error!("Authentication failed: {}", e);
                if self.state() != ServiceState::Stopped {
                    self.abort("Authentication failed, please check email/password, stopping service");
                }
                return Err(e);
            }
        };

        if self.state() == ServiceState::Stopped {
            info!("Authentication completed after shutdown, not starting");
            return Ok(());
        }
        self.hub.log_text("Successfully authenticated");
        *self.user_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.user_id.clone());

        self.register_device(&session.user_id).await;
        self.bring_up(&settings, &session.user_id).await;
        Ok(())
    }

    /// Writes this device's identity record. Failures are logged only.
    async fn register_device(&self, user_id: &str) {
        let path = self.device.record_path(user_id);
        let result = match serde_json::to_value(&self.device) {
            Ok(value) => self.store.set(&path, value).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => debug!("Device record written to {}", path),
            Err(e) => warn!("Failed to write device record {}: {}", path, e),
        }
    }

    async fn bring_up(&self, settings: &Settings, user_id: &str) {
        let mut slot = self.subscription.lock().await;
        if !self.advance(ServiceState::Connecting) {
            info!("Service stopped during startup, not subscribing");
            return;
        }

        let (samples_tx, samples_rx) = mpsc::channel(SAMPLE_QUEUE);

        let publisher = Arc::new(EventPublisher::new(
            self.store.clone(),
            self.hub.clone(),
            self.wake.clone(),
            user_id,
            self.device.device_id.clone(),
        ));
        tokio::spawn(publisher.run(samples_rx, self.subscribe()));

        let (manager, events) = SubscriptionManager::new(
            self.positioning.clone(),
            settings.update_interval_seconds,
            self.hub.clone(),
            samples_tx,
        );
        let manager = Arc::new(manager);
        tokio::spawn(manager.clone().run(events, self.subscribe()));
        manager.connect();
        *slot = Some(manager);

        self.hub.status().show();
        self.running.store(true, Ordering::SeqCst);
        self.advance(ServiceState::Running);
        self.hub
            .log_text(format!("Service started, update frequency {}", settings.frequency));
    }

    /// Stops the service. Safe to call in any state and more than once.
    pub async fn teardown(&self) {
        let mut slot = self.subscription.lock().await;
        let previous = self.state.send_replace(ServiceState::Stopped);
        if previous == ServiceState::Stopped {
            debug!("Teardown requested, already stopped");
            return;
        }

        self.hub.status().cancel();
        if let Some(manager) = slot.take() {
            if let Err(e) = manager.close().await {
                warn!("Failed to remove location updates: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.hub.log_text("Service stopped");
    }
}

/// Diagnostic line recorded when startup aborts with `error`.
fn precondition_message(error: &TrackerError) -> String {
    match error {
        TrackerError::PositioningUnavailable => {
            "Positioning service not available, stopping service".to_string()
        }
        TrackerError::InvalidEndpoint => "Invalid endpoint, stopping service".to_string(),
        TrackerError::InvalidFrequency(seconds) => {
            format!("Invalid frequency ({}), stopping service", seconds)
        }
        TrackerError::MissingCredentials => "No email/password found, stopping service".to_string(),
        other => format!("{}, stopping service", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mocks::test_identity;
    use crate::diagnostics::hub::mocks::{test_hub, texts};
    use crate::positioning::mocks::{sample_at, FakePositioning};
    use crate::positioning::{ConnectionEvent, LocationRequest, RequestHandle, SampleSender};
    use crate::publisher::day_bucket_key;
    use crate::store::mocks::{FakeAuth, MemoryStore};
    use crate::store::AuthSession;
    use crate::wake::NoopWakeLock;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Fixture {
        positioning: FakePositioning,
        store: MemoryStore,
        auth: FakeAuth,
        hub: LogHub,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                positioning: FakePositioning::new(),
                store: MemoryStore::new(),
                auth: FakeAuth::accepting("user@example.com", "hunter2", "uid-1"),
                hub: test_hub(),
            }
        }

        fn service(&self, config: Config) -> TrackerService {
            self.service_with_auth(config, Arc::new(self.auth.clone()))
        }

        fn service_with_auth(&self, config: Config, auth: Arc<dyn AuthProvider>) -> TrackerService {
            TrackerService::new(
                config,
                self.hub.clone(),
                Collaborators {
                    positioning: Arc::new(self.positioning.clone()),
                    auth,
                    store: Arc::new(self.store.clone()),
                    wake: Arc::new(WakeGuard::new(|| Box::new(NoopWakeLock))),
                    device: test_identity(),
                },
            )
        }
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.store.endpoint = "https://tracker.firebaseio.com".to_string();
        config.auth.email = "user@example.com".to_string();
        config.auth.password = "hunter2".to_string();
        config.tracking.update_frequency = "30s".to_string();
        config
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Condition not reached in time");
    }

    /// Auth provider that waits for a signal before answering
    struct GatedAuth {
        gate: Arc<Notify>,
        inner: FakeAuth,
    }

    #[async_trait]
    impl AuthProvider for GatedAuth {
        async fn authenticate(&self, email: &str, password: &str) -> Result<AuthSession> {
            self.gate.notified().await;
            self.inner.authenticate(email, password).await
        }
    }

    /// Positioning service whose availability check yields to the scheduler
    struct YieldingPositioning(FakePositioning);

    #[async_trait]
    impl PositioningService for YieldingPositioning {
        async fn is_available(&self) -> bool {
            tokio::task::yield_now().await;
            self.0.is_available().await
        }

        fn connect(&self, events: mpsc::Sender<ConnectionEvent>) {
            self.0.connect(events)
        }

        async fn request_updates(&self, request: LocationRequest, samples: SampleSender) -> Result<RequestHandle> {
            self.0.request_updates(request, samples).await
        }

        async fn remove_updates(&self, handle: RequestHandle) -> Result<()> {
            self.0.remove_updates(handle).await
        }
    }

    // ── Preconditions ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_positioning_unavailable_stops() {
        let mut fixture = Fixture::new();
        fixture.positioning = FakePositioning::unavailable();
        let service = fixture.service(valid_config());

        let result = service.start().await;

        assert!(matches!(result, Err(TrackerError::PositioningUnavailable)));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(texts(&fixture.hub), vec!["Positioning service not available, stopping service"]);
        assert_eq!(fixture.auth.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_endpoint_stops() {
        let fixture = Fixture::new();
        let mut config = valid_config();
        config.store.endpoint = "  ".to_string();
        let service = fixture.service(config);

        assert!(matches!(service.start().await, Err(TrackerError::InvalidEndpoint)));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(texts(&fixture.hub), vec!["Invalid endpoint, stopping service"]);
    }

    #[tokio::test]
    async fn test_invalid_frequency_stops() {
        for frequency in ["abc", "", "0s", "5x"] {
            let fixture = Fixture::new();
            let mut config = valid_config();
            config.tracking.update_frequency = frequency.to_string();
            let service = fixture.service(config);

            assert!(matches!(service.start().await, Err(TrackerError::InvalidFrequency(0))));
            assert_eq!(texts(&fixture.hub), vec!["Invalid frequency (0), stopping service"]);
            assert_eq!(fixture.auth.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_stop() {
        let fixture = Fixture::new();
        let mut config = valid_config();
        config.auth.password = String::new();
        let service = fixture.service(config);

        assert!(matches!(service.start().await, Err(TrackerError::MissingCredentials)));
        assert_eq!(texts(&fixture.hub), vec!["No email/password found, stopping service"]);
        assert!(!service.is_running());
    }

    // ── Authentication ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_authentication_failure_stops() {
        let fixture = Fixture::new();
        let mut config = valid_config();
        config.auth.password = "wrong".to_string();
        let service = fixture.service(config);

        assert!(matches!(service.start().await, Err(TrackerError::Authentication(_))));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(
            texts(&fixture.hub),
            vec![
                "Service authenticating...",
                "Authentication failed, please check email/password, stopping service",
            ]
        );
        assert!(fixture.store.paths().is_empty());
        assert_eq!(fixture.positioning.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_authentication_after_teardown_is_ignored() {
        let fixture = Fixture::new();
        let gate = Arc::new(Notify::new());
        let auth = GatedAuth { gate: gate.clone(), inner: fixture.auth.clone() };
        let service = Arc::new(fixture.service_with_auth(valid_config(), Arc::new(auth)));

        let starting = tokio::spawn({
            let service = service.clone();
            async move { service.start().await }
        });
        let mut state = service.subscribe();
        state.wait_for(|s| *s == ServiceState::Authenticating).await.unwrap();

        service.teardown().await;
        gate.notify_one();
        starting.await.unwrap().unwrap();

        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(fixture.positioning.connect_count(), 0);
        assert!(fixture.store.paths().is_empty());
        assert!(!service.is_running());
        assert!(!texts(&fixture.hub).contains(&"Successfully authenticated".to_string()));
    }

    // ── Bring-up ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_successful_start() {
        let fixture = Fixture::new();
        let service = fixture.service(valid_config());

        service.start().await.unwrap();

        assert_eq!(service.state(), ServiceState::Running);
        assert!(service.is_running());
        assert_eq!(service.user_id().as_deref(), Some("uid-1"));
        assert!(fixture.hub.status().is_visible());

        let device = fixture.store.get("devices/uid-1/machine-1").unwrap();
        assert_eq!(device["deviceId"], "machine-1");
        assert_eq!(device["model"], "Laptop 13");

        assert_eq!(
            texts(&fixture.hub),
            vec![
                "Service authenticating...",
                "Successfully authenticated",
                "Service started, update frequency 30s",
            ]
        );

        let positioning = fixture.positioning.clone();
        wait_for(move || positioning.active_requests().len() == 1).await;
        assert_eq!(fixture.positioning.active_requests()[0].1.interval_ms, 30_000);
        assert_eq!(fixture.positioning.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_samples_flow_to_store() {
        let fixture = Fixture::new();
        let service = fixture.service(valid_config());
        service.start().await.unwrap();

        let positioning = fixture.positioning.clone();
        wait_for(move || positioning.active_requests().len() == 1).await;

        let sample = sample_at(1_714_550_400_000);
        let bucket = format!("locations/uid-1/machine-1/{}", day_bucket_key(sample.time));
        fixture.positioning.deliver(Some(sample)).await;

        let store = fixture.store.clone();
        let watched = bucket.clone();
        wait_for(move || store.children(&watched).len() == 1).await;
        let (_, record) = &fixture.store.children(&bucket)[0];
        assert_eq!(record["provider"], "gpsd");
    }

    #[tokio::test]
    async fn test_device_record_failure_is_not_fatal() {
        let fixture = Fixture::new();
        fixture.store.set_fail_writes(true);
        let service = fixture.service(valid_config());

        service.start().await.unwrap();

        assert_eq!(service.state(), ServiceState::Running);
        assert!(fixture.store.get("devices/uid-1/machine-1").is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_running() {
        let fixture = Fixture::new();
        let service = fixture.service(valid_config());
        service.start().await.unwrap();
        let positioning = fixture.positioning.clone();
        wait_for(move || positioning.active_requests().len() == 1).await;

        fixture.store.set_fail_writes(true);
        fixture.positioning.deliver(Some(sample_at(1))).await;

        let hub = fixture.hub.clone();
        wait_for(move || texts(&hub).last().map(String::as_str) == Some("Failed to send location data.")).await;
        assert_eq!(service.state(), ServiceState::Running);
        assert!(service.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_starts_bring_up_once() {
        let fixture = Fixture::new();
        let positioning = YieldingPositioning(fixture.positioning.clone());
        let service = TrackerService::new(
            valid_config(),
            fixture.hub.clone(),
            Collaborators {
                positioning: Arc::new(positioning),
                auth: Arc::new(fixture.auth.clone()),
                store: Arc::new(fixture.store.clone()),
                wake: Arc::new(WakeGuard::new(|| Box::new(NoopWakeLock))),
                device: test_identity(),
            },
        );

        let (first, second) = tokio::join!(service.start(), service.start());
        first.unwrap();
        second.unwrap();

        assert_eq!(fixture.auth.call_count(), 1);
        assert_eq!(fixture.positioning.connect_count(), 1);
        let started = texts(&fixture.hub)
            .iter()
            .filter(|t| t.starts_with("Service started"))
            .count();
        assert_eq!(started, 1);

        let positioning = fixture.positioning.clone();
        wait_for(move || positioning.active_requests().len() == 1).await;
        service.teardown().await;
        assert!(fixture.positioning.active_requests().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let fixture = Fixture::new();
        let service = fixture.service(valid_config());

        service.start().await.unwrap();
        service.start().await.unwrap();

        assert_eq!(fixture.auth.call_count(), 1);
    }

    // ── Teardown ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let fixture = Fixture::new();
        let service = fixture.service(valid_config());
        service.start().await.unwrap();
        let positioning = fixture.positioning.clone();
        wait_for(move || positioning.active_requests().len() == 1).await;

        service.teardown().await;
        service.teardown().await;

        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!service.is_running());
        assert!(!fixture.hub.status().is_visible());
        assert!(fixture.positioning.active_requests().is_empty());
        let stopped = texts(&fixture.hub).iter().filter(|t| *t == "Service stopped").count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_teardown_before_start() {
        let fixture = Fixture::new();
        let service = fixture.service(valid_config());

        service.teardown().await;
        service.start().await.unwrap();

        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(fixture.auth.call_count(), 0);
    }

    #[test]
    fn test_settings_debug_redacts_password() {
        let settings = Settings {
            endpoint: "https://x".into(),
            email: "a@b".into(),
            password: "hunter2".into(),
            frequency: "5m".into(),
            update_interval_seconds: 300,
        };
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }
}
