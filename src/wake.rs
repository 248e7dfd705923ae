//! # Wake Lock Module
//!
//! Keeps the host awake while a sample is being published.
//!
//! [`WakeGuard`] builds its platform lock lazily, on the first acquisition,
//! and hands out scoped [`WakeHold`]s. Holds are reference counted: the
//! platform lock is taken when the first hold is created and released when
//! the last one is dropped, so every publish cycle ends with the lock
//! released.
//!
//! On Linux the kernel's autosleep interface is used: writing a name to
//! `/sys/power/wake_lock` takes a lock, writing it to `/sys/power/wake_unlock`
//! drops it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::config::WakeConfig;
use crate::error::Result;

/// Platform wake resource.
#[cfg_attr(test, mockall::automock)]
pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
}

/// Kernel wake lock driven through sysfs.
#[derive(Debug, Clone)]
pub struct SysfsWakeLock {
    name: String,
    dir: PathBuf,
}

impl SysfsWakeLock {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    fn write_control(&self, file: &str) -> Result<()> {
        let path = self.dir.join(file);
        let mut control = OpenOptions::new().write(true).open(&path)?;
        control.write_all(self.name.as_bytes())?;
        Ok(())
    }
}

impl WakeLock for SysfsWakeLock {
    fn acquire(&self) -> Result<()> {
        self.write_control("wake_lock")?;
        debug!("Wake lock '{}' acquired", self.name);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.write_control("wake_unlock")?;
        debug!("Wake lock '{}' released", self.name);
        Ok(())
    }
}

/// Lock used when wake locks are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

type WakeLockFactory = Box<dyn Fn() -> Box<dyn WakeLock> + Send + Sync>;

/// Lazily constructed, reference-counted wake lock.
pub struct WakeGuard {
    factory: WakeLockFactory,
    lock: OnceLock<Box<dyn WakeLock>>,
    holds: Mutex<usize>,
}

impl std::fmt::Debug for WakeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeGuard")
            .field("constructed", &self.is_constructed())
            .field("holds", &self.hold_count())
            .finish_non_exhaustive()
    }
}

impl WakeGuard {
    /// Creates a guard; `factory` runs at most once, on first acquisition.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn WakeLock> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            lock: OnceLock::new(),
            holds: Mutex::new(0),
        }
    }

    /// Guard for the configured platform lock.
    pub fn from_config(config: &WakeConfig) -> Self {
        if !config.enabled {
            return Self::new(|| Box::new(NoopWakeLock));
        }
        let name = config.name.clone();
        let dir = config.sysfs_dir.clone();
        Self::new(move || Box::new(SysfsWakeLock::new(name.clone(), dir.clone())))
    }

    fn counter(&self) -> MutexGuard<'_, usize> {
        self.holds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a hold, acquiring the platform lock if no other hold exists.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the lock cannot be taken; no hold is
    /// recorded in that case.
    pub fn acquire(&self) -> Result<WakeHold<'_>> {
        let lock = self.lock.get_or_init(|| (self.factory)());
        let mut holds = self.counter();
        if *holds == 0 {
            lock.acquire()?;
        }
        *holds += 1;
        Ok(WakeHold { guard: self })
    }

    fn release_one(&self) {
        let mut holds = self.counter();
        *holds = holds.saturating_sub(1);
        if *holds == 0 {
            if let Some(lock) = self.lock.get() {
                if let Err(e) = lock.release() {
                    warn!("Failed to release wake lock: {}", e);
                }
            }
        }
    }

    pub fn hold_count(&self) -> usize {
        *self.counter()
    }

    /// Whether the platform lock has been built yet.
    pub fn is_constructed(&self) -> bool {
        self.lock.get().is_some()
    }
}

/// Scoped hold on a [`WakeGuard`]; dropping it releases the hold.
#[derive(Debug)]
#[must_use = "the wake lock is released as soon as the hold is dropped"]
pub struct WakeHold<'a> {
    guard: &'a WakeGuard,
}

impl Drop for WakeHold<'_> {
    fn drop(&mut self) {
        self.guard.release_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lock_constructed_lazily() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let guard = WakeGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(NoopWakeLock)
        });

        assert!(!guard.is_constructed());
        drop(guard.acquire().unwrap());
        drop(guard.acquire().unwrap());
        assert!(guard.is_constructed());
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_and_release_once_per_cycle() {
        let mut lock = MockWakeLock::new();
        lock.expect_acquire().times(2).returning(|| Ok(()));
        lock.expect_release().times(2).returning(|| Ok(()));
        let lock = Mutex::new(Some(lock));
        let guard = WakeGuard::new(move || {
            Box::new(lock.lock().unwrap().take().unwrap()) as Box<dyn WakeLock>
        });

        {
            let _hold = guard.acquire().unwrap();
            assert_eq!(guard.hold_count(), 1);
        }
        assert_eq!(guard.hold_count(), 0);

        let _hold = guard.acquire().unwrap();
    }

    #[test]
    fn test_nested_holds_share_platform_lock() {
        let mut lock = MockWakeLock::new();
        lock.expect_acquire().times(1).returning(|| Ok(()));
        lock.expect_release().times(1).returning(|| Ok(()));
        let lock = Mutex::new(Some(lock));
        let guard = WakeGuard::new(move || {
            Box::new(lock.lock().unwrap().take().unwrap()) as Box<dyn WakeLock>
        });

        let first = guard.acquire().unwrap();
        let second = guard.acquire().unwrap();
        assert_eq!(guard.hold_count(), 2);
        drop(first);
        assert_eq!(guard.hold_count(), 1);
        drop(second);
        assert_eq!(guard.hold_count(), 0);
    }

    #[test]
    fn test_failed_acquire_records_no_hold() {
        let mut lock = MockWakeLock::new();
        lock.expect_acquire()
            .times(1)
            .returning(|| Err(TrackerError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied))));
        lock.expect_release().times(0);
        let lock = Mutex::new(Some(lock));
        let guard = WakeGuard::new(move || {
            Box::new(lock.lock().unwrap().take().unwrap()) as Box<dyn WakeLock>
        });

        assert!(guard.acquire().is_err());
        assert_eq!(guard.hold_count(), 0);
    }

    #[test]
    fn test_sysfs_wake_lock_writes_control_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wake_lock"), b"").unwrap();
        std::fs::write(dir.path().join("wake_unlock"), b"").unwrap();

        let lock = SysfsWakeLock::new("location-tracker", dir.path());
        lock.acquire().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("wake_lock")).unwrap(), "location-tracker");

        lock.release().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("wake_unlock")).unwrap(), "location-tracker");
    }

    #[test]
    fn test_sysfs_wake_lock_missing_interface() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SysfsWakeLock::new("location-tracker", dir.path());
        assert!(matches!(lock.acquire(), Err(TrackerError::Io(_))));
    }

    #[test]
    fn test_disabled_config_uses_noop_lock() {
        let config = WakeConfig {
            enabled: false,
            name: String::new(),
            sysfs_dir: "/nonexistent".to_string(),
        };
        let guard = WakeGuard::from_config(&config);
        let hold = guard.acquire();
        assert!(hold.is_ok());
    }
}
