//! # Status Indicator
//!
//! Persistent "service is running" indicator. The agent only pushes text to
//! it; rendering belongs to the [`StatusSink`].

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Title shown alongside every status line
pub const STATUS_TITLE: &str = "Location Tracker";

/// Renders status text somewhere a user can see it.
#[cfg_attr(test, mockall::automock)]
pub trait StatusSink: Send + Sync {
    /// Replace the displayed text.
    fn display(&self, title: &str, text: &str);

    /// Remove the indicator.
    fn cancel(&self);
}

/// Sink that writes status changes to the process log.
#[derive(Debug, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn display(&self, title: &str, text: &str) {
        info!(target: "status", "{}: {}", title, text);
    }

    fn cancel(&self) {
        info!(target: "status", "{}: indicator cleared", STATUS_TITLE);
    }
}

/// Indicator that only forwards updates while shown.
pub struct StatusIndicator {
    sink: Box<dyn StatusSink>,
    visible: AtomicBool,
}

impl std::fmt::Debug for StatusIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusIndicator")
            .field("visible", &self.is_visible())
            .finish_non_exhaustive()
    }
}

impl StatusIndicator {
    pub fn new(sink: Box<dyn StatusSink>) -> Self {
        Self {
            sink,
            visible: AtomicBool::new(false),
        }
    }

    pub fn show(&self) {
        self.visible.store(true, Ordering::SeqCst);
        self.sink.display(STATUS_TITLE, "Service started");
    }

    /// Updates the text if the indicator is shown; otherwise does nothing.
    pub fn update(&self, text: &str) {
        if self.is_visible() {
            self.sink.display(STATUS_TITLE, text);
        }
    }

    pub fn cancel(&self) {
        if self.visible.swap(false, Ordering::SeqCst) {
            self.sink.cancel();
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}
