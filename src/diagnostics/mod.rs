//! # Diagnostics Module
//!
//! Bounded diagnostic log mirrored to live observers.
//!
//! This module handles:
//! - Keeping the last 15 diagnostic lines (FIFO eviction)
//! - Fanning each new line out to registered observers
//! - Replaying history to observers as they register
//! - Serving observers over a Unix domain socket

pub mod hub;
pub mod protocol;
pub mod ring;
pub mod server;

pub use hub::LogHub;
pub use protocol::{ClientHandle, Message};
pub use ring::{LogMessage, LogRing};
