//! # Location Tracker Library
//!
//! Background agent that publishes periodic position fixes to a Firebase
//! Realtime Database.
//!
//! The agent authenticates a user, subscribes to position updates from gpsd,
//! appends each sample under a per-user, per-device, per-day key and keeps a
//! short diagnostic log that live observers can follow over a Unix socket.

pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod positioning;
pub mod publisher;
pub mod status;
pub mod store;
pub mod wake;
