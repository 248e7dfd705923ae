//! # Error Types
//!
//! Custom error types for Location Tracker using `thiserror`.

use thiserror::Error;

/// Main error type for Location Tracker
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The host positioning service cannot be reached
    #[error("positioning service not available")]
    PositioningUnavailable,

    /// Remote store endpoint is missing
    #[error("invalid endpoint")]
    InvalidEndpoint,

    /// Update frequency parsed to fewer than one second
    #[error("invalid frequency ({0})")]
    InvalidFrequency(u64),

    /// Email or password is empty
    #[error("no email/password found")]
    MissingCredentials,

    /// Identity provider rejected the credentials or could not be reached
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Remote store write failed
    #[error("publish failed: {0}")]
    Publish(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackerError {
    /// Whether this error aborts startup before authentication.
    pub fn is_startup_precondition(&self) -> bool {
        matches!(
            self,
            Self::PositioningUnavailable
                | Self::InvalidEndpoint
                | Self::InvalidFrequency(_)
                | Self::MissingCredentials
        )
    }
}

/// Result type alias for Location Tracker
pub type Result<T> = std::result::Result<T, TrackerError>;
