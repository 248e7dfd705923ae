//! # Remote Store Module
//!
//! Identity provider and realtime key-value store seams.
//!
//! Paths are slash-separated keys into the store's tree, e.g.
//! `locations/{userId}/{deviceId}/{dayBucketKey}`.

pub mod firebase;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
}

/// Email/password identity provider.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, email: &str, password: &str) -> Result<AuthSession>;
}

/// Realtime key-value tree.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Writes `value` at `path`, replacing whatever was there.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Appends `value` under `path` with a server-generated, time-ordered key.
    /// Returns the generated key.
    async fn push(&self, path: &str, value: Value) -> Result<String>;
}
