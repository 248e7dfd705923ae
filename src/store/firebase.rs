//! # Firebase REST Client
//!
//! Implements [`AuthProvider`] against the Identity Toolkit password sign-in
//! endpoint and [`RemoteStore`] against the Realtime Database REST API.
//!
//! ## Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | Sign in | `POST {auth_url}/v1/accounts:signInWithPassword?key=API_KEY` |
//! | Refresh | `POST {token_url}/v1/token?key=API_KEY` (form) |
//! | Set | `PUT {endpoint}/{path}.json?auth=ID_TOKEN` |
//! | Push | `POST {endpoint}/{path}.json?auth=ID_TOKEN` → `{"name": "<push id>"}` |
//!
//! ID tokens live for an hour; writes refresh the token once it is within
//! [`TOKEN_REFRESH_MARGIN_SECS`] of expiring.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AuthProvider, AuthSession, RemoteStore};
use crate::config::StoreConfig;
use crate::error::{Result, TrackerError};

/// Refresh the ID token when it expires within this many seconds
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Token lifetime assumed when the server omits `expiresIn`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Clone)]
struct IdToken {
    id_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl IdToken {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        (self.expires_at - now).num_seconds() < TOKEN_REFRESH_MARGIN_SECS
    }
}

/// Expiry instant for an `expiresIn` value; unparsable or out-of-range
/// lifetimes fall back to the default.
fn expiry_from(expires_in: Option<&str>) -> DateTime<Utc> {
    let now = Utc::now();
    let lifetime = |secs| TimeDelta::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
    expires_in
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(lifetime)
        .or_else(|| lifetime(DEFAULT_TOKEN_LIFETIME_SECS))
        .unwrap_or(now)
}

/// Client for one Firebase project.
pub struct FirebaseClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    auth_url: String,
    token_url: String,
    token: Mutex<Option<IdToken>>,
}

impl std::fmt::Debug for FirebaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirebaseClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl FirebaseClient {
    /// Builds a client from the `[store]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self::with_client(
            http,
            &config.endpoint,
            &config.api_key,
            &config.auth_url,
            &config.token_url,
        ))
    }

    /// Builds a client around an existing `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        endpoint: &str,
        api_key: &str,
        auth_url: &str,
        token_url: &str,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            auth_url: auth_url.trim_end_matches('/').to_string(),
            token_url: token_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/{}.json", self.endpoint, path.trim_matches('/'))
    }

    /// Current ID token, refreshed if it is about to expire.
    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        let token = guard
            .as_ref()
            .ok_or_else(|| TrackerError::Publish("not authenticated".to_string()))?;

        if !token.needs_refresh(Utc::now()) {
            return Ok(token.id_token.clone());
        }

        debug!("Refreshing ID token");
        let response = self
            .http
            .post(format!("{}/v1/token", self.token_url))
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", token.refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let message = error_message(response).await;
            return Err(TrackerError::Publish(format!("token refresh failed: {}", message)));
        }

        let refreshed: RefreshResponse = response.json().await?;
        let id_token = refreshed.id_token.clone();
        *guard = Some(IdToken {
            id_token: refreshed.id_token,
            refresh_token: refreshed.refresh_token,
            expires_at: expiry_from(refreshed.expires_in.as_deref()),
        });
        Ok(id_token)
    }

    async fn check_write(response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(TrackerError::Publish(format!("{}: {}", status, body.trim())))
    }
}

/// Best-effort extraction of `error.message` from a failed response.
async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| format!("{}: {}", status, body.trim())),
        Err(_) => status.to_string(),
    }
}

#[async_trait]
impl AuthProvider for FirebaseClient {
    async fn authenticate(&self, email: &str, password: &str) -> Result<AuthSession> {
        let response = self
            .http
            .post(format!("{}/v1/accounts:signInWithPassword", self.auth_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({
                "email": email,
                "password": password,
                "returnSecureToken": true,
            }))
            .send()
            .await
            .map_err(|e| TrackerError::Authentication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TrackerError::Authentication(error_message(response).await));
        }

        let signed_in: SignInResponse = response
            .json()
            .await
            .map_err(|e| TrackerError::Authentication(e.to_string()))?;

        info!("Signed in as {}", signed_in.local_id);
        *self.token.lock().await = Some(IdToken {
            id_token: signed_in.id_token,
            refresh_token: signed_in.refresh_token,
            expires_at: expiry_from(signed_in.expires_in.as_deref()),
        });

        Ok(AuthSession { user_id: signed_in.local_id })
    }
}

#[async_trait]
impl RemoteStore for FirebaseClient {
    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .put(self.data_url(path))
            .query(&[("auth", token.as_str())])
            .json(&value)
            .send()
            .await?;
        Self::check_write(response).await?;
        debug!("Set {}", path);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.data_url(path))
            .query(&[("auth", token.as_str())])
            .json(&value)
            .send()
            .await?;
        let response = Self::check_write(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(TrackerError::Publish("push returned no key".to_string()));
        }
        let pushed: PushResponse = response.json().await?;
        debug!("Pushed {}/{}", path, pushed.name);
        Ok(pushed.name)
    }
}
