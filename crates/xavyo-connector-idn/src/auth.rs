//! Credential management for the two IdentityNow API surfaces.
//!
//! The primary API uses an `OAuth2` client-credentials token whose lifetime is
//! returned by the token endpoint. The privileged surface uses a session token
//! scraped from the login page; the upstream gives no lifetime for it, so a
//! fixed validity is assumed.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::{IdnConfig, IdnError, IdnResult};

/// Assumed validity of a privileged session token, in minutes.
pub const PRIVILEGED_TOKEN_VALIDITY_MINUTES: i64 = 15;

/// Which credential a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// `OAuth2` client-credentials token for the primary API.
    Api,
    /// Session token for the privileged API surface.
    Privileged,
}

/// OAuth2 token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// An issued bearer credential. Replaced wholesale on refresh.
#[derive(Clone)]
pub struct Credential {
    kind: CredentialKind,
    token: String,
    expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    #[must_use]
    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true if the credential is expired or will expire within the grace period.
    #[must_use]
    pub fn is_expired(&self, grace_period: Duration) -> bool {
        Utc::now() + grace_period >= self.expires_at
    }
}

/// One cached credential with its refresh guard.
#[derive(Debug, Default)]
struct CredentialSlot {
    cached: RwLock<Option<Credential>>,
    refresh: Mutex<()>,
}

impl CredentialSlot {
    async fn fresh_token(&self, grace_period: Duration) -> Option<String> {
        let cache = self.cached.read().await;
        cache
            .as_ref()
            .filter(|c| !c.is_expired(grace_period))
            .map(|c| c.token.clone())
    }

    async fn store(&self, credential: Credential) {
        let mut cache = self.cached.write().await;
        *cache = Some(credential);
    }

    async fn snapshot(&self) -> Option<Credential> {
        self.cached.read().await.clone()
    }
}

/// Owns both credentials and serializes their refresh.
///
/// Concurrent callers that find a credential expired queue on the slot's
/// refresh lock; the first performs the network exchange and the rest pick up
/// its result from the cache.
#[derive(Debug)]
pub struct CredentialBroker {
    config: Arc<IdnConfig>,
    http_client: reqwest::Client,
    api: CredentialSlot,
    privileged: CredentialSlot,
    grace_period: Duration,
}

impl CredentialBroker {
    /// Creates a broker with empty caches.
    pub fn new(config: Arc<IdnConfig>, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
            api: CredentialSlot::default(),
            privileged: CredentialSlot::default(),
            grace_period: Duration::seconds(30),
        }
    }

    /// Overrides how long before expiry a credential is treated as expired.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Returns a valid API token, refreshing it if necessary.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Authentication` if the token exchange fails. There is
    /// no fallback for the primary API.
    #[instrument(skip(self))]
    pub async fn api_token(&self) -> IdnResult<String> {
        if let Some(token) = self.api.fresh_token(self.grace_period).await {
            debug!("Using cached API token");
            return Ok(token);
        }

        let _guard = self.api.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.api.fresh_token(self.grace_period).await {
            return Ok(token);
        }

        debug!("Refreshing API token");
        let credential = self.acquire_api_token().await?;
        let token = credential.token.clone();
        self.api.store(credential).await;
        Ok(token)
    }

    /// Returns the privileged session token, refreshing it if necessary.
    ///
    /// A failed refresh is logged and the stale token (or none) is returned;
    /// requests made with it fail downstream with an authorization error.
    #[instrument(skip(self))]
    pub async fn privileged_token(&self) -> Option<String> {
        if let Some(token) = self.privileged.fresh_token(self.grace_period).await {
            debug!("Using cached privileged token");
            return Some(token);
        }

        let _guard = self.privileged.refresh.lock().await;
        if let Some(token) = self.privileged.fresh_token(self.grace_period).await {
            return Some(token);
        }

        debug!("Refreshing privileged token");
        match self.acquire_privileged_token().await {
            Ok(credential) => {
                let token = credential.token.clone();
                self.privileged.store(credential).await;
                Some(token)
            }
            Err(e) => {
                warn!(error = %e, "Privileged login failed, continuing with stale session");
                self.privileged.snapshot().await.map(|c| c.token)
            }
        }
    }

    /// Returns the token for the given surface.
    ///
    /// # Errors
    ///
    /// Propagates API token refresh failures.
    pub async fn token_for(&self, kind: CredentialKind) -> IdnResult<Option<String>> {
        match kind {
            CredentialKind::Api => self.api_token().await.map(Some),
            CredentialKind::Privileged => Ok(self.privileged_token().await),
        }
    }

    /// Returns the cached credential of the given kind without refreshing it.
    pub async fn cached(&self, kind: CredentialKind) -> Option<Credential> {
        match kind {
            CredentialKind::Api => self.api.snapshot().await,
            CredentialKind::Privileged => self.privileged.snapshot().await,
        }
    }

    /// Invalidates a cached credential, forcing a refresh on next use.
    pub async fn invalidate(&self, kind: CredentialKind) {
        let slot = match kind {
            CredentialKind::Api => &self.api,
            CredentialKind::Privileged => &self.privileged,
        };
        let mut cache = slot.cached.write().await;
        *cache = None;
    }

    /// Exchanges the client credentials for an API token.
    async fn acquire_api_token(&self) -> IdnResult<Credential> {
        let token_url = self.config.token_url()?;

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
        ];

        let response = self
            .http_client
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| IdnError::Authentication(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IdnError::Authentication(format!(
                "Token request failed with status {status}: {body}"
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdnError::Authentication(format!("Failed to parse token response: {e}")))?;

        if token_response.expires_in <= 0 {
            return Err(IdnError::Authentication(format!(
                "Token endpoint returned non-positive lifetime {}",
                token_response.expires_in
            )));
        }

        let expires_at = Utc::now() + Duration::seconds(token_response.expires_in);

        debug!(
            "Acquired new API token, expires at {}",
            expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        Ok(Credential {
            kind: CredentialKind::Api,
            token: token_response.access_token,
            expires_at,
        })
    }

    /// Logs in through the form endpoint and scrapes the session token.
    async fn acquire_privileged_token(&self) -> IdnResult<Credential> {
        let login = self.config.privileged.as_ref().ok_or_else(|| {
            IdnError::Config("Privileged login is not configured".to_string())
        })?;

        let params = [
            ("username", login.username.as_str()),
            ("password", login.password.expose_secret()),
        ];

        let response = self
            .http_client
            .post(&login.login_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| IdnError::Authentication(format!("Login request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IdnError::Authentication(format!("Failed to read login page: {e}")))?;

        if !status.is_success() {
            return Err(IdnError::Authentication(format!(
                "Login failed with status {status}"
            )));
        }

        let token = extract_session_token(&body, &login.blob_element_id, &login.token_pointer)?;

        Ok(Credential {
            kind: CredentialKind::Privileged,
            token,
            expires_at: Utc::now() + Duration::minutes(PRIVILEGED_TOKEN_VALIDITY_MINUTES),
        })
    }
}

/// Pulls the session token out of the JSON blob embedded in the login page.
///
/// # Errors
///
/// Returns `IdnError::Authentication` if the blob is missing, is not JSON, or
/// does not carry a string at `token_pointer`.
pub fn extract_session_token(html: &str, element_id: &str, token_pointer: &str) -> IdnResult<String> {
    let pattern = format!(
        r#"(?s)<script[^>]*\bid\s*=\s*["']{}["'][^>]*>(.*?)</script>"#,
        regex::escape(element_id)
    );
    let re = Regex::new(&pattern)
        .map_err(|e| IdnError::Config(format!("Invalid blob element id: {e}")))?;

    let blob = re
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .ok_or_else(|| {
            IdnError::Authentication(format!("Login page has no '{element_id}' element"))
        })?;

    let value: serde_json::Value = serde_json::from_str(blob)
        .map_err(|e| IdnError::Authentication(format!("Embedded session blob is not JSON: {e}")))?;

    value
        .pointer(token_pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            IdnError::Authentication(format!("Session blob has no token at {token_pointer}"))
        })
}

/// Decodes the (unverified) claims of a JWT.
///
/// # Errors
///
/// Returns `IdnError::InvalidResponse` if the token is not a three-part JWT
/// with a JSON payload.
pub fn decode_jwt_claims(token: &str) -> IdnResult<serde_json::Value> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| IdnError::InvalidResponse("Token is not a JWT".to_string()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| IdnError::InvalidResponse(format!("JWT payload is not base64url: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}
