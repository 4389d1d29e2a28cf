//! Connector configuration.
//!
//! Keys follow the source configuration document (`baseUrl`, `clientId`,
//! `enableLevels`, ...). Loading the document is the host's job; this module
//! only deserializes and validates it.

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{IdnError, IdnResult};

/// Largest page the search and list endpoints accept.
pub const MAX_PAGE_SIZE: u32 = 250;

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn default_token_path() -> String {
    "/oauth/token".to_string()
}

fn default_settle_delay_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_page_delay_ms() -> u64 {
    250
}

fn default_blob_element_id() -> String {
    "slpt-globals-json".to_string()
}

fn default_token_pointer() -> String {
    "/api/accessToken".to_string()
}

fn default_privileged_api_path() -> String {
    "/cc/api".to_string()
}

/// How the paginated fetcher decides when a scan is complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TotalCountPolicy {
    /// Trust the total declared on the first page for the whole scan.
    #[default]
    FirstPage,
    /// Re-read the declared total on every page.
    EveryPage,
}

/// What happens to an account's entitlements when it is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisableEntitlementPolicy {
    /// Leave levels and governance groups untouched.
    #[default]
    Keep,
    /// Remove every level and governance group after disabling.
    Strip,
    /// Strip, unless the account has a manually set lifecycle state.
    StripUnlessManualLifecycle,
}

/// Paging knobs shared by every list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    /// Records requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Pause between consecutive page requests.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    /// Termination rule for cursor and offset scans.
    #[serde(default)]
    pub total_count_policy: TotalCountPolicy,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            total_count_policy: TotalCountPolicy::default(),
        }
    }
}

impl PaginationConfig {
    /// Pause between consecutive page requests.
    #[must_use]
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

/// Form login used to obtain the privileged session token.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivilegedLoginConfig {
    /// Form-POST login endpoint.
    pub login_url: String,
    /// Login user name.
    pub username: String,
    /// Login password.
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    /// Base path of the privileged API, relative to `baseUrl`.
    #[serde(default = "default_privileged_api_path")]
    pub api_path: String,
    /// `id` of the script element carrying the embedded JSON blob.
    #[serde(default = "default_blob_element_id")]
    pub blob_element_id: String,
    /// JSON pointer to the session token inside the blob.
    #[serde(default = "default_token_pointer")]
    pub token_pointer: String,
}

impl PrivilegedLoginConfig {
    /// Creates a login block with default blob location.
    pub fn new(
        login_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            login_url: login_url.into(),
            username: username.into(),
            password: SecretString::from(password.into()),
            api_path: default_privileged_api_path(),
            blob_element_id: default_blob_element_id(),
            token_pointer: default_token_pointer(),
        }
    }
}

/// IdentityNow connector configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdnConfig {
    /// Tenant API base URL (e.g. `https://acme.api.identitynow.com`).
    #[serde(rename = "baseurl", alias = "baseUrl")]
    pub base_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    #[serde(deserialize_with = "deserialize_secret")]
    pub client_secret: SecretString,
    /// Token endpoint path, resolved against the base URL origin.
    #[serde(default = "default_token_path")]
    pub token_path: String,
    /// Privileged session login, required for capability reads and writes.
    #[serde(default)]
    pub privileged: Option<PrivilegedLoginConfig>,
    /// Manage levels (capabilities).
    #[serde(default)]
    pub enable_levels: bool,
    /// Manage governance group membership.
    #[serde(default)]
    pub enable_workgroups: bool,
    /// Manage manually set lifecycle states.
    #[serde(default, alias = "enableLCS")]
    pub enable_lcs: bool,
    /// Deliver per-operation error reports.
    #[serde(default)]
    pub enable_reports: bool,
    /// List every identity, not only those holding an entitlement.
    #[serde(default)]
    pub all_identities: bool,
    /// Entitlement handling on disable.
    #[serde(default)]
    pub disable_policy: DisableEntitlementPolicy,
    /// Paging knobs.
    #[serde(default)]
    pub pagination: PaginationConfig,
    /// Retry policy for outbound calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Wait after writes before re-reading state.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Per-call HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Overrides the report recipient resolved from the workflow owner.
    #[serde(default)]
    pub report_recipient: Option<String>,
}

impl IdnConfig {
    /// Returns a builder with every knob at its default.
    #[must_use]
    pub fn builder() -> IdnConfigBuilder {
        IdnConfigBuilder::default()
    }

    /// Deserializes and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Config` if the document is malformed or invalid.
    pub fn from_json(value: serde_json::Value) -> IdnResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| IdnError::Config(format!("Invalid configuration document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Config` describing the first invalid field.
    pub fn validate(&self) -> IdnResult<()> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| IdnError::Config(format!("baseUrl is not a valid URL: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(IdnError::Config(format!(
                "Unsupported baseUrl scheme: {}",
                base.scheme()
            )));
        }
        if self.client_id.trim().is_empty() {
            return Err(IdnError::Config("clientId must not be empty".to_string()));
        }
        if !self.token_path.starts_with('/') {
            return Err(IdnError::Config("tokenPath must start with '/'".to_string()));
        }
        if self.pagination.page_size == 0 || self.pagination.page_size > MAX_PAGE_SIZE {
            return Err(IdnError::Config(format!(
                "pageSize must be in 1..={MAX_PAGE_SIZE}"
            )));
        }
        if let Some(ref privileged) = self.privileged {
            url::Url::parse(&privileged.login_url).map_err(|e| {
                IdnError::Config(format!("privileged.loginUrl is not a valid URL: {e}"))
            })?;
            if !privileged.token_pointer.starts_with('/') {
                return Err(IdnError::Config(
                    "privileged.tokenPointer must be a JSON pointer".to_string(),
                ));
            }
        }
        self.retry.validate().map_err(IdnError::Config)?;
        Ok(())
    }

    /// OAuth token endpoint: base URL origin plus the token path.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL cannot be parsed.
    pub fn token_url(&self) -> IdnResult<String> {
        let base = url::Url::parse(&self.base_url)?;
        Ok(format!(
            "{}{}",
            base.origin().ascii_serialization(),
            self.token_path
        ))
    }

    /// Joins an API path onto the base URL.
    #[must_use]
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Joins a path onto the privileged API base, falling back to the primary API.
    #[must_use]
    pub fn privileged_api_url(&self, path: &str) -> String {
        match self.privileged {
            Some(ref p) => self.api_url(&format!("{}{}", p.api_path.trim_end_matches('/'), path)),
            None => self.api_url(path),
        }
    }

    /// Wait applied after writes.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Per-call HTTP timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Builder for [`IdnConfig`].
#[derive(Debug, Default)]
pub struct IdnConfigBuilder {
    base_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_path: Option<String>,
    privileged: Option<PrivilegedLoginConfig>,
    enable_levels: bool,
    enable_workgroups: bool,
    enable_lcs: bool,
    enable_reports: bool,
    all_identities: bool,
    disable_policy: DisableEntitlementPolicy,
    pagination: PaginationConfig,
    retry: Option<RetryPolicy>,
    settle_delay_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    report_recipient: Option<String>,
}

impl IdnConfigBuilder {
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn client_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    #[must_use]
    pub fn token_path(mut self, path: impl Into<String>) -> Self {
        self.token_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn privileged(mut self, login: PrivilegedLoginConfig) -> Self {
        self.privileged = Some(login);
        self
    }

    #[must_use]
    pub fn enable_levels(mut self, enabled: bool) -> Self {
        self.enable_levels = enabled;
        self
    }

    #[must_use]
    pub fn enable_workgroups(mut self, enabled: bool) -> Self {
        self.enable_workgroups = enabled;
        self
    }

    #[must_use]
    pub fn enable_lcs(mut self, enabled: bool) -> Self {
        self.enable_lcs = enabled;
        self
    }

    #[must_use]
    pub fn enable_reports(mut self, enabled: bool) -> Self {
        self.enable_reports = enabled;
        self
    }

    #[must_use]
    pub fn all_identities(mut self, enabled: bool) -> Self {
        self.all_identities = enabled;
        self
    }

    #[must_use]
    pub fn disable_policy(mut self, policy: DisableEntitlementPolicy) -> Self {
        self.disable_policy = policy;
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.pagination.page_size = page_size;
        self
    }

    #[must_use]
    pub fn page_delay_ms(mut self, delay_ms: u64) -> Self {
        self.pagination.page_delay_ms = delay_ms;
        self
    }

    #[must_use]
    pub fn total_count_policy(mut self, policy: TotalCountPolicy) -> Self {
        self.pagination.total_count_policy = policy;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn settle_delay_ms(mut self, delay_ms: u64) -> Self {
        self.settle_delay_ms = Some(delay_ms);
        self
    }

    #[must_use]
    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn report_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.report_recipient = Some(recipient.into());
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Config` if a required field is missing or invalid.
    pub fn build(self) -> IdnResult<IdnConfig> {
        let config = IdnConfig {
            base_url: self
                .base_url
                .ok_or_else(|| IdnError::Config("baseUrl is required".to_string()))?,
            client_id: self
                .client_id
                .ok_or_else(|| IdnError::Config("clientId is required".to_string()))?,
            client_secret: SecretString::from(self.client_secret.unwrap_or_default()),
            token_path: self.token_path.unwrap_or_else(default_token_path),
            privileged: self.privileged,
            enable_levels: self.enable_levels,
            enable_workgroups: self.enable_workgroups,
            enable_lcs: self.enable_lcs,
            enable_reports: self.enable_reports,
            all_identities: self.all_identities,
            disable_policy: self.disable_policy,
            pagination: self.pagination,
            retry: self.retry.unwrap_or_default(),
            settle_delay_ms: self.settle_delay_ms.unwrap_or_else(default_settle_delay_ms),
            request_timeout_secs: self
                .request_timeout_secs
                .unwrap_or_else(default_request_timeout_secs),
            report_recipient: self.report_recipient,
        };
        config.validate()?;
        Ok(config)
    }
}
