//! IdentityNow REST/search client.
//!
//! Thin typed wrappers over the endpoints the connector uses. Every call goes
//! through the [`RetryingTransport`]; list endpoints go through a
//! [`PageStream`].

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::auth::{CredentialBroker, CredentialKind};
use crate::pagination::PageStream;
use crate::records::{
    workgroup_member_id, IdentityDocument, IdentityProfileRecord, IdentityRecord,
    LifecycleStateRecord, WorkflowRecord, WorkgroupRecord,
};
use crate::transport::{ApiRequest, RetryingTransport};
use crate::{IdnConfig, IdnError, IdnResult};

/// Search query selecting every identity holding a governance platform account.
pub const PRIVILEGED_IDENTITIES_QUERY: &str = "@access(source.name.exact:IdentityNow)";

const IDENTITIES_INDEX: &str = "identities";

/// Body of a governance-group membership change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipChange {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl MembershipChange {
    #[must_use]
    pub fn add(identity_id: impl Into<String>) -> Self {
        Self {
            add: vec![identity_id.into()],
            remove: Vec::new(),
        }
    }

    #[must_use]
    pub fn remove(identity_id: impl Into<String>) -> Self {
        Self {
            add: Vec::new(),
            remove: vec![identity_id.into()],
        }
    }
}

/// Client for the IdentityNow APIs.
#[derive(Debug)]
pub struct IdnClient {
    config: Arc<IdnConfig>,
    transport: RetryingTransport,
}

impl IdnClient {
    /// Creates a client sharing one HTTP connection pool between the
    /// credential broker and the transport.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Config` if the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: IdnConfig) -> IdnResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| IdnError::Config(format!("Failed to create HTTP client: {e}")))?;

        let broker = Arc::new(CredentialBroker::new(config.clone(), http_client.clone()));
        let transport = RetryingTransport::new(http_client, broker, config.retry.clone());

        Ok(Self { config, transport })
    }

    #[must_use]
    pub fn config(&self) -> &IdnConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &RetryingTransport {
        &self.transport
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<CredentialBroker> {
        self.transport.broker()
    }

    fn api(&self, path: &str) -> String {
        self.config.api_url(path)
    }

    fn offset_stream(&self, request: ApiRequest) -> PageStream<'_> {
        PageStream::offset(&self.transport, request, self.config.pagination.clone())
    }

    /// Surface and credential used for capability reads and writes.
    fn capability_request(&self, request: impl FnOnce(String) -> ApiRequest, identity_id: &str) -> ApiRequest {
        let path = format!("/v3/auth-users/{}", urlencoding::encode(identity_id));
        if self.config.privileged.is_some() {
            request(self.config.privileged_api_url(&path)).credential(CredentialKind::Privileged)
        } else {
            request(self.api(&path))
        }
    }

    /// Verifies the tenant is reachable with the configured credentials.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Authentication` if no token can be obtained, or the
    /// transport error of the probe call.
    #[instrument(skip(self))]
    pub async fn test_connection(&self) -> IdnResult<()> {
        self.transport
            .execute(ApiRequest::get(self.api("/v3/public-identities-config")))
            .await?;
        info!("Connection test successful");
        Ok(())
    }

    /// Offset-paginated stream over every identity.
    #[must_use]
    pub fn identity_pages(&self) -> PageStream<'_> {
        self.offset_stream(ApiRequest::get(self.api("/beta/identities")))
    }

    /// Lists every identity.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self))]
    pub async fn list_identities(&self) -> IdnResult<Vec<IdentityRecord>> {
        let records = self.identity_pages().collect_records().await?;
        records.iter().map(IdentityRecord::from_json).collect()
    }

    /// Reads one identity.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::NotFound` if the identity does not exist.
    #[instrument(skip(self))]
    pub async fn get_identity(&self, identity_id: &str) -> IdnResult<IdentityRecord> {
        let url = self.api(&format!(
            "/beta/identities/{}",
            urlencoding::encode(identity_id)
        ));
        let response = self
            .transport
            .execute(ApiRequest::get(url))
            .await
            .map_err(|e| not_found_as(e, || format!("Identity {identity_id}")))?;
        IdentityRecord::from_json(&response.body)
    }

    async fn search_identities(&self, query: String) -> IdnResult<Vec<IdentityDocument>> {
        let request = ApiRequest::post(self.api("/v3/search")).json(json!({
            "indices": [IDENTITIES_INDEX],
            "query": { "query": query },
            "sort": ["id"],
            "includeNested": true,
        }));
        let hits = self.transport.execute(request).await?.into_records()?;
        hits.iter().map(IdentityDocument::from_json).collect()
    }

    /// Finds an identity's search document by id.
    ///
    /// Only a hit carrying exactly `identity_id` is accepted.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors. An absent identity is `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn search_identity(&self, identity_id: &str) -> IdnResult<Option<IdentityDocument>> {
        let hits = self
            .search_identities(format!("id:\"{}\"", escape_query_term(identity_id)))
            .await?;
        let found = hits.into_iter().find(|doc| doc.id == identity_id);
        if found.is_none() {
            debug!(identity_id, "No search hit matches the identity id");
        }
        Ok(found)
    }

    /// Finds an identity's search document by `uid`.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors. An absent identity is `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn search_identity_by_uid(&self, uid: &str) -> IdnResult<Option<IdentityDocument>> {
        let hits = self
            .search_identities(format!(
                "attributes.uid.exact:\"{}\"",
                escape_query_term(uid)
            ))
            .await?;
        Ok(hits.into_iter().next())
    }

    /// Cursor-paginated stream over identities holding a platform account.
    #[must_use]
    pub fn privileged_identity_pages(&self) -> PageStream<'_> {
        let request = ApiRequest::post(self.api("/v3/search")).json(json!({
            "indices": [IDENTITIES_INDEX],
            "query": { "query": PRIVILEGED_IDENTITIES_QUERY },
            "sort": ["id"],
            "includeNested": true,
        }));
        PageStream::cursor(&self.transport, request, "id", self.config.pagination.clone())
    }

    /// Lists every identity holding a platform account, with nested accounts.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self))]
    pub async fn list_privileged_identities(&self) -> IdnResult<Vec<IdentityDocument>> {
        let records = self.privileged_identity_pages().collect_records().await?;
        debug!(count = records.len(), "Fetched privileged identities");
        records.iter().map(IdentityDocument::from_json).collect()
    }

    /// Lists every governance group.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self))]
    pub async fn list_workgroups(&self) -> IdnResult<Vec<WorkgroupRecord>> {
        let records = self
            .offset_stream(ApiRequest::get(self.api("/beta/workgroups")))
            .collect_records()
            .await?;
        records.iter().map(WorkgroupRecord::from_json).collect()
    }

    /// Reads one governance group.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::NotFound` if the group does not exist.
    #[instrument(skip(self))]
    pub async fn get_workgroup(&self, workgroup_id: &str) -> IdnResult<WorkgroupRecord> {
        let url = self.api(&format!(
            "/v2/workgroups/{}",
            urlencoding::encode(workgroup_id)
        ));
        let response = self
            .transport
            .execute(ApiRequest::get(url))
            .await
            .map_err(|e| not_found_as(e, || format!("Governance group {workgroup_id}")))?;
        WorkgroupRecord::from_json(&response.body)
    }

    /// Lists the identity ids that are members of a governance group.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self))]
    pub async fn list_workgroup_members(&self, workgroup_id: &str) -> IdnResult<Vec<String>> {
        let url = self.api(&format!(
            "/v2/workgroups/{}/members",
            urlencoding::encode(workgroup_id)
        ));
        let records = self.transport.execute(ApiRequest::get(url)).await?.into_records()?;
        records.iter().map(workgroup_member_id).collect()
    }

    /// Adds or removes governance group members.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    #[instrument(skip(self, change), fields(add = change.add.len(), remove = change.remove.len()))]
    pub async fn modify_workgroup_members(
        &self,
        workgroup_id: &str,
        change: &MembershipChange,
    ) -> IdnResult<()> {
        let url = self.api(&format!(
            "/v2/workgroups/{}/members",
            urlencoding::encode(workgroup_id)
        ));
        self.transport
            .execute(ApiRequest::post(url).json(serde_json::to_value(change)?))
            .await?;
        Ok(())
    }

    /// Lists every identity profile.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self))]
    pub async fn list_identity_profiles(&self) -> IdnResult<Vec<IdentityProfileRecord>> {
        let records = self
            .offset_stream(ApiRequest::get(self.api("/beta/identity-profiles")))
            .collect_records()
            .await?;
        records.iter().map(IdentityProfileRecord::from_json).collect()
    }

    /// Lists the lifecycle states of an identity profile.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self))]
    pub async fn list_lifecycle_states(&self, profile_id: &str) -> IdnResult<Vec<LifecycleStateRecord>> {
        let url = self.api(&format!(
            "/v3/identity-profiles/{}/lifecycle-states",
            urlencoding::encode(profile_id)
        ));
        let records = self.transport.execute(ApiRequest::get(url)).await?.into_records()?;
        records.iter().map(LifecycleStateRecord::from_json).collect()
    }

    /// Reads an identity's platform capabilities.
    ///
    /// Uses the privileged surface when it is configured.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Authorization` if the surface rejects the credential.
    #[instrument(skip(self))]
    pub async fn get_capabilities(&self, identity_id: &str) -> IdnResult<Vec<String>> {
        let request = self.capability_request(ApiRequest::get, identity_id);
        let response = self.transport.execute(request).await?;
        Ok(response
            .body
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| caps.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default())
    }

    /// Current capability set of an identity.
    ///
    /// An identity without an auth-user record holds no capabilities.
    ///
    /// # Errors
    ///
    /// Same as [`IdnClient::get_capabilities`], except that 404 is `Ok` and empty.
    pub async fn current_capabilities(&self, identity_id: &str) -> IdnResult<BTreeSet<String>> {
        match self.get_capabilities(identity_id).await {
            Ok(capabilities) => Ok(capabilities.into_iter().collect()),
            Err(e) if e.is_not_found() => {
                debug!(identity_id, "No auth-user record, treating as no capabilities");
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Replaces an identity's platform capabilities with `capabilities`.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Authorization` if the surface rejects the credential.
    #[instrument(skip(self, capabilities), fields(count = capabilities.len()))]
    pub async fn set_capabilities(&self, identity_id: &str, capabilities: &[String]) -> IdnResult<()> {
        let request = self
            .capability_request(ApiRequest::patch, identity_id)
            .json_patch(json!([{
                "op": "replace",
                "path": "/capabilities",
                "value": capabilities,
            }]));
        self.transport.execute(request).await?;
        Ok(())
    }

    /// Sets an identity's lifecycle state.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    #[instrument(skip(self))]
    pub async fn set_lifecycle_state(&self, identity_id: &str, state_id: &str) -> IdnResult<()> {
        let url = self.api(&format!(
            "/v3/identities/{}/set-lifecycle-state",
            urlencoding::encode(identity_id)
        ));
        self.transport
            .execute(ApiRequest::post(url).json(json!({ "lifecycleStateId": state_id })))
            .await?;
        Ok(())
    }

    async fn toggle_account(&self, account_id: &str, action: &str) -> IdnResult<()> {
        let url = self.api(&format!(
            "/v3/accounts/{}/{action}",
            urlencoding::encode(account_id)
        ));
        self.transport
            .execute(ApiRequest::post(url).json(json!({ "forceProvisioning": true })))
            .await?;
        Ok(())
    }

    /// Disables a source account.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    #[instrument(skip(self))]
    pub async fn disable_account(&self, account_id: &str) -> IdnResult<()> {
        self.toggle_account(account_id, "disable").await
    }

    /// Enables a source account.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    #[instrument(skip(self))]
    pub async fn enable_account(&self, account_id: &str) -> IdnResult<()> {
        self.toggle_account(account_id, "enable").await
    }

    /// Lists workflows.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self))]
    pub async fn list_workflows(&self) -> IdnResult<Vec<WorkflowRecord>> {
        let records = self
            .transport
            .execute(ApiRequest::get(self.api("/beta/workflows")))
            .await?
            .into_records()?;
        records.iter().map(WorkflowRecord::from_json).collect()
    }

    /// Creates a workflow from its definition.
    ///
    /// # Errors
    ///
    /// Propagates transport and parse errors.
    #[instrument(skip(self, definition))]
    pub async fn create_workflow(&self, definition: Value) -> IdnResult<WorkflowRecord> {
        let response = self
            .transport
            .execute(ApiRequest::post(self.api("/beta/workflows")).json(definition))
            .await?;
        WorkflowRecord::from_json(&response.body)
    }

    /// Triggers a test run of a workflow.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    #[instrument(skip(self, input))]
    pub async fn test_workflow(&self, workflow_id: &str, input: Value) -> IdnResult<()> {
        let url = self.api(&format!(
            "/beta/workflows/{}/test",
            urlencoding::encode(workflow_id)
        ));
        self.transport
            .execute(ApiRequest::post(url).json(json!({ "input": input })))
            .await?;
        Ok(())
    }
}

/// Escapes a term for use inside a quoted search query.
fn escape_query_term(term: &str) -> String {
    term.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Maps an upstream 404 to a typed not-found.
fn not_found_as(error: IdnError, what: impl FnOnce() -> String) -> IdnError {
    if error.is_not_found() {
        IdnError::NotFound(what())
    } else {
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_change_body() {
        let body = serde_json::to_value(MembershipChange::add("id-1")).unwrap();
        assert_eq!(body, json!({"add": ["id-1"]}));

        let body = serde_json::to_value(MembershipChange::remove("id-1")).unwrap();
        assert_eq!(body, json!({"remove": ["id-1"]}));
    }

    #[test]
    fn test_escape_query_term() {
        assert_eq!(escape_query_term("id-1"), "id-1");
        assert_eq!(escape_query_term(r#"a" OR id:*"#), r#"a\" OR id:*"#);
        assert_eq!(escape_query_term(r"a\b"), r"a\\b");
    }

    #[test]
    fn test_not_found_mapping() {
        let err = not_found_as(
            IdnError::Api {
                status: 404,
                message: "missing".to_string(),
                attempts: 1,
            },
            || "Identity x".to_string(),
        );
        assert!(matches!(err, IdnError::NotFound(ref m) if m == "Identity x"));

        let err = not_found_as(IdnError::Validation("bad".to_string()), String::new);
        assert!(matches!(err, IdnError::Validation(_)));
    }
}
