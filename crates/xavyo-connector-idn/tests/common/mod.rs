//! Common test utilities for xavyo-connector-idn integration tests.

#![cfg(feature = "integration")]
#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Once;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};
use xavyo_connector_idn::{
    IdnConfig, IdnConfigBuilder, RetryPolicy, PRIVILEGED_IDENTITIES_QUERY, TOTAL_COUNT_HEADER,
};

static INIT: Once = Once::new();

/// Initialize logging for tests (once), when `RUST_LOG` is set.
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

pub const HR_SOURCE: &str = "src-hr";
pub const GROUP_A: &str = "5e3e4b7a-1c2d-4e5f-8a9b-0c1d2e3f4a5b";
pub const GROUP_B: &str = "0f9e8d7c-6b5a-4c3d-9e2f-1a0b9c8d7e6f";

/// Test data factory for identities as returned by the identity endpoints.
pub fn create_identity(id: &str, uid: &str) -> Value {
    json!({
        "id": id,
        "name": uid,
        "identityStatus": "ACTIVE",
        "attributes": {
            "uid": uid,
            "firstname": "Test",
            "lastname": uid,
            "displayName": format!("Test {uid}"),
            "email": format!("{uid}@example.com"),
            "cloudAuthoritativeSource": HR_SOURCE
        }
    })
}

/// Identity whose lifecycle state was set by hand.
pub fn create_identity_with_lifecycle(id: &str, uid: &str, state: &str, manual: bool) -> Value {
    let mut identity = create_identity(id, uid);
    identity["lifecycleState"] = json!({
        "stateName": state,
        "manuallyUpdated": manual
    });
    identity
}

/// Search document for an identity holding a platform account.
pub fn create_identity_document(id: &str, name: &str, assigned_groups: Option<Value>) -> Value {
    let mut platform_account = json!({
        "id": format!("acc-{id}"),
        "source": { "id": "src-idn", "name": "IdentityNow" },
        "entitlementAttributes": {}
    });
    if let Some(groups) = assigned_groups {
        platform_account["entitlementAttributes"]["assignedGroups"] = groups;
    }
    json!({
        "id": id,
        "name": name,
        "attributes": { "email": format!("{name}@example.com") },
        "accounts": [
            { "id": format!("ad-{id}"), "source": { "id": "src-ad", "name": "Active Directory" } },
            platform_account
        ]
    })
}

/// Test data factory for governance groups.
pub fn create_workgroup(id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "description": format!("Test group: {name}")
    })
}

pub fn create_identity_profile(id: &str, name: &str, source: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "authoritativeSource": { "id": source, "name": "HR" }
    })
}

pub fn create_lifecycle_state(id: &str, name: &str, technical_name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "technicalName": technical_name
    })
}

/// Creates a mock OAuth token response.
pub fn create_token_response(access_token: &str, expires_in: u64) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": expires_in
    })
}

/// Login page embedding the privileged session token.
pub fn create_login_page(token: &str) -> String {
    format!(
        r#"<html><head><script id="slpt-globals-json" type="application/json">{{"api":{{"accessToken":"{token}","baseUrl":"/cc/api"}}}}</script></head><body></body></html>"#
    )
}

/// Records for `count` sequentially numbered identities, starting at `start`.
pub fn numbered_records(start: usize, count: usize) -> Vec<Value> {
    (start..start + count)
        .map(|i| create_identity(&format!("id-{i:04}"), &format!("user{i:04}")))
        .collect()
}

/// Page response carrying a total count header.
pub fn page_response(records: Vec<Value>, total: Option<usize>) -> ResponseTemplate {
    let mut response = ResponseTemplate::new(200).set_body_json(Value::Array(records));
    if let Some(total) = total {
        response = response.insert_header(TOTAL_COUNT_HEADER, total.to_string().as_str());
    }
    response
}

/// Parsed JSON body of a received request.
pub fn json_body(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap_or(Value::Null)
}

/// Mock server wrapper with common setup helpers.
pub struct MockIdnServer {
    pub server: MockServer,
}

impl MockIdnServer {
    /// Creates a new mock tenant.
    pub async fn new() -> Self {
        init_test_logging();
        let server = MockServer::start().await;
        Self { server }
    }

    /// Returns the mock server's base URL.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Config pointing at this server with millisecond delays.
    pub fn config(&self) -> IdnConfigBuilder {
        IdnConfig::builder()
            .base_url(self.url())
            .client_credentials("test-client", "test-secret")
            .page_delay_ms(1)
            .settle_delay_ms(1)
            .retry(RetryPolicy::for_testing())
    }

    /// Sets up the OAuth token endpoint.
    pub async fn mock_token_endpoint(&self) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(create_token_response("mock-access-token", 3600)),
            )
            .mount(&self.server)
            .await;
    }

    /// Sets up the OAuth token endpoint, expecting exactly `calls` exchanges.
    pub async fn mock_token_endpoint_expecting(&self, token: &str, expires_in: u64, calls: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(create_token_response(token, expires_in)),
            )
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    /// Sets up a failing OAuth token endpoint.
    pub async fn mock_token_failure(&self) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "invalid_client"})),
            )
            .mount(&self.server)
            .await;
    }

    /// Sets up the identity list as a single page.
    pub async fn mock_identities(&self, identities: Vec<Value>) {
        let total = identities.len();
        Mock::given(method("GET"))
            .and(path("/beta/identities"))
            .respond_with(page_response(identities, Some(total)))
            .mount(&self.server)
            .await;
    }

    /// Sets up single identity reads.
    pub async fn mock_identity(&self, identity: &Value) {
        let id = identity["id"].as_str().unwrap_or_default();
        Mock::given(method("GET"))
            .and(path(format!("/beta/identities/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(identity.clone()))
            .mount(&self.server)
            .await;
    }

    /// Sets up the privileged identity search as a single page.
    pub async fn mock_privileged_identities(&self, documents: Vec<Value>) {
        let total = documents.len();
        Mock::given(method("POST"))
            .and(path("/v3/search"))
            .and(body_partial_json(
                json!({ "query": { "query": PRIVILEGED_IDENTITIES_QUERY } }),
            ))
            .respond_with(page_response(documents, Some(total)))
            .mount(&self.server)
            .await;
    }

    /// Sets up the search by id for one identity.
    pub async fn mock_identity_search(&self, identity_id: &str, hits: Vec<Value>) {
        Mock::given(method("POST"))
            .and(path("/v3/search"))
            .and(body_partial_json(
                json!({ "query": { "query": format!("id:\"{identity_id}\"") } }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(hits)))
            .mount(&self.server)
            .await;
    }

    /// Sets up capability reads on the primary API.
    pub async fn mock_capabilities(&self, identity_id: &str, capabilities: &[&str]) {
        Mock::given(method("GET"))
            .and(path(format!("/v3/auth-users/{identity_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": identity_id,
                "uid": identity_id,
                "capabilities": capabilities
            })))
            .mount(&self.server)
            .await;
    }

    /// Sets up capability replacement, expecting exactly `calls` writes.
    pub async fn mock_capability_patch(&self, identity_id: &str, calls: u64) {
        Mock::given(method("PATCH"))
            .and(path(format!("/v3/auth-users/{identity_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": identity_id})))
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    /// Sets up governance groups and their members.
    pub async fn mock_workgroups(&self, groups: Vec<(Value, Vec<&str>)>) {
        let total = groups.len();
        let records: Vec<Value> = groups.iter().map(|(g, _)| g.clone()).collect();
        Mock::given(method("GET"))
            .and(path("/beta/workgroups"))
            .respond_with(page_response(records, Some(total)))
            .mount(&self.server)
            .await;

        for (group, members) in groups {
            let id = group["id"].as_str().unwrap_or_default().to_string();
            let members: Vec<Value> = members
                .iter()
                .map(|m| json!({ "id": m, "name": m, "type": "IDENTITY" }))
                .collect();
            Mock::given(method("GET"))
                .and(path(format!("/v2/workgroups/{id}/members")))
                .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(members)))
                .mount(&self.server)
                .await;
        }
    }

    /// Sets up identity profiles and their lifecycle states.
    pub async fn mock_identity_profiles(&self, profiles: Vec<(Value, Vec<Value>)>) {
        let total = profiles.len();
        let records: Vec<Value> = profiles.iter().map(|(p, _)| p.clone()).collect();
        Mock::given(method("GET"))
            .and(path("/beta/identity-profiles"))
            .respond_with(page_response(records, Some(total)))
            .mount(&self.server)
            .await;

        for (profile, states) in profiles {
            let id = profile["id"].as_str().unwrap_or_default().to_string();
            Mock::given(method("GET"))
                .and(path(format!("/v3/identity-profiles/{id}/lifecycle-states")))
                .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(states)))
                .mount(&self.server)
                .await;
        }
    }

    /// Sets up lifecycle state writes, expecting exactly `calls`.
    pub async fn mock_set_lifecycle_state(&self, identity_id: &str, calls: u64) {
        Mock::given(method("POST"))
            .and(path(format!("/v3/identities/{identity_id}/set-lifecycle-state")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accountActivityId": "activity-1"
            })))
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    /// Requests received for `method` and `path`, in arrival order.
    pub async fn requests_to(&self, http_method: &str, request_path: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == http_method && r.url.path() == request_path)
            .collect()
    }
}
