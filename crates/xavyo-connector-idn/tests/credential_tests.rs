//! Credential broker tests against a mock tenant.

#![cfg(feature = "integration")]

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};
use xavyo_connector_idn::{CredentialKind, IdnClient, IdnError, PrivilegedLoginConfig};

#[tokio::test]
async fn test_api_token_is_cached_across_calls() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint_expecting("cached-token", 3600, 1).await;

    Mock::given(method("GET"))
        .and(path("/v3/public-identities-config"))
        .and(header("authorization", "Bearer cached-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(3)
        .mount(&mock.server)
        .await;

    let client = IdnClient::new(mock.config().build().unwrap()).unwrap();
    for _ in 0..3 {
        client.test_connection().await.unwrap();
    }

    let cached = client.broker().cached(CredentialKind::Api).await.unwrap();
    assert_eq!(cached.kind(), CredentialKind::Api);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let mock = MockIdnServer::new().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(create_token_response("shared-token", 3600))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&mock.server)
        .await;

    let client = IdnClient::new(mock.config().build().unwrap()).unwrap();
    let broker = client.broker();
    let (a, b, c) = tokio::join!(broker.api_token(), broker.api_token(), broker.api_token());

    assert_eq!(a.unwrap(), "shared-token");
    assert_eq!(b.unwrap(), "shared-token");
    assert_eq!(c.unwrap(), "shared-token");
}

#[tokio::test]
async fn test_token_inside_grace_period_is_refreshed() {
    let mock = MockIdnServer::new().await;
    // 10s lifetime is inside the default 30s grace period, so each call refreshes.
    mock.mock_token_endpoint_expecting("short-lived", 10, 2).await;

    let client = IdnClient::new(mock.config().build().unwrap()).unwrap();
    client.broker().api_token().await.unwrap();
    client.broker().api_token().await.unwrap();
}

#[tokio::test]
async fn test_token_failure_is_authentication_error() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_failure().await;

    let client = IdnClient::new(mock.config().build().unwrap()).unwrap();
    let err = client.test_connection().await.unwrap_err();

    assert!(matches!(err, IdnError::Authentication(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_rejected_api_token_is_refreshed_once() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint_expecting("mock-access-token", 3600, 2).await;

    Mock::given(method("GET"))
        .and(path("/v3/public-identities-config"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&mock.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/public-identities-config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock.server)
        .await;

    let client = IdnClient::new(mock.config().build().unwrap()).unwrap();
    client.test_connection().await.unwrap();
}

#[tokio::test]
async fn test_persistent_401_is_authorization_error() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    Mock::given(method("GET"))
        .and(path("/v3/public-identities-config"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&mock.server)
        .await;

    let client = IdnClient::new(mock.config().build().unwrap()).unwrap();
    let err = client.test_connection().await.unwrap_err();

    match err {
        IdnError::Authorization { status, .. } => assert_eq!(status, 401),
        other => panic!("Expected Authorization error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_privileged_login_scrapes_session_token() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(create_login_page("session-token")),
        )
        .expect(1)
        .mount(&mock.server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cc/api/v3/auth-users/id-1"))
        .and(header("authorization", "Bearer session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "id-1",
            "capabilities": ["ORG_ADMIN", "HELPDESK"]
        })))
        .expect(2)
        .mount(&mock.server)
        .await;

    let login = PrivilegedLoginConfig::new(format!("{}/login", mock.url()), "admin", "secret");
    let config = mock.config().privileged(login).build().unwrap();
    let client = IdnClient::new(config).unwrap();

    let first = client.get_capabilities("id-1").await.unwrap();
    let second = client.get_capabilities("id-1").await.unwrap();

    assert_eq!(first, vec!["ORG_ADMIN", "HELPDESK"]);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_revoked_privileged_session_logs_in_again() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    for session in ["session-1", "session-2"] {
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(create_login_page(session)),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock.server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/cc/api/v3/auth-users/id-1"))
        .and(header("authorization", "Bearer session-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cc/api/v3/auth-users/id-1"))
        .and(header("authorization", "Bearer session-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "id-1",
            "capabilities": ["HELPDESK"]
        })))
        .expect(1)
        .mount(&mock.server)
        .await;

    let login = PrivilegedLoginConfig::new(format!("{}/login", mock.url()), "admin", "secret");
    let client = IdnClient::new(mock.config().privileged(login).build().unwrap()).unwrap();

    let capabilities = client.get_capabilities("id-1").await.unwrap();

    assert_eq!(capabilities, vec!["HELPDESK"]);
    assert!(client.broker().cached(CredentialKind::Privileged).await.is_some());
}

#[tokio::test]
async fn test_privileged_login_failure_degrades_to_authorization() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Service unavailable"))
        .mount(&mock.server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cc/api/v3/auth-users/id-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock.server)
        .await;

    let login = PrivilegedLoginConfig::new(format!("{}/login", mock.url()), "admin", "secret");
    let config = mock.config().privileged(login).build().unwrap();
    let client = IdnClient::new(config).unwrap();

    assert!(client.broker().privileged_token().await.is_none());

    let err = client.get_capabilities("id-1").await.unwrap_err();
    assert!(matches!(err, IdnError::Authorization { status: 401, .. }));

    // The API credential is unaffected.
    assert!(client.broker().api_token().await.is_ok());
}

#[tokio::test]
async fn test_login_page_without_blob_yields_no_session() {
    let mock = MockIdnServer::new().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>Invalid credentials</html>"))
        .mount(&mock.server)
        .await;

    let login = PrivilegedLoginConfig::new(format!("{}/login", mock.url()), "admin", "wrong");
    let config = mock.config().privileged(login).build().unwrap();
    let client = IdnClient::new(config).unwrap();

    assert!(client.broker().privileged_token().await.is_none());
    assert!(client.broker().cached(CredentialKind::Privileged).await.is_none());
}
