//! Account aggregation tests against a mock tenant.

#![cfg(feature = "integration")]

mod common;

use async_trait::async_trait;
use common::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};
use xavyo_connector_idn::{
    AccountOutput, ErrorNotifier, IdnConnector, IdnError, IdnResult, PrivilegedLoginConfig,
    RunReport,
};

#[derive(Default)]
struct RecordingNotifier {
    reports: Mutex<Vec<RunReport>>,
}

#[async_trait]
impl ErrorNotifier for RecordingNotifier {
    async fn notify(&self, report: &RunReport) -> IdnResult<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

async fn list(connector: &IdnConnector) -> IdnResult<(RunReport, Vec<AccountOutput>)> {
    let mut accounts = Vec::new();
    let report = connector.list_accounts(|a| accounts.push(a)).await?;
    Ok((report, accounts))
}

#[tokio::test]
async fn test_api_token_failure_aborts_listing() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_failure().await;

    let notifier = Arc::new(RecordingNotifier::default());
    let connector = IdnConnector::new(mock.config().all_identities(true).build().unwrap())
        .unwrap()
        .with_notifier(notifier.clone());

    let mut emitted = 0;
    let err = connector
        .list_accounts(|_| emitted += 1)
        .await
        .unwrap_err();

    assert!(matches!(err, IdnError::Authentication(_)));
    assert_eq!(emitted, 0);

    let reports = notifier.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].errors()[0].starts_with("run: "));
}

#[tokio::test]
async fn test_privileged_failure_only_affects_one_account() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cc/api/v3/auth-users/id-2"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock.server)
        .await;

    mock.mock_privileged_identities(vec![
        create_identity_document("id-1", "alice", Some(json!(["ORG_ADMIN"]))),
        create_identity_document("id-2", "bob", None),
    ])
    .await;
    mock.mock_identities(vec![
        create_identity("id-1", "alice"),
        create_identity("id-2", "bob"),
        create_identity("id-3", "carol"),
    ])
    .await;

    let notifier = Arc::new(RecordingNotifier::default());
    let login = PrivilegedLoginConfig::new(format!("{}/login", mock.url()), "admin", "secret");
    let config = mock
        .config()
        .enable_levels(true)
        .privileged(login)
        .build()
        .unwrap();
    let connector = IdnConnector::new(config)
        .unwrap()
        .with_notifier(notifier.clone());

    let (report, accounts) = list(&connector).await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.emitted, 1);
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].identity, "id-1");
    assert_eq!(accounts[0].values("levels"), vec!["ORG_ADMIN"]);

    assert_eq!(report.errors().len(), 1);
    assert!(report.errors()[0].starts_with("bob: "));
    assert!(matches!(
        report.partial_error(),
        Some(IdnError::PartialRun { failed: 1, total: 3 })
    ));
    assert_eq!(notifier.reports.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_indexed_and_direct_levels_agree() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    mock.mock_privileged_identities(vec![create_identity_document(
        "id-1",
        "alice",
        Some(json!(["ORG_ADMIN", "HELPDESK"])),
    )])
    .await;
    let identity = create_identity("id-1", "alice");
    mock.mock_identities(vec![identity.clone()]).await;
    mock.mock_identity(&identity).await;

    // Only the direct read touches the capability endpoint.
    Mock::given(method("GET"))
        .and(path("/v3/auth-users/id-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "id-1",
            "capabilities": ["HELPDESK", "ORG_ADMIN"]
        })))
        .expect(1)
        .mount(&mock.server)
        .await;

    let connector = IdnConnector::new(mock.config().enable_levels(true).build().unwrap()).unwrap();

    let (_, listed) = list(&connector).await.unwrap();
    let read = connector.read_account("id-1").await.unwrap();

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0], read);
    assert_eq!(read.values("levels"), vec!["HELPDESK", "ORG_ADMIN"]);
}

#[tokio::test]
async fn test_missing_assigned_groups_falls_back_to_capabilities() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    mock.mock_privileged_identities(vec![create_identity_document("id-1", "alice", None)])
        .await;
    mock.mock_identities(vec![create_identity("id-1", "alice")]).await;
    mock.mock_capabilities("id-1", &["REPORT_ADMIN"]).await;

    let connector = IdnConnector::new(mock.config().enable_levels(true).build().unwrap()).unwrap();
    let (report, accounts) = list(&connector).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(accounts[0].values("levels"), vec!["REPORT_ADMIN"]);
}

#[tokio::test]
async fn test_identities_without_entitlements_are_discarded() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;
    mock.mock_privileged_identities(Vec::new()).await;
    mock.mock_identities(vec![create_identity("id-1", "alice"), create_identity("id-2", "bob")])
        .await;

    let connector = IdnConnector::new(mock.config().enable_levels(true).build().unwrap()).unwrap();
    let (report, accounts) = list(&connector).await.unwrap();

    assert_eq!(report.processed, 2);
    assert!(accounts.is_empty());
}

#[tokio::test]
async fn test_all_identities_emits_everyone() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;
    mock.mock_privileged_identities(Vec::new()).await;
    mock.mock_identities(vec![create_identity("id-1", "alice"), create_identity("id-2", "bob")])
        .await;

    let config = mock
        .config()
        .enable_levels(true)
        .all_identities(true)
        .build()
        .unwrap();
    let connector = IdnConnector::new(config).unwrap();
    let (report, accounts) = list(&connector).await.unwrap();

    assert_eq!(report.emitted, 2);
    assert_eq!(accounts[1].uuid, "bob");
    assert_eq!(accounts[1].attributes["levels"], json!([]));
    assert!(!accounts[1].attributes.contains_key("workgroups"));
}

#[tokio::test]
async fn test_workgroups_and_manual_lifecycle_states() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;

    mock.mock_workgroups(vec![
        (create_workgroup(GROUP_A, "Auditors"), vec!["id-1"]),
        (create_workgroup(GROUP_B, "Approvers"), vec!["id-1", "id-9"]),
    ])
    .await;
    mock.mock_identity_profiles(vec![(
        create_identity_profile("p-emp", "Employees", HR_SOURCE),
        vec![create_lifecycle_state("s-leave", "On leave", "leave")],
    )])
    .await;
    mock.mock_identities(vec![
        create_identity("id-1", "alice"),
        create_identity_with_lifecycle("id-2", "bob", "leave", true),
        create_identity_with_lifecycle("id-3", "carol", "leave", false),
    ])
    .await;

    let config = mock
        .config()
        .enable_workgroups(true)
        .enable_lcs(true)
        .build()
        .unwrap();
    let connector = IdnConnector::new(config).unwrap();
    let (report, accounts) = list(&connector).await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(accounts.len(), 2);

    let alice = &accounts[0];
    assert_eq!(alice.values("workgroups"), vec![GROUP_B, GROUP_A]);
    assert_eq!(alice.attributes["lcs"], Value::Null);

    let bob = &accounts[1];
    assert!(bob.values("workgroups").is_empty());
    assert_eq!(bob.attributes["lcs"], json!("s-leave"));
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let mock = MockIdnServer::new().await;
    mock.mock_token_endpoint().await;
    mock.mock_identities(vec![
        json!({ "name": "no-id" }),
        create_identity("id-2", "bob"),
    ])
    .await;

    let connector = IdnConnector::new(mock.config().all_identities(true).build().unwrap()).unwrap();
    let (report, accounts) = list(&connector).await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.errors().len(), 1);
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].identity, "id-2");
}
