//! SailPoint IdentityNow governance connector for xavyo
//!
//! Aggregates IdentityNow's own administrative entitlements as accounts and
//! provisions changes back to the tenant:
//!
//! - **Levels**: platform capabilities such as `ORG_ADMIN` or `HELPDESK`
//! - **Governance groups**: delegated administration workgroups
//! - **Lifecycle states**: manually set identity lifecycle states
//!
//! # Architecture
//!
//! A [`CredentialBroker`] owns the OAuth API token and the optional
//! privileged session token. Every request goes through the
//! [`RetryingTransport`], list endpoints through a [`PageStream`]. The
//! [`EntitlementReconciler`] merges the three entitlement sources into one
//! [`AccountView`], and the [`ProvisioningCoordinator`] turns
//! [`EntitlementDelta`]s into writes.
//!
//! # Example
//!
//! ```no_run
//! use xavyo_connector_idn::{IdnConfig, IdnConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IdnConfig::builder()
//!     .base_url("https://acme.api.identitynow.com")
//!     .client_credentials("client-id", "client-secret")
//!     .enable_levels(true)
//!     .enable_workgroups(true)
//!     .build()?;
//!
//! let connector = IdnConnector::new(config)?;
//! connector.test_connection().await?;
//!
//! let report = connector
//!     .list_accounts(|account| println!("{}", account.identity))
//!     .await?;
//! println!("{} accounts, {} errors", report.emitted, report.errors().len());
//! # Ok(())
//! # }
//! ```

mod auth;
mod client;
mod config;
mod connector;
mod entitlements;
mod error;
mod levels;
mod pagination;
mod provisioning;
mod reconcile;
mod records;
mod report;
mod retry;
mod transport;

// Re-exports
pub use auth::{
    decode_jwt_claims, extract_session_token, Credential, CredentialBroker, CredentialKind,
    PRIVILEGED_TOKEN_VALIDITY_MINUTES,
};
pub use client::{IdnClient, MembershipChange, PRIVILEGED_IDENTITIES_QUERY};
pub use config::{
    DisableEntitlementPolicy, IdnConfig, IdnConfigBuilder, PaginationConfig,
    PrivilegedLoginConfig, TotalCountPolicy, MAX_PAGE_SIZE,
};
pub use connector::{AccountOutput, AttributeChange, IdnConnector};
pub use entitlements::{
    classify, partition, resulting_capabilities, AttributeChangeOp, EntitlementAttributes,
    EntitlementDelta, EntitlementKind, EntitlementOutput, Partition, ValueClass,
};
pub use error::{IdnError, IdnResult};
pub use levels::{find_level, Level, LEVELS};
pub use pagination::{Page, PageAddressing, PagePosition, PageStream};
pub use provisioning::{ProvisioningCoordinator, ProvisioningStage, WritePlan};
pub use reconcile::{
    AccountView, EntitlementReconciler, LifecycleCatalog, PrivilegedIndex, RunIndexes,
    WorkgroupIndex,
};
pub use records::{
    string_or_list, IdentityDocument, IdentityLifecycle, IdentityProfileRecord, IdentityRecord,
    LifecycleStateRecord, LinkedAccount, WorkflowRecord, WorkgroupRecord, PLATFORM_SOURCE_NAME,
};
pub use report::{
    email_workflow_definition, flush_report, ErrorNotifier, RunReport, WorkflowNotifier,
    REPORT_SUBJECT, REPORT_WORKFLOW_NAME,
};
pub use retry::RetryPolicy;
pub use transport::{
    ApiRequest, ApiResponse, RequestBody, RetryingTransport, TransportMetrics,
    JSON_PATCH_CONTENT_TYPE, TOTAL_COUNT_HEADER,
};
