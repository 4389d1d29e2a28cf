//! Inbound connector operations.
//!
//! [`IdnConnector`] is the surface the controller drives: account and
//! entitlement listing and reads, plus create/update/enable/disable. Listing
//! collects per-record failures into a [`RunReport`]; single-account
//! operations return their error to the caller.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::client::IdnClient;
use crate::config::DisableEntitlementPolicy;
use crate::entitlements::{
    partition, AttributeChangeOp, EntitlementDelta, EntitlementKind, EntitlementOutput,
};
use crate::levels::{find_level, LEVELS};
use crate::provisioning::ProvisioningCoordinator;
use crate::reconcile::{
    AccountView, EntitlementReconciler, LifecycleCatalog, PrivilegedIndex, RunIndexes, WorkgroupIndex,
};
use crate::records::{string_or_list, IdentityDocument, IdentityRecord, LinkedAccount};
use crate::report::{flush_report, ErrorNotifier, RunReport, WorkflowNotifier};
use crate::{IdnConfig, IdnError, IdnResult};

/// Account object emitted to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOutput {
    pub identity: String,
    pub uuid: String,
    pub disabled: bool,
    pub attributes: Map<String, Value>,
}

impl AccountOutput {
    /// Renders a view, including only the entitlement attributes enabled in `config`.
    #[must_use]
    pub fn from_view(view: &AccountView, config: &IdnConfig) -> Self {
        let mut attributes = Map::new();
        attributes.insert("id".to_string(), json!(view.identity_id));
        attributes.insert("uid".to_string(), json!(view.unique_id));
        attributes.insert("firstName".to_string(), json!(view.first_name));
        attributes.insert("lastName".to_string(), json!(view.last_name));
        attributes.insert("displayName".to_string(), json!(view.display_name));
        if config.enable_levels {
            attributes.insert("levels".to_string(), json!(view.levels));
        }
        if config.enable_workgroups {
            attributes.insert("workgroups".to_string(), json!(view.workgroups));
        }
        if config.enable_lcs {
            attributes.insert("lcs".to_string(), json!(view.lifecycle_state));
        }

        Self {
            identity: view.identity_id.clone(),
            uuid: view
                .unique_id
                .clone()
                .unwrap_or_else(|| view.identity_id.clone()),
            disabled: !view.enabled,
            attributes,
        }
    }

    /// Values of a multi-valued attribute.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Vec<String> {
        string_or_list(self.attributes.get(attribute))
    }
}

/// One attribute change of an account update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: String,
    pub op: AttributeChangeOp,
    #[serde(default)]
    pub value: Value,
}

impl AttributeChange {
    pub fn new(attribute: impl Into<String>, op: AttributeChangeOp, value: Value) -> Self {
        Self {
            attribute: attribute.into(),
            op,
            value,
        }
    }
}

/// IdentityNow governance connector.
pub struct IdnConnector {
    client: Arc<IdnClient>,
    notifier: Option<Arc<dyn ErrorNotifier>>,
}

impl std::fmt::Debug for IdnConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdnConnector")
            .field("client", &self.client)
            .field("reports", &self.notifier.is_some())
            .finish()
    }
}

impl IdnConnector {
    /// Creates a connector. Error reports go to the tenant's email workflow
    /// when `enableReports` is set.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Config` if the configuration is invalid.
    pub fn new(config: IdnConfig) -> IdnResult<Self> {
        let client = Arc::new(IdnClient::new(config)?);
        let notifier: Option<Arc<dyn ErrorNotifier>> = if client.config().enable_reports {
            Some(Arc::new(WorkflowNotifier::new(client.clone())))
        } else {
            None
        };
        Ok(Self { client, notifier })
    }

    /// Replaces the error report channel.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ErrorNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn client(&self) -> &IdnClient {
        &self.client
    }

    fn config(&self) -> &IdnConfig {
        self.client.config()
    }

    fn reconciler(&self) -> EntitlementReconciler<'_> {
        EntitlementReconciler::new(&self.client)
    }

    fn coordinator(&self) -> ProvisioningCoordinator<'_> {
        ProvisioningCoordinator::new(&self.client)
    }

    /// Reports a failed single-account operation, then hands the result back.
    async fn reported<T>(&self, context: &str, input: Value, result: IdnResult<T>) -> IdnResult<T> {
        if let Err(ref e) = result {
            let mut report = RunReport::new(context, input);
            report.record_error(context, e);
            flush_report(self.notifier.as_ref(), &report).await;
        }
        result
    }

    /// Verifies connectivity and credentials.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Authentication` if no API token can be obtained.
    pub async fn test_connection(&self) -> IdnResult<()> {
        self.client.test_connection().await
    }

    /// Streams every qualifying account to `sink`.
    ///
    /// Indexes are built once up front. A record that fails to build is
    /// logged, collected in the returned report and skipped. The report's
    /// `partial_error` summarizes such failures.
    ///
    /// # Errors
    ///
    /// Aborts on index build failures, identity page failures and API
    /// credential failures.
    #[instrument(skip(self, sink))]
    pub async fn list_accounts<F>(&self, mut sink: F) -> IdnResult<RunReport>
    where
        F: FnMut(AccountOutput) + Send,
    {
        let mut report = RunReport::new("account:list", Value::Null);
        let result = self.collect_accounts(&mut report, &mut sink).await;

        if let Err(ref e) = result {
            report.record_error("run", e);
        }
        flush_report(self.notifier.as_ref(), &report).await;
        result?;

        match report.partial_error() {
            Some(partial) => warn!(
                processed = report.processed,
                emitted = report.emitted,
                error = %partial,
                "Account list complete with failures"
            ),
            None => info!(
                processed = report.processed,
                emitted = report.emitted,
                "Account list complete"
            ),
        }
        Ok(report)
    }

    async fn collect_accounts<F>(&self, report: &mut RunReport, sink: &mut F) -> IdnResult<()>
    where
        F: FnMut(AccountOutput) + Send,
    {
        let config = self.config();

        let workgroups = if config.enable_workgroups {
            info!("Collecting governance groups with membership");
            Some(WorkgroupIndex::fetch(&self.client).await?)
        } else {
            None
        };
        let privileged = if config.enable_levels {
            info!("Collecting privileged identities");
            Some(PrivilegedIndex::fetch(&self.client).await?)
        } else {
            None
        };
        let lifecycle = if config.enable_lcs {
            info!("Collecting lifecycle states");
            Some(LifecycleCatalog::fetch(&self.client).await?)
        } else {
            None
        };
        let indexes = RunIndexes {
            workgroups: workgroups.as_ref(),
            privileged: privileged.as_ref(),
            lifecycle: lifecycle.as_ref(),
        };

        info!("Collecting identities");
        let reconciler = self.reconciler();
        let mut pages = self.client.identity_pages();
        while let Some(page) = pages.next_page().await? {
            for raw in &page.records {
                report.processed += 1;

                let identity = match IdentityRecord::from_json(raw) {
                    Ok(identity) => identity,
                    Err(e) => {
                        report.record_error("identity", &e);
                        continue;
                    }
                };

                let view = match reconciler.build_account_view(&identity, indexes).await {
                    Ok(view) => view,
                    Err(e @ IdnError::Authentication(_)) => return Err(e),
                    Err(e) => {
                        report.record_error(&identity.name, &e);
                        continue;
                    }
                };

                if self.should_emit(&view) {
                    sink(AccountOutput::from_view(&view, config));
                    report.emitted += 1;
                } else {
                    debug!(identity = %identity.name, "Discarding identity without entitlements");
                }
            }
        }

        Ok(())
    }

    fn should_emit(&self, view: &AccountView) -> bool {
        let config = self.config();
        config.all_identities
            || (config.enable_levels && !view.levels.is_empty())
            || (config.enable_workgroups && !view.workgroups.is_empty())
            || (config.enable_lcs && view.lifecycle_state.is_some())
    }

    /// Reads one account.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::NotFound` if the identity does not exist.
    #[instrument(skip(self))]
    pub async fn read_account(&self, identity_id: &str) -> IdnResult<AccountOutput> {
        let result = self.fetch_account(identity_id).await;
        self.reported("account:read", json!({ "identity": identity_id }), result)
            .await
    }

    async fn fetch_account(&self, identity_id: &str) -> IdnResult<AccountOutput> {
        let identity = self.client.get_identity(identity_id).await?;
        let view = self
            .reconciler()
            .build_account_view(&identity, RunIndexes::default())
            .await?;
        Ok(AccountOutput::from_view(&view, self.config()))
    }

    /// Streams every entitlement of `kind` to `sink` and returns how many were sent.
    ///
    /// A kind whose feature toggle is off yields nothing.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Validation` for an unsupported type.
    #[instrument(skip(self, sink))]
    pub async fn list_entitlements<F>(&self, kind: &str, mut sink: F) -> IdnResult<usize>
    where
        F: FnMut(EntitlementOutput) + Send,
    {
        let result = self.entitlements(kind).await;
        let entitlements = self
            .reported("entitlement:list", json!({ "type": kind }), result)
            .await?;

        let count = entitlements.len();
        for entitlement in entitlements {
            sink(entitlement);
        }
        info!(kind, count, "Entitlement list complete");
        Ok(count)
    }

    async fn entitlements(&self, kind: &str) -> IdnResult<Vec<EntitlementOutput>> {
        let config = self.config();
        match kind.parse::<EntitlementKind>()? {
            EntitlementKind::Level if config.enable_levels => {
                Ok(LEVELS.iter().map(EntitlementOutput::from_level).collect())
            }
            EntitlementKind::Workgroup if config.enable_workgroups => Ok(self
                .client
                .list_workgroups()
                .await?
                .iter()
                .map(EntitlementOutput::from_workgroup)
                .collect()),
            EntitlementKind::Lcs if config.enable_lcs => {
                Ok(LifecycleCatalog::fetch(&self.client).await?.entitlements())
            }
            disabled => {
                debug!(kind = %disabled, "Entitlement type disabled");
                Ok(Vec::new())
            }
        }
    }

    /// Reads one entitlement.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::NotFound` for an unknown id and
    /// `IdnError::Validation` for an unsupported type.
    #[instrument(skip(self))]
    pub async fn read_entitlement(&self, kind: &str, id: &str) -> IdnResult<EntitlementOutput> {
        let result = self.fetch_entitlement(kind, id).await;
        self.reported(
            "entitlement:read",
            json!({ "type": kind, "identity": id }),
            result,
        )
        .await
    }

    async fn fetch_entitlement(&self, kind: &str, id: &str) -> IdnResult<EntitlementOutput> {
        match kind.parse::<EntitlementKind>()? {
            EntitlementKind::Level => find_level(id)
                .map(EntitlementOutput::from_level)
                .ok_or_else(|| IdnError::NotFound(format!("Level {id}"))),
            EntitlementKind::Workgroup => {
                let workgroup = self.client.get_workgroup(id).await?;
                Ok(EntitlementOutput::from_workgroup(&workgroup))
            }
            EntitlementKind::Lcs => LifecycleCatalog::fetch(&self.client)
                .await?
                .entitlements()
                .into_iter()
                .find(|e| e.identity == id)
                .ok_or_else(|| IdnError::NotFound(format!("Lifecycle state {id}"))),
        }
    }

    /// Grants the requested entitlements to the identity with the given `uid`.
    ///
    /// # Errors
    ///
    /// - `IdnError::Validation` if `uid` is missing.
    /// - `IdnError::NotFound` if no identity has that `uid`.
    #[instrument(skip(self, attributes))]
    pub async fn create_account(&self, attributes: &Map<String, Value>) -> IdnResult<AccountOutput> {
        let result = self.provision_new_account(attributes).await;
        self.reported(
            "account:create",
            json!({ "attributes": attributes }),
            result,
        )
        .await
    }

    async fn provision_new_account(&self, attributes: &Map<String, Value>) -> IdnResult<AccountOutput> {
        let uid = attributes
            .get("uid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IdnError::Validation("Account creation requires a uid".to_string()))?;

        info!(uid, "Locating identity");
        let document = self
            .client
            .search_identity_by_uid(uid)
            .await?
            .ok_or_else(|| IdnError::NotFound(format!("Identity with uid {uid}")))?;

        let changes: Vec<AttributeChange> = ["levels", "workgroups", "lcs"]
            .into_iter()
            .filter_map(|attribute| {
                attributes
                    .get(attribute)
                    .map(|value| AttributeChange::new(attribute, AttributeChangeOp::Add, value.clone()))
            })
            .collect();

        let deltas = deltas_for_changes(&document.id, &changes)?;
        let view = self.coordinator().apply(&document.id, &deltas).await?;
        Ok(AccountOutput::from_view(&view, self.config()))
    }

    /// Applies attribute changes to an account.
    ///
    /// An update without changes returns the current account unchanged.
    ///
    /// # Errors
    ///
    /// - `IdnError::Validation` for a `Set` on a multi-valued attribute.
    /// - `IdnError::NotFound` if the identity does not exist.
    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub async fn update_account(
        &self,
        identity_id: &str,
        changes: &[AttributeChange],
    ) -> IdnResult<AccountOutput> {
        let result = self.apply_changes(identity_id, changes).await;
        self.reported(
            "account:update",
            json!({ "identity": identity_id, "changes": changes }),
            result,
        )
        .await
    }

    async fn apply_changes(&self, identity_id: &str, changes: &[AttributeChange]) -> IdnResult<AccountOutput> {
        if changes.is_empty() {
            warn!(identity_id, "No changes detected in account update");
            return self.fetch_account(identity_id).await;
        }

        let deltas = deltas_for_changes(identity_id, changes)?;
        let view = self.coordinator().apply(identity_id, &deltas).await?;
        Ok(AccountOutput::from_view(&view, self.config()))
    }

    /// Disables the identity's platform account, stripping entitlements per
    /// the configured policy.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::NotFound` if the identity or its platform account
    /// does not exist.
    #[instrument(skip(self))]
    pub async fn disable_account(&self, identity_id: &str) -> IdnResult<AccountOutput> {
        let result = self.toggle(identity_id, false).await;
        self.reported("account:disable", json!({ "identity": identity_id }), result)
            .await
    }

    /// Enables the identity's platform account.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::NotFound` if the identity or its platform account
    /// does not exist.
    #[instrument(skip(self))]
    pub async fn enable_account(&self, identity_id: &str) -> IdnResult<AccountOutput> {
        let result = self.toggle(identity_id, true).await;
        self.reported("account:enable", json!({ "identity": identity_id }), result)
            .await
    }

    async fn toggle(&self, identity_id: &str, enable: bool) -> IdnResult<AccountOutput> {
        let document = self
            .client
            .search_identity(identity_id)
            .await?
            .ok_or_else(|| IdnError::NotFound(format!("Identity {identity_id}")))?;
        let account_id = platform_account_id(&document)?;

        let strip_deltas = if enable {
            Vec::new()
        } else {
            self.strip_deltas(identity_id).await?
        };

        if enable {
            info!(identity_id, account_id, "Enabling account");
            self.client.enable_account(account_id).await?;
        } else {
            info!(identity_id, account_id, "Disabling account");
            self.client.disable_account(account_id).await?;
        }

        if strip_deltas.iter().any(|d| !d.is_empty()) {
            info!(identity_id, "Removing entitlements of disabled account");
            let view = self.coordinator().apply(identity_id, &strip_deltas).await?;
            return Ok(AccountOutput::from_view(&view, self.config()));
        }

        self.coordinator().settle().await;
        self.fetch_account(identity_id).await
    }

    /// Removal deltas for every level and governance group, when the disable
    /// policy asks for them.
    async fn strip_deltas(&self, identity_id: &str) -> IdnResult<Vec<EntitlementDelta>> {
        let policy = self.config().disable_policy;
        if policy == DisableEntitlementPolicy::Keep {
            return Ok(Vec::new());
        }

        let identity = self.client.get_identity(identity_id).await?;
        if policy == DisableEntitlementPolicy::StripUnlessManualLifecycle
            && identity.manual_lifecycle_state().is_some()
        {
            debug!(identity_id, "Manual lifecycle state present, keeping entitlements");
            return Ok(Vec::new());
        }

        let view = self
            .reconciler()
            .build_account_view(&identity, RunIndexes::default())
            .await?;
        Ok(vec![
            EntitlementDelta::new(identity_id, EntitlementKind::Level, BTreeSet::new(), view.levels)?,
            EntitlementDelta::new(
                identity_id,
                EntitlementKind::Workgroup,
                BTreeSet::new(),
                view.workgroups,
            )?,
        ])
    }
}

fn platform_account_id(document: &IdentityDocument) -> IdnResult<&str> {
    let account: &LinkedAccount = document.platform_account().ok_or_else(|| {
        IdnError::NotFound(format!("IdentityNow account for identity {}", document.id))
    })?;
    account.id.as_deref().ok_or_else(|| {
        IdnError::InvalidResponse(format!(
            "IdentityNow account of identity {} has no id",
            document.id
        ))
    })
}

/// Turns controller attribute changes into entitlement deltas.
///
/// Values under `levels` and `workgroups` are routed by shape, so a governance
/// group id sent under `levels` still lands on the membership endpoint. `Set`
/// on the single-valued `lcs` attribute means "set this state".
fn deltas_for_changes(identity_id: &str, changes: &[AttributeChange]) -> IdnResult<Vec<EntitlementDelta>> {
    let mut deltas = Vec::new();
    for change in changes {
        let values = string_or_list(Some(&change.value));
        match change.attribute.as_str() {
            "levels" | "workgroups" => {
                let split = partition(&values);
                if !split.capabilities.is_empty() {
                    deltas.push(EntitlementDelta::from_change(
                        identity_id,
                        EntitlementKind::Level,
                        change.op,
                        split.capabilities,
                    )?);
                }
                if !split.workgroups.is_empty() {
                    deltas.push(EntitlementDelta::from_change(
                        identity_id,
                        EntitlementKind::Workgroup,
                        change.op,
                        split.workgroups,
                    )?);
                }
            }
            "lcs" => {
                let op = match change.op {
                    AttributeChangeOp::Set => AttributeChangeOp::Add,
                    op => op,
                };
                let values: BTreeSet<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
                deltas.push(EntitlementDelta::from_change(
                    identity_id,
                    EntitlementKind::Lcs,
                    op,
                    values,
                )?);
            }
            other => {
                warn!(attribute = other, "Ignoring change to unmanaged attribute");
            }
        }
    }

    // Merge per kind so the resulting deltas stay disjoint.
    let mut merged: Vec<EntitlementDelta> = Vec::new();
    for delta in deltas {
        match merged.iter_mut().find(|d| d.kind == delta.kind) {
            Some(existing) => {
                let add: BTreeSet<String> = existing.add.union(&delta.add).cloned().collect();
                let remove: BTreeSet<String> = existing.remove.union(&delta.remove).cloned().collect();
                *existing = EntitlementDelta::new(identity_id, delta.kind, add, remove)?;
            }
            None => merged.push(delta),
        }
    }
    Ok(merged)
}
