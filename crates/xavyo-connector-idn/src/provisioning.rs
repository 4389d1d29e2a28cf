//! Entitlement provisioning.
//!
//! A request moves through FETCH_CURRENT, COMPUTE_DELTA, APPLY_WRITES, an
//! optional SETTLE wait, REFETCH and RETURN. Capability changes are always
//! written as one whole-set replace; governance group changes are one call per
//! group; lifecycle state removal is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, instrument, warn};

use crate::client::{IdnClient, MembershipChange};
use crate::entitlements::{EntitlementDelta, EntitlementKind};
use crate::reconcile::{AccountView, EntitlementReconciler, LifecycleCatalog, RunIndexes};
use crate::records::IdentityRecord;
use crate::{IdnError, IdnResult};

/// Stage of a provisioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStage {
    FetchCurrent,
    ComputeDelta,
    ApplyWrites,
    Settle,
    Refetch,
    Return,
}

impl fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningStage::FetchCurrent => "FETCH_CURRENT",
            ProvisioningStage::ComputeDelta => "COMPUTE_DELTA",
            ProvisioningStage::ApplyWrites => "APPLY_WRITES",
            ProvisioningStage::Settle => "SETTLE",
            ProvisioningStage::Refetch => "REFETCH",
            ProvisioningStage::Return => "RETURN",
        };
        f.write_str(name)
    }
}

/// Writes computed for one request, in the order they are issued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    /// Full capability set to write, when it changes.
    pub capabilities: Option<BTreeSet<String>>,
    /// Membership change per governance group.
    pub workgroups: BTreeMap<String, MembershipChange>,
    /// Lifecycle state id to set.
    pub lifecycle_state: Option<String>,
    /// Lifecycle state ids rejected for the identity's profile.
    pub skipped_lifecycle_states: Vec<String>,
}

impl WritePlan {
    /// Number of outbound write calls the plan issues.
    #[must_use]
    pub fn write_count(&self) -> usize {
        usize::from(self.capabilities.is_some())
            + self.workgroups.len()
            + usize::from(self.lifecycle_state.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.write_count() == 0
    }
}

/// Applies entitlement deltas to one identity.
#[derive(Debug, Clone, Copy)]
pub struct ProvisioningCoordinator<'a> {
    client: &'a IdnClient,
}

impl<'a> ProvisioningCoordinator<'a> {
    #[must_use]
    pub fn new(client: &'a IdnClient) -> Self {
        Self { client }
    }

    /// Applies `deltas` to `identity_id` and returns the refetched view.
    ///
    /// # Errors
    ///
    /// - `IdnError::NotFound` if the identity does not exist.
    /// - `IdnError::Validation` if a delta targets another identity or asks
    ///   for more than one lifecycle state.
    /// - Transport errors from any read or write.
    #[instrument(skip(self, deltas), fields(deltas = deltas.len()))]
    pub async fn apply(&self, identity_id: &str, deltas: &[EntitlementDelta]) -> IdnResult<AccountView> {
        debug!(stage = %ProvisioningStage::FetchCurrent, "Provisioning stage");
        let identity = self.client.get_identity(identity_id).await?;

        debug!(stage = %ProvisioningStage::ComputeDelta, "Provisioning stage");
        let plan = self.plan(&identity, deltas).await?;

        debug!(stage = %ProvisioningStage::ApplyWrites, writes = plan.write_count(), "Provisioning stage");
        self.execute(identity_id, &plan).await?;

        if !plan.is_empty() {
            debug!(stage = %ProvisioningStage::Settle, "Provisioning stage");
            self.settle().await;
        }

        debug!(stage = %ProvisioningStage::Refetch, "Provisioning stage");
        let identity = self.client.get_identity(identity_id).await?;
        let view = EntitlementReconciler::new(self.client)
            .build_account_view(&identity, RunIndexes::default())
            .await?;

        debug!(stage = %ProvisioningStage::Return, "Provisioning stage");
        Ok(view)
    }

    /// Waits for the upstream to converge after writes.
    pub async fn settle(&self) {
        let delay = self.client.config().settle_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Computes the writes needed for `deltas`, reading current capabilities
    /// and the identity's lifecycle states as needed.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Validation` for malformed deltas, or read errors.
    pub async fn plan(&self, identity: &IdentityRecord, deltas: &[EntitlementDelta]) -> IdnResult<WritePlan> {
        let mut plan = WritePlan::default();

        if let Some(delta) = deltas.iter().find(|d| d.target != identity.id) {
            return Err(IdnError::Validation(format!(
                "Delta for {} applied to identity {}",
                delta.target, identity.id
            )));
        }

        let level_deltas: Vec<_> = deltas
            .iter()
            .filter(|d| d.kind == EntitlementKind::Level && !d.is_empty())
            .collect();
        if !level_deltas.is_empty() {
            let current = self.client.current_capabilities(&identity.id).await?;
            let resulting = level_deltas
                .iter()
                .fold(current.clone(), |acc, delta| delta.apply_to(&acc));
            if resulting == current {
                debug!("Capability set unchanged, skipping write");
            } else {
                plan.capabilities = Some(resulting);
            }
        }

        for delta in deltas.iter().filter(|d| d.kind == EntitlementKind::Workgroup) {
            for workgroup_id in &delta.add {
                plan.workgroups
                    .entry(workgroup_id.clone())
                    .or_default()
                    .add
                    .push(identity.id.clone());
            }
            for workgroup_id in &delta.remove {
                plan.workgroups
                    .entry(workgroup_id.clone())
                    .or_default()
                    .remove
                    .push(identity.id.clone());
            }
        }

        let lifecycle_deltas: Vec<_> = deltas
            .iter()
            .filter(|d| d.kind == EntitlementKind::Lcs)
            .collect();
        if lifecycle_deltas.iter().any(|d| !d.remove.is_empty()) {
            info!(identity_id = %identity.id, "Ignoring lifecycle state removal");
        }
        let requested: BTreeSet<&String> = lifecycle_deltas.iter().flat_map(|d| &d.add).collect();
        if requested.len() > 1 {
            return Err(IdnError::Validation(format!(
                "Only one lifecycle state can be set, got {}",
                requested.len()
            )));
        }
        if let Some(state_id) = requested.into_iter().next() {
            if self.is_valid_lifecycle_state(identity, state_id).await? {
                plan.lifecycle_state = Some(state_id.clone());
            } else {
                warn!(identity_id = %identity.id, state_id = %state_id, "Invalid lifecycle state, skipping");
                plan.skipped_lifecycle_states.push(state_id.clone());
            }
        }

        Ok(plan)
    }

    async fn is_valid_lifecycle_state(&self, identity: &IdentityRecord, state_id: &str) -> IdnResult<bool> {
        let Some(ref source_id) = identity.authoritative_source else {
            return Ok(false);
        };
        let catalog = LifecycleCatalog::fetch_for_source(self.client, source_id).await?;
        Ok(catalog.is_valid_state(source_id, state_id))
    }

    /// Issues the writes of `plan`: capabilities, governance groups, then
    /// lifecycle state.
    ///
    /// # Errors
    ///
    /// Stops at the first failed write and returns its error.
    pub async fn execute(&self, identity_id: &str, plan: &WritePlan) -> IdnResult<()> {
        if let Some(ref capabilities) = plan.capabilities {
            let capabilities: Vec<String> = capabilities.iter().cloned().collect();
            info!(identity_id, capabilities = ?capabilities, "Setting capabilities");
            self.client.set_capabilities(identity_id, &capabilities).await?;
        }

        for (workgroup_id, change) in &plan.workgroups {
            info!(
                identity_id,
                workgroup_id = %workgroup_id,
                add = !change.add.is_empty(),
                "Updating governance group membership"
            );
            self.client.modify_workgroup_members(workgroup_id, change).await?;
        }

        if let Some(ref state_id) = plan.lifecycle_state {
            info!(identity_id, state_id = %state_id, "Setting lifecycle state");
            self.client.set_lifecycle_state(identity_id, state_id).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_count() {
        let mut plan = WritePlan::default();
        assert!(plan.is_empty());

        plan.capabilities = Some(BTreeSet::new());
        plan.workgroups.insert("g1".to_string(), MembershipChange::add("id"));
        plan.workgroups.insert("g2".to_string(), MembershipChange::remove("id"));
        plan.skipped_lifecycle_states.push("s-bad".to_string());
        assert_eq!(plan.write_count(), 3);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(ProvisioningStage::FetchCurrent.to_string(), "FETCH_CURRENT");
        assert_eq!(ProvisioningStage::Settle.to_string(), "SETTLE");
    }
}
