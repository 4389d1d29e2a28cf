//! Account view reconciliation.
//!
//! Levels, governance group membership and lifecycle state live in three
//! independent upstream subsystems. [`EntitlementReconciler`] merges them into
//! one [`AccountView`]. The indexes below are built at most once per run and
//! are read-only afterwards.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, instrument};

use crate::client::IdnClient;
use crate::entitlements::EntitlementOutput;
use crate::records::{
    IdentityDocument, IdentityProfileRecord, IdentityRecord, LifecycleStateRecord, WorkgroupRecord,
};
use crate::IdnResult;

/// Canonical account built from an identity and its entitlement facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub identity_id: String,
    pub unique_id: Option<String>,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: bool,
    pub levels: BTreeSet<String>,
    pub workgroups: BTreeSet<String>,
    /// Lifecycle state id, only when the state was set manually.
    pub lifecycle_state: Option<String>,
}

impl AccountView {
    fn base(identity: &IdentityRecord) -> Self {
        Self {
            identity_id: identity.id.clone(),
            unique_id: identity.uid.clone(),
            display_name: identity.display_name.clone(),
            first_name: identity.first_name.clone(),
            last_name: identity.last_name.clone(),
            enabled: identity.enabled,
            levels: BTreeSet::new(),
            workgroups: BTreeSet::new(),
            lifecycle_state: None,
        }
    }
}

/// Governance groups with their member identity ids.
#[derive(Debug, Clone, Default)]
pub struct WorkgroupIndex {
    groups: Vec<(WorkgroupRecord, HashSet<String>)>,
}

impl WorkgroupIndex {
    /// Fetches every group, then each group's members sequentially.
    ///
    /// # Errors
    ///
    /// Propagates the first fetch error.
    #[instrument(skip(client))]
    pub async fn fetch(client: &IdnClient) -> IdnResult<Self> {
        let workgroups = client.list_workgroups().await?;
        let mut groups = Vec::with_capacity(workgroups.len());
        for workgroup in workgroups {
            debug!(workgroup = %workgroup.name, "Fetching governance group members");
            let members = client.list_workgroup_members(&workgroup.id).await?;
            groups.push((workgroup, members));
        }
        info!(groups = groups.len(), "Built governance group index");
        Ok(Self::from_groups(groups))
    }

    #[must_use]
    pub fn from_groups(groups: Vec<(WorkgroupRecord, Vec<String>)>) -> Self {
        Self {
            groups: groups
                .into_iter()
                .map(|(group, members)| (group, members.into_iter().collect()))
                .collect(),
        }
    }

    /// Ids of the groups that list `identity_id` as a member.
    #[must_use]
    pub fn memberships(&self, identity_id: &str) -> BTreeSet<String> {
        self.groups
            .iter()
            .filter(|(_, members)| members.contains(identity_id))
            .map(|(group, _)| group.id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Identities holding a governance platform account, keyed by identity id.
#[derive(Debug, Clone, Default)]
pub struct PrivilegedIndex {
    by_id: HashMap<String, IdentityDocument>,
}

impl PrivilegedIndex {
    /// Runs the privileged identity search to completion.
    ///
    /// # Errors
    ///
    /// Propagates the first page error.
    #[instrument(skip(client))]
    pub async fn fetch(client: &IdnClient) -> IdnResult<Self> {
        let documents = client.list_privileged_identities().await?;
        info!(identities = documents.len(), "Built privileged identity index");
        Ok(Self::from_documents(documents))
    }

    #[must_use]
    pub fn from_documents(documents: Vec<IdentityDocument>) -> Self {
        Self {
            by_id: documents.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, identity_id: &str) -> Option<&IdentityDocument> {
        self.by_id.get(identity_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Identity profiles and the lifecycle states each defines.
#[derive(Debug, Clone, Default)]
pub struct LifecycleCatalog {
    profiles: Vec<(IdentityProfileRecord, Vec<LifecycleStateRecord>)>,
}

impl LifecycleCatalog {
    /// Fetches every profile with its states.
    ///
    /// # Errors
    ///
    /// Propagates the first fetch error.
    #[instrument(skip(client))]
    pub async fn fetch(client: &IdnClient) -> IdnResult<Self> {
        let mut profiles = Vec::new();
        for profile in client.list_identity_profiles().await? {
            let states = client.list_lifecycle_states(&profile.id).await?;
            profiles.push((profile, states));
        }
        Ok(Self { profiles })
    }

    /// Fetches only the profile sourced by `source_id`, if there is one.
    ///
    /// # Errors
    ///
    /// Propagates the first fetch error.
    #[instrument(skip(client))]
    pub async fn fetch_for_source(client: &IdnClient, source_id: &str) -> IdnResult<Self> {
        let profile = client
            .list_identity_profiles()
            .await?
            .into_iter()
            .find(|p| p.authoritative_source_id.as_deref() == Some(source_id));

        let Some(profile) = profile else {
            debug!(source_id, "No identity profile for source");
            return Ok(Self::default());
        };
        let states = client.list_lifecycle_states(&profile.id).await?;
        Ok(Self {
            profiles: vec![(profile, states)],
        })
    }

    #[must_use]
    pub fn from_profiles(profiles: Vec<(IdentityProfileRecord, Vec<LifecycleStateRecord>)>) -> Self {
        Self { profiles }
    }

    fn states_for_source(&self, source_id: &str) -> Option<&[LifecycleStateRecord]> {
        self.profiles
            .iter()
            .find(|(p, _)| p.authoritative_source_id.as_deref() == Some(source_id))
            .map(|(_, states)| states.as_slice())
    }

    /// State id for a technical name under the profile sourced by `source_id`.
    #[must_use]
    pub fn state_id_by_technical_name(&self, source_id: &str, technical_name: &str) -> Option<&str> {
        self.states_for_source(source_id)?
            .iter()
            .find(|s| s.technical_name == technical_name)
            .map(|s| s.id.as_str())
    }

    /// Whether `state_id` belongs to the profile sourced by `source_id`.
    #[must_use]
    pub fn is_valid_state(&self, source_id: &str, state_id: &str) -> bool {
        self.states_for_source(source_id)
            .is_some_and(|states| states.iter().any(|s| s.id == state_id))
    }

    /// One entitlement per (profile, state).
    #[must_use]
    pub fn entitlements(&self) -> Vec<EntitlementOutput> {
        self.profiles
            .iter()
            .flat_map(|(profile, states)| {
                states
                    .iter()
                    .map(move |state| EntitlementOutput::from_lifecycle_state(profile, state))
            })
            .collect()
    }
}

/// Indexes shared by every account built in one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunIndexes<'a> {
    pub workgroups: Option<&'a WorkgroupIndex>,
    pub privileged: Option<&'a PrivilegedIndex>,
    pub lifecycle: Option<&'a LifecycleCatalog>,
}

/// Builds account views, using run indexes when supplied and per-account
/// lookups otherwise.
#[derive(Debug, Clone, Copy)]
pub struct EntitlementReconciler<'a> {
    client: &'a IdnClient,
}

impl<'a> EntitlementReconciler<'a> {
    #[must_use]
    pub fn new(client: &'a IdnClient) -> Self {
        Self { client }
    }

    /// Builds the account view for one identity.
    ///
    /// # Errors
    ///
    /// Propagates lookup errors; a privileged session failure surfaces as
    /// `IdnError::Authorization` for this account only.
    #[instrument(skip(self, identity, indexes), fields(identity_id = %identity.id))]
    pub async fn build_account_view(
        &self,
        identity: &IdentityRecord,
        indexes: RunIndexes<'_>,
    ) -> IdnResult<AccountView> {
        let config = self.client.config();
        let mut view = AccountView::base(identity);

        if config.enable_levels {
            view.levels = self.levels(&identity.id, indexes.privileged).await?;
        }

        if config.enable_workgroups {
            view.workgroups = match indexes.workgroups {
                Some(index) => index.memberships(&identity.id),
                None => WorkgroupIndex::fetch(self.client).await?.memberships(&identity.id),
            };
        }

        if config.enable_lcs {
            view.lifecycle_state = self.lifecycle_state(identity, indexes.lifecycle).await?;
        }

        Ok(view)
    }

    async fn levels(
        &self,
        identity_id: &str,
        privileged: Option<&PrivilegedIndex>,
    ) -> IdnResult<BTreeSet<String>> {
        let Some(index) = privileged else {
            return self.client.current_capabilities(identity_id).await;
        };

        let Some(document) = index.get(identity_id) else {
            return Ok(BTreeSet::new());
        };

        match document
            .platform_account()
            .and_then(|a| a.assigned_groups.as_ref())
        {
            Some(groups) => Ok(groups.iter().filter(|g| !g.is_empty()).cloned().collect()),
            None => {
                // Platform accounts can lag behind their entitlements right after a change.
                debug!(identity_id, "Indexed platform account has no assigned groups, reading capabilities");
                self.client.current_capabilities(identity_id).await
            }
        }
    }

    async fn lifecycle_state(
        &self,
        identity: &IdentityRecord,
        catalog: Option<&LifecycleCatalog>,
    ) -> IdnResult<Option<String>> {
        let Some(state_name) = identity.manual_lifecycle_state() else {
            return Ok(None);
        };
        let Some(ref source_id) = identity.authoritative_source else {
            debug!(identity_id = %identity.id, "Manual lifecycle state without authoritative source");
            return Ok(None);
        };

        let fetched;
        let catalog = match catalog {
            Some(catalog) => catalog,
            None => {
                fetched = LifecycleCatalog::fetch_for_source(self.client, source_id).await?;
                &fetched
            }
        };

        Ok(catalog
            .state_id_by_technical_name(source_id, state_name)
            .map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workgroup(id: &str) -> WorkgroupRecord {
        WorkgroupRecord {
            id: id.to_string(),
            name: format!("Group {id}"),
            description: None,
        }
    }

    fn catalog() -> LifecycleCatalog {
        LifecycleCatalog::from_profiles(vec![
            (
                IdentityProfileRecord {
                    id: "p-emp".to_string(),
                    name: "Employees".to_string(),
                    authoritative_source_id: Some("src-hr".to_string()),
                },
                vec![
                    LifecycleStateRecord {
                        id: "s-active".to_string(),
                        name: "Active".to_string(),
                        technical_name: "active".to_string(),
                    },
                    LifecycleStateRecord {
                        id: "s-leaver".to_string(),
                        name: "Leaver".to_string(),
                        technical_name: "leaver".to_string(),
                    },
                ],
            ),
            (
                IdentityProfileRecord {
                    id: "p-ctr".to_string(),
                    name: "Contractors".to_string(),
                    authoritative_source_id: Some("src-vms".to_string()),
                },
                vec![LifecycleStateRecord {
                    id: "s-ctr-active".to_string(),
                    name: "Active".to_string(),
                    technical_name: "active".to_string(),
                }],
            ),
        ])
    }

    #[test]
    fn test_workgroup_memberships() {
        let index = WorkgroupIndex::from_groups(vec![
            (workgroup("g1"), vec!["id-1".to_string(), "id-2".to_string()]),
            (workgroup("g2"), vec!["id-2".to_string()]),
            (workgroup("g3"), vec![]),
        ]);

        assert_eq!(index.len(), 3);
        assert_eq!(
            index.memberships("id-2"),
            ["g1", "g2"].iter().map(|s| s.to_string()).collect()
        );
        assert!(index.memberships("id-9").is_empty());
    }

    #[test]
    fn test_lifecycle_lookup_is_scoped_to_profile() {
        let catalog = catalog();
        assert_eq!(
            catalog.state_id_by_technical_name("src-hr", "active"),
            Some("s-active")
        );
        assert_eq!(
            catalog.state_id_by_technical_name("src-vms", "active"),
            Some("s-ctr-active")
        );
        assert_eq!(catalog.state_id_by_technical_name("src-none", "active"), None);

        assert!(catalog.is_valid_state("src-hr", "s-leaver"));
        assert!(!catalog.is_valid_state("src-vms", "s-leaver"));
        assert!(!catalog.is_valid_state("src-none", "s-active"));
    }

    #[test]
    fn test_lifecycle_entitlements() {
        let outputs = catalog().entitlements();
        let names: Vec<_> = outputs.iter().map(|o| o.uuid.as_str()).collect();
        assert_eq!(
            names,
            vec!["Employees - Active", "Employees - Leaver", "Contractors - Active"]
        );
    }
}
