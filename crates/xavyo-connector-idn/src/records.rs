//! Normalized views of upstream records.
//!
//! Each upstream record kind has exactly one adapter here; nothing else in
//! the crate reads raw record fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{IdnError, IdnResult};

/// Source name of the governance platform's own accounts.
pub const PLATFORM_SOURCE_NAME: &str = "IdentityNow";

fn str_field(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn required_str(value: &Value, pointer: &str, kind: &str) -> IdnResult<String> {
    str_field(value, pointer)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IdnError::InvalidResponse(format!("{kind} record missing {pointer}")))
}

/// Reads a field that the upstream sends either as one string or as a list.
#[must_use]
pub fn string_or_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Lifecycle state as reported on an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLifecycle {
    /// Technical name of the state.
    pub state_name: String,
    /// True when an operator set the state by hand.
    pub manually_updated: bool,
}

/// Identity from the identity list/read endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    pub uid: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    /// Id of the source that authoritatively feeds this identity.
    pub authoritative_source: Option<String>,
    pub enabled: bool,
    pub lifecycle: Option<IdentityLifecycle>,
}

impl IdentityRecord {
    /// Parses an identity record.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::InvalidResponse` if the id is missing.
    pub fn from_json(value: &Value) -> IdnResult<Self> {
        let id = required_str(value, "/id", "Identity")?;
        let lifecycle = value.get("lifecycleState").and_then(|lcs| {
            str_field(lcs, "/stateName").map(|state_name| IdentityLifecycle {
                state_name,
                manually_updated: lcs
                    .get("manuallyUpdated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        });

        Ok(Self {
            name: str_field(value, "/name").unwrap_or_else(|| id.clone()),
            uid: str_field(value, "/attributes/uid"),
            first_name: str_field(value, "/attributes/firstname"),
            last_name: str_field(value, "/attributes/lastname"),
            display_name: str_field(value, "/attributes/displayName"),
            authoritative_source: str_field(value, "/attributes/cloudAuthoritativeSource"),
            enabled: str_field(value, "/identityStatus").as_deref() != Some("DISABLED"),
            lifecycle,
            id,
        })
    }

    /// Lifecycle state name, only when it was set manually.
    #[must_use]
    pub fn manual_lifecycle_state(&self) -> Option<&str> {
        self.lifecycle
            .as_ref()
            .filter(|l| l.manually_updated)
            .map(|l| l.state_name.as_str())
    }
}

/// Account attached to an identity search document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub id: Option<String>,
    pub source_name: Option<String>,
    /// `assignedGroups` entitlement attribute, when the source reports one.
    pub assigned_groups: Option<Vec<String>>,
}

impl LinkedAccount {
    /// Parses an account nested in a search document.
    #[must_use]
    pub fn from_search_json(value: &Value) -> Self {
        Self {
            id: str_field(value, "/id"),
            source_name: str_field(value, "/source/name"),
            assigned_groups: value
                .pointer("/entitlementAttributes/assignedGroups")
                .filter(|v| !v.is_null())
                .map(|v| string_or_list(Some(v))),
        }
    }

    #[must_use]
    pub fn is_platform_account(&self) -> bool {
        self.source_name.as_deref() == Some(PLATFORM_SOURCE_NAME)
    }
}

/// Identity as returned by the search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub accounts: Vec<LinkedAccount>,
}

impl IdentityDocument {
    /// Parses a search hit.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::InvalidResponse` if the id is missing.
    pub fn from_json(value: &Value) -> IdnResult<Self> {
        let id = required_str(value, "/id", "Identity document")?;
        Ok(Self {
            name: str_field(value, "/name").unwrap_or_else(|| id.clone()),
            email: str_field(value, "/attributes/email").or_else(|| str_field(value, "/email")),
            accounts: value
                .get("accounts")
                .and_then(Value::as_array)
                .map(|accounts| accounts.iter().map(LinkedAccount::from_search_json).collect())
                .unwrap_or_default(),
            id,
        })
    }

    /// The identity's account on the governance platform itself.
    #[must_use]
    pub fn platform_account(&self) -> Option<&LinkedAccount> {
        self.accounts.iter().find(|a| a.is_platform_account())
    }
}

/// Governance group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkgroupRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl WorkgroupRecord {
    /// Parses a governance group.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::InvalidResponse` if the id is missing.
    pub fn from_json(value: &Value) -> IdnResult<Self> {
        let id = required_str(value, "/id", "Governance group")?;
        Ok(Self {
            name: str_field(value, "/name").unwrap_or_else(|| id.clone()),
            description: str_field(value, "/description"),
            id,
        })
    }
}

/// Member id of a governance group entry.
///
/// # Errors
///
/// Returns `IdnError::InvalidResponse` if the entry has no id.
pub fn workgroup_member_id(value: &Value) -> IdnResult<String> {
    required_str(value, "/id", "Governance group member")
}

/// Identity profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfileRecord {
    pub id: String,
    pub name: String,
    pub authoritative_source_id: Option<String>,
}

impl IdentityProfileRecord {
    /// Parses an identity profile.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::InvalidResponse` if the id is missing.
    pub fn from_json(value: &Value) -> IdnResult<Self> {
        let id = required_str(value, "/id", "Identity profile")?;
        Ok(Self {
            name: str_field(value, "/name").unwrap_or_else(|| id.clone()),
            authoritative_source_id: str_field(value, "/authoritativeSource/id"),
            id,
        })
    }
}

/// Lifecycle state defined on an identity profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStateRecord {
    pub id: String,
    pub name: String,
    pub technical_name: String,
}

impl LifecycleStateRecord {
    /// Parses a lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::InvalidResponse` if the id is missing.
    pub fn from_json(value: &Value) -> IdnResult<Self> {
        let id = required_str(value, "/id", "Lifecycle state")?;
        let name = str_field(value, "/name").unwrap_or_else(|| id.clone());
        Ok(Self {
            technical_name: str_field(value, "/technicalName").unwrap_or_else(|| name.clone()),
            name,
            id,
        })
    }
}

/// Workflow summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub owner_id: Option<String>,
}

impl WorkflowRecord {
    /// Parses a workflow.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::InvalidResponse` if the id is missing.
    pub fn from_json(value: &Value) -> IdnResult<Self> {
        let id = required_str(value, "/id", "Workflow")?;
        Ok(Self {
            name: str_field(value, "/name").unwrap_or_default(),
            owner_id: str_field(value, "/owner/id"),
            id,
        })
    }
}
