//! Entitlement kinds, value classification and delta computation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::levels::Level;
use crate::records::{IdentityProfileRecord, LifecycleStateRecord, WorkgroupRecord};
use crate::{IdnError, IdnResult};

/// Governance group ids: five dash-delimited hex groups (8-4-4-4-12).
static WORKGROUP_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("WORKGROUP_ID_PATTERN is a valid regex pattern")
});

/// Entitlement types exposed to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementKind {
    Level,
    Workgroup,
    Lcs,
}

impl EntitlementKind {
    /// Type string used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementKind::Level => "level",
            EntitlementKind::Workgroup => "workgroup",
            EntitlementKind::Lcs => "lcs",
        }
    }

    /// Account attribute carrying entitlements of this kind.
    #[must_use]
    pub fn attribute(&self) -> &'static str {
        match self {
            EntitlementKind::Level => "levels",
            EntitlementKind::Workgroup => "workgroups",
            EntitlementKind::Lcs => "lcs",
        }
    }

    /// Human-readable type label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            EntitlementKind::Level => "Level",
            EntitlementKind::Workgroup => "Governance group",
            EntitlementKind::Lcs => "Lifecycle state",
        }
    }
}

impl fmt::Display for EntitlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementKind {
    type Err = IdnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "level" => Ok(EntitlementKind::Level),
            "workgroup" => Ok(EntitlementKind::Workgroup),
            "lcs" => Ok(EntitlementKind::Lcs),
            other => Err(IdnError::Validation(format!(
                "Unsupported entitlement type {other}"
            ))),
        }
    }
}

/// Attribute change operation requested by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeChangeOp {
    Add,
    Remove,
    Set,
}

impl fmt::Display for AttributeChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeChangeOp::Add => f.write_str("Add"),
            AttributeChangeOp::Remove => f.write_str("Remove"),
            AttributeChangeOp::Set => f.write_str("Set"),
        }
    }
}

/// Backing subsystem of a level or workgroup value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    /// Governance group id.
    Workgroup,
    /// Platform capability (level).
    Capability,
}

/// Classifies a value by shape. Empty values belong to neither subsystem.
#[must_use]
pub fn classify(value: &str) -> Option<ValueClass> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else if WORKGROUP_ID_PATTERN.is_match(value) {
        Some(ValueClass::Workgroup)
    } else {
        Some(ValueClass::Capability)
    }
}

/// Values split by backing subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub capabilities: BTreeSet<String>,
    pub workgroups: BTreeSet<String>,
}

/// Splits values into capabilities and governance group ids.
pub fn partition<I, S>(values: I) -> Partition
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Partition::default();
    for value in values {
        let value = value.as_ref().trim();
        match classify(value) {
            Some(ValueClass::Workgroup) => {
                out.workgroups.insert(value.to_string());
            }
            Some(ValueClass::Capability) => {
                out.capabilities.insert(value.to_string());
            }
            None => {}
        }
    }
    out
}

/// Full capability set after applying `op` with `values` to `current`.
///
/// # Errors
///
/// Returns `IdnError::Validation` for `Set`; only add and remove are supported.
pub fn resulting_capabilities(
    op: AttributeChangeOp,
    current: &BTreeSet<String>,
    values: &BTreeSet<String>,
) -> IdnResult<BTreeSet<String>> {
    match op {
        AttributeChangeOp::Add => Ok(current.union(values).cloned().collect()),
        AttributeChangeOp::Remove => Ok(current.difference(values).cloned().collect()),
        AttributeChangeOp::Set => Err(IdnError::Validation(
            "Set operations are not supported for entitlements".to_string(),
        )),
    }
}

/// Add/remove request against one entitlement kind of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementDelta {
    pub target: String,
    pub kind: EntitlementKind,
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

impl EntitlementDelta {
    /// Creates a delta.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Validation` if a value is both added and removed.
    pub fn new(
        target: impl Into<String>,
        kind: EntitlementKind,
        add: BTreeSet<String>,
        remove: BTreeSet<String>,
    ) -> IdnResult<Self> {
        if let Some(overlap) = add.intersection(&remove).next() {
            return Err(IdnError::Validation(format!(
                "{overlap} is both added and removed"
            )));
        }
        Ok(Self {
            target: target.into(),
            kind,
            add,
            remove,
        })
    }

    /// Delta for a single attribute change.
    ///
    /// # Errors
    ///
    /// Returns `IdnError::Validation` for `Set`.
    pub fn from_change(
        target: impl Into<String>,
        kind: EntitlementKind,
        op: AttributeChangeOp,
        values: BTreeSet<String>,
    ) -> IdnResult<Self> {
        match op {
            AttributeChangeOp::Add => Self::new(target, kind, values, BTreeSet::new()),
            AttributeChangeOp::Remove => Self::new(target, kind, BTreeSet::new(), values),
            AttributeChangeOp::Set => Err(IdnError::Validation(format!(
                "Set operation is not supported for {}",
                kind.attribute()
            ))),
        }
    }

    /// Minimal delta moving `current` to `desired`.
    #[must_use]
    pub fn between(
        target: impl Into<String>,
        kind: EntitlementKind,
        current: &BTreeSet<String>,
        desired: &BTreeSet<String>,
    ) -> Self {
        Self {
            target: target.into(),
            kind,
            add: desired.difference(current).cloned().collect(),
            remove: current.difference(desired).cloned().collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Capability set after applying this delta to `current`.
    #[must_use]
    pub fn apply_to(&self, current: &BTreeSet<String>) -> BTreeSet<String> {
        current
            .union(&self.add)
            .filter(|v| !self.remove.contains(*v))
            .cloned()
            .collect()
    }
}

/// Attributes of an entitlement object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementAttributes {
    #[serde(rename = "type")]
    pub kind_label: String,
    pub name: String,
    pub id: String,
    pub description: Option<String>,
}

/// Entitlement object emitted to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementOutput {
    pub identity: String,
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: EntitlementKind,
    pub attributes: EntitlementAttributes,
}

impl EntitlementOutput {
    fn new(kind: EntitlementKind, id: String, name: String, description: Option<String>) -> Self {
        Self {
            identity: id.clone(),
            uuid: name.clone(),
            kind,
            attributes: EntitlementAttributes {
                kind_label: kind.label().to_string(),
                name,
                id,
                description,
            },
        }
    }

    #[must_use]
    pub fn from_level(level: &Level) -> Self {
        Self::new(
            EntitlementKind::Level,
            level.value.to_string(),
            level.name.to_string(),
            Some(level.description.to_string()),
        )
    }

    #[must_use]
    pub fn from_workgroup(workgroup: &WorkgroupRecord) -> Self {
        Self::new(
            EntitlementKind::Workgroup,
            workgroup.id.clone(),
            workgroup.name.clone(),
            workgroup.description.clone(),
        )
    }

    /// Lifecycle state entitlement, named after its profile.
    #[must_use]
    pub fn from_lifecycle_state(profile: &IdentityProfileRecord, state: &LifecycleStateRecord) -> Self {
        Self::new(
            EntitlementKind::Lcs,
            state.id.clone(),
            format!("{} - {}", profile.name, state.name),
            Some(format!(
                "{} lifecycle state for {} identity profile",
                state.name, profile.name
            )),
        )
    }
}
