//! Grantable platform levels.

/// A level that can be granted to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    /// Capability value as stored upstream.
    pub value: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

const fn level(value: &'static str, name: &'static str, description: &'static str) -> Level {
    Level {
        value,
        name,
        description,
    }
}

/// Every level the connector exposes as an entitlement.
pub const LEVELS: &[Level] = &[
    level("HELPDESK", "Helpdesk", "Helpdesk access to IdentityNow"),
    level("ORG_ADMIN", "Administrator", "Full administrative access to IdentityNow"),
    level("CERT_ADMIN", "Cert Administrator", "Cert Administrator access to IdentityNow"),
    level("REPORT_ADMIN", "Report Administrator", "Report Administrator access to IdentityNow"),
    level("ROLE_ADMIN", "Role Administrator", "Role Administrator access to IdentityNow"),
    level("ROLE_SUBADMIN", "Role SubAdministrator", "Role SubAdministrator access to IdentityNow"),
    level("SOURCE_ADMIN", "Source Administrator", "Source Administrator access to IdentityNow"),
    level("SOURCE_SUBADMIN", "Source Subadministrator", "Source Subadministrator access to IdentityNow"),
    level("CLOUD_GOV_ADMIN", "Cloud Gov Admin", "Cloud Gov Admin access to IdentityNow"),
    level("CLOUD_GOV_USER", "Cloud Gov User", "Cloud Gov User access to IdentityNow"),
    level(
        "sp:aic-dashboard-read",
        "Access Intelligence Center - Reader",
        "Access Intelligence Center - Reader access to IdentityNow",
    ),
    level(
        "sp:aic-dashboard-write",
        "Access Intelligence Center - Author",
        "Access Intelligence Center - Author access to IdentityNow",
    ),
    level(
        "sp:aic-dashboard-admin",
        "Access Intelligence Center - Admin",
        "Access Intelligence Center - Admin access to IdentityNow",
    ),
    level("SAAS_MANAGEMENT_ADMIN", "SaaS Management - Admin", "Admin access to SaaS Management"),
    level("SAAS_MANAGEMENT_READER", "SaaS Management - Reader", "Reader access to SaaS Management"),
    level(
        "das:ui-administrator",
        "Data Access Security Administrator",
        "Administrator access to Data Access Security",
    ),
    level(
        "das:ui-compliance_manager",
        "Data Access Security Compliance Manager",
        "Compliance Manager access to Data Access Security",
    ),
    level(
        "das:ui-data_owner",
        "Data Access Data Owner",
        "Data Owner access to Data Access Security",
    ),
    level(
        "das:ui-auditor",
        "Data Access Security Auditor",
        "Auditor access to Data Access Security",
    ),
];

/// Looks up a level by its capability value.
#[must_use]
pub fn find_level(value: &str) -> Option<&'static Level> {
    LEVELS.iter().find(|l| l.value == value)
}
