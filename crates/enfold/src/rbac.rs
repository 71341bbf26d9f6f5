//! Role-based access control kernel.
//!
//! Closed role/capability/visibility tables and pure predicates over them.
//! No I/O: the tables are constants and every check is a function of its
//! arguments. Unknown roles and capabilities always resolve to a denial.

use serde::{Deserialize, Serialize};

use crate::audit::{self, AuditEvent};
use crate::error::{Error, Result};

/// The closed set of caller roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    General,
    Pro,
    Scholars,
    Analytics,
    Ops,
}

/// The closed set of capabilities a role may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    ReadPublic,
    ReadLedgerFull,
    ProposeHypothesis,
    ProposeAura,
    WriteGraph,
    WriteContradictions,
    ManageRoles,
    ViewDebug,
}

impl Role {
    /// All known roles, in ascending privilege order.
    pub const ALL: [Role; 5] = [
        Role::General,
        Role::Pro,
        Role::Scholars,
        Role::Analytics,
        Role::Ops,
    ];

    /// Parse a role name, case-insensitively. Unknown names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "general" => Some(Role::General),
            "pro" => Some(Role::Pro),
            "scholars" => Some(Role::Scholars),
            "analytics" => Some(Role::Analytics),
            "ops" => Some(Role::Ops),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Role::General => "general",
            Role::Pro => "pro",
            Role::Scholars => "scholars",
            Role::Analytics => "analytics",
            Role::Ops => "ops",
        }
    }

    /// Memory visibility level granted to this role.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Role::General => 0,
            Role::Pro | Role::Scholars => 1,
            Role::Analytics | Role::Ops => 2,
        }
    }

    /// Capability grants for this role.
    #[must_use]
    pub fn capabilities(self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Role::General => &[ReadPublic],
            Role::Pro | Role::Scholars => {
                &[ReadPublic, ReadLedgerFull, ProposeHypothesis, ProposeAura]
            }
            Role::Analytics => &[
                ReadPublic,
                ReadLedgerFull,
                ProposeHypothesis,
                ProposeAura,
                WriteGraph,
                WriteContradictions,
            ],
            Role::Ops => &[ReadPublic, ReadLedgerFull, ManageRoles, ViewDebug],
        }
    }
}

/// Does `role` hold `cap`? Unknown role names deny.
///
/// Pure function of the tables; deterministic for fixed arguments.
#[must_use]
pub fn has_capability(role: &str, cap: Capability) -> bool {
    Role::parse(role).is_some_and(|r| r.capabilities().contains(&cap))
}

/// Highest visibility level among the caller's roles.
///
/// Unknown role names contribute level 0, as does an empty role set.
#[must_use]
pub fn max_level<S: AsRef<str>>(roles: &[S]) -> u8 {
    roles
        .iter()
        .filter_map(|r| Role::parse(r.as_ref()))
        .map(Role::level)
        .max()
        .unwrap_or(0)
}

/// Resolve the role name that redaction will be applied under: the
/// highest-level known role, or `general` when none of the names are known.
#[must_use]
pub fn resolve_role<S: AsRef<str>>(roles: &[S]) -> &'static str {
    roles
        .iter()
        .filter_map(|r| Role::parse(r.as_ref()))
        .max_by_key(|r| r.level())
        .unwrap_or(Role::General)
        .name()
}

/// Require that at least one of the caller's roles holds `cap`.
///
/// Denials are audit-logged and surfaced as [`Error::InvalidArgument`]; this
/// is the explicit guard privileged operations call at their top.
pub fn require_capability<S: AsRef<str>>(roles: &[S], cap: Capability) -> Result<()> {
    if roles.iter().any(|r| has_capability(r.as_ref(), cap)) {
        return Ok(());
    }
    audit::record(AuditEvent::role_denied(
        resolve_role(roles),
        &format!("{cap:?}"),
    ));
    Err(Error::invalid_argument(format!(
        "caller lacks required capability {cap:?}"
    )))
}
