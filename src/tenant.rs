//! Tenant identity types.
//!
//! Every user, task, and chat session is scoped to exactly one tenant
//! (superadmins excepted). The typed identifier keeps hub-registry keys and
//! store queries from mixing tenants up by accident.

use serde::{Deserialize, Serialize};

/// Opaque tenant identifier, backed by the store's row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A provisioned organization.
///
/// The slug is unique and immutable; it is the human-readable handle used at
/// login. `user_limit` caps how many users the tenant may hold.
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub user_limit: u32,
}
