//! Request/response types for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::lifecycle::Role;
use crate::tenant::TenantId;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Tenant provisioning request: the organization plus its first admin.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub slug: String,
    pub admin_username: String,
    pub admin_password: String,
    #[serde(default)]
    pub user_limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub tenant_id: TenantId,
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Organization slug; omitted for superadmin login.
    #[serde(default)]
    pub organization: Option<String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub exp: i64,
    pub role: Role,
    pub muted: bool,
}

/// One row of the admin user roster.
#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub muted: bool,
}

#[derive(Debug, Serialize)]
pub struct ReportsResponse {
    pub users: Vec<UserSummary>,
}
