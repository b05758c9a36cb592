//! JWT claims codec and login.
//!
//! - Clients post `{organization, username, password}` to `/api/login`
//! - The server returns a JWT carrying {subject, role, tenant, username,
//!   muted}; every core operation takes those verified claims as an explicit
//!   argument, never ambient identity
//! - WebSocket clients pass the token via `Sec-WebSocket-Protocol: jwt.<t>`
//!   (browsers cannot set an Authorization header on upgrades) or a `token`
//!   query parameter

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::routes::AppState;
use super::types::{LoginRequest, LoginResponse};
use crate::lifecycle::Role;
use crate::store::UserRecord;
use crate::tenant::TenantId;

/// Verified identity and authorization payload attached to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject user id
    pub sub: i64,
    pub role: Role,
    /// Tenant id; absent for superadmins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantId>,
    /// Username (for display and chat authorship)
    #[serde(default)]
    pub usr: String,
    /// Whether the user is muted in chat
    #[serde(default)]
    pub muted: bool,
    /// Issued-at unix seconds
    pub iat: i64,
    /// Expiration unix seconds
    pub exp: i64,
}

impl Claims {
    /// Whether these claims may act within `tenant`. Superadmins cover every
    /// tenant; everyone else only their own.
    pub fn covers(&self, tenant: TenantId) -> bool {
        self.tenant == Some(tenant) || self.role == Role::Superadmin
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

/// Salted SHA-256 digest, hex encoded.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn issue_jwt(secret: &str, ttl_days: i64, user: &UserRecord) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::days(ttl_days.max(1));
    let claims = Claims {
        sub: user.id,
        role: user.role,
        tenant: user.tenant_id,
        usr: user.username.clone(),
        muted: user.muted,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

pub fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let validation = Validation::default();
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(token_data.claims)
}

/// Pull a JWT out of a WebSocket upgrade request: subprotocol first, then
/// the `token` query parameter.
pub fn token_from_ws(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(raw) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        // Client sends: ["orgboard", "jwt.<token>"]
        for part in raw.split(',').map(|s| s.trim()) {
            if let Some(rest) = part.strip_prefix("jwt.") {
                if !rest.is_empty() {
                    return Some(rest.to_string());
                }
            }
        }
    }
    query_token
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    let tenant = match req.organization.as_deref().map(str::trim) {
        Some(slug) if !slug.is_empty() => {
            let tenant = state
                .store
                .tenant_by_slug(slug)
                .await
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            match tenant {
                Some(t) => Some(t),
                None => {
                    return Err((StatusCode::NOT_FOUND, "Unknown organization".to_string()));
                }
            }
        }
        // No organization names the process-wide superadmin scope.
        _ => None,
    };

    let username = req.username.trim();
    let account = state
        .store
        .user_by_name(tenant.as_ref().map(|t| t.id), username)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let supplied = hash_password(&state.config.password_salt, req.password.trim());
    // Single generic error for both unknown user and bad password to prevent
    // username enumeration; dummy comparison keeps timing flat.
    let valid = match &account {
        Some(acc) => constant_time_eq(&supplied, &acc.password_hash),
        None => {
            let _ = constant_time_eq(&supplied, "dummy_hash_for_timing");
            false
        }
    };
    if !valid {
        return Err((
            StatusCode::UNAUTHORIZED,
            "Invalid username or password".to_string(),
        ));
    }
    let account = account.ok_or((
        StatusCode::UNAUTHORIZED,
        "Invalid username or password".to_string(),
    ))?;

    let (token, exp) = issue_jwt(&state.config.jwt_secret, state.config.jwt_ttl_days, &account)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    tracing::info!(user = %account.username, tenant = ?account.tenant_id, "login");
    Ok(Json(LoginResponse {
        token,
        exp,
        role: account.role,
        muted: account.muted,
    }))
}

/// Middleware: require a valid Bearer token and attach the verified claims
/// to the request.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("");

    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    }

    match verify_jwt(token, &state.config.jwt_secret) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    }
}
