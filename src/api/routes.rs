//! HTTP route handlers.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::hub::HubRegistry;
use crate::lifecycle::{self, LifecycleError, NewTask, TaskEvent};
use crate::store::{Store, StoreError, TaskRecord};

use super::auth::{self, Claims};
use super::chat;
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    /// One chat hub per tenant, created on first join
    pub hubs: HubRegistry,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.database_path)?;

    // Bootstrap the process-wide superadmin when configured.
    if let Some((username, password)) = &config.root_user {
        let hash = auth::hash_password(&config.password_salt, password);
        store.ensure_superadmin(username, &hash).await?;
        tracing::info!(user = %username, "superadmin account ensured");
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        hubs: HubRegistry::new(),
    });

    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/register", post(register))
        .route("/api/login", post(auth::login))
        // WebSocket chat uses subprotocol/query auth (browsers can't set an
        // Authorization header on upgrade requests)
        .route("/api/chat/ws", get(chat::chat_ws));

    let protected_routes = Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/:id/complete", put(complete_task))
        .route("/api/tasks/:id/approve", put(approve_task))
        .route("/api/admin/mute/:user_id/:value", post(set_muted))
        .route("/api/reports", get(reports))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Map a lifecycle failure to an HTTP reply.
fn reject(err: LifecycleError) -> (StatusCode, String) {
    let status = match &err {
        LifecycleError::Authorization => StatusCode::FORBIDDEN,
        LifecycleError::InvalidTransition { .. } => StatusCode::CONFLICT,
        LifecycleError::ScopeViolation(_) => StatusCode::BAD_REQUEST,
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Provision a tenant with its first admin.
///
/// Open by design for single-box deployments, like the login endpoint; put
/// an upstream gate in front of it when the deployment calls for one.
async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, String)> {
    let slug = req.slug.trim();
    if slug.is_empty() || req.admin_username.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Slug and admin username are required".to_string(),
        ));
    }

    let hash = auth::hash_password(&state.config.password_salt, req.admin_password.trim());
    let (tenant, _admin) = state
        .store
        .provision_tenant(
            req.name.trim(),
            slug,
            req.user_limit.unwrap_or(50),
            req.admin_username.trim(),
            &hash,
        )
        .await
        .map_err(|e| match e {
            StoreError::SlugTaken => (StatusCode::BAD_REQUEST, e.to_string()),
            StoreError::UserLimitReached => (
                StatusCode::BAD_REQUEST,
                "User limit must admit the first admin".to_string(),
            ),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;

    tracing::info!(tenant = %tenant.id, slug = %tenant.slug, "tenant provisioned");
    Ok(Json(RegisterResponse {
        tenant_id: tenant.id,
        slug: tenant.slug,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    /// Tenant slug, used by superadmins to pick the organization.
    #[serde(default)]
    tenant: Option<String>,
}

/// List tasks visible to the caller.
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskRecord>>, (StatusCode, String)> {
    lifecycle::list_for(&state.store, &claims, query.tenant.as_deref())
        .await
        .map(Json)
        .map_err(reject)
}

/// Create a task (admin/superadmin only).
async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<NewTask>,
) -> Result<(StatusCode, Json<TaskRecord>), (StatusCode, String)> {
    lifecycle::create(&state.store, &claims, req)
        .await
        .map(|task| (StatusCode::CREATED, Json(task)))
        .map_err(reject)
}

/// Mark a task done (assignee only).
async fn complete_task(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, (StatusCode, String)> {
    lifecycle::transition(&state.store, &claims, id, TaskEvent::Complete)
        .await
        .map(Json)
        .map_err(reject)
}

/// Approve a completed task (tenant admin or superadmin).
async fn approve_task(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, (StatusCode, String)> {
    lifecycle::transition(&state.store, &claims, id, TaskEvent::Approve)
        .await
        .map(Json)
        .map_err(reject)
}

/// Mute or unmute a user in the caller's tenant. Takes effect on the user's
/// next chat connection, which is when claims are re-read.
async fn set_muted(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path((user_id, value)): Path<(i64, u8)>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !claims.role.is_admin() {
        return Err((StatusCode::FORBIDDEN, "Access denied".to_string()));
    }
    if user_id == claims.sub {
        return Err((
            StatusCode::FORBIDDEN,
            "Cannot change your own mute flag".to_string(),
        ));
    }
    let tenant = claims.tenant.ok_or((
        StatusCode::BAD_REQUEST,
        "An organization context is required".to_string(),
    ))?;

    let changed = state
        .store
        .set_muted(tenant, user_id, value != 0)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !changed {
        return Err((
            StatusCode::NOT_FOUND,
            format!("User {} not found in this organization", user_id),
        ));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Admin roster of the caller's tenant.
async fn reports(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ReportsResponse>, (StatusCode, String)> {
    if !claims.role.is_admin() {
        return Err((StatusCode::FORBIDDEN, "Access denied".to_string()));
    }
    let tenant = claims.tenant.ok_or((
        StatusCode::BAD_REQUEST,
        "An organization context is required".to_string(),
    ))?;

    let users = state
        .store
        .users_for_tenant(tenant)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(ReportsResponse {
        users: users
            .into_iter()
            .map(|u| UserSummary {
                id: u.id,
                username: u.username,
                role: u.role,
                muted: u.muted,
            })
            .collect(),
    }))
}
