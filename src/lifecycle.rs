//! Task lifecycle state machine.
//!
//! A task moves along exactly one path: `pending -> done -> approved`. No
//! other edge exists and none is reversible. Both transitions share a single
//! authorization policy, kept as data in [`RULES`] rather than scattered
//! per-endpoint conditionals, and both are applied as one read-check-write
//! unit inside the store so that two concurrent calls cannot both succeed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::auth::Claims;
use crate::store::{Store, StoreError, TaskRecord};
use crate::tenant::TenantId;

/// User role within (or above) a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Employee,
    Admin,
    /// Process-wide operator role, not bound to any tenant.
    Superadmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Admin => "admin",
            Self::Superadmin => "superadmin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "employee" => Some(Self::Employee),
            "admin" => Some(Self::Admin),
            "superadmin" => Some(Self::Superadmin),
            _ => None,
        }
    }

    /// Admin or superadmin.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin | Self::Superadmin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status. `Approved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
    Approved,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Approved => "approved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "approved" => Some(Self::Approved),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEvent {
    Complete,
    Approve,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Complete => "complete",
            Self::Approve => "approve",
        })
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("operation not permitted for this caller")]
    Authorization,

    #[error("cannot {event} a task in the {status} state")]
    InvalidTransition { event: TaskEvent, status: TaskStatus },

    #[error("{0}")]
    ScopeViolation(String),

    #[error("task {0} not found")]
    NotFound(i64),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Who may request a transition.
#[derive(Debug, Clone, Copy)]
enum Scope {
    /// Caller must be the task's assignee, in the task's tenant. Role is not
    /// consulted: an admin may complete a task assigned to them.
    Assignee,
    /// Caller must be an admin of the task's tenant, or a superadmin.
    TenantAdmin,
}

struct Rule {
    from: TaskStatus,
    to: TaskStatus,
    scope: Scope,
}

/// The whole state machine. One row per legal edge.
static RULES: [Rule; 2] = [
    Rule {
        from: TaskStatus::Pending,
        to: TaskStatus::Done,
        scope: Scope::Assignee,
    },
    Rule {
        from: TaskStatus::Done,
        to: TaskStatus::Approved,
        scope: Scope::TenantAdmin,
    },
];

fn rule_for(event: TaskEvent) -> &'static Rule {
    match event {
        TaskEvent::Complete => &RULES[0],
        TaskEvent::Approve => &RULES[1],
    }
}

fn authorize(claims: &Claims, task: &TaskRecord, scope: Scope) -> LifecycleResult<()> {
    let allowed = match scope {
        Scope::Assignee => claims.sub == task.assigned_to && claims.covers(task.tenant_id),
        Scope::TenantAdmin => claims.role.is_admin() && claims.covers(task.tenant_id),
    };
    if allowed {
        Ok(())
    } else {
        Err(LifecycleError::Authorization)
    }
}

/// Apply a requested transition to a task.
///
/// Authorization is checked before the status precondition, so an outsider
/// learns nothing about the task's current state. Repeating a successful
/// request fails with [`LifecycleError::InvalidTransition`] rather than
/// double-applying.
pub async fn transition(
    store: &Store,
    claims: &Claims,
    task_id: i64,
    event: TaskEvent,
) -> LifecycleResult<TaskRecord> {
    let rule = rule_for(event);
    let task = store
        .update_task_status(task_id, |task| {
            let task = task.ok_or(LifecycleError::NotFound(task_id))?;
            authorize(claims, task, rule.scope)?;
            if task.status != rule.from {
                return Err(LifecycleError::InvalidTransition {
                    event,
                    status: task.status,
                });
            }
            Ok(rule.to)
        })
        .await?;
    tracing::info!(
        task = task_id,
        tenant = %task.tenant_id,
        %event,
        status = %task.status,
        "task transition applied"
    );
    Ok(task)
}

/// Parameters for task creation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub assignee: i64,
    pub deadline: DateTime<Utc>,
    /// Target tenant slug. Required when a superadmin creates on behalf of a
    /// tenant; admins always act within their own tenant.
    #[serde(default)]
    pub tenant: Option<String>,
}

/// Create a task, assigned to a user of the same tenant.
pub async fn create(store: &Store, claims: &Claims, req: NewTask) -> LifecycleResult<TaskRecord> {
    if !claims.role.is_admin() {
        return Err(LifecycleError::Authorization);
    }
    let tenant_id = target_tenant(store, claims, req.tenant.as_deref()).await?;
    let task = store
        .create_task(tenant_id, &req.title, req.assignee, claims.sub, req.deadline)
        .await
        .map_err(|e| match e {
            StoreError::UnknownUser(id) => {
                LifecycleError::ScopeViolation(format!("assignee {id} does not exist"))
            }
            StoreError::TenantMismatch => LifecycleError::ScopeViolation(
                "assignee belongs to a different organization".into(),
            ),
            other => LifecycleError::Store(other),
        })?;
    tracing::info!(task = task.id, tenant = %task.tenant_id, assignee = task.assigned_to, "task created");
    Ok(task)
}

/// List tasks visible to the caller.
///
/// Admins see every task in their tenant; employees only tasks assigned to
/// them. The scoping is part of the contract, not an optimization.
pub async fn list_for(
    store: &Store,
    claims: &Claims,
    tenant_hint: Option<&str>,
) -> LifecycleResult<Vec<TaskRecord>> {
    match claims.role {
        Role::Superadmin => {
            let tenant_id = target_tenant(store, claims, tenant_hint).await?;
            Ok(store.list_tasks(tenant_id, None).await?)
        }
        Role::Admin => {
            let tenant_id = claims.tenant.ok_or(LifecycleError::Authorization)?;
            Ok(store.list_tasks(tenant_id, None).await?)
        }
        Role::Employee => {
            let tenant_id = claims.tenant.ok_or(LifecycleError::Authorization)?;
            Ok(store.list_tasks(tenant_id, Some(claims.sub)).await?)
        }
    }
}

/// Resolve the tenant an operation targets. Admins are pinned to their own
/// tenant; superadmins must name one by slug.
async fn target_tenant(
    store: &Store,
    claims: &Claims,
    slug: Option<&str>,
) -> LifecycleResult<TenantId> {
    if let Some(own) = claims.tenant {
        if let Some(slug) = slug {
            let named = store
                .tenant_by_slug(slug)
                .await?
                .ok_or_else(|| LifecycleError::ScopeViolation(format!("unknown organization '{slug}'")))?;
            if named.id != own {
                return Err(LifecycleError::ScopeViolation(
                    "cannot act on behalf of another organization".into(),
                ));
            }
        }
        return Ok(own);
    }
    let slug = slug.ok_or_else(|| {
        LifecycleError::ScopeViolation("a target organization is required".into())
    })?;
    let tenant = store
        .tenant_by_slug(slug)
        .await?
        .ok_or_else(|| LifecycleError::ScopeViolation(format!("unknown organization '{slug}'")))?;
    Ok(tenant.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UserRecord;

    fn claims_for(user: &UserRecord) -> Claims {
        Claims {
            sub: user.id,
            role: user.role,
            tenant: user.tenant_id,
            usr: user.username.clone(),
            muted: user.muted,
            iat: 0,
            exp: i64::MAX,
        }
    }

    struct Fixture {
        store: Store,
        admin: Claims,
        employee: Claims,
        outsider: Claims,
        root: Claims,
    }

    async fn fixture() -> Fixture {
        let store = Store::open(":memory:").unwrap();
        let acme = store.create_tenant("Acme Corp", "acme", 50).await.unwrap();
        let globex = store.create_tenant("Globex", "globex", 50).await.unwrap();
        let admin = store
            .create_user(Some(acme.id), "boss", "x", Role::Admin)
            .await
            .unwrap();
        let employee = store
            .create_user(Some(acme.id), "worker", "x", Role::Employee)
            .await
            .unwrap();
        let outsider = store
            .create_user(Some(globex.id), "stranger", "x", Role::Employee)
            .await
            .unwrap();
        let root = store.ensure_superadmin("root", "x").await.unwrap();
        Fixture {
            store,
            admin: claims_for(&admin),
            employee: claims_for(&employee),
            outsider: claims_for(&outsider),
            root: claims_for(&root),
        }
    }

    async fn file_report(fx: &Fixture) -> TaskRecord {
        create(
            &fx.store,
            &fx.admin,
            NewTask {
                title: "file report".into(),
                assignee: fx.employee.sub,
                deadline: Utc::now(),
                tenant: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn full_lifecycle_then_terminal() {
        let fx = fixture().await;
        let task = file_report(&fx).await;
        assert_eq!(task.status, TaskStatus::Pending);

        let task = transition(&fx.store, &fx.employee, task.id, TaskEvent::Complete)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        let task = transition(&fx.store, &fx.admin, task.id, TaskEvent::Approve)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Approved);

        // Terminal: neither event applies again.
        let err = transition(&fx.store, &fx.admin, task.id, TaskEvent::Approve)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                status: TaskStatus::Approved,
                ..
            }
        ));
        let err = transition(&fx.store, &fx.employee, task.id, TaskEvent::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn complete_requires_assignee_match() {
        let fx = fixture().await;
        let task = file_report(&fx).await;

        // Admin of the same tenant is not the assignee.
        let err = transition(&fx.store, &fx.admin, task.id, TaskEvent::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Authorization));

        // Employee from another tenant.
        let err = transition(&fx.store, &fx.outsider, task.id, TaskEvent::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Authorization));
    }

    #[tokio::test]
    async fn approve_requires_admin_of_tenant() {
        let fx = fixture().await;
        let task = file_report(&fx).await;
        transition(&fx.store, &fx.employee, task.id, TaskEvent::Complete)
            .await
            .unwrap();

        let err = transition(&fx.store, &fx.employee, task.id, TaskEvent::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Authorization));

        // Superadmin may approve any tenant's task.
        let task = transition(&fx.store, &fx.root, task.id, TaskEvent::Approve)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
    }

    #[tokio::test]
    async fn approve_before_done_is_invalid() {
        let fx = fixture().await;
        let task = file_report(&fx).await;
        let err = transition(&fx.store, &fx.admin, task.id, TaskEvent::Approve)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                status: TaskStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn create_rejects_cross_tenant_assignee() {
        let fx = fixture().await;
        let err = create(
            &fx.store,
            &fx.admin,
            NewTask {
                title: "spy".into(),
                assignee: fx.outsider.sub,
                deadline: Utc::now(),
                tenant: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LifecycleError::ScopeViolation(_)));
    }

    #[tokio::test]
    async fn create_rejects_non_admin() {
        let fx = fixture().await;
        let err = create(
            &fx.store,
            &fx.employee,
            NewTask {
                title: "self-assigned".into(),
                assignee: fx.employee.sub,
                deadline: Utc::now(),
                tenant: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LifecycleError::Authorization));
    }

    #[tokio::test]
    async fn superadmin_creates_with_explicit_tenant() {
        let fx = fixture().await;
        let task = create(
            &fx.store,
            &fx.root,
            NewTask {
                title: "audit".into(),
                assignee: fx.employee.sub,
                deadline: Utc::now(),
                tenant: Some("acme".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(task.tenant_id, fx.admin.tenant.unwrap());

        // Without a tenant slug there is nothing to scope to.
        let err = create(
            &fx.store,
            &fx.root,
            NewTask {
                title: "audit".into(),
                assignee: fx.employee.sub,
                deadline: Utc::now(),
                tenant: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LifecycleError::ScopeViolation(_)));
    }

    #[tokio::test]
    async fn listing_is_scoped_by_role() {
        let fx = fixture().await;
        let mine = file_report(&fx).await;
        // A second task assigned to the admin.
        create(
            &fx.store,
            &fx.admin,
            NewTask {
                title: "plan quarter".into(),
                assignee: fx.admin.sub,
                deadline: Utc::now(),
                tenant: None,
            },
        )
        .await
        .unwrap();

        let all = list_for(&fx.store, &fx.admin, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let own = list_for(&fx.store, &fx.employee, None).await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].id, mine.id);

        let elsewhere = list_for(&fx.store, &fx.outsider, None).await.unwrap();
        assert!(elsewhere.is_empty());
    }
}
