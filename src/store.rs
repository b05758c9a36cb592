//! SQLite-backed persistence for tenants, users, and tasks.
//!
//! A single connection behind a `tokio::sync::Mutex` serves the whole
//! process. Holding the lock across [`Store::update_task_status`] makes each
//! task transition an atomic read-check-write, which is what keeps two
//! concurrent approvals of the same task from both succeeding.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::lifecycle::{Role, TaskStatus};
use crate::tenant::{Tenant, TenantId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    slug        TEXT NOT NULL UNIQUE,
    user_limit  INTEGER NOT NULL DEFAULT 50
);
CREATE TABLE IF NOT EXISTS users (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id      INTEGER REFERENCES tenants(id),
    username       TEXT NOT NULL,
    password_hash  TEXT NOT NULL,
    role           TEXT NOT NULL DEFAULT 'employee',
    muted          INTEGER NOT NULL DEFAULT 0,
    UNIQUE (tenant_id, username)
);
CREATE TABLE IF NOT EXISTS tasks (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id      INTEGER NOT NULL REFERENCES tenants(id),
    title          TEXT NOT NULL,
    assigned_to    INTEGER NOT NULL REFERENCES users(id),
    supervisor_id  INTEGER NOT NULL REFERENCES users(id),
    deadline       TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending'
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("organization slug already in use")]
    SlugTaken,

    #[error("organization user limit reached")]
    UserLimitReached,

    #[error("user {0} not found")]
    UnknownUser(i64),

    #[error("user belongs to a different organization")]
    TenantMismatch,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A persisted user. The password hash never serializes.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: i64,
    /// `None` for superadmins, who are not bound to any tenant.
    pub tenant_id: Option<TenantId>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub muted: bool,
}

/// A persisted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub tenant_id: TenantId,
    pub title: String,
    pub assigned_to: i64,
    pub supervisor_id: i64,
    pub deadline: DateTime<Utc>,
    pub status: TaskStatus,
}

impl FromSql for TenantId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(TenantId)
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| Self::parse(s).ok_or(FromSqlError::InvalidType))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| Self::parse(s).ok_or(FromSqlError::InvalidType))
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`. `":memory:"` works for tests.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- tenant directory ----

    /// Provision a tenant. The slug is unique; a duplicate fails with
    /// [`StoreError::SlugTaken`].
    pub async fn create_tenant(&self, name: &str, slug: &str, user_limit: u32) -> StoreResult<Tenant> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tenants (name, slug, user_limit) VALUES (?1, ?2, ?3)",
            params![name, slug, user_limit],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::SlugTaken
            }
            other => StoreError::Sqlite(other),
        })?;
        Ok(Tenant {
            id: TenantId(conn.last_insert_rowid()),
            name: name.to_string(),
            slug: slug.to_string(),
            user_limit,
        })
    }

    /// Provision a tenant together with its first admin, atomically.
    ///
    /// Both rows land in one transaction: a failure on the admin insert rolls
    /// the tenant back too, so a slug is never consumed by a half-provisioned
    /// organization. The limit must admit at least the admin.
    pub async fn provision_tenant(
        &self,
        name: &str,
        slug: &str,
        user_limit: u32,
        admin_username: &str,
        admin_password_hash: &str,
    ) -> StoreResult<(Tenant, UserRecord)> {
        if user_limit < 1 {
            return Err(StoreError::UserLimitReached);
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tenants (name, slug, user_limit) VALUES (?1, ?2, ?3)",
            params![name, slug, user_limit],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::SlugTaken
            }
            other => StoreError::Sqlite(other),
        })?;
        let tenant_id = TenantId(tx.last_insert_rowid());
        tx.execute(
            "INSERT INTO users (tenant_id, username, password_hash, role) VALUES (?1, ?2, ?3, ?4)",
            params![
                tenant_id.0,
                admin_username,
                admin_password_hash,
                Role::Admin.as_str()
            ],
        )?;
        let admin_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((
            Tenant {
                id: tenant_id,
                name: name.to_string(),
                slug: slug.to_string(),
                user_limit,
            },
            UserRecord {
                id: admin_id,
                tenant_id: Some(tenant_id),
                username: admin_username.to_string(),
                password_hash: admin_password_hash.to_string(),
                role: Role::Admin,
                muted: false,
            },
        ))
    }

    pub async fn tenant_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        let conn = self.conn.lock().await;
        let tenant = conn
            .query_row(
                "SELECT id, name, slug, user_limit FROM tenants WHERE slug = ?1",
                params![slug],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        slug: row.get(2)?,
                        user_limit: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    // ---- users ----

    pub async fn create_user(
        &self,
        tenant_id: Option<TenantId>,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> StoreResult<UserRecord> {
        let conn = self.conn.lock().await;
        if let Some(tenant) = tenant_id {
            let (count, limit): (u32, u32) = conn.query_row(
                "SELECT (SELECT COUNT(*) FROM users WHERE tenant_id = ?1), user_limit
                 FROM tenants WHERE id = ?1",
                params![tenant.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if count >= limit {
                return Err(StoreError::UserLimitReached);
            }
        }
        conn.execute(
            "INSERT INTO users (tenant_id, username, password_hash, role) VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id.map(|t| t.0), username, password_hash, role.as_str()],
        )?;
        Ok(UserRecord {
            id: conn.last_insert_rowid(),
            tenant_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            role,
            muted: false,
        })
    }

    /// Look up a user by name within a tenant (`None` for superadmins).
    pub async fn user_by_name(
        &self,
        tenant_id: Option<TenantId>,
        username: &str,
    ) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn.lock().await;
        let user = conn
            .query_row(
                "SELECT id, tenant_id, username, password_hash, role, muted
                 FROM users WHERE tenant_id IS ?1 AND username = ?2",
                params![tenant_id.map(|t| t.0), username],
                Self::map_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Create the process-wide superadmin if it does not exist yet.
    pub async fn ensure_superadmin(&self, username: &str, password_hash: &str) -> StoreResult<UserRecord> {
        if let Some(existing) = self.user_by_name(None, username).await? {
            return Ok(existing);
        }
        self.create_user(None, username, password_hash, Role::Superadmin)
            .await
    }

    pub async fn users_for_tenant(&self, tenant_id: TenantId) -> StoreResult<Vec<UserRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, username, password_hash, role, muted
             FROM users WHERE tenant_id = ?1 ORDER BY id",
        )?;
        let users = stmt
            .query_map(params![tenant_id.0], Self::map_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Flip a user's muted flag, scoped to the given tenant. Returns false
    /// when no such user exists in that tenant.
    pub async fn set_muted(&self, tenant_id: TenantId, user_id: i64, muted: bool) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE users SET muted = ?1 WHERE id = ?2 AND tenant_id = ?3",
            params![muted, user_id, tenant_id.0],
        )?;
        Ok(changed > 0)
    }

    // ---- tasks ----

    /// Insert a task after verifying the assignee belongs to `tenant_id`.
    /// The check and the insert share the connection lock.
    pub async fn create_task(
        &self,
        tenant_id: TenantId,
        title: &str,
        assigned_to: i64,
        supervisor_id: i64,
        deadline: DateTime<Utc>,
    ) -> StoreResult<TaskRecord> {
        let conn = self.conn.lock().await;
        let assignee_tenant: Option<Option<i64>> = conn
            .query_row(
                "SELECT tenant_id FROM users WHERE id = ?1",
                params![assigned_to],
                |row| row.get(0),
            )
            .optional()?;
        match assignee_tenant {
            None => return Err(StoreError::UnknownUser(assigned_to)),
            Some(t) if t != Some(tenant_id.0) => return Err(StoreError::TenantMismatch),
            Some(_) => {}
        }
        conn.execute(
            "INSERT INTO tasks (tenant_id, title, assigned_to, supervisor_id, deadline, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tenant_id.0,
                title,
                assigned_to,
                supervisor_id,
                deadline.to_rfc3339(),
                TaskStatus::Pending.as_str(),
            ],
        )?;
        Ok(TaskRecord {
            id: conn.last_insert_rowid(),
            tenant_id,
            title: title.to_string(),
            assigned_to,
            supervisor_id,
            deadline,
            status: TaskStatus::Pending,
        })
    }

    pub async fn task_by_id(&self, task_id: i64) -> StoreResult<Option<TaskRecord>> {
        let conn = self.conn.lock().await;
        Ok(Self::fetch_task(&conn, task_id)?)
    }

    /// Tasks in a tenant, optionally narrowed to one assignee.
    pub async fn list_tasks(
        &self,
        tenant_id: TenantId,
        assigned_to: Option<i64>,
    ) -> StoreResult<Vec<TaskRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, title, assigned_to, supervisor_id, deadline, status
             FROM tasks WHERE tenant_id = ?1 AND (?2 IS NULL OR assigned_to = ?2)
             ORDER BY id",
        )?;
        let tasks = stmt
            .query_map(params![tenant_id.0, assigned_to], Self::map_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Read-check-write a task's status as one critical section.
    ///
    /// `decide` sees the current row (or `None`) and either returns the next
    /// status or an error of the caller's choosing; the update only runs when
    /// it returns `Ok`. The connection lock is held throughout.
    pub async fn update_task_status<E, F>(&self, task_id: i64, decide: F) -> Result<TaskRecord, E>
    where
        F: FnOnce(Option<&TaskRecord>) -> Result<TaskStatus, E>,
        E: From<StoreError>,
    {
        let conn = self.conn.lock().await;
        let current = Self::fetch_task(&conn, task_id).map_err(StoreError::from)?;
        let next = decide(current.as_ref())?;
        let Some(mut task) = current else {
            // decide must reject a missing row; treat a slip as no-rows.
            return Err(E::from(StoreError::Sqlite(
                rusqlite::Error::QueryReturnedNoRows,
            )));
        };
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![next.as_str(), task_id],
        )
        .map_err(StoreError::from)?;
        task.status = next;
        Ok(task)
    }

    fn fetch_task(conn: &Connection, task_id: i64) -> rusqlite::Result<Option<TaskRecord>> {
        conn.query_row(
            "SELECT id, tenant_id, title, assigned_to, supervisor_id, deadline, status
             FROM tasks WHERE id = ?1",
            params![task_id],
            Self::map_task,
        )
        .optional()
    }

    fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
        Ok(UserRecord {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            username: row.get(2)?,
            password_hash: row.get(3)?,
            role: row.get(4)?,
            muted: row.get(5)?,
        })
    }

    fn map_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
        let deadline: String = row.get(5)?;
        let deadline = DateTime::parse_from_rfc3339(&deadline)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?
            .with_timezone(&Utc);
        Ok(TaskRecord {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            title: row.get(2)?,
            assigned_to: row.get(3)?,
            supervisor_id: row.get(4)?,
            deadline,
            status: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slug_is_unique() {
        let store = Store::open(":memory:").unwrap();
        store.create_tenant("Acme", "acme", 10).await.unwrap();
        let err = store.create_tenant("Acme Two", "acme", 10).await.unwrap_err();
        assert!(matches!(err, StoreError::SlugTaken));
    }

    #[tokio::test]
    async fn user_limit_is_enforced() {
        let store = Store::open(":memory:").unwrap();
        let tenant = store.create_tenant("Tiny", "tiny", 1).await.unwrap();
        store
            .create_user(Some(tenant.id), "only", "x", Role::Admin)
            .await
            .unwrap();
        let err = store
            .create_user(Some(tenant.id), "extra", "x", Role::Employee)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UserLimitReached));
    }

    #[tokio::test]
    async fn provisioning_is_atomic() {
        let store = Store::open(":memory:").unwrap();

        // A limit that cannot admit the first admin fails the whole
        // provisioning, leaving the slug free for a retry.
        let err = store
            .provision_tenant("Zero Corp", "zero", 0, "boss", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UserLimitReached));
        assert!(store.tenant_by_slug("zero").await.unwrap().is_none());

        let (tenant, admin) = store
            .provision_tenant("Zero Corp", "zero", 5, "boss", "x")
            .await
            .unwrap();
        assert_eq!(tenant.slug, "zero");
        assert_eq!(admin.tenant_id, Some(tenant.id));
        assert_eq!(admin.role, Role::Admin);

        let err = store
            .provision_tenant("Copycat", "zero", 5, "boss2", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SlugTaken));
    }

    #[tokio::test]
    async fn task_creation_checks_assignee_tenant() {
        let store = Store::open(":memory:").unwrap();
        let acme = store.create_tenant("Acme", "acme", 10).await.unwrap();
        let globex = store.create_tenant("Globex", "globex", 10).await.unwrap();
        let admin = store
            .create_user(Some(acme.id), "boss", "x", Role::Admin)
            .await
            .unwrap();
        let foreign = store
            .create_user(Some(globex.id), "other", "x", Role::Employee)
            .await
            .unwrap();

        let err = store
            .create_task(acme.id, "t", foreign.id, admin.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TenantMismatch));

        let err = store
            .create_task(acme.id, "t", 9999, admin.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownUser(9999)));
    }

    #[tokio::test]
    async fn update_task_status_round_trips() {
        let store = Store::open(":memory:").unwrap();
        let acme = store.create_tenant("Acme", "acme", 10).await.unwrap();
        let admin = store
            .create_user(Some(acme.id), "boss", "x", Role::Admin)
            .await
            .unwrap();
        let task = store
            .create_task(acme.id, "t", admin.id, admin.id, Utc::now())
            .await
            .unwrap();

        let updated = store
            .update_task_status::<StoreError, _>(task.id, |t| {
                assert_eq!(t.unwrap().status, TaskStatus::Pending);
                Ok(TaskStatus::Done)
            })
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Done);

        let reread = store.task_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(reread.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orgboard.db");
        {
            let store = Store::open(&path).unwrap();
            store.create_tenant("Acme", "acme", 10).await.unwrap();
        }
        let store = Store::open(&path).unwrap();
        let tenant = store.tenant_by_slug("acme").await.unwrap().unwrap();
        assert_eq!(tenant.name, "Acme");
    }
}
