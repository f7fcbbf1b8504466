//! Database store for accounts, metadata, and project registrations
//!
//! This is the durable collaborator behind the cloak workflow: the queue of
//! pending requests lives in memory, but assigned cloaks survive here as
//! account metadata.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Account, Project};

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // Account operations

    pub async fn create_account(&self, name: &str) -> Result<Account> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO accounts (id, name, frozen, created_at)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Account {
            id,
            name: name.to_string(),
            frozen: false,
            created_at: now,
        })
    }

    /// Look up an account by name, case-insensitively. Returns the canonical
    /// record as registered.
    pub async fn account_by_name(&self, name: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, name, frozen, created_at
            FROM accounts
            WHERE name = ? COLLATE NOCASE
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    pub async fn set_frozen(&self, account_id: Uuid, frozen: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts SET frozen = ? WHERE id = ?
            "#,
        )
        .bind(frozen as i64)
        .bind(account_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Metadata operations

    pub async fn metadata_set(&self, account_id: Uuid, key: &str, value: &str) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO account_metadata (account_id, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (account_id, key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(account_id.to_string())
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn metadata_get(&self, account_id: Uuid, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            SELECT value FROM account_metadata
            WHERE account_id = ? AND key = ?
            "#,
        )
        .bind(account_id.to_string())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    // Project operations

    pub async fn create_project(&self, name: &str, namespace: &str) -> Result<Project> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO projects (id, name, namespace, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(namespace)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Project {
            id,
            name: name.to_string(),
            namespace: namespace.to_string(),
            created_at: now,
        })
    }

    /// Look up the project owning a cloak namespace prefix.
    pub async fn project_by_namespace(&self, namespace: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, name, namespace, created_at
            FROM projects
            WHERE namespace = ? COLLATE NOCASE
            "#,
        )
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    pub async fn add_contact(&self, project_id: Uuid, account_id: Uuid) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO project_contacts (project_id, account_id, added_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(project_id.to_string())
        .bind(account_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Test whether the named account is a registered contact of the project.
    pub async fn is_contact(&self, project_id: Uuid, account_name: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM project_contacts pc
            JOIN accounts a ON a.id = pc.account_id
            WHERE pc.project_id = ? AND a.name = ? COLLATE NOCASE
            "#,
        )
        .bind(project_id.to_string())
        .bind(account_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: String,
    name: String,
    frozen: i64,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = AppError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid account id: {}", e)))?,
            name: row.name,
            frozen: row.frozen != 0,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    namespace: String,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<ProjectRow> for Project {
    type Error = AppError;

    fn try_from(row: ProjectRow) -> Result<Self> {
        Ok(Project {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid project id: {}", e)))?,
            name: row.name,
            namespace: row.namespace,
            created_at: row.created_at,
        })
    }
}
