use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::row_parsers::contains_pattern;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, log_change, EventBus};
use crate::models::role::DbRole;
use crate::models::Role;

const ROLE_COLUMNS: &str = "id, name, description, created_at, updated_at";

#[derive(Clone)]
pub struct RoleRepository {
    pool: SqlitePool,
    events: EventBus,
}

impl RoleRepository {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self { pool, events }
    }

    pub async fn create(&self, name: &str, description: Option<&str>, actor: Option<&str>) -> AppResult<Role> {
        Role::validate_name(name)?;
        let now = Utc::now();
        let role = Role {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        sqlx::query("INSERT INTO roles (id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
            .bind(role.id.to_string())
            .bind(&role.name)
            .bind(&role.description)
            .bind(role.created_at)
            .bind(role.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from_write(e, format!("role '{}' already exists", role.name)))?;

        tracing::info!(role = %role.name, "role created");
        log_activity(&self.events, "created", actor, &role);
        Ok(role)
    }

    pub async fn find_by_name(&self, name: &str) -> AppResult<Option<Role>> {
        let row = sqlx::query_as::<_, DbRole>(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Role::try_from).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> AppResult<Role> {
        self.find_by_name(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("role '{name}' not found")))
    }

    pub async fn find_by_name_containing(&self, fragment: &str) -> AppResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, DbRole>(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles WHERE name LIKE ? ESCAPE '\\' ORDER BY name"
        ))
        .bind(contains_pattern(fragment))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Role::try_from).collect()
    }

    pub async fn all(&self) -> AppResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, DbRole>(&format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY name"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Role::try_from).collect()
    }

    pub async fn update_description(&self, name: &str, description: Option<&str>, actor: Option<&str>) -> AppResult<Role> {
        let old = self.get_by_name(name).await?;
        let role = Role {
            description: description.map(str::to_string),
            updated_at: Utc::now(),
            ..old.clone()
        };

        sqlx::query("UPDATE roles SET description = ?, updated_at = ? WHERE id = ?")
            .bind(&role.description)
            .bind(role.updated_at)
            .bind(role.id.to_string())
            .execute(&self.pool)
            .await?;

        log_change(&self.events, "updated", actor, &role, Some(&old));
        Ok(role)
    }

    pub async fn rename(&self, name: &str, new_name: &str, actor: Option<&str>) -> AppResult<Role> {
        Role::validate_name(new_name)?;
        let old = self.get_by_name(name).await?;
        if old.is_admin_role() {
            return Err(AppError::forbidden("cannot rename the admin role"));
        }
        let role = Role {
            name: new_name.trim().to_string(),
            updated_at: Utc::now(),
            ..old.clone()
        };

        sqlx::query("UPDATE roles SET name = ?, updated_at = ? WHERE id = ?")
            .bind(&role.name)
            .bind(role.updated_at)
            .bind(role.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from_write(e, format!("role '{}' already exists", role.name)))?;

        tracing::info!(from = %old.name, to = %role.name, "role renamed");
        log_change(&self.events, "updated", actor, &role, Some(&old));
        Ok(role)
    }

    /// Deletes the role together with its grants and memberships. The admin role cannot be deleted.
    pub async fn delete(&self, name: &str, actor: Option<&str>) -> AppResult<Role> {
        let role = self.get_by_name(name).await?;
        if role.is_admin_role() {
            return Err(AppError::forbidden("cannot delete the admin role"));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM permissions WHERE role_id = ?")
            .bind(role.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_roles WHERE role_id = ?")
            .bind(role.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM roles WHERE id = ?")
            .bind(role.id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(role = %role.name, "role deleted");
        log_activity(&self.events, "deleted", actor, &role);
        Ok(role)
    }

    /// Usernames of the role's members.
    pub async fn usernames(&self, role_id: Uuid) -> AppResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT u.username FROM users u JOIN user_roles ur ON ur.user_id = u.id WHERE ur.role_id = ? ORDER BY u.username",
        )
        .bind(role_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}
