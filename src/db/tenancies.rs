use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::row_parsers::contains_pattern;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, log_change, EventBus};
use crate::models::tenancy::DbTenancy;
use crate::models::Tenancy;

const TENANCY_COLUMNS: &str = "path, name, parent_path, created_at, updated_at";

#[derive(Clone)]
pub struct TenancyRepository {
    pool: SqlitePool,
    events: EventBus,
}

impl TenancyRepository {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self { pool, events }
    }

    pub async fn create(&self, path: &str, name: &str, parent_path: Option<&str>, actor: Option<&str>) -> AppResult<Tenancy> {
        Tenancy::validate(path, name)?;
        if let Some(parent) = parent_path {
            self.get_by_path(parent).await?;
        }

        let now = Utc::now();
        let tenancy = Tenancy {
            path: path.trim().to_string(),
            name: name.trim().to_string(),
            parent_path: parent_path.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        sqlx::query("INSERT INTO tenancies (path, name, parent_path, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&tenancy.path)
            .bind(&tenancy.name)
            .bind(&tenancy.parent_path)
            .bind(tenancy.created_at)
            .bind(tenancy.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from_write(e, format!("tenancy '{}' already exists", tenancy.path)))?;

        tracing::info!(path = %tenancy.path, "tenancy created");
        log_activity(&self.events, "created", actor, &tenancy);
        Ok(tenancy)
    }

    pub async fn find_by_path(&self, path: &str) -> AppResult<Option<Tenancy>> {
        let row = sqlx::query_as::<_, DbTenancy>(&format!("SELECT {TENANCY_COLUMNS} FROM tenancies WHERE path = ?"))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Tenancy::from))
    }

    pub async fn get_by_path(&self, path: &str) -> AppResult<Tenancy> {
        self.find_by_path(path)
            .await?
            .ok_or_else(|| AppError::not_found(format!("tenancy '{path}' not found")))
    }

    pub async fn find_by_name(&self, name: &str) -> AppResult<Option<Tenancy>> {
        let row = sqlx::query_as::<_, DbTenancy>(&format!("SELECT {TENANCY_COLUMNS} FROM tenancies WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Tenancy::from))
    }

    /// Tenancies whose path or name contains `search`.
    pub async fn find_matching(&self, search: &str) -> AppResult<Vec<Tenancy>> {
        let rows = sqlx::query_as::<_, DbTenancy>(&format!(
            "SELECT {TENANCY_COLUMNS} FROM tenancies WHERE path LIKE ?1 ESCAPE '\\' OR name LIKE ?1 ESCAPE '\\' ORDER BY path"
        ))
        .bind(contains_pattern(search))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Tenancy::from).collect())
    }

    pub async fn all(&self) -> AppResult<Vec<Tenancy>> {
        let rows = sqlx::query_as::<_, DbTenancy>(&format!("SELECT {TENANCY_COLUMNS} FROM tenancies ORDER BY path"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Tenancy::from).collect())
    }

    pub async fn children(&self, path: &str) -> AppResult<Vec<Tenancy>> {
        let rows = sqlx::query_as::<_, DbTenancy>(&format!(
            "SELECT {TENANCY_COLUMNS} FROM tenancies WHERE parent_path = ? ORDER BY path"
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Tenancy::from).collect())
    }

    pub async fn usernames(&self, path: &str) -> AppResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>("SELECT username FROM users WHERE tenancy_path = ? ORDER BY username")
            .bind(path)
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    pub async fn update_name(&self, path: &str, name: &str, actor: Option<&str>) -> AppResult<Tenancy> {
        Tenancy::validate(path, name)?;
        let old = self.get_by_path(path).await?;
        let tenancy = Tenancy {
            name: name.trim().to_string(),
            updated_at: Utc::now(),
            ..old.clone()
        };

        sqlx::query("UPDATE tenancies SET name = ?, updated_at = ? WHERE path = ?")
            .bind(&tenancy.name)
            .bind(tenancy.updated_at)
            .bind(&tenancy.path)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from_write(e, format!("tenancy name '{}' already in use", tenancy.name)))?;

        log_change(&self.events, "updated", actor, &tenancy, Some(&old));
        Ok(tenancy)
    }

    /// Re-parents the tenancy. A tenancy cannot become its own ancestor.
    pub async fn update_parent(&self, path: &str, parent_path: Option<&str>, actor: Option<&str>) -> AppResult<Tenancy> {
        let old = self.get_by_path(path).await?;

        if let Some(parent) = parent_path {
            let mut cursor = Some(self.get_by_path(parent).await?);
            while let Some(ancestor) = cursor {
                if ancestor.path == old.path {
                    return Err(AppError::invalid_argument(format!(
                        "tenancy '{}' cannot be moved beneath itself",
                        old.path
                    )));
                }
                cursor = match ancestor.parent_path.as_deref() {
                    Some(next) => self.find_by_path(next).await?,
                    None => None,
                };
            }
        }

        let tenancy = Tenancy {
            parent_path: parent_path.map(str::to_string),
            updated_at: Utc::now(),
            ..old.clone()
        };

        sqlx::query("UPDATE tenancies SET parent_path = ?, updated_at = ? WHERE path = ?")
            .bind(&tenancy.parent_path)
            .bind(tenancy.updated_at)
            .bind(&tenancy.path)
            .execute(&self.pool)
            .await?;

        log_change(&self.events, "updated", actor, &tenancy, Some(&old));
        Ok(tenancy)
    }

    /// Deletes the tenancy; its children become roots and its users leave it.
    pub async fn delete(&self, path: &str, actor: Option<&str>) -> AppResult<Tenancy> {
        let tenancy = self.get_by_path(path).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE users SET tenancy_path = NULL WHERE tenancy_path = ?")
            .bind(&tenancy.path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE tenancies SET parent_path = NULL WHERE parent_path = ?")
            .bind(&tenancy.path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tenancies WHERE path = ?")
            .bind(&tenancy.path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(path = %tenancy.path, "tenancy deleted");
        log_activity(&self.events, "deleted", actor, &tenancy);
        Ok(tenancy)
    }
}
