use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::authz::GrantSource;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, log_change, EventBus};
use crate::models::permission::DbPermission;
use crate::models::{FeatureId, FeatureType, NewPermission, Permission, PermissionRule, PermissionValue, Role};

const PERMISSION_SELECT: &str = "SELECT p.id, p.role_id, r.name AS role_name, p.rule, p.mode, p.feature_type, \
     p.feature_fqn, p.member_type, p.created_at FROM permissions p JOIN roles r ON r.id = p.role_id";

const PERMISSION_ORDER: &str = "ORDER BY r.name, p.feature_type, p.feature_fqn, p.rule, p.mode";

#[derive(Clone)]
pub struct PermissionRepository {
    pool: SqlitePool,
    events: EventBus,
}

impl PermissionRepository {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self { pool, events }
    }

    /// Adds a grant to `role`.
    ///
    /// A role holds at most one grant per (feature, rule); granting the same
    /// pair again replaces its mode.
    pub async fn grant(&self, role: &Role, new: NewPermission, actor: Option<&str>) -> AppResult<Permission> {
        let feature_id = &new.feature.id;
        let feature_fqn = feature_id.fully_qualified_name();
        let member_type = new.feature.member_type;

        if let Some(existing) = self
            .find_by_role_and_rule_and_feature(role.id, new.rule, feature_id.feature_type(), &feature_fqn)
            .await?
        {
            if existing.mode == new.mode && (member_type.is_none() || existing.member_type == member_type) {
                return Ok(existing);
            }
            let updated = Permission {
                mode: new.mode,
                member_type: member_type.or(existing.member_type),
                ..existing.clone()
            };
            sqlx::query("UPDATE permissions SET mode = ?, member_type = ? WHERE id = ?")
                .bind(updated.mode.as_str())
                .bind(updated.member_type.map(|m| m.as_str()))
                .bind(updated.id.to_string())
                .execute(&self.pool)
                .await?;

            tracing::info!(permission = %updated.title(), "permission updated");
            log_change(&self.events, "updated", actor, &updated, Some(&existing));
            return Ok(updated);
        }

        let permission = Permission {
            id: Uuid::new_v4(),
            role_id: role.id,
            role_name: role.name.clone(),
            rule: new.rule,
            mode: new.mode,
            feature_type: feature_id.feature_type(),
            feature_fqn,
            member_type,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO permissions (id, role_id, rule, mode, feature_type, feature_fqn, member_type, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(permission.id.to_string())
        .bind(permission.role_id.to_string())
        .bind(permission.rule.as_str())
        .bind(permission.mode.as_str())
        .bind(permission.feature_type.as_str())
        .bind(&permission.feature_fqn)
        .bind(permission.member_type.map(|m| m.as_str()))
        .bind(permission.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_write(e, format!("'{}' already granted", permission.title())))?;

        tracing::info!(permission = %permission.title(), "permission granted");
        log_activity(&self.events, "created", actor, &permission);
        Ok(permission)
    }

    /// Removes the (feature, rule) grant from `role`; `None` when there was nothing to remove.
    ///
    /// Package-level grants of the admin role are protected.
    pub async fn revoke(
        &self,
        role: &Role,
        rule: PermissionRule,
        feature_type: FeatureType,
        feature_fqn: &str,
        actor: Option<&str>,
    ) -> AppResult<Option<Permission>> {
        if role.is_admin_role() && feature_type == FeatureType::Package {
            return Err(AppError::forbidden(
                "cannot remove top-level package permissions for the admin role",
            ));
        }

        let Some(permission) = self
            .find_by_role_and_rule_and_feature(role.id, rule, feature_type, feature_fqn)
            .await?
        else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM permissions WHERE id = ?")
            .bind(permission.id.to_string())
            .execute(&self.pool)
            .await?;

        tracing::info!(permission = %permission.title(), "permission removed");
        log_activity(&self.events, "deleted", actor, &permission);
        Ok(Some(permission))
    }

    pub async fn all(&self) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, DbPermission>(&format!("{PERMISSION_SELECT} {PERMISSION_ORDER}"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Permission::try_from).collect()
    }

    pub async fn find_by_role(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, DbPermission>(&format!("{PERMISSION_SELECT} WHERE p.role_id = ? {PERMISSION_ORDER}"))
            .bind(role_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Permission::try_from).collect()
    }

    /// Every grant reachable through the user's roles, regardless of account status.
    pub async fn find_by_user(&self, username: &str) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, DbPermission>(&format!(
            "{PERMISSION_SELECT} JOIN user_roles ur ON ur.role_id = p.role_id JOIN users u ON u.id = ur.user_id \
             WHERE u.username = ? {PERMISSION_ORDER}"
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Permission::try_from).collect()
    }

    /// The persisted grant behind `value`, if the user holds it through any role.
    pub async fn find_by_user_and_permission_value(
        &self,
        username: &str,
        value: &PermissionValue,
    ) -> AppResult<Option<Permission>> {
        let row = sqlx::query_as::<_, DbPermission>(&format!(
            "{PERMISSION_SELECT} JOIN user_roles ur ON ur.role_id = p.role_id JOIN users u ON u.id = ur.user_id \
             WHERE u.username = ? AND p.rule = ? AND p.mode = ? AND p.feature_type = ? AND p.feature_fqn = ? \
             {PERMISSION_ORDER} LIMIT 1"
        ))
        .bind(username)
        .bind(value.rule.as_str())
        .bind(value.mode.as_str())
        .bind(value.feature_id.feature_type().as_str())
        .bind(value.feature_id.fully_qualified_name())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Permission::try_from).transpose()
    }

    pub async fn find_by_feature(&self, feature_id: &FeatureId) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, DbPermission>(&format!(
            "{PERMISSION_SELECT} WHERE p.feature_type = ? AND p.feature_fqn = ? {PERMISSION_ORDER}"
        ))
        .bind(feature_id.feature_type().as_str())
        .bind(feature_id.fully_qualified_name())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Permission::try_from).collect()
    }

    pub async fn find_by_role_and_rule_and_feature(
        &self,
        role_id: Uuid,
        rule: PermissionRule,
        feature_type: FeatureType,
        feature_fqn: &str,
    ) -> AppResult<Option<Permission>> {
        let row = sqlx::query_as::<_, DbPermission>(&format!(
            "{PERMISSION_SELECT} WHERE p.role_id = ? AND p.rule = ? AND p.feature_type = ? AND p.feature_fqn = ?"
        ))
        .bind(role_id.to_string())
        .bind(rule.as_str())
        .bind(feature_type.as_str())
        .bind(feature_fqn)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Permission::try_from).transpose()
    }

    pub async fn find_by_role_and_rule_and_feature_type(
        &self,
        role_id: Uuid,
        rule: PermissionRule,
        feature_type: FeatureType,
    ) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, DbPermission>(&format!(
            "{PERMISSION_SELECT} WHERE p.role_id = ? AND p.rule = ? AND p.feature_type = ? {PERMISSION_ORDER}"
        ))
        .bind(role_id.to_string())
        .bind(rule.as_str())
        .bind(feature_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Permission::try_from).collect()
    }

    /// Names of the roles an enabled user holds; empty for unknown or disabled users.
    pub async fn role_names_for_user(&self, username: &str) -> AppResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT r.name FROM roles r JOIN user_roles ur ON ur.role_id = r.id JOIN users u ON u.id = ur.user_id \
             WHERE u.username = ? AND u.status = 'ENABLED' ORDER BY r.name",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

#[async_trait]
impl GrantSource for PermissionRepository {
    /// Disabled users resolve to no grants at all.
    async fn grants_for_user(&self, username: &str) -> AppResult<Vec<PermissionValue>> {
        let rows = sqlx::query_as::<_, DbPermission>(&format!(
            "{PERMISSION_SELECT} JOIN user_roles ur ON ur.role_id = p.role_id JOIN users u ON u.id = ur.user_id \
             WHERE u.username = ? AND u.status = 'ENABLED'"
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Permission::try_from(row).and_then(|p| p.as_value()))
            .collect()
    }

    async fn roles_for_user(&self, username: &str) -> AppResult<Vec<String>> {
        self.role_names_for_user(username).await
    }
}
