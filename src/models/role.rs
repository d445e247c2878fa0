use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::authz::roles;
use crate::errors::{AppError, AppResult};
use crate::events::{Loggable, Severity};
use crate::models::permission::Permission;

pub const MAX_LENGTH_NAME: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn is_admin_role(&self) -> bool {
        self.name == roles::SECURITY_ADMIN
    }

    pub fn validate_name(name: &str) -> AppResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::invalid_argument("role name must not be empty"));
        }
        if name.chars().count() > MAX_LENGTH_NAME {
            return Err(AppError::invalid_argument(format!(
                "role name must be at most {MAX_LENGTH_NAME} characters"
            )));
        }
        Ok(())
    }
}

impl Loggable for Role {
    fn entity_type() -> &'static str { "role" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbRole {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbRole> for Role {
    type Error = AppError;

    fn try_from(db: DbRole) -> Result<Self, Self::Error> {
        Ok(Role {
            id: crate::db::row_parsers::parse_uuid(&db.id)?,
            name: db.name,
            description: db.description,
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

// =============================================================================
// USER-ROLE MEMBERSHIP
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub username: String,
    pub role_id: Uuid,
    pub role_name: String,
    pub created_at: DateTime<Utc>,
}

impl Loggable for UserRole {
    fn entity_type() -> &'static str { "user_role" }
    fn subject_id(&self) -> Uuid { self.user_id }
    fn severity(&self) -> Severity { Severity::Critical }
}

// =============================================================================
// ROLE VIEW (read projection)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RoleView {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub admin: bool,
    pub users: Vec<String>,
    /// Permission titles, in rule/mode/feature order.
    pub permissions: Vec<String>,
}

impl RoleView {
    pub fn project(role: &Role, permissions: &[Permission], mut usernames: Vec<String>) -> Self {
        let mut sorted: Vec<&Permission> = permissions.iter().collect();
        sorted.sort_by(|a, b| {
            (a.feature_type, &a.feature_fqn, a.rule, a.mode).cmp(&(b.feature_type, &b.feature_fqn, b.rule, b.mode))
        });
        usernames.sort();
        RoleView {
            name: role.name.clone(),
            description: role.description.clone(),
            admin: role.is_admin_role(),
            users: usernames,
            permissions: sorted.into_iter().map(Permission::title).collect(),
        }
    }
}
