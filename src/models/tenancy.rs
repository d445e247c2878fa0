use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::events::Loggable;

pub const MAX_LENGTH_PATH: usize = 255;
pub const MAX_LENGTH_NAME: usize = 40;

/// An organisational partition users belong to, identified by a path such as `/uk/leeds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenancy {
    pub path: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenancy {
    pub fn validate(path: &str, name: &str) -> AppResult<()> {
        if path.trim().is_empty() {
            return Err(AppError::invalid_argument("tenancy path must not be empty"));
        }
        if path.chars().count() > MAX_LENGTH_PATH {
            return Err(AppError::invalid_argument(format!(
                "tenancy path must be at most {MAX_LENGTH_PATH} characters"
            )));
        }
        if name.trim().is_empty() {
            return Err(AppError::invalid_argument("tenancy name must not be empty"));
        }
        if name.chars().count() > MAX_LENGTH_NAME {
            return Err(AppError::invalid_argument(format!(
                "tenancy name must be at most {MAX_LENGTH_NAME} characters"
            )));
        }
        Ok(())
    }
}

impl Loggable for Tenancy {
    fn entity_type() -> &'static str { "tenancy" }
    // Tenancies are keyed by path; derive a stable id from it for the event stream.
    fn subject_id(&self) -> Uuid { Uuid::new_v5(&Uuid::NAMESPACE_URL, self.path.as_bytes()) }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbTenancy {
    pub path: String,
    pub name: String,
    pub parent_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbTenancy> for Tenancy {
    fn from(db: DbTenancy) -> Self {
        Tenancy {
            path: db.path,
            name: db.name,
            parent_path: db.parent_path,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

// =============================================================================
// TENANCY VIEW (read projection)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TenancyView {
    pub path: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub users: Vec<String>,
}

impl TenancyView {
    pub fn project(tenancy: &Tenancy, mut children: Vec<String>, mut usernames: Vec<String>) -> Self {
        children.sort();
        usernames.sort();
        TenancyView {
            path: tenancy.path.clone(),
            name: tenancy.name.clone(),
            parent: tenancy.parent_path.clone(),
            children,
            users: usernames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_path_and_name() {
        assert!(Tenancy::validate("/uk", "United Kingdom").is_ok());
        assert!(Tenancy::validate("", "United Kingdom").is_err());
        assert!(Tenancy::validate("/uk", "").is_err());
        assert!(Tenancy::validate("/uk", &"n".repeat(MAX_LENGTH_NAME + 1)).is_err());
    }

    #[test]
    fn subject_id_is_stable_per_path() {
        let now = Utc::now();
        let a = Tenancy { path: "/uk".into(), name: "UK".into(), parent_path: None, created_at: now, updated_at: now };
        let b = Tenancy { name: "Britain".into(), ..a.clone() };
        assert_eq!(a.subject_id(), b.subject_id());
    }
}
