//! Authorization: permission sets, evaluation policy and enforcement
//!
//! A user's grants (the union of the grants of every role they hold) are
//! collected into a [`PermissionValueSet`] which answers "may this user view /
//! change feature F?". Evaluation walks from the most specific feature id to
//! the least specific one, and the first step with a relevant grant decides.
//! Nothing relevant anywhere means VETO.

mod cache;
mod evaluator;
mod principal;
mod value_set;

pub use cache::{start_invalidation_listener, CacheGeneration, PermissionSetCache};
pub use evaluator::{AllowBeatsVeto, Evaluation, EvaluationPolicy, PolicyKind, VetoBeatsAllow};
pub use principal::{enforce, Principal};
pub use value_set::PermissionValueSet;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::models::PermissionValue;

/// Authorization enforcement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthzMode {
    /// No permission checks (development mode)
    Off,
    /// Log denials but allow (rollout / testing)
    Advisory,
    /// Denials are `Forbidden` errors
    #[default]
    Strict,
}

impl AuthzMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthzMode::Off => "off",
            AuthzMode::Advisory => "advisory",
            AuthzMode::Strict => "strict",
        }
    }
}

impl fmt::Display for AuthzMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthzMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(AuthzMode::Off),
            "advisory" => Ok(AuthzMode::Advisory),
            "strict" => Ok(AuthzMode::Strict),
            other => Err(AppError::configuration(format!("unknown AUTHZ_MODE '{other}'"))),
        }
    }
}

/// Well-known role names
pub mod roles {
    /// Role seeded with full access to the configured top-level packages; cannot be deleted.
    pub const SECURITY_ADMIN: &str = "security-admin";
    /// User seeded with the admin role; cannot be locked or deleted.
    pub const SECURITY_ADMIN_USER: &str = "security-admin";
}

/// Supplies the raw grants reachable by a user through their roles.
///
/// Failures are returned as-is; callers decide whether to fail open or closed.
#[async_trait]
pub trait GrantSource: Send + Sync {
    async fn grants_for_user(&self, username: &str) -> AppResult<Vec<PermissionValue>>;

    /// Role names held by the user; sources that do not track roles report none.
    async fn roles_for_user(&self, _username: &str) -> AppResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Grants kept in memory: role → grants, user → roles.
#[derive(Debug, Default)]
pub struct InMemoryGrants {
    role_grants: RwLock<HashMap<String, Vec<PermissionValue>>>,
    user_roles: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemoryGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grant(self, role: &str, grant: PermissionValue) -> Self {
        self.grant(role, grant);
        self
    }

    pub fn with_user_role(self, username: &str, role: &str) -> Self {
        self.assign(username, role);
        self
    }

    pub fn grant(&self, role: &str, grant: PermissionValue) {
        if let Ok(mut role_grants) = self.role_grants.write() {
            role_grants.entry(role.to_string()).or_default().push(grant);
        }
    }

    pub fn revoke(&self, role: &str, grant: &PermissionValue) {
        if let Ok(mut role_grants) = self.role_grants.write() {
            if let Some(grants) = role_grants.get_mut(role) {
                grants.retain(|g| g != grant);
            }
        }
    }

    pub fn assign(&self, username: &str, role: &str) {
        if let Ok(mut user_roles) = self.user_roles.write() {
            let roles = user_roles.entry(username.to_string()).or_default();
            if !roles.iter().any(|r| r == role) {
                roles.push(role.to_string());
            }
        }
    }
}

#[async_trait]
impl GrantSource for InMemoryGrants {
    async fn grants_for_user(&self, username: &str) -> AppResult<Vec<PermissionValue>> {
        let user_roles = self
            .user_roles
            .read()
            .map_err(|_| AppError::internal("user role table poisoned"))?;
        let role_grants = self
            .role_grants
            .read()
            .map_err(|_| AppError::internal("role grant table poisoned"))?;

        Ok(user_roles
            .get(username)
            .into_iter()
            .flatten()
            .filter_map(|role| role_grants.get(role))
            .flatten()
            .cloned()
            .collect())
    }

    async fn roles_for_user(&self, username: &str) -> AppResult<Vec<String>> {
        let user_roles = self
            .user_roles
            .read()
            .map_err(|_| AppError::internal("user role table poisoned"))?;
        Ok(user_roles.get(username).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureId, PermissionMode};

    #[test]
    fn authz_mode_parses_case_insensitively() {
        assert_eq!("Advisory".parse::<AuthzMode>().unwrap(), AuthzMode::Advisory);
        assert_eq!("STRICT".parse::<AuthzMode>().unwrap(), AuthzMode::Strict);
        assert_eq!(" off ".parse::<AuthzMode>().unwrap(), AuthzMode::Off);
        assert!("lenient".parse::<AuthzMode>().is_err());
        assert_eq!(AuthzMode::default(), AuthzMode::Strict);
    }

    #[tokio::test]
    async fn in_memory_grants_union_across_roles() {
        let pkg = FeatureId::new_package("com.acme").unwrap();
        let class = FeatureId::new_class("com.acme.Invoice").unwrap();
        let grants = InMemoryGrants::new()
            .with_grant("r1", PermissionValue::allow(pkg.clone(), PermissionMode::Changing))
            .with_grant("r2", PermissionValue::veto(class.clone(), PermissionMode::Viewing))
            .with_grant("r3", PermissionValue::veto(pkg, PermissionMode::Viewing))
            .with_user_role("u", "r1")
            .with_user_role("u", "r2")
            .with_user_role("u", "r2");

        let found = grants.grants_for_user("u").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(grants.grants_for_user("nobody").await.unwrap().is_empty());
        assert_eq!(grants.roles_for_user("u").await.unwrap(), vec!["r1", "r2"]);

        grants.revoke("r2", &PermissionValue::veto(class, PermissionMode::Viewing));
        assert_eq!(grants.grants_for_user("u").await.unwrap().len(), 1);
    }
}
