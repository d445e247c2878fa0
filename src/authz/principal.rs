use std::collections::HashSet;
use std::sync::Arc;

use super::evaluator::Evaluation;
use super::value_set::PermissionValueSet;
use super::AuthzMode;
use crate::errors::{AppError, AppResult};
use crate::models::{FeatureId, PermissionMode, PermissionRule};

/// Principal represents the user being authorized, with their resolved permission set
#[derive(Debug, Clone)]
pub struct Principal {
    pub username: String,
    pub roles: HashSet<String>,
    pub permissions: Arc<PermissionValueSet>,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            roles: HashSet::new(),
            permissions: Arc::new(PermissionValueSet::empty()),
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<PermissionValueSet>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn is_security_admin(&self) -> bool {
        self.has_role(super::roles::SECURITY_ADMIN)
    }

    pub fn evaluate(&self, feature: &FeatureId, mode: PermissionMode) -> PermissionRule {
        let rule = self.permissions.evaluate(feature, mode);
        tracing::debug!(
            username = %self.username,
            feature = %feature,
            mode = %mode,
            rule = %rule,
            "permission evaluated"
        );
        rule
    }

    pub fn explain(&self, feature: &FeatureId, mode: PermissionMode) -> Option<Evaluation> {
        self.permissions.evaluation(feature, mode)
    }

    pub fn can_view(&self, feature: &FeatureId) -> bool {
        self.evaluate(feature, PermissionMode::Viewing) == PermissionRule::Allow
    }

    pub fn can_change(&self, feature: &FeatureId) -> bool {
        self.evaluate(feature, PermissionMode::Changing) == PermissionRule::Allow
    }
}

/// Enforcement point: applies `authz_mode` to the principal's verdict.
///
/// `Off` skips evaluation, `Advisory` logs a denial and lets it through,
/// `Strict` turns it into [`AppError::Forbidden`].
pub fn enforce(authz_mode: AuthzMode, principal: &Principal, feature: &FeatureId, mode: PermissionMode) -> AppResult<()> {
    if authz_mode == AuthzMode::Off {
        return Ok(());
    }

    if principal.evaluate(feature, mode) == PermissionRule::Allow {
        return Ok(());
    }

    match authz_mode {
        AuthzMode::Advisory => {
            tracing::warn!(
                username = %principal.username,
                feature = %feature,
                mode = %mode,
                "permission denied (advisory, allowing)"
            );
            Ok(())
        }
        _ => Err(AppError::forbidden(format!(
            "{} may not {} {}",
            principal.username,
            match mode {
                PermissionMode::Viewing => "view",
                PermissionMode::Changing => "change",
            },
            feature
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PermissionValue;

    fn invoice() -> FeatureId {
        FeatureId::new_class("com.acme.Invoice").unwrap()
    }

    fn viewer() -> Principal {
        let set = PermissionValueSet::new(vec![PermissionValue::allow(invoice(), PermissionMode::Viewing)]);
        Principal::new("alice")
            .with_roles(vec!["clerk".to_string()])
            .with_permissions(Arc::new(set))
    }

    #[test]
    fn principal_checks_view_and_change() {
        let principal = viewer();
        assert!(principal.can_view(&invoice()));
        assert!(!principal.can_change(&invoice()));
        assert!(principal.has_role("clerk"));
        assert!(!principal.is_security_admin());
    }

    #[test]
    fn new_principal_has_no_access() {
        let principal = Principal::new("nobody");
        assert!(!principal.can_view(&invoice()));
        assert!(principal.explain(&invoice(), PermissionMode::Viewing).is_none());
    }

    #[test]
    fn strict_mode_forbids_denials() {
        let principal = viewer();
        assert!(enforce(AuthzMode::Strict, &principal, &invoice(), PermissionMode::Viewing).is_ok());
        let err = enforce(AuthzMode::Strict, &principal, &invoice(), PermissionMode::Changing).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(err.to_string(), "forbidden: alice may not change com.acme.Invoice");
    }

    #[test]
    fn advisory_and_off_let_denials_through() {
        let principal = viewer();
        assert!(enforce(AuthzMode::Advisory, &principal, &invoice(), PermissionMode::Changing).is_ok());
        assert!(enforce(AuthzMode::Off, &principal, &invoice(), PermissionMode::Changing).is_ok());
    }
}
