use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::authz::{
    enforce, start_invalidation_listener, AuthzMode, Evaluation, EvaluationPolicy, GrantSource, PermissionSetCache,
    PermissionValueSet, Principal,
};
use crate::config::SecurityConfig;
use crate::errors::AppResult;
use crate::events::EventBus;
use crate::models::{FeatureId, PermissionMode, PermissionRule};

/// Answers "may this user view / change this feature?".
///
/// Grants come from the injected [`GrantSource`]; built sets are cached per
/// user until the TTL lapses or a domain event invalidates them.
#[derive(Clone)]
pub struct SecurityService {
    grants: Arc<dyn GrantSource>,
    cache: Arc<PermissionSetCache>,
    policy: Arc<dyn EvaluationPolicy>,
    authz_mode: AuthzMode,
}

impl SecurityService {
    pub fn new(grants: Arc<dyn GrantSource>, config: &SecurityConfig) -> Self {
        Self {
            grants,
            cache: Arc::new(PermissionSetCache::new(config.cache_ttl)),
            policy: config.policy.policy(),
            authz_mode: config.authz_mode,
        }
    }

    pub fn with_cache(mut self, cache: Arc<PermissionSetCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn EvaluationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_authz_mode(mut self, authz_mode: AuthzMode) -> Self {
        self.authz_mode = authz_mode;
        self
    }

    pub fn authz_mode(&self) -> AuthzMode {
        self.authz_mode
    }

    pub fn cache(&self) -> &Arc<PermissionSetCache> {
        &self.cache
    }

    /// The user's permission set, from cache when fresh. Failed loads are never
    /// cached, and neither are loads overtaken by an invalidation.
    pub async fn permission_set(&self, username: &str) -> AppResult<Arc<PermissionValueSet>> {
        if let Some(set) = self.cache.get(username) {
            tracing::debug!(username = %username, "permission set cache hit");
            return Ok(set);
        }

        let seen = self.cache.generation(username);
        let grants = self.grants.grants_for_user(username).await?;
        let set = Arc::new(PermissionValueSet::with_policy(grants, Arc::clone(&self.policy)));
        tracing::debug!(username = %username, grants = set.len(), policy = self.policy.kind().as_str(), "permission set built");

        self.cache.put_if_current(username, seen, Arc::clone(&set));
        Ok(set)
    }

    pub async fn principal(&self, username: &str) -> AppResult<Principal> {
        let permissions = self.permission_set(username).await?;
        let roles = self.grants.roles_for_user(username).await?;
        Ok(Principal::new(username).with_roles(roles).with_permissions(permissions))
    }

    pub async fn evaluate(&self, username: &str, feature: &FeatureId, mode: PermissionMode) -> AppResult<PermissionRule> {
        Ok(self.permission_set(username).await?.evaluate(feature, mode))
    }

    /// The grant that decided the outcome; `None` means vetoed for lack of any relevant grant.
    pub async fn explain(&self, username: &str, feature: &FeatureId, mode: PermissionMode) -> AppResult<Option<Evaluation>> {
        Ok(self.permission_set(username).await?.evaluation(feature, mode))
    }

    /// Applies the configured [`AuthzMode`] to the user's verdict.
    pub async fn authorize(&self, username: &str, feature: &FeatureId, mode: PermissionMode) -> AppResult<()> {
        if self.authz_mode == AuthzMode::Off {
            return Ok(());
        }
        let principal = self.principal(username).await?;
        enforce(self.authz_mode, &principal, feature, mode)
    }

    pub fn invalidate_user(&self, username: &str) {
        self.cache.invalidate_user(username);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Keeps the cache in step with admin writes published on `events`.
    pub fn spawn_invalidation_listener(&self, events: &EventBus) -> JoinHandle<()> {
        tokio::spawn(start_invalidation_listener(events.subscribe(), Arc::clone(&self.cache)))
    }
}
