use std::time::Duration;

use crate::authz::{AuthzMode, PolicyKind};
use crate::errors::AppError;

const DEFAULT_CACHE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub database_url: String,
    pub authz_mode: AuthzMode,
    pub policy: PolicyKind,
    pub cache_ttl: Duration,
}

impl SecurityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, so tests need not touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| AppError::configuration("DATABASE_URL not set"))?;

        let authz_mode = lookup("AUTHZ_MODE")
            .map(|val| val.parse::<AuthzMode>())
            .transpose()?
            .unwrap_or_default();

        let policy = lookup("PERMISSIONS_POLICY")
            .map(|val| val.parse::<PolicyKind>())
            .transpose()?
            .unwrap_or_default();

        let cache_ttl_secs = lookup("PERMISSION_CACHE_TTL_SECS")
            .map(|val| val.trim().parse::<u64>())
            .unwrap_or(Ok(DEFAULT_CACHE_TTL_SECS))
            .map_err(|_| AppError::configuration("PERMISSION_CACHE_TTL_SECS must be a non-negative integer"))?;

        Ok(Self {
            database_url,
            authz_mode,
            policy,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
        })
    }

    pub fn with_database_url(mut self, database_url: impl Into<String>) -> Self {
        self.database_url = database_url.into();
        self
    }
}

/// Loads `.env` from the working directory, falling back to the crate's own.
pub fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(crate_env);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = SecurityConfig::from_lookup(lookup(&[("DATABASE_URL", "sqlite::memory:")])).unwrap();
        assert_eq!(config.authz_mode, AuthzMode::Strict);
        assert_eq!(config.policy, PolicyKind::VetoBeatsAllow);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn database_url_is_required() {
        let err = SecurityConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn reads_all_settings() {
        let config = SecurityConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite://security.db"),
            ("AUTHZ_MODE", "advisory"),
            ("PERMISSIONS_POLICY", "allow_beats_veto"),
            ("PERMISSION_CACHE_TTL_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite://security.db");
        assert_eq!(config.authz_mode, AuthzMode::Advisory);
        assert_eq!(config.policy, PolicyKind::AllowBeatsVeto);
        assert!(config.cache_ttl.is_zero());
    }

    #[test]
    fn rejects_bad_values() {
        let bad_ttl = lookup(&[("DATABASE_URL", "sqlite::memory:"), ("PERMISSION_CACHE_TTL_SECS", "soon")]);
        assert!(SecurityConfig::from_lookup(bad_ttl).is_err());

        let bad_mode = lookup(&[("DATABASE_URL", "sqlite::memory:"), ("AUTHZ_MODE", "maybe")]);
        assert!(SecurityConfig::from_lookup(bad_mode).is_err());
    }
}
