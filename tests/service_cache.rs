use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use feature_security::authz::{GrantSource, PolicyKind};
use feature_security::db::{self, Repositories};
use feature_security::events::init_event_bus;
use feature_security::models::{FeatureId, NewPermission, NewUser, PermissionMode, PermissionRule, PermissionValue};
use feature_security::{AppError, AppResult, AuthzMode, SecurityConfig, SecurityService};

fn config(ttl: Duration) -> SecurityConfig {
    SecurityConfig {
        database_url: "sqlite::memory:".to_string(),
        authz_mode: AuthzMode::Strict,
        policy: PolicyKind::VetoBeatsAllow,
        cache_ttl: ttl,
    }
}

fn invoice() -> FeatureId {
    FeatureId::new_class("com.acme.Invoice").unwrap()
}

/// Grants everyone viewing on invoices, counting loads; can be made to fail.
#[derive(Default)]
struct CountingGrants {
    loads: AtomicUsize,
    failing: AtomicBool,
}

#[async_trait]
impl GrantSource for CountingGrants {
    async fn grants_for_user(&self, _username: &str) -> AppResult<Vec<PermissionValue>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::internal("grant store unavailable"));
        }
        Ok(vec![PermissionValue::allow(invoice(), PermissionMode::Viewing)])
    }
}

#[tokio::test]
async fn permission_sets_are_cached_per_user() {
    let grants = Arc::new(CountingGrants::default());
    let service = SecurityService::new(grants.clone(), &config(Duration::from_secs(60)));

    for _ in 0..3 {
        assert_eq!(
            service.evaluate("alice", &invoice(), PermissionMode::Viewing).await.unwrap(),
            PermissionRule::Allow
        );
    }
    assert_eq!(grants.loads.load(Ordering::SeqCst), 1);

    service.evaluate("bob", &invoice(), PermissionMode::Viewing).await.unwrap();
    assert_eq!(grants.loads.load(Ordering::SeqCst), 2);

    service.invalidate_user("alice");
    service.evaluate("alice", &invoice(), PermissionMode::Viewing).await.unwrap();
    assert_eq!(grants.loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn zero_ttl_loads_every_time() {
    let grants = Arc::new(CountingGrants::default());
    let service = SecurityService::new(grants.clone(), &config(Duration::ZERO));

    service.evaluate("alice", &invoice(), PermissionMode::Viewing).await.unwrap();
    service.evaluate("alice", &invoice(), PermissionMode::Viewing).await.unwrap();
    assert_eq!(grants.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_loads_propagate_and_are_not_cached() {
    let grants = Arc::new(CountingGrants::default());
    grants.failing.store(true, Ordering::SeqCst);
    let service = SecurityService::new(grants.clone(), &config(Duration::from_secs(60)));

    let err = service.evaluate("alice", &invoice(), PermissionMode::Viewing).await.unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));
    assert!(service.cache().is_empty());

    grants.failing.store(false, Ordering::SeqCst);
    assert_eq!(
        service.evaluate("alice", &invoice(), PermissionMode::Viewing).await.unwrap(),
        PermissionRule::Allow
    );
}

/// Reads the current grants, then holds the first load until released.
#[derive(Default)]
struct GatedGrants {
    loads: AtomicUsize,
    revoked: AtomicBool,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl GrantSource for GatedGrants {
    async fn grants_for_user(&self, _username: &str) -> AppResult<Vec<PermissionValue>> {
        let grants = if self.revoked.load(Ordering::SeqCst) {
            Vec::new()
        } else {
            vec![PermissionValue::allow(invoice(), PermissionMode::Viewing)]
        };
        if self.loads.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.notify_one();
            self.release.notified().await;
        }
        Ok(grants)
    }
}

#[tokio::test]
async fn invalidation_during_a_load_is_not_overwritten() {
    let grants = Arc::new(GatedGrants::default());
    let service = SecurityService::new(grants.clone(), &config(Duration::from_secs(60)));

    let in_flight = {
        let service = service.clone();
        tokio::spawn(async move { service.evaluate("alice", &invoice(), PermissionMode::Viewing).await })
    };
    grants.started.notified().await;

    grants.revoked.store(true, Ordering::SeqCst);
    service.invalidate_all();
    grants.release.notify_one();

    // the in-flight caller still sees what it read, but nothing stale is kept
    assert_eq!(in_flight.await.unwrap().unwrap(), PermissionRule::Allow);
    assert!(service.cache().get("alice").is_none());

    assert_eq!(
        service.evaluate("alice", &invoice(), PermissionMode::Viewing).await.unwrap(),
        PermissionRule::Veto
    );
    assert_eq!(grants.loads.load(Ordering::SeqCst), 2);
    assert_eq!(service.cache().len(), 1);
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn admin_writes_invalidate_cached_sets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("cache.db").display());
    let pool = db::init(&url).await.expect("init db");
    let (bus, _rx) = init_event_bus();
    let repos = Repositories::new(pool, bus.clone());

    let service = SecurityService::new(Arc::new(repos.permissions.clone()), &config(Duration::from_secs(60)));

    let clerk = repos.roles.create("clerk", None, None).await.unwrap();
    repos.users.create(NewUser::local("alice"), None).await.unwrap();
    repos.users.add_role("alice", &clerk, None).await.unwrap();

    // subscribe only after setup so earlier events cannot race the first load
    let _listener = service.spawn_invalidation_listener(&bus);

    assert_eq!(
        service.evaluate("alice", &invoice(), PermissionMode::Changing).await.unwrap(),
        PermissionRule::Veto
    );
    assert_eq!(service.cache().len(), 1);

    repos
        .permissions
        .grant(&clerk, NewPermission::new(PermissionRule::Allow, PermissionMode::Changing, invoice()), None)
        .await
        .unwrap();
    wait_until(|| service.cache().is_empty()).await;

    assert_eq!(
        service.evaluate("alice", &invoice(), PermissionMode::Changing).await.unwrap(),
        PermissionRule::Allow
    );

    repos.users.remove_role("alice", &clerk, None).await.unwrap();
    wait_until(|| service.cache().get("alice").is_none()).await;

    assert_eq!(
        service.evaluate("alice", &invoice(), PermissionMode::Changing).await.unwrap(),
        PermissionRule::Veto
    );
}
