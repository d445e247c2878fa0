use feature_security::authz::{roles, GrantSource};
use feature_security::db::{self, Repositories};
use feature_security::events::{event_name, init_event_bus};
use feature_security::models::{
    FeatureId, FeatureType, MemberType, NewPermission, NewUser, PermissionMode, PermissionRule, PermissionValue,
    PersonName, UserStatus,
};
use feature_security::AppError;
use tempfile::TempDir;

async fn setup() -> (TempDir, Repositories) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("security.db").display());
    let pool = db::init(&url).await.expect("init db");
    let (bus, _rx) = init_event_bus();
    (dir, Repositories::new(pool, bus))
}

fn class(fqn: &str) -> FeatureId {
    FeatureId::new_class(fqn).unwrap()
}

fn package(fqn: &str) -> FeatureId {
    FeatureId::new_package(fqn).unwrap()
}

#[tokio::test]
async fn grants_reach_users_through_roles() {
    let (_dir, repos) = setup().await;

    let r1 = repos.roles.create("R1", None, None).await.unwrap();
    let r2 = repos.roles.create("R2", Some("invoice lockdown"), None).await.unwrap();
    repos
        .permissions
        .grant(&r1, NewPermission::new(PermissionRule::Allow, PermissionMode::Changing, package("com.acme")), None)
        .await
        .unwrap();
    repos
        .permissions
        .grant(&r2, NewPermission::new(PermissionRule::Veto, PermissionMode::Viewing, class("com.acme.Invoice")), None)
        .await
        .unwrap();

    repos.users.create(NewUser::local("u"), None).await.unwrap();
    repos.users.add_role("u", &r1, None).await.unwrap();
    repos.users.add_role("u", &r2, None).await.unwrap();

    let mut grants = repos.permissions.grants_for_user("u").await.unwrap();
    grants.sort();
    assert_eq!(
        grants,
        vec![
            PermissionValue::allow(package("com.acme"), PermissionMode::Changing),
            PermissionValue::veto(class("com.acme.Invoice"), PermissionMode::Viewing),
        ]
    );
    assert_eq!(repos.permissions.roles_for_user("u").await.unwrap(), vec!["R1", "R2"]);
    assert!(repos.permissions.grants_for_user("nobody").await.unwrap().is_empty());

    let by_user = repos.permissions.find_by_user("u").await.unwrap();
    assert_eq!(by_user.len(), 2);
    let via = repos
        .permissions
        .find_by_user_and_permission_value("u", &PermissionValue::veto(class("com.acme.Invoice"), PermissionMode::Viewing))
        .await
        .unwrap()
        .expect("held through R2");
    assert_eq!(via.role_name, "R2");
}

#[tokio::test]
async fn granting_the_same_rule_twice_replaces_the_mode() {
    let (_dir, repos) = setup().await;
    let role = repos.roles.create("clerk", None, None).await.unwrap();
    let feature = FeatureId::new_member("com.acme.Invoice", "approve").unwrap();

    let first = repos
        .permissions
        .grant(&role, NewPermission::new(PermissionRule::Allow, PermissionMode::Viewing, feature.clone()), None)
        .await
        .unwrap();
    let second = repos
        .permissions
        .grant(
            &role,
            NewPermission::new(PermissionRule::Allow, PermissionMode::Changing, feature.clone())
                .with_member_type(MemberType::Action),
            None,
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.mode, PermissionMode::Changing);
    assert_eq!(second.type_label(), "ACTION");

    let stored = repos.permissions.find_by_role(role.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].mode, PermissionMode::Changing);
    assert_eq!(stored[0].member_type, Some(MemberType::Action));

    // a veto on the same feature is a separate grant
    repos
        .permissions
        .grant(&role, NewPermission::new(PermissionRule::Veto, PermissionMode::Changing, feature.clone()), None)
        .await
        .unwrap();
    assert_eq!(repos.permissions.find_by_feature(&feature).await.unwrap().len(), 2);
    assert_eq!(
        repos
            .permissions
            .find_by_role_and_rule_and_feature_type(role.id, PermissionRule::Veto, FeatureType::Member)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn revoke_removes_only_the_matching_grant() {
    let (_dir, repos) = setup().await;
    let role = repos.roles.create("clerk", None, None).await.unwrap();
    let invoice = class("com.acme.Invoice");
    repos
        .permissions
        .grant(&role, NewPermission::new(PermissionRule::Allow, PermissionMode::Changing, invoice.clone()), None)
        .await
        .unwrap();

    let missing = repos
        .permissions
        .revoke(&role, PermissionRule::Veto, FeatureType::Class, "com.acme.Invoice", None)
        .await
        .unwrap();
    assert!(missing.is_none());

    let removed = repos
        .permissions
        .revoke(&role, PermissionRule::Allow, FeatureType::Class, "com.acme.Invoice", None)
        .await
        .unwrap();
    assert!(removed.is_some());
    assert!(repos.permissions.find_by_role(role.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn admin_role_and_user_are_protected() {
    let (_dir, repos) = setup().await;
    let admin = repos.roles.create(roles::SECURITY_ADMIN, None, None).await.unwrap();
    repos
        .permissions
        .grant(&admin, NewPermission::new(PermissionRule::Allow, PermissionMode::Changing, package("com.acme")), None)
        .await
        .unwrap();
    repos.users.create(NewUser::local(roles::SECURITY_ADMIN_USER), None).await.unwrap();
    repos.users.add_role(roles::SECURITY_ADMIN_USER, &admin, None).await.unwrap();

    let err = repos
        .permissions
        .revoke(&admin, PermissionRule::Allow, FeatureType::Package, "com.acme", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    assert!(matches!(repos.roles.delete(roles::SECURITY_ADMIN, None).await, Err(AppError::Forbidden(_))));
    assert!(matches!(repos.users.lock(roles::SECURITY_ADMIN_USER, None).await, Err(AppError::Forbidden(_))));
    assert!(matches!(repos.users.delete(roles::SECURITY_ADMIN_USER, None).await, Err(AppError::Forbidden(_))));
    assert!(matches!(
        repos.users.remove_role(roles::SECURITY_ADMIN_USER, &admin, None).await,
        Err(AppError::Forbidden(_))
    ));
}

#[tokio::test]
async fn disabled_users_have_no_grants() {
    let (_dir, repos) = setup().await;
    let role = repos.roles.create("reader", None, None).await.unwrap();
    repos
        .permissions
        .grant(&role, NewPermission::new(PermissionRule::Allow, PermissionMode::Viewing, package("com.acme")), None)
        .await
        .unwrap();
    repos.users.create(NewUser::local("bob"), None).await.unwrap();
    repos.users.add_role("bob", &role, None).await.unwrap();
    assert_eq!(repos.permissions.grants_for_user("bob").await.unwrap().len(), 1);

    let locked = repos.users.lock("bob", None).await.unwrap();
    assert_eq!(locked.status, UserStatus::Disabled);
    assert!(repos.permissions.grants_for_user("bob").await.unwrap().is_empty());
    assert!(repos.permissions.roles_for_user("bob").await.unwrap().is_empty());

    repos.users.unlock("bob", None).await.unwrap();
    assert_eq!(repos.permissions.grants_for_user("bob").await.unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_names_conflict() {
    let (_dir, repos) = setup().await;
    repos.roles.create("clerk", None, None).await.unwrap();
    assert!(matches!(repos.roles.create("clerk", None, None).await, Err(AppError::Conflict(_))));

    repos.users.create(NewUser::local("alice"), None).await.unwrap();
    assert!(matches!(repos.users.create(NewUser::local("alice"), None).await, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn deleting_a_role_drops_its_grants_and_members() {
    let (_dir, repos) = setup().await;
    let role = repos.roles.create("temp", None, None).await.unwrap();
    repos
        .permissions
        .grant(&role, NewPermission::new(PermissionRule::Allow, PermissionMode::Viewing, package("com.acme")), None)
        .await
        .unwrap();
    repos.users.create(NewUser::local("carol"), None).await.unwrap();
    repos.users.add_role("carol", &role, None).await.unwrap();

    repos.roles.delete("temp", None).await.unwrap();

    assert!(repos.roles.find_by_name("temp").await.unwrap().is_none());
    assert!(repos.permissions.all().await.unwrap().is_empty());
    let carol = repos.users.get_by_username("carol").await.unwrap();
    assert!(repos.users.role_names(carol.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn users_carry_names_passwords_and_tenancy() {
    let (_dir, repos) = setup().await;
    repos.tenancies.create("/", "Global", None, None).await.unwrap();
    repos.tenancies.create("/uk", "United Kingdom", Some("/"), None).await.unwrap();

    let new = NewUser {
        name: PersonName {
            family_name: Some("Smith".to_string()),
            given_name: Some("Frederick".to_string()),
            known_as: Some("Fred".to_string()),
        },
        password: Some("s3cret-pass".to_string()),
        tenancy_path: Some("/uk".to_string()),
        ..NewUser::local("fsmith")
    };
    let user = repos.users.create(new, None).await.unwrap();
    assert_eq!(user.display_name(), "Fred Smith (fsmith)");
    assert!(user.has_password());

    assert!(repos.users.verify_password("fsmith", "s3cret-pass").await.unwrap());
    assert!(!repos.users.verify_password("fsmith", "wrong-pass").await.unwrap());
    assert!(!repos.users.verify_password("ghost", "s3cret-pass").await.unwrap());

    assert_eq!(repos.users.find("Fred").await.unwrap().len(), 1);
    assert_eq!(repos.tenancies.usernames("/uk").await.unwrap(), vec!["fsmith"]);
    assert_eq!(repos.tenancies.children("/").await.unwrap().len(), 1);

    let delegated = NewUser { password: Some("s3cret-pass".to_string()), ..NewUser::delegated("remote") };
    assert!(matches!(repos.users.create(delegated, None).await, Err(AppError::InvalidArgument(_))));

    let half_named = NewUser {
        name: PersonName { family_name: Some("Smith".to_string()), ..Default::default() },
        ..NewUser::local("halfname")
    };
    assert!(matches!(repos.users.create(half_named, None).await, Err(AppError::InvalidArgument(_))));
}

#[tokio::test]
async fn tenancies_cannot_form_cycles() {
    let (_dir, repos) = setup().await;
    repos.tenancies.create("/", "Global", None, None).await.unwrap();
    repos.tenancies.create("/uk", "United Kingdom", Some("/"), None).await.unwrap();
    repos.tenancies.create("/uk/leeds", "Leeds", Some("/uk"), None).await.unwrap();

    let err = repos.tenancies.update_parent("/", Some("/uk/leeds"), None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument(_)));

    let moved = repos.tenancies.update_parent("/uk/leeds", Some("/"), None).await.unwrap();
    assert_eq!(moved.parent_path.as_deref(), Some("/"));
}

#[tokio::test]
async fn writes_publish_domain_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("events.db").display());
    let pool = db::init(&url).await.expect("init db");
    let (bus, mut rx) = init_event_bus();
    let repos = Repositories::new(pool, bus);

    let role = repos.roles.create("clerk", None, Some("admin")).await.unwrap();
    repos.users.create(NewUser::local("dave"), Some("admin")).await.unwrap();
    repos.users.add_role("dave", &role, Some("admin")).await.unwrap();

    let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|event| event_name(&event).to_string())
        .collect();
    assert_eq!(names, vec!["role.created", "user.created", "user_role.created"]);
}

async fn has_table(pool: &sqlx::SqlitePool, name: &str) -> bool {
    sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .unwrap()
        .is_some()
}

#[tokio::test]
async fn connect_leaves_the_schema_to_migrate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("fresh.db").display());
    let pool = db::connect(&url).await.expect("connect");

    assert!(db::applied_migrations(&pool).await.unwrap().is_empty());
    assert!(!has_table(&pool, "_sqlx_migrations").await);
    assert!(!has_table(&pool, "roles").await);

    db::migrate(&pool).await.unwrap();

    let applied = db::applied_migrations(&pool).await.unwrap();
    assert!(!applied.is_empty());
    assert!(sqlx::migrate!().iter().all(|migration| applied.contains(&migration.version)));
    assert!(has_table(&pool, "roles").await);
}

#[tokio::test]
async fn unknown_applied_migration_is_a_migration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("drifted.db").display());
    let pool = db::init(&url).await.expect("init db");

    sqlx::query(
        "INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time) \
         VALUES (99990101000000, 'removed', 1, X'00', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let err = db::migrate(&pool).await.unwrap_err();
    assert!(matches!(err, AppError::Migration(_)));
    assert_eq!(err.kind(), "migration");
}
