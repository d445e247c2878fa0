use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

pub mod permissions;
pub mod roles;
pub mod row_parsers;
pub mod tenancies;
pub mod users;

pub use permissions::PermissionRepository;
pub use roles::RoleRepository;
pub use tenancies::TenancyRepository;
pub use users::UserRepository;

use crate::errors::AppResult;
use crate::events::EventBus;

/// Connects (creating the database file if needed) and applies pending migrations.
pub async fn init(database_url: &str) -> anyhow::Result<SqlitePool> {
    let pool = connect(database_url).await?;
    migrate(&pool).await.context("failed to run migrations")?;
    Ok(pool)
}

/// Connects without touching the schema.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid DATABASE_URL '{database_url}'"))?
        .create_if_missing(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .context("failed to connect to database")
}

pub async fn migrate(pool: &SqlitePool) -> AppResult<()> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

/// Versions recorded as successfully applied; empty on a database never migrated.
pub async fn applied_migrations(pool: &SqlitePool) -> AppResult<HashSet<i64>> {
    let tracked = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'")
        .fetch_optional(pool)
        .await?
        .is_some();
    if !tracked {
        return Ok(HashSet::new());
    }

    let rows = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().filter_map(|row| row.try_get::<i64, _>("version").ok()).collect())
}

/// One repository per entity, sharing a pool and an event bus.
#[derive(Clone)]
pub struct Repositories {
    pub roles: RoleRepository,
    pub permissions: PermissionRepository,
    pub users: UserRepository,
    pub tenancies: TenancyRepository,
}

impl Repositories {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self {
            roles: RoleRepository::new(pool.clone(), events.clone()),
            permissions: PermissionRepository::new(pool.clone(), events.clone()),
            users: UserRepository::new(pool.clone(), events.clone()),
            tenancies: TenancyRepository::new(pool, events),
        }
    }
}
