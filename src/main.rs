use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sqlx::SqlitePool;

use feature_security::authz::roles;
use feature_security::config::{load_env, SecurityConfig};
use feature_security::db::{self, Repositories};
use feature_security::events::{self, init_event_bus};
use feature_security::models::{
    FeatureId, FeatureType, MemberType, NewPermission, NewUser, PermissionMode, PermissionRule, RoleView,
    TenancyView, UserStatus, UserView,
};
use feature_security::{AppError, SecurityService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Role-based feature permissions: administration and checks", long_about = None)]
struct Cli {
    /// Recorded as the actor of every change
    #[arg(long, global = true, env = "SECURITY_ACTOR")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate {
        /// Only report which migrations are applied
        #[arg(long)]
        status: bool,
    },
    /// Create the admin role and user, granting full access to the given packages
    SeedAdmin {
        #[arg(long = "package", required = true)]
        packages: Vec<String>,
        #[arg(long)]
        password: Option<String>,
    },
    #[command(subcommand)]
    Role(RoleCommand),
    /// Add a grant to a role (re-granting replaces the mode)
    Grant {
        role: String,
        #[command(flatten)]
        feature: FeatureArgs,
        #[arg(long, default_value = "allow")]
        rule: PermissionRule,
        #[arg(long, default_value = "changing")]
        mode: PermissionMode,
        #[arg(long)]
        member_type: Option<MemberType>,
    },
    /// Remove a grant from a role
    Revoke {
        role: String,
        #[command(flatten)]
        feature: FeatureArgs,
        #[arg(long, default_value = "allow")]
        rule: PermissionRule,
    },
    #[command(subcommand)]
    User(UserCommand),
    #[command(subcommand)]
    Tenancy(TenancyCommand),
    /// Print ALLOW or VETO for a user and feature
    Check {
        username: String,
        #[command(flatten)]
        feature: FeatureArgs,
        #[arg(long, default_value = "viewing")]
        mode: PermissionMode,
    },
    /// Show which grant decides a check
    Explain {
        username: String,
        #[command(flatten)]
        feature: FeatureArgs,
        #[arg(long, default_value = "viewing")]
        mode: PermissionMode,
    },
    /// List every grant a user holds through their roles
    Permissions { username: String },
}

#[derive(Args, Debug)]
struct FeatureArgs {
    /// Fully qualified name, `com.acme.Invoice` or `com.acme.Invoice#total` for members
    feature: String,
    #[arg(long = "type", default_value = "class")]
    feature_type: FeatureType,
}

impl FeatureArgs {
    fn feature_id(&self) -> Result<FeatureId, AppError> {
        FeatureId::new_feature(self.feature_type, &self.feature)
    }
}

#[derive(Subcommand, Debug)]
enum RoleCommand {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        #[arg(long)]
        search: Option<String>,
    },
    Show { name: String },
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Create {
        username: String,
        #[arg(long)]
        password: Option<String>,
        /// Authenticated elsewhere; no password is stored
        #[arg(long, conflicts_with = "password")]
        delegated: bool,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        tenancy: Option<String>,
        #[arg(long)]
        disabled: bool,
    },
    Show { username: String },
    List {
        #[arg(long)]
        search: Option<String>,
    },
    AddRole { username: String, role: String },
    RemoveRole { username: String, role: String },
    Lock { username: String },
    Unlock { username: String },
    SetPassword { username: String, password: String },
    Delete { username: String },
}

#[derive(Subcommand, Debug)]
enum TenancyCommand {
    Create {
        path: String,
        name: String,
        #[arg(long)]
        parent: Option<String>,
    },
    List {
        #[arg(long)]
        search: Option<String>,
    },
    Show { path: String },
    AddUser { path: String, username: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = SecurityConfig::from_env()?;

    if let Commands::Migrate { status } = &cli.command {
        if *status {
            let pool = db::connect(&config.database_url).await?;
            print_migration_status(&pool).await?;
        } else {
            db::init(&config.database_url).await?;
            println!("Migrations applied");
        }
        return Ok(());
    }

    let pool = db::init(&config.database_url).await?;

    let (bus, rx) = init_event_bus();
    let audit = tokio::spawn(events::start_audit_listener(rx, pool.clone()));

    let repos = Repositories::new(pool.clone(), bus.clone());
    let service = SecurityService::new(Arc::new(repos.permissions.clone()), &config);
    let result = run(cli, &repos, &service).await;

    // close the bus so the audit listener drains and stops
    drop(service);
    drop(repos);
    drop(bus);
    audit.await.context("audit listener failed")?;

    result
}

async fn run(cli: Cli, repos: &Repositories, service: &SecurityService) -> anyhow::Result<()> {
    let actor = cli.actor.as_deref();

    match cli.command {
        Commands::Migrate { .. } => {}
        Commands::SeedAdmin { packages, password } => seed_admin(repos, &packages, password, actor).await?,
        Commands::Role(command) => run_role(command, repos, actor).await?,
        Commands::Grant { role, feature, rule, mode, member_type } => {
            let role = repos.roles.get_by_name(&role).await?;
            let mut new = NewPermission::new(rule, mode, feature.feature_id()?);
            if let Some(member_type) = member_type {
                new = new.with_member_type(member_type);
            }
            let permission = repos.permissions.grant(&role, new, actor).await?;
            println!("{}", permission.title());
        }
        Commands::Revoke { role, feature, rule } => {
            let role = repos.roles.get_by_name(&role).await?;
            let feature_id = feature.feature_id()?;
            let removed = repos
                .permissions
                .revoke(&role, rule, feature_id.feature_type(), &feature_id.fully_qualified_name(), actor)
                .await?;
            match removed {
                Some(permission) => println!("removed {}", permission.title()),
                None => println!("no {} grant on {} for role '{}'", rule, feature_id, role.name),
            }
        }
        Commands::User(command) => run_user(command, repos, actor).await?,
        Commands::Tenancy(command) => run_tenancy(command, repos, actor).await?,
        Commands::Check { username, feature, mode } => {
            let feature_id = feature.feature_id()?;
            let rule = service.evaluate(&username, &feature_id, mode).await?;
            println!("{rule}");
        }
        Commands::Explain { username, feature, mode } => {
            let feature_id = feature.feature_id()?;
            match service.explain(&username, &feature_id, mode).await? {
                Some(evaluation) => {
                    println!("{} (decided by {})", evaluation.rule(), evaluation.cause);
                    if let Some(permission) = repos
                        .permissions
                        .find_by_user_and_permission_value(&username, &evaluation.cause)
                        .await?
                    {
                        println!("  via role '{}'", permission.role_name);
                    }
                }
                None => println!("{} (no grant applies)", PermissionRule::Veto),
            }
        }
        Commands::Permissions { username } => {
            repos.users.get_by_username(&username).await?;
            for permission in repos.permissions.find_by_user(&username).await? {
                println!("{:<10} {}", permission.type_label(), permission.title());
            }
        }
    }

    Ok(())
}

async fn seed_admin(
    repos: &Repositories,
    packages: &[String],
    password: Option<String>,
    actor: Option<&str>,
) -> anyhow::Result<()> {
    let role = match repos.roles.find_by_name(roles::SECURITY_ADMIN).await? {
        Some(role) => role,
        None => {
            repos
                .roles
                .create(roles::SECURITY_ADMIN, Some("Full access to the secured packages"), actor)
                .await?
        }
    };

    for package in packages {
        let feature_id = FeatureId::new_package(package)?;
        repos
            .permissions
            .grant(&role, NewPermission::new(PermissionRule::Allow, PermissionMode::Changing, feature_id), actor)
            .await?;
    }

    let user = match repos.users.find_by_username(roles::SECURITY_ADMIN_USER).await? {
        Some(user) => user,
        None => {
            let new = NewUser { password, ..NewUser::local(roles::SECURITY_ADMIN_USER) };
            repos.users.create(new, actor).await?
        }
    };
    repos.users.add_role(&user.username, &role, actor).await?;

    tracing::info!(packages = packages.len(), "admin seeded");
    println!("admin role '{}' and user '{}' ready", role.name, user.username);
    Ok(())
}

async fn run_role(command: RoleCommand, repos: &Repositories, actor: Option<&str>) -> anyhow::Result<()> {
    match command {
        RoleCommand::Create { name, description } => {
            let role = repos.roles.create(&name, description.as_deref(), actor).await?;
            println!("created role '{}'", role.name);
        }
        RoleCommand::List { search } => {
            let found = match search {
                Some(fragment) => repos.roles.find_by_name_containing(&fragment).await?,
                None => repos.roles.all().await?,
            };
            for role in found {
                println!("{:<30} {}", role.name, role.description.unwrap_or_default());
            }
        }
        RoleCommand::Show { name } => {
            let role = repos.roles.get_by_name(&name).await?;
            let permissions = repos.permissions.find_by_role(role.id).await?;
            let usernames = repos.roles.usernames(role.id).await?;
            print_json(&RoleView::project(&role, &permissions, usernames))?;
        }
        RoleCommand::Delete { name } => {
            let role = repos.roles.delete(&name, actor).await?;
            println!("deleted role '{}'", role.name);
        }
    }
    Ok(())
}

async fn run_user(command: UserCommand, repos: &Repositories, actor: Option<&str>) -> anyhow::Result<()> {
    match command {
        UserCommand::Create { username, password, delegated, email, tenancy, disabled } => {
            let base = if delegated { NewUser::delegated(username) } else { NewUser::local(username) };
            let new = NewUser {
                password,
                email_address: email,
                tenancy_path: tenancy,
                status: UserStatus::parse(!disabled),
                ..base
            };
            let user = repos.users.create(new, actor).await?;
            println!("created user '{}'", user.username);
        }
        UserCommand::Show { username } => {
            let user = repos.users.get_by_username(&username).await?;
            let role_names = repos.users.role_names(user.id).await?;
            print_json(&UserView::project(&user, role_names))?;
        }
        UserCommand::List { search } => {
            let found = match search {
                Some(fragment) => repos.users.find(&fragment).await?,
                None => repos.users.all().await?,
            };
            for user in found {
                println!("{:<30} {:<9} {}", user.username, user.status, user.display_name());
            }
        }
        UserCommand::AddRole { username, role } => {
            let role = repos.roles.get_by_name(&role).await?;
            match repos.users.add_role(&username, &role, actor).await? {
                Some(_) => println!("'{username}' now holds '{}'", role.name),
                None => println!("'{username}' already holds '{}'", role.name),
            }
        }
        UserCommand::RemoveRole { username, role } => {
            let role = repos.roles.get_by_name(&role).await?;
            if repos.users.remove_role(&username, &role, actor).await? {
                println!("'{username}' no longer holds '{}'", role.name);
            } else {
                println!("'{username}' did not hold '{}'", role.name);
            }
        }
        UserCommand::Lock { username } => {
            let user = repos.users.lock(&username, actor).await?;
            println!("'{}' is {}", user.username, user.status);
        }
        UserCommand::Unlock { username } => {
            let user = repos.users.unlock(&username, actor).await?;
            println!("'{}' is {}", user.username, user.status);
        }
        UserCommand::SetPassword { username, password } => {
            repos.users.set_password(&username, &password, actor).await?;
            println!("password changed for '{username}'");
        }
        UserCommand::Delete { username } => {
            let user = repos.users.delete(&username, actor).await?;
            println!("deleted user '{}'", user.username);
        }
    }
    Ok(())
}

async fn run_tenancy(command: TenancyCommand, repos: &Repositories, actor: Option<&str>) -> anyhow::Result<()> {
    match command {
        TenancyCommand::Create { path, name, parent } => {
            let tenancy = repos.tenancies.create(&path, &name, parent.as_deref(), actor).await?;
            println!("created tenancy '{}' ({})", tenancy.path, tenancy.name);
        }
        TenancyCommand::List { search } => {
            let found = match search {
                Some(fragment) => repos.tenancies.find_matching(&fragment).await?,
                None => repos.tenancies.all().await?,
            };
            for tenancy in found {
                println!("{:<30} {}", tenancy.path, tenancy.name);
            }
        }
        TenancyCommand::Show { path } => {
            let tenancy = repos.tenancies.get_by_path(&path).await?;
            let children = repos.tenancies.children(&path).await?.into_iter().map(|t| t.path).collect();
            let usernames = repos.tenancies.usernames(&path).await?;
            print_json(&TenancyView::project(&tenancy, children, usernames))?;
        }
        TenancyCommand::AddUser { path, username } => {
            let tenancy = repos.tenancies.get_by_path(&path).await?;
            repos.users.update_tenancy(&username, Some(&tenancy.path), actor).await?;
            println!("'{username}' moved into '{}'", tenancy.path);
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn print_migration_status(pool: &SqlitePool) -> anyhow::Result<()> {
    let applied = db::applied_migrations(pool).await?;

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in sqlx::migrate!().iter() {
        let status = if applied.contains(&migration.version) { "applied" } else { "pending" };
        println!("{:<8} {:<20} {}", status, migration.version, migration.description.trim());
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
