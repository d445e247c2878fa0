use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::row_parsers::contains_pattern;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, log_change, EventBus};
use crate::models::user::DbUser;
use crate::models::{AccountType, NewUser, PersonName, Role, User, UserRole, UserStatus};
use crate::utils::{hash_password, verify_password};

const USER_COLUMNS: &str = "id, username, family_name, given_name, known_as, email_address, phone_number, \
     fax_number, tenancy_path, account_type, status, encrypted_password, created_at, updated_at";

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
    events: EventBus,
}

impl UserRepository {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self { pool, events }
    }

    pub async fn create(&self, new: NewUser, actor: Option<&str>) -> AppResult<User> {
        User::validate_username(&new.username)?;
        new.name.validate()?;

        let encrypted_password = match (new.account_type, new.password.as_deref()) {
            (AccountType::Delegated, Some(_)) => {
                return Err(AppError::invalid_argument("delegated accounts cannot hold a password"));
            }
            (AccountType::Local, Some(password)) => Some(hash_password(password)?),
            (_, None) => None,
        };

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: new.username.trim().to_string(),
            name: new.name,
            email_address: new.email_address,
            phone_number: None,
            fax_number: None,
            tenancy_path: new.tenancy_path,
            account_type: new.account_type,
            status: new.status,
            encrypted_password,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO users (id, username, family_name, given_name, known_as, email_address, phone_number, \
             fax_number, tenancy_path, account_type, status, encrypted_password, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.name.family_name)
        .bind(&user.name.given_name)
        .bind(&user.name.known_as)
        .bind(&user.email_address)
        .bind(&user.phone_number)
        .bind(&user.fax_number)
        .bind(&user.tenancy_path)
        .bind(user.account_type.as_str())
        .bind(user.status.as_str())
        .bind(&user.encrypted_password)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_write(e, format!("user '{}' already exists", user.username)))?;

        tracing::info!(username = %user.username, account_type = %user.account_type, "user created");
        log_activity(&self.events, "created", actor, &user);
        Ok(user)
    }

    pub async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, DbUser>(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    pub async fn get_by_username(&self, username: &str) -> AppResult<User> {
        self.find_by_username(username)
            .await?
            .ok_or_else(|| AppError::not_found(format!("user '{username}' not found")))
    }

    /// Users whose username, names or email contain `search`.
    pub async fn find(&self, search: &str) -> AppResult<Vec<User>> {
        let rows = sqlx::query_as::<_, DbUser>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username LIKE ?1 ESCAPE '\\' OR family_name LIKE ?1 ESCAPE '\\' \
             OR given_name LIKE ?1 ESCAPE '\\' OR known_as LIKE ?1 ESCAPE '\\' OR email_address LIKE ?1 ESCAPE '\\' \
             ORDER BY username"
        ))
        .bind(contains_pattern(search))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(User::try_from).collect()
    }

    pub async fn all(&self) -> AppResult<Vec<User>> {
        let rows = sqlx::query_as::<_, DbUser>(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY username"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(User::try_from).collect()
    }

    pub async fn find_by_tenancy(&self, tenancy_path: &str) -> AppResult<Vec<User>> {
        let rows = sqlx::query_as::<_, DbUser>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE tenancy_path = ? ORDER BY username"
        ))
        .bind(tenancy_path)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(User::try_from).collect()
    }

    pub async fn role_names(&self, user_id: Uuid) -> AppResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT r.name FROM roles r JOIN user_roles ur ON ur.role_id = r.id WHERE ur.user_id = ? ORDER BY r.name",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Assigns `role` to the user. Assigning a role already held is a no-op returning `None`.
    pub async fn add_role(&self, username: &str, role: &Role, actor: Option<&str>) -> AppResult<Option<UserRole>> {
        let user = self.get_by_username(username).await?;
        let membership = UserRole {
            user_id: user.id,
            username: user.username.clone(),
            role_id: role.id,
            role_name: role.name.clone(),
            created_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT INTO user_roles (user_id, role_id, created_at) VALUES (?, ?, ?) ON CONFLICT (user_id, role_id) DO NOTHING",
        )
        .bind(membership.user_id.to_string())
        .bind(membership.role_id.to_string())
        .bind(membership.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        tracing::info!(username = %membership.username, role = %membership.role_name, "role assigned");
        log_activity(&self.events, "created", actor, &membership);
        Ok(Some(membership))
    }

    /// Removes `role` from the user; the admin user keeps the admin role.
    pub async fn remove_role(&self, username: &str, role: &Role, actor: Option<&str>) -> AppResult<bool> {
        let user = self.get_by_username(username).await?;
        if user.is_admin_user() && role.is_admin_role() {
            return Err(AppError::forbidden("cannot remove the admin role from the admin user"));
        }

        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = ? AND role_id = ?")
            .bind(user.id.to_string())
            .bind(role.id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let membership = UserRole {
            user_id: user.id,
            username: user.username,
            role_id: role.id,
            role_name: role.name.clone(),
            created_at: Utc::now(),
        };
        tracing::info!(username = %membership.username, role = %membership.role_name, "role removed");
        log_activity(&self.events, "deleted", actor, &membership);
        Ok(true)
    }

    pub async fn lock(&self, username: &str, actor: Option<&str>) -> AppResult<User> {
        let user = self.get_by_username(username).await?;
        if user.is_admin_user() {
            return Err(AppError::forbidden("cannot disable the admin user"));
        }
        self.set_status(user, UserStatus::Disabled, actor).await
    }

    pub async fn unlock(&self, username: &str, actor: Option<&str>) -> AppResult<User> {
        let user = self.get_by_username(username).await?;
        self.set_status(user, UserStatus::Enabled, actor).await
    }

    async fn set_status(&self, old: User, status: UserStatus, actor: Option<&str>) -> AppResult<User> {
        if old.status == status {
            return Ok(old);
        }
        let user = User { status, updated_at: Utc::now(), ..old.clone() };

        sqlx::query("UPDATE users SET status = ?, updated_at = ? WHERE id = ?")
            .bind(user.status.as_str())
            .bind(user.updated_at)
            .bind(user.id.to_string())
            .execute(&self.pool)
            .await?;

        tracing::info!(username = %user.username, status = %user.status, "user status changed");
        log_change(&self.events, "updated", actor, &user, Some(&old));
        Ok(user)
    }

    pub async fn update_name(&self, username: &str, name: PersonName, actor: Option<&str>) -> AppResult<User> {
        name.validate()?;
        let old = self.get_by_username(username).await?;
        let user = User { name, updated_at: Utc::now(), ..old.clone() };

        sqlx::query("UPDATE users SET family_name = ?, given_name = ?, known_as = ?, updated_at = ? WHERE id = ?")
            .bind(&user.name.family_name)
            .bind(&user.name.given_name)
            .bind(&user.name.known_as)
            .bind(user.updated_at)
            .bind(user.id.to_string())
            .execute(&self.pool)
            .await?;

        log_change(&self.events, "updated", actor, &user, Some(&old));
        Ok(user)
    }

    pub async fn update_contact(
        &self,
        username: &str,
        email_address: Option<String>,
        phone_number: Option<String>,
        fax_number: Option<String>,
        actor: Option<&str>,
    ) -> AppResult<User> {
        let old = self.get_by_username(username).await?;
        let user = User {
            email_address,
            phone_number,
            fax_number,
            updated_at: Utc::now(),
            ..old.clone()
        };

        sqlx::query("UPDATE users SET email_address = ?, phone_number = ?, fax_number = ?, updated_at = ? WHERE id = ?")
            .bind(&user.email_address)
            .bind(&user.phone_number)
            .bind(&user.fax_number)
            .bind(user.updated_at)
            .bind(user.id.to_string())
            .execute(&self.pool)
            .await?;

        log_change(&self.events, "updated", actor, &user, Some(&old));
        Ok(user)
    }

    /// Moves the user into `tenancy_path`, or out of any tenancy with `None`.
    pub async fn update_tenancy(&self, username: &str, tenancy_path: Option<&str>, actor: Option<&str>) -> AppResult<User> {
        let old = self.get_by_username(username).await?;
        let user = User {
            tenancy_path: tenancy_path.map(str::to_string),
            updated_at: Utc::now(),
            ..old.clone()
        };

        sqlx::query("UPDATE users SET tenancy_path = ?, updated_at = ? WHERE id = ?")
            .bind(&user.tenancy_path)
            .bind(user.updated_at)
            .bind(user.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    AppError::not_found(format!("tenancy '{}' not found", tenancy_path.unwrap_or_default()))
                }
                _ => AppError::Repository(e),
            })?;

        log_change(&self.events, "updated", actor, &user, Some(&old));
        Ok(user)
    }

    pub async fn set_password(&self, username: &str, password: &str, actor: Option<&str>) -> AppResult<User> {
        let old = self.get_by_username(username).await?;
        if old.account_type == AccountType::Delegated {
            return Err(AppError::invalid_argument("delegated accounts cannot hold a password"));
        }
        let user = User {
            encrypted_password: Some(hash_password(password)?),
            updated_at: Utc::now(),
            ..old.clone()
        };

        sqlx::query("UPDATE users SET encrypted_password = ?, updated_at = ? WHERE id = ?")
            .bind(&user.encrypted_password)
            .bind(user.updated_at)
            .bind(user.id.to_string())
            .execute(&self.pool)
            .await?;

        tracing::info!(username = %user.username, "password changed");
        log_change(&self.events, "updated", actor, &user, Some(&old));
        Ok(user)
    }

    /// True only for an enabled local account whose stored hash matches.
    pub async fn verify_password(&self, username: &str, password: &str) -> AppResult<bool> {
        let Some(user) = self.find_by_username(username).await? else {
            return Ok(false);
        };
        match (&user.encrypted_password, user.is_enabled()) {
            (Some(hash), true) if user.account_type == AccountType::Local => verify_password(password, hash),
            _ => Ok(false),
        }
    }

    pub async fn delete(&self, username: &str, actor: Option<&str>) -> AppResult<User> {
        let user = self.get_by_username(username).await?;
        if user.is_admin_user() {
            return Err(AppError::forbidden("cannot delete the admin user"));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_roles WHERE user_id = ?")
            .bind(user.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user.id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(username = %user.username, "user deleted");
        log_activity(&self.events, "deleted", actor, &user);
        Ok(user)
    }
}
