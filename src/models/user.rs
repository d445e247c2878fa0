use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::authz::roles;
use crate::errors::{AppError, AppResult};
use crate::events::Loggable;

pub const MAX_LENGTH_USERNAME: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    /// Password held (hashed) in this store.
    Local,
    /// Authenticated elsewhere; never holds a password here.
    Delegated,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Local => "LOCAL",
            AccountType::Delegated => "DELEGATED",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(AccountType::Local),
            "DELEGATED" => Ok(AccountType::Delegated),
            other => Err(AppError::invalid_argument(format!("unknown account type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Enabled,
    Disabled,
}

impl UserStatus {
    pub fn parse(enabled: bool) -> Self {
        if enabled {
            UserStatus::Enabled
        } else {
            UserStatus::Disabled
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Enabled => "ENABLED",
            UserStatus::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENABLED" => Ok(UserStatus::Enabled),
            "DISABLED" => Ok(UserStatus::Disabled),
            other => Err(AppError::invalid_argument(format!("unknown user status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonName {
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    pub known_as: Option<String>,
}

impl PersonName {
    /// A family name needs a given name, and given/known-as names need a family name.
    pub fn validate(&self) -> AppResult<()> {
        if self.family_name.is_some() && self.given_name.is_none() {
            return Err(AppError::invalid_argument(
                "must provide given name if family name has been provided",
            ));
        }
        if self.family_name.is_none() && (self.given_name.is_some() || self.known_as.is_some()) {
            return Err(AppError::invalid_argument(
                "must provide family name if given name or 'known as' name has been provided",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(flatten)]
    pub name: PersonName,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub fax_number: Option<String>,
    pub tenancy_path: Option<String>,
    pub account_type: AccountType,
    pub status: UserStatus,
    #[serde(skip)]
    pub encrypted_password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// `"Fred Smith (fsmith)"`, preferring the known-as name; the bare username without a family name.
    pub fn display_name(&self) -> String {
        match &self.name.family_name {
            Some(family_name) => {
                let first = self
                    .name
                    .known_as
                    .as_deref()
                    .or(self.name.given_name.as_deref())
                    .unwrap_or_default();
                format!("{} {} ({})", first, family_name, self.username)
            }
            None => self.username.clone(),
        }
    }

    pub fn has_password(&self) -> bool {
        self.encrypted_password.as_deref().map_or(false, |hash| !hash.is_empty())
    }

    pub fn is_admin_user(&self) -> bool {
        self.username == roles::SECURITY_ADMIN_USER
    }

    pub fn is_enabled(&self) -> bool {
        self.status == UserStatus::Enabled
    }

    pub fn validate_username(username: &str) -> AppResult<()> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::invalid_argument("username must not be empty"));
        }
        if username.chars().count() > MAX_LENGTH_USERNAME {
            return Err(AppError::invalid_argument(format!(
                "username must be at most {MAX_LENGTH_USERNAME} characters"
            )));
        }
        Ok(())
    }
}

impl Loggable for User {
    fn entity_type() -> &'static str { "user" }
    fn subject_id(&self) -> Uuid { self.id }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbUser {
    pub id: String,
    pub username: String,
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    pub known_as: Option<String>,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub fax_number: Option<String>,
    pub tenancy_path: Option<String>,
    pub account_type: String,
    pub status: String,
    pub encrypted_password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbUser> for User {
    type Error = AppError;

    fn try_from(value: DbUser) -> Result<Self, Self::Error> {
        Ok(User {
            id: crate::db::row_parsers::parse_uuid(&value.id)?,
            username: value.username,
            name: PersonName {
                family_name: value.family_name,
                given_name: value.given_name,
                known_as: value.known_as,
            },
            email_address: value.email_address,
            phone_number: value.phone_number,
            fax_number: value.fax_number,
            tenancy_path: value.tenancy_path,
            account_type: value.account_type.parse()?,
            status: value.status.parse()?,
            encrypted_password: value.encrypted_password,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub name: PersonName,
    pub email_address: Option<String>,
    pub tenancy_path: Option<String>,
    pub account_type: AccountType,
    pub status: UserStatus,
    /// Plain-text password; only honoured for local accounts.
    pub password: Option<String>,
}

impl NewUser {
    pub fn local(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            name: PersonName::default(),
            email_address: None,
            tenancy_path: None,
            account_type: AccountType::Local,
            status: UserStatus::Enabled,
            password: None,
        }
    }

    pub fn delegated(username: impl Into<String>) -> Self {
        Self {
            account_type: AccountType::Delegated,
            ..Self::local(username)
        }
    }
}

// =============================================================================
// USER VIEW (read projection)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub username: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
    pub account_type: AccountType,
    pub status: UserStatus,
    pub has_password: bool,
    pub roles: Vec<String>,
}

impl UserView {
    pub fn project(user: &User, mut role_names: Vec<String>) -> Self {
        role_names.sort();
        UserView {
            username: user.username.clone(),
            name: user.display_name(),
            email_address: user.email_address.clone(),
            tenancy: user.tenancy_path.clone(),
            account_type: user.account_type,
            status: user.status,
            has_password: user.has_password(),
            roles: role_names,
        }
    }
}
