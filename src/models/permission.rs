use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::events::{Loggable, Severity};
use crate::models::feature::{ApplicationFeature, FeatureId, FeatureType, MemberType};

/// Class names at least this long are shortened to their simple name in titles.
const MAX_TITLE_CLASS_FQN: usize = 30;

// =============================================================================
// MODE / RULE
// =============================================================================

/// Viewing is the weaker capability; changing implies viewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionMode {
    Viewing,
    Changing,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Viewing => "VIEWING",
            PermissionMode::Changing => "CHANGING",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VIEWING" => Ok(PermissionMode::Viewing),
            "CHANGING" => Ok(PermissionMode::Changing),
            other => Err(AppError::invalid_argument(format!("unknown permission mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionRule {
    Allow,
    Veto,
}

impl PermissionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionRule::Allow => "ALLOW",
            PermissionRule::Veto => "VETO",
        }
    }
}

impl fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionRule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALLOW" => Ok(PermissionRule::Allow),
            "VETO" => Ok(PermissionRule::Veto),
            other => Err(AppError::invalid_argument(format!("unknown permission rule '{other}'"))),
        }
    }
}

// =============================================================================
// PERMISSION VALUE
// =============================================================================

/// "Rule R applies to feature F in mode M."
///
/// Ordered by feature, then rule, then mode.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionValue {
    pub feature_id: FeatureId,
    pub rule: PermissionRule,
    pub mode: PermissionMode,
}

impl PermissionValue {
    pub fn new(feature_id: FeatureId, rule: PermissionRule, mode: PermissionMode) -> Self {
        Self { feature_id, rule, mode }
    }

    pub fn allow(feature_id: FeatureId, mode: PermissionMode) -> Self {
        Self::new(feature_id, PermissionRule::Allow, mode)
    }

    pub fn veto(feature_id: FeatureId, mode: PermissionMode) -> Self {
        Self::new(feature_id, PermissionRule::Veto, mode)
    }

    /// Builds a value from loosely typed parts, e.g. columns or CLI arguments.
    pub fn parse(
        feature_type: Option<&str>,
        feature_fqn: Option<&str>,
        rule: Option<&str>,
        mode: Option<&str>,
    ) -> AppResult<Self> {
        let missing = |what: &str| AppError::invalid_argument(format!("permission {what} is missing"));
        let feature_type: FeatureType = feature_type.ok_or_else(|| missing("feature type"))?.parse()?;
        let feature_fqn = feature_fqn.ok_or_else(|| missing("feature"))?;
        let rule: PermissionRule = rule.ok_or_else(|| missing("rule"))?.parse()?;
        let mode: PermissionMode = mode.ok_or_else(|| missing("mode"))?.parse()?;
        Ok(Self::new(FeatureId::new_feature(feature_type, feature_fqn)?, rule, mode))
    }

    /// Whether this grant allows `mode` access to `target`.
    ///
    /// Only ALLOW rules imply access, and viewing access never implies changing.
    pub fn implies(&self, target: &FeatureId, mode: PermissionMode) -> bool {
        if self.rule != PermissionRule::Allow {
            return false;
        }
        if self.mode == PermissionMode::Viewing && mode == PermissionMode::Changing {
            return false;
        }
        self.feature_id.contains(target)
    }

    /// Whether this grant denies `mode` access to `target`.
    ///
    /// Only VETO rules refute access, and a changing veto never refutes viewing.
    pub fn refutes(&self, target: &FeatureId, mode: PermissionMode) -> bool {
        if self.rule != PermissionRule::Veto {
            return false;
        }
        if self.mode == PermissionMode::Changing && mode == PermissionMode::Viewing {
            return false;
        }
        self.feature_id.contains(target)
    }
}

impl fmt::Display for PermissionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} of {}", self.rule, self.mode, self.feature_id)
    }
}

// =============================================================================
// PERMISSION (persisted grant)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub role_id: Uuid,
    /// Denormalized for titles and event payloads.
    pub role_name: String,
    pub rule: PermissionRule,
    pub mode: PermissionMode,
    pub feature_type: FeatureType,
    pub feature_fqn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_type: Option<MemberType>,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn feature_id(&self) -> AppResult<FeatureId> {
        FeatureId::new_feature(self.feature_type, &self.feature_fqn)
    }

    pub fn as_value(&self) -> AppResult<PermissionValue> {
        PermissionValue::try_from(self)
    }

    /// e.g. `admin: ALLOW CHANGING of com.mycompany.Bar#foo`
    pub fn title(&self) -> String {
        let subject = match (self.feature_type, self.feature_id()) {
            (FeatureType::Class, Ok(id)) if self.feature_fqn.len() >= MAX_TITLE_CLASS_FQN => {
                id.class_name().unwrap_or_default().to_string()
            }
            _ => self.feature_fqn.clone(),
        };
        format!("{}: {} {} of {}", self.role_name, self.rule, self.mode, subject)
    }

    pub fn type_label(&self) -> &'static str {
        match self.feature_id() {
            Ok(id) => {
                let feature = ApplicationFeature::new(id);
                match self.member_type {
                    Some(member_type) => feature.with_member_type(member_type).type_label(),
                    None => feature.type_label(),
                }
            }
            Err(_) => self.feature_type.as_str(),
        }
    }
}

impl TryFrom<&Permission> for PermissionValue {
    type Error = AppError;

    fn try_from(permission: &Permission) -> Result<Self, Self::Error> {
        Ok(PermissionValue::new(permission.feature_id()?, permission.rule, permission.mode))
    }
}

impl Loggable for Permission {
    fn entity_type() -> &'static str { "permission" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbPermission {
    pub id: String,
    pub role_id: String,
    pub role_name: String,
    pub rule: String,
    pub mode: String,
    pub feature_type: String,
    pub feature_fqn: String,
    pub member_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbPermission> for Permission {
    type Error = AppError;

    fn try_from(db: DbPermission) -> Result<Self, Self::Error> {
        Ok(Permission {
            id: crate::db::row_parsers::parse_uuid(&db.id)?,
            role_id: crate::db::row_parsers::parse_uuid(&db.role_id)?,
            role_name: db.role_name,
            rule: db.rule.parse()?,
            mode: db.mode.parse()?,
            feature_type: db.feature_type.parse()?,
            feature_fqn: db.feature_fqn,
            member_type: db.member_type.as_deref().map(str::parse).transpose()?,
            created_at: db.created_at,
        })
    }
}

/// Everything needed to add a grant to a role.
#[derive(Debug, Clone)]
pub struct NewPermission {
    pub rule: PermissionRule,
    pub mode: PermissionMode,
    pub feature: ApplicationFeature,
}

impl NewPermission {
    pub fn new(rule: PermissionRule, mode: PermissionMode, feature_id: FeatureId) -> Self {
        Self {
            rule,
            mode,
            feature: ApplicationFeature::new(feature_id),
        }
    }

    pub fn with_member_type(mut self, member_type: MemberType) -> Self {
        self.feature = self.feature.with_member_type(member_type);
        self
    }

    pub fn value(&self) -> PermissionValue {
        PermissionValue::new(self.feature.id.clone(), self.rule, self.mode)
    }
}
