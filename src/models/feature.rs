//! Feature identity: packages, classes and class members.
//!
//! A feature is addressed by its package name, an optional class name and an
//! optional member name. The persisted form is the pair
//! `(feature_type, feature_fqn)` where the fqn is `com.foo`, `com.foo.Bar` or
//! `com.foo.Bar#baz`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

const MEMBER_SEPARATOR: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    Package,
    Class,
    Member,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Package => "PACKAGE",
            FeatureType::Class => "CLASS",
            FeatureType::Member => "MEMBER",
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PACKAGE" => Ok(FeatureType::Package),
            "CLASS" => Ok(FeatureType::Class),
            "MEMBER" => Ok(FeatureType::Member),
            other => Err(AppError::invalid_argument(format!("unknown feature type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberType {
    Property,
    Collection,
    Action,
}

impl MemberType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberType::Property => "PROPERTY",
            MemberType::Collection => "COLLECTION",
            MemberType::Action => "ACTION",
        }
    }
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROPERTY" => Ok(MemberType::Property),
            "COLLECTION" => Ok(MemberType::Collection),
            "ACTION" => Ok(MemberType::Action),
            other => Err(AppError::invalid_argument(format!("unknown member type '{other}'"))),
        }
    }
}

/// Identity of a package, class or member.
///
/// Field order matters: the derived ordering is by type, then package, class
/// and member name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "FeatureIdParts")]
pub struct FeatureId {
    feature_type: FeatureType,
    package_name: String,
    class_name: Option<String>,
    member_name: Option<String>,
}

/// Unchecked wire form; every decoded id goes back through the constructors.
#[derive(Deserialize)]
struct FeatureIdParts {
    feature_type: FeatureType,
    package_name: String,
    class_name: Option<String>,
    member_name: Option<String>,
}

impl TryFrom<FeatureIdParts> for FeatureId {
    type Error = AppError;

    fn try_from(parts: FeatureIdParts) -> AppResult<Self> {
        let id = match (parts.feature_type, &parts.class_name, &parts.member_name) {
            (FeatureType::Package, None, None) => Self::new_package(&parts.package_name)?,
            (FeatureType::Class, Some(class_name), None) => {
                Self::new_class(&format!("{}.{}", parts.package_name, class_name))?
            }
            (FeatureType::Member, Some(class_name), Some(member_name)) => {
                Self::new_member(&format!("{}.{}", parts.package_name, class_name), member_name)?
            }
            (feature_type, _, _) => {
                return Err(AppError::invalid_argument(format!(
                    "class and member names do not fit a {feature_type} feature"
                )))
            }
        };
        let canonical = id.package_name == parts.package_name
            && id.class_name == parts.class_name
            && id.member_name == parts.member_name;
        if !canonical {
            return Err(AppError::invalid_argument(format!("malformed feature id '{id}'")));
        }
        Ok(id)
    }
}

fn check_package_name(package_name: &str) -> AppResult<()> {
    if package_name.split('.').any(|segment| segment.trim().is_empty()) {
        return Err(AppError::invalid_argument(format!(
            "package name '{package_name}' has an empty segment"
        )));
    }
    Ok(())
}

impl FeatureId {
    pub fn new_package(fqn: &str) -> AppResult<Self> {
        let fqn = fqn.trim();
        if fqn.is_empty() {
            return Err(AppError::invalid_argument("package name must not be empty"));
        }
        check_package_name(fqn)?;
        Ok(Self {
            feature_type: FeatureType::Package,
            package_name: fqn.to_string(),
            class_name: None,
            member_name: None,
        })
    }

    /// Splits `fqn` on its last `.` into package and class name.
    pub fn new_class(fqn: &str) -> AppResult<Self> {
        let fqn = fqn.trim();
        if fqn.is_empty() {
            return Err(AppError::invalid_argument("class name must not be empty"));
        }
        let (package_name, class_name) = fqn
            .rsplit_once('.')
            .ok_or_else(|| AppError::invalid_argument(format!("class '{fqn}' has no package")))?;
        if package_name.is_empty() || class_name.is_empty() {
            return Err(AppError::invalid_argument(format!("malformed class name '{fqn}'")));
        }
        check_package_name(package_name)?;
        Ok(Self {
            feature_type: FeatureType::Class,
            package_name: package_name.to_string(),
            class_name: Some(class_name.to_string()),
            member_name: None,
        })
    }

    pub fn new_member(class_fqn: &str, member_name: &str) -> AppResult<Self> {
        let member_name = member_name.trim();
        if member_name.is_empty() {
            return Err(AppError::invalid_argument("member name must not be empty"));
        }
        let class_id = Self::new_class(class_fqn)?;
        Ok(Self {
            feature_type: FeatureType::Member,
            member_name: Some(member_name.to_string()),
            ..class_id
        })
    }

    /// Rebuilds an id from its persisted `(feature_type, feature_fqn)` form.
    pub fn new_feature(feature_type: FeatureType, fqn: &str) -> AppResult<Self> {
        match feature_type {
            FeatureType::Package => Self::new_package(fqn),
            FeatureType::Class => Self::new_class(fqn),
            FeatureType::Member => {
                let (class_fqn, member_name) = fqn.split_once(MEMBER_SEPARATOR).ok_or_else(|| {
                    AppError::invalid_argument(format!(
                        "member '{fqn}' must have the form package.Class{MEMBER_SEPARATOR}member"
                    ))
                })?;
                Self::new_member(class_fqn, member_name)
            }
        }
    }

    pub fn feature_type(&self) -> FeatureType {
        self.feature_type
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn member_name(&self) -> Option<&str> {
        self.member_name.as_deref()
    }

    /// `com.foo.Bar` for classes and members, `None` for packages.
    pub fn class_fqn(&self) -> Option<String> {
        self.class_name
            .as_ref()
            .map(|class_name| format!("{}.{}", self.package_name, class_name))
    }

    pub fn fully_qualified_name(&self) -> String {
        match (&self.class_name, &self.member_name) {
            (Some(class_name), Some(member_name)) => {
                format!("{}.{}{}{}", self.package_name, class_name, MEMBER_SEPARATOR, member_name)
            }
            (Some(class_name), None) => format!("{}.{}", self.package_name, class_name),
            _ => self.package_name.clone(),
        }
    }

    /// The package this feature lives in; a package is its own parent package.
    pub fn parent_package_id(&self) -> FeatureId {
        if self.feature_type == FeatureType::Package {
            return self.clone();
        }
        Self {
            feature_type: FeatureType::Package,
            package_name: self.package_name.clone(),
            class_name: None,
            member_name: None,
        }
    }

    pub fn parent_class_id(&self) -> Option<FeatureId> {
        if self.feature_type != FeatureType::Member {
            return None;
        }
        Some(Self {
            feature_type: FeatureType::Class,
            package_name: self.package_name.clone(),
            class_name: self.class_name.clone(),
            member_name: None,
        })
    }

    /// The enclosing package of a package (`com.foo` for `com.foo.bar`).
    fn enclosing_package_id(&self) -> Option<FeatureId> {
        debug_assert_eq!(self.feature_type, FeatureType::Package);
        let (parent, _) = self.package_name.rsplit_once('.')?;
        if parent.is_empty() {
            return None;
        }
        Some(Self {
            feature_type: FeatureType::Package,
            package_name: parent.to_string(),
            class_name: None,
            member_name: None,
        })
    }

    /// This id followed by every enclosing feature, most specific first.
    pub fn path_ids(&self) -> Vec<FeatureId> {
        let mut path = vec![self.clone()];
        if let Some(class_id) = self.parent_class_id() {
            path.push(class_id);
        }
        let mut package_id = self.parent_package_id();
        if package_id != *self {
            path.push(package_id.clone());
        }
        while let Some(enclosing) = package_id.enclosing_package_id() {
            path.push(enclosing.clone());
            package_id = enclosing;
        }
        path
    }

    pub fn parent_ids(&self) -> Vec<FeatureId> {
        self.path_ids().into_iter().skip(1).collect()
    }

    /// True when `other` is this feature or lies within it.
    ///
    /// Package containment respects segment boundaries: `com.foo` contains
    /// `com.foo.Bar` and `com.foo.bar.Baz` but not `com.foobar.Baz`.
    pub fn contains(&self, other: &FeatureId) -> bool {
        match self.feature_type {
            FeatureType::Package => {
                other.package_name == self.package_name
                    || other
                        .package_name
                        .strip_prefix(self.package_name.as_str())
                        .map_or(false, |rest| rest.starts_with('.'))
            }
            FeatureType::Class => {
                other.feature_type != FeatureType::Package
                    && other.package_name == self.package_name
                    && other.class_name == self.class_name
            }
            FeatureType::Member => other == self,
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified_name())
    }
}

/// A feature together with the kind of member it is, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFeature {
    pub id: FeatureId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_type: Option<MemberType>,
}

impl ApplicationFeature {
    pub fn new(id: FeatureId) -> Self {
        Self { id, member_type: None }
    }

    pub fn with_member_type(mut self, member_type: MemberType) -> Self {
        if self.id.feature_type() == FeatureType::Member {
            self.member_type = Some(member_type);
        }
        self
    }

    /// `PACKAGE`, `CLASS`, or the member type for members (falling back to `MEMBER`).
    pub fn type_label(&self) -> &'static str {
        match (self.id.feature_type(), self.member_type) {
            (FeatureType::Member, Some(member_type)) => member_type.as_str(),
            (feature_type, _) => feature_type.as_str(),
        }
    }
}
