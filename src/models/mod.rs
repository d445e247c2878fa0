pub mod feature;
pub mod permission;
pub mod role;
pub mod tenancy;
pub mod user;

pub use feature::{ApplicationFeature, FeatureId, FeatureType, MemberType};
pub use permission::{NewPermission, Permission, PermissionMode, PermissionRule, PermissionValue};
pub use role::{Role, RoleView, UserRole};
pub use tenancy::{Tenancy, TenancyView};
pub use user::{AccountType, NewUser, PersonName, User, UserStatus, UserView};
