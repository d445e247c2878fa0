pub mod authz;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod models;
pub mod service;
pub mod utils;

pub use authz::{AuthzMode, GrantSource, InMemoryGrants, PermissionValueSet, PolicyKind, Principal};
pub use config::SecurityConfig;
pub use errors::{AppError, AppResult};
pub use service::SecurityService;
