use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retention class of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Grants, roles, memberships: kept indefinitely
    Critical,
    #[default]
    Important,
    /// Safe to trim aggressively
    Noise,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Noise => "noise",
        }
    }
}

/// Entities whose changes are published on the event bus.
pub trait Loggable: Serialize + Send + Sync {
    /// Prefix of the event name, e.g. `permission` in `permission.created`.
    fn entity_type() -> &'static str;

    fn subject_id(&self) -> Uuid;

    fn severity(&self) -> Severity {
        Severity::Important
    }

    /// Deletions are always critical.
    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "deleted" => Severity::Critical,
            "created" | "updated" => self.severity(),
            _ => Severity::Important,
        }
    }
}
