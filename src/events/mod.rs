use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod loggable;
pub use loggable::{Loggable, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<T> {
    pub id: Uuid,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub subject_id: Option<Uuid>,
    pub payload: T,
}

impl<T> DomainEvent<T> {
    pub fn new(name: impl Into<String>, actor: Option<String>, subject_id: Option<Uuid>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            occurred_at: Utc::now(),
            actor,
            subject_id,
            payload,
        }
    }
}

pub type EventBus = broadcast::Sender<Value>;

pub fn init_event_bus() -> (EventBus, broadcast::Receiver<Value>) {
    broadcast::channel(1024)
}

/// Structured activity payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPayload {
    /// The current/new state of the entity
    #[serde(rename = "new")]
    pub current: Value,
    /// The previous state (for update/delete operations)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// Severity level for retention policy
    pub severity: Severity,
}

/// Publishes `<entity_type>.<action>` for any `Loggable` entity.
pub fn log_activity<T: Loggable>(event_bus: &EventBus, action: &str, actor: Option<&str>, entity: &T) {
    log_change(event_bus, action, actor, entity, None);
}

/// Like [`log_activity`], also recording the previous state.
pub fn log_change<T: Loggable>(
    event_bus: &EventBus,
    action: &str,
    actor: Option<&str>,
    entity: &T,
    old_entity: Option<&T>,
) {
    let event_name = format!("{}.{}", T::entity_type(), action);

    let payload = ActivityPayload {
        current: serde_json::to_value(entity).unwrap_or_default(),
        old: old_entity.map(|e| serde_json::to_value(e).unwrap_or_default()),
        severity: entity.severity_for_action(action),
    };

    let event = DomainEvent::new(
        event_name,
        actor.map(str::to_string),
        Some(entity.subject_id()),
        serde_json::to_value(&payload).unwrap_or_default(),
    );

    // No receivers is fine: nothing is listening in one-shot CLI runs.
    let _ = event_bus.send(serde_json::to_value(event).unwrap_or_default());
}

/// Event name (`role.created`, ...) of a serialized [`DomainEvent`].
pub fn event_name(event: &Value) -> &str {
    event.get("name").and_then(|v| v.as_str()).unwrap_or("unknown")
}

/// A field of the entity state carried in a serialized [`DomainEvent`].
pub fn payload_field<'a>(event: &'a Value, field: &str) -> Option<&'a str> {
    event
        .get("payload")
        .and_then(|p| p.get("new"))
        .and_then(|n| n.get(field))
        .and_then(|v| v.as_str())
}

fn describe(name: &str) -> &'static str {
    match name {
        "role.created" => "Role created",
        "role.updated" => "Role updated",
        "role.deleted" => "Role deleted",
        "permission.created" => "Permission granted",
        "permission.updated" => "Permission changed",
        "permission.deleted" => "Permission removed",
        "user.created" => "User created",
        "user.updated" => "User updated",
        "user.deleted" => "User deleted",
        "user_role.created" => "Role assigned to user",
        "user_role.deleted" => "Role removed from user",
        "tenancy.created" => "Tenancy created",
        "tenancy.updated" => "Tenancy updated",
        "tenancy.deleted" => "Tenancy deleted",
        _ => "Security event",
    }
}

/// Persists every event into `security_audit_log` until the bus closes.
pub async fn start_audit_listener(mut rx: broadcast::Receiver<Value>, pool: SqlitePool) {
    tracing::info!("audit listener started");
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "audit listener lagged, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let name = event_name(&event).to_string();
        let actor = event.get("actor").and_then(|v| v.as_str()).map(str::to_string);
        let subject_id = event.get("subject_id").and_then(|v| v.as_str()).map(str::to_string);
        let severity = event
            .get("payload")
            .and_then(|p| p.get("severity"))
            .and_then(|s| s.as_str())
            .unwrap_or("important")
            .to_string();
        let occurred_at = event
            .get("occurred_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let result = sqlx::query(
            r#"
            INSERT INTO security_audit_log (id, event_name, description, actor, subject_id, occurred_at, properties, severity)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&name)
        .bind(describe(&name))
        .bind(&actor)
        .bind(&subject_id)
        .bind(occurred_at)
        .bind(event.to_string())
        .bind(&severity)
        .execute(&pool)
        .await;

        if let Err(e) = result {
            tracing::error!(event = %name, "failed to save audit log: {}", e);
        }
    }
    tracing::info!("audit listener stopped");
}
