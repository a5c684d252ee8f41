//! Persisted entities.
//!
//! An [`EntityDescriptor`] is the data-driven description of what the
//! consumer writes: the table, the conflict strategy encoding its
//! redelivery semantics, and the transform from a queue message to a row.
//!
//! Built-in entities:
//!
//! | entity | table | key | strategy |
//! |---|---|---|---|
//! | `simple_message` | `public.simple_messages` | `id` (SNS message id) | skip: a redelivered notification is the same notification |
//! | `consultation` | `public.messages` | `consultation_id` | update: a later notification carries the newer state |

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::broker::ReceivedMessage;
use crate::persist::{ColumnSpec, ColumnType, ConflictStrategy, PersistableRecord, TableDescriptor};

/// Errors raised while turning a message into a record.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Body is not a notification envelope: {0}")]
    Envelope(String),

    #[error("Payload is not valid JSON: {0}")]
    Payload(String),

    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Field '{field}' is not a timestamp: {value}")]
    Timestamp { field: &'static str, value: String },
}

/// SNS notification envelope as delivered to a subscribed queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    #[serde(rename = "Type", default)]
    pub kind: Option<String>,
    pub message_id: String,
    #[serde(default)]
    pub topic_arn: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl Notification {
    pub fn parse(body: &str) -> Result<Self, TransformError> {
        serde_json::from_str(body).map_err(|e| TransformError::Envelope(e.to_string()))
    }

    /// The published message decoded as JSON.
    pub fn payload(&self) -> Result<Value, TransformError> {
        serde_json::from_str(&self.message).map_err(|e| TransformError::Payload(e.to_string()))
    }
}

/// Turns one message into one record; `now` is the insertion time.
pub type Transform = Arc<
    dyn Fn(&ReceivedMessage, DateTime<Utc>) -> Result<PersistableRecord, TransformError>
        + Send
        + Sync,
>;

/// Table, conflict strategy and transform of a persisted entity.
#[derive(Clone)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: TableDescriptor,
    pub strategy: ConflictStrategy,
    pub transform: Transform,
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl EntityDescriptor {
    pub fn new(
        name: impl Into<String>,
        table: TableDescriptor,
        strategy: ConflictStrategy,
        transform: Transform,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            strategy,
            transform,
        }
    }

    /// Built-in entity by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "simple_message" => Some(simple_message()),
            "consultation" => Some(consultation()),
            _ => None,
        }
    }

    /// Replace the documented strategy (deployment override).
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn apply(
        &self,
        message: &ReceivedMessage,
        now: DateTime<Utc>,
    ) -> Result<PersistableRecord, TransformError> {
        (self.transform)(message, now)
    }
}

/// Names accepted by [`EntityDescriptor::by_name`].
pub const BUILT_IN_ENTITIES: &[&str] = &["simple_message", "consultation"];

/// Raw notification: SNS message id, receive time and message text.
pub fn simple_message() -> EntityDescriptor {
    let table = TableDescriptor {
        schema: "public".to_string(),
        table: "simple_messages".to_string(),
        primary_key: "id".to_string(),
        retention_column: Some("created_at".to_string()),
        columns: vec![
            ColumnSpec::required("id", ColumnType::Text),
            ColumnSpec::required("created_at", ColumnType::Timestamp),
            ColumnSpec::nullable("message", ColumnType::Text),
        ],
    };
    EntityDescriptor::new(
        "simple_message",
        table,
        ConflictStrategy::Skip,
        Arc::new(simple_message_record),
    )
}

fn simple_message_record(
    message: &ReceivedMessage,
    now: DateTime<Utc>,
) -> Result<PersistableRecord, TransformError> {
    let notification = Notification::parse(&message.body)?;
    Ok(PersistableRecord::new()
        .with("id", notification.message_id)
        .with("created_at", now)
        .with("message", notification.message))
}

/// Consultation lifecycle: keyed by the consultation id in the payload.
pub fn consultation() -> EntityDescriptor {
    let table = TableDescriptor {
        schema: "public".to_string(),
        table: "messages".to_string(),
        primary_key: "consultation_id".to_string(),
        retention_column: Some("inserted_utc_at".to_string()),
        columns: vec![
            ColumnSpec::required("consultation_id", ColumnType::Text),
            ColumnSpec::required("inserted_utc_at", ColumnType::Timestamp),
            ColumnSpec::nullable("estimated_start_utc_at", ColumnType::Timestamp),
            ColumnSpec::nullable("closed_utc_at", ColumnType::Timestamp),
        ],
    };
    EntityDescriptor::new(
        "consultation",
        table,
        ConflictStrategy::Update,
        Arc::new(consultation_record),
    )
}

fn consultation_record(
    message: &ReceivedMessage,
    now: DateTime<Utc>,
) -> Result<PersistableRecord, TransformError> {
    let payload = Notification::parse(&message.body)?.payload()?;
    let id = match payload.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(TransformError::MissingField("id")),
    };
    Ok(PersistableRecord::new()
        .with("consultation_id", id)
        .with("inserted_utc_at", now)
        .with(
            "estimated_start_utc_at",
            timestamp_field(&payload, "estimatedStartDate")?,
        )
        .with("closed_utc_at", timestamp_field(&payload, "closedAt")?))
}

/// Optional timestamp field; absent and null both read as `None`.
fn timestamp_field(
    payload: &Value,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, TransformError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_timestamp(s).map(Some).ok_or_else(|| {
            TransformError::Timestamp {
                field,
                value: s.clone(),
            }
        }),
        Some(other) => Err(TransformError::Timestamp {
            field,
            value: other.to_string(),
        }),
    }
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}
