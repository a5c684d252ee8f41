//! Redrive and access policy documents.
//!
//! Both are stored by the broker as JSON strings. They are compared in decoded
//! form so that key order and whitespace never cause a spurious rewrite.

use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::{Result, TopologyError};

/// Policy language version written into every access policy.
pub const POLICY_VERSION: &str = "2012-10-17";
/// Id of access policies created by this crate.
pub const POLICY_ID: &str = "SQSPolicy";
/// Prefix of statement ids granting a topic permission to deliver.
pub const STATEMENT_PREFIX: &str = "SNSPublish-";

/// Links a queue to its dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    /// Deliveries after which a message is moved to the dead-letter queue.
    /// Encoded as a string on the wire; numbers are accepted when reading.
    #[serde(deserialize_with = "count_from_string_or_number")]
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn new(dead_letter_target_arn: impl Into<String>, max_receive_count: u32) -> Self {
        Self {
            dead_letter_target_arn: dead_letter_target_arn.into(),
            max_receive_count,
        }
    }

    pub fn parse(queue_url: &str, document: &str) -> Result<Self> {
        serde_json::from_str(document).map_err(|e| TopologyError::InvalidPolicy {
            queue_url: queue_url.to_string(),
            message: format!("redrive policy: {}", e),
        })
    }

    pub fn to_json(&self) -> String {
        json!({
            "deadLetterTargetArn": self.dead_letter_target_arn,
            "maxReceiveCount": self.max_receive_count.to_string(),
        })
        .to_string()
    }
}

fn count_from_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Text(String),
        Number(u32),
    }

    match Count::deserialize(deserializer)? {
        Count::Number(n) => Ok(n),
        Count::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Statement id granting `topic_arn` permission to deliver.
///
/// Derived from the full topic ARN, so re-applying for the same topic replaces
/// rather than appends, and same-named topics in other regions or accounts
/// keep their own statements. Characters outside `[A-Za-z0-9]` become `-`.
pub fn statement_id(topic_arn: &str) -> String {
    let suffix: String = topic_arn
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}{}", STATEMENT_PREFIX, suffix)
}

/// Statement allowing `topic_arn` to send messages to `queue_arn`.
pub fn topic_delivery_statement(queue_arn: &str, topic_arn: &str) -> Value {
    json!({
        "Sid": statement_id(topic_arn),
        "Effect": "Allow",
        "Principal": "*",
        "Action": "sqs:SendMessage",
        "Resource": queue_arn,
        "Condition": { "ArnEquals": { "aws:SourceArn": topic_arn } }
    })
}

/// Queue access policy: an ordered list of named statements.
///
/// Statements written by other tools are preserved untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPolicy {
    pub version: String,
    pub id: Option<String>,
    pub statements: Vec<Value>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            id: Some(POLICY_ID.to_string()),
            statements: Vec::new(),
        }
    }
}

impl AccessPolicy {
    pub fn parse(queue_url: &str, document: &str) -> Result<Self> {
        let invalid = |message: String| TopologyError::InvalidPolicy {
            queue_url: queue_url.to_string(),
            message,
        };

        let doc: Value =
            serde_json::from_str(document).map_err(|e| invalid(format!("access policy: {}", e)))?;
        let Value::Object(map) = doc else {
            return Err(invalid("access policy is not an object".to_string()));
        };

        // A single statement may be written without the surrounding array.
        let statements = match map.get("Statement") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(single @ Value::Object(_)) => vec![single.clone()],
            Some(other) => return Err(invalid(format!("unexpected Statement: {}", other))),
        };

        Ok(Self {
            version: map
                .get("Version")
                .and_then(Value::as_str)
                .unwrap_or(POLICY_VERSION)
                .to_string(),
            id: map.get("Id").and_then(Value::as_str).map(str::to_string),
            statements,
        })
    }

    pub fn to_json(&self) -> String {
        let mut doc = serde_json::Map::new();
        doc.insert("Version".to_string(), Value::String(self.version.clone()));
        if let Some(id) = &self.id {
            doc.insert("Id".to_string(), Value::String(id.clone()));
        }
        doc.insert("Statement".to_string(), Value::Array(self.statements.clone()));
        Value::Object(doc).to_string()
    }

    pub fn statement(&self, sid: &str) -> Option<&Value> {
        self.statements
            .iter()
            .find(|s| s.get("Sid").and_then(Value::as_str) == Some(sid))
    }

    /// True when a statement with the same Sid and equivalent content exists.
    pub fn contains(&self, statement: &Value) -> bool {
        let Some(sid) = statement.get("Sid").and_then(Value::as_str) else {
            return false;
        };
        self.statement(sid)
            .is_some_and(|existing| canonical(existing) == canonical(statement))
    }

    /// Insert `statement`, replacing any statement with the same Sid.
    pub fn upsert(&mut self, statement: Value) {
        let sid = statement.get("Sid").and_then(Value::as_str).map(str::to_string);
        self.statements
            .retain(|s| sid.is_none() || s.get("Sid").and_then(Value::as_str) != sid.as_deref());
        self.statements.push(statement);
    }
}

/// Decoded form used for comparison.
///
/// The broker may echo `"Principal": "*"` back as `{"AWS": "*"}`.
fn canonical(statement: &Value) -> Value {
    let mut statement = statement.clone();
    if let Some(principal) = statement.get_mut("Principal") {
        if *principal == json!({ "AWS": "*" }) {
            *principal = Value::String("*".to_string());
        }
    }
    statement
}
