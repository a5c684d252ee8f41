//! Broker capabilities.
//!
//! This module contains:
//! - `TopicApi` trait: named publish points (SNS topics)
//! - `QueueApi` trait: durable at-least-once queues (SQS queues)
//! - Wire types shared by both
//! - Implementations: SNS/SQS (AWS SDK), Mock (in-memory)

use std::collections::HashMap;

use async_trait::async_trait;

use crate::credentials::CredentialError;

pub mod mock;
pub mod sns_sqs;

pub use mock::MockBroker;
pub use sns_sqs::{SnsTopics, SqsQueues};

/// Protocol used when subscribing a queue to a topic.
pub const QUEUE_PROTOCOL: &str = "sqs";

/// SQS limit on entries per DeleteMessageBatch call.
pub const MAX_DELETE_BATCH: usize = 10;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
///
/// Transient failures (network, throttling) surface here unchanged; nothing
/// in this crate retries them.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Credentials unavailable: {0}")]
    Credentials(#[from] CredentialError),

    #[error("Topic operation failed: {0}")]
    Topic(String),

    #[error("Queue operation failed: {0}")]
    Queue(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),
}

/// Queue attributes the relay reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueAttribute {
    QueueArn,
    Policy,
    RedrivePolicy,
    VisibilityTimeout,
}

impl QueueAttribute {
    /// Attribute name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueArn => "QueueArn",
            Self::Policy => "Policy",
            Self::RedrivePolicy => "RedrivePolicy",
            Self::VisibilityTimeout => "VisibilityTimeout",
        }
    }
}

/// A topic subscription as listed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscription_arn: String,
    pub protocol: String,
    pub endpoint: String,
}

/// A message to publish on a topic.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub body: String,
    pub subject: Option<String>,
    /// String-typed message attributes.
    pub attributes: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// One delivery of a message from a queue.
///
/// The receipt handle is only valid for this delivery and only until the
/// visibility timeout expires.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// Long-poll receive parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on messages returned (1..=10).
    pub max_messages: i32,
    /// Seconds to wait for at least one message.
    pub wait_time_secs: i32,
    /// Seconds the returned messages stay hidden from other receivers.
    pub visibility_timeout_secs: i32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
        }
    }
}

/// Entry of a batch acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    /// Batch-local id, unique within one call.
    pub id: String,
    pub receipt_handle: String,
}

/// An entry the broker refused to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelete {
    pub id: String,
    pub code: String,
    pub message: String,
}

/// Per-entry result of a batch acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<FailedDelete>,
}

impl DeleteOutcome {
    pub fn merge(&mut self, other: DeleteOutcome) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

/// Topic side of the broker.
#[async_trait]
pub trait TopicApi: Send + Sync {
    /// Identifiers (ARNs) of every topic visible to the caller.
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Create a topic and return its identifier.
    async fn create_topic(&self, name: &str) -> Result<String>;

    /// Subscriptions currently attached to a topic.
    async fn list_subscriptions(&self, topic_arn: &str) -> Result<Vec<Subscription>>;

    /// Subscribe `endpoint` to a topic and return the subscription identifier.
    async fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String>;

    /// Publish a message and return the broker-assigned message id.
    async fn publish(&self, topic_arn: &str, message: &OutboundMessage) -> Result<String>;
}

/// Queue side of the broker.
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// URLs of queues whose name starts with `prefix`.
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create a queue and return its URL.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<QueueAttribute, String>,
    ) -> Result<String>;

    /// Read selected attributes. Attributes that are not set are absent.
    async fn get_attributes(
        &self,
        queue_url: &str,
        names: &[QueueAttribute],
    ) -> Result<HashMap<QueueAttribute, String>>;

    /// Overwrite selected attributes.
    async fn set_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<QueueAttribute, String>,
    ) -> Result<()>;

    /// Long-poll receive.
    async fn receive(&self, queue_url: &str, options: &ReceiveOptions)
        -> Result<Vec<ReceivedMessage>>;

    /// Delete up to [`MAX_DELETE_BATCH`] deliveries in one call.
    async fn delete_batch(&self, queue_url: &str, entries: &[DeleteEntry])
        -> Result<DeleteOutcome>;
}

/// Queue name component of a queue URL (`https://host/account/name`).
pub fn queue_name_from_url(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Resource name component of an ARN (`arn:aws:sns:region:account:name`).
pub fn resource_name_from_arn(arn: &str) -> &str {
    arn.rsplit(':').next().unwrap_or(arn)
}
