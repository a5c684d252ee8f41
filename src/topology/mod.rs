//! Topology provisioning.
//!
//! Creates and wires a topic, a primary queue and its dead-letter queue.
//! Every step looks before it writes, so provisioning can run at every
//! process start against existing infrastructure: a second run performs only
//! reads. A run that stopped half-way is completed by the next one.
//!
//! Broker errors are surfaced as-is. Provisioning runs once at startup and
//! does not retry; the caller decides whether to abort.

mod policy;
mod queue;
mod topic;

pub use policy::{
    statement_id, topic_delivery_statement, AccessPolicy, RedrivePolicy, POLICY_ID,
    POLICY_VERSION, STATEMENT_PREFIX,
};
pub use queue::{dead_letter_name, validate_queue_name, QueueManager, DEAD_LETTER_PREFIX};
pub use topic::TopicManager;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::broker::{BrokerError, QueueApi, QueueAttribute, TopicApi};

/// Default deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors that can occur while provisioning.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Queue {queue_url} has no {attribute} attribute")]
    MissingAttribute {
        queue_url: String,
        attribute: &'static str,
    },

    #[error("Invalid policy on {queue_url}: {message}")]
    InvalidPolicy { queue_url: String, message: String },

    #[error("Invalid queue name '{0}'")]
    InvalidName(String),
}

/// A resolved topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRef {
    pub name: String,
    pub arn: String,
}

/// A resolved queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRef {
    pub name: String,
    pub arn: String,
    pub url: String,
}

/// A fully wired topic, queue and dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub topic: TopicRef,
    pub queue: QueueRef,
    pub dead_letter: QueueRef,
}

/// Provisioning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologySettings {
    /// Deliveries before a message moves to the dead-letter queue.
    pub max_receive_count: u32,
    /// Default visibility timeout of a newly created primary queue.
    pub visibility_timeout_secs: Option<i32>,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            visibility_timeout_secs: None,
        }
    }
}

/// Produces a wired [`Topology`] from logical names.
pub struct TopologyProvisioner {
    topics: Arc<dyn TopicApi>,
    topic_manager: TopicManager,
    queue_manager: QueueManager,
    settings: TopologySettings,
}

impl TopologyProvisioner {
    pub fn new(
        topics: Arc<dyn TopicApi>,
        queues: Arc<dyn QueueApi>,
        settings: TopologySettings,
    ) -> Self {
        Self {
            topic_manager: TopicManager::new(Arc::clone(&topics)),
            queue_manager: QueueManager::new(queues),
            topics,
            settings,
        }
    }

    pub fn topics(&self) -> &TopicManager {
        &self.topic_manager
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queue_manager
    }

    /// Resolve or create the topic, dead-letter queue and primary queue, then
    /// attach subscription, access policy and redrive policy.
    ///
    /// Wiring is checked on every run, not only when the queue is new; each
    /// check is a read and writes happen only when something is missing.
    pub async fn ensure_topology(&self, topic_name: &str, queue_name: &str) -> Result<Topology> {
        validate_queue_name(queue_name)?;
        validate_queue_name(&dead_letter_name(queue_name))?;

        let topic = self.topic_manager.ensure(topic_name).await?;
        let dead_letter = self.queue_manager.ensure_dead_letter(queue_name).await?;

        let mut attributes = HashMap::new();
        if let Some(secs) = self.settings.visibility_timeout_secs {
            attributes.insert(QueueAttribute::VisibilityTimeout, secs.to_string());
        }
        let (queue, created) = self.queue_manager.ensure(queue_name, &attributes).await?;

        let subscribed = self
            .queue_manager
            .subscribe(self.topics.as_ref(), &topic, &queue)
            .await?;
        let granted = self
            .queue_manager
            .attach_access_policy(&queue, &topic)
            .await?;
        let redriven = self
            .queue_manager
            .attach_redrive(&queue, &dead_letter, self.settings.max_receive_count)
            .await?;

        info!(
            topic = %topic.arn,
            queue = %queue.url,
            dead_letter = %dead_letter.url,
            created,
            subscribed,
            granted,
            redriven,
            "Topology ready"
        );

        Ok(Topology {
            topic,
            queue,
            dead_letter,
        })
    }
}
