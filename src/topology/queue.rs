//! Queue lookup, creation and wiring.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::policy::{topic_delivery_statement, AccessPolicy, RedrivePolicy};
use super::{QueueRef, Result, TopicRef, TopologyError};
use crate::broker::{queue_name_from_url, QueueApi, QueueAttribute, TopicApi, QUEUE_PROTOCOL};

/// Prefix of dead-letter queue names.
pub const DEAD_LETTER_PREFIX: &str = "dlq-";

/// SQS queue name limit.
const MAX_QUEUE_NAME_LEN: usize = 80;

/// Name of the dead-letter queue paired with `queue_name`.
pub fn dead_letter_name(queue_name: &str) -> String {
    format!("{}{}", DEAD_LETTER_PREFIX, queue_name)
}

/// Check a queue name against SQS naming rules.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN || !valid_chars {
        return Err(TopologyError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Resolves queues and attaches their policies and subscriptions.
pub struct QueueManager {
    queues: Arc<dyn QueueApi>,
}

impl QueueManager {
    pub fn new(queues: Arc<dyn QueueApi>) -> Self {
        Self { queues }
    }

    /// Find an existing queue whose name is exactly `name`.
    pub async fn find(&self, name: &str) -> Result<Option<QueueRef>> {
        let urls = self.queues.list_queues(name).await?;
        let Some(url) = urls.into_iter().find(|url| queue_name_from_url(url) == name) else {
            return Ok(None);
        };
        let arn = self.queue_arn(&url).await?;
        Ok(Some(QueueRef {
            name: name.to_string(),
            arn,
            url,
        }))
    }

    /// Return the queue named `name`, creating it with `attributes` if absent.
    ///
    /// The flag is true when the queue was created by this call. Attributes of
    /// an existing queue are left alone.
    pub async fn ensure(
        &self,
        name: &str,
        attributes: &HashMap<QueueAttribute, String>,
    ) -> Result<(QueueRef, bool)> {
        validate_queue_name(name)?;
        if let Some(queue) = self.find(name).await? {
            debug!(queue = %name, url = %queue.url, "Queue exists");
            return Ok((queue, false));
        }

        let url = self.queues.create_queue(name, attributes).await?;
        let arn = self.queue_arn(&url).await?;
        info!(queue = %name, url = %url, "Created queue");
        Ok((
            QueueRef {
                name: name.to_string(),
                arn,
                url,
            },
            true,
        ))
    }

    /// Return the dead-letter queue for `queue_name`, creating it if absent.
    pub async fn ensure_dead_letter(&self, queue_name: &str) -> Result<QueueRef> {
        let (queue, _) = self
            .ensure(&dead_letter_name(queue_name), &HashMap::new())
            .await?;
        Ok(queue)
    }

    /// Point `queue` at `dead_letter`. Returns true if the policy was written.
    pub async fn attach_redrive(
        &self,
        queue: &QueueRef,
        dead_letter: &QueueRef,
        max_receive_count: u32,
    ) -> Result<bool> {
        let desired = RedrivePolicy::new(&dead_letter.arn, max_receive_count);
        let current = self
            .queues
            .get_attributes(&queue.url, &[QueueAttribute::RedrivePolicy])
            .await?;

        if let Some(document) = current.get(&QueueAttribute::RedrivePolicy) {
            if RedrivePolicy::parse(&queue.url, document)? == desired {
                debug!(queue = %queue.name, "Redrive policy up to date");
                return Ok(false);
            }
        }

        let mut update = HashMap::new();
        update.insert(QueueAttribute::RedrivePolicy, desired.to_json());
        self.queues.set_attributes(&queue.url, update).await?;
        info!(
            queue = %queue.name,
            dead_letter = %dead_letter.name,
            max_receive_count,
            "Attached redrive policy"
        );
        Ok(true)
    }

    /// Grant `topic` permission to deliver to `queue`.
    ///
    /// Returns true if the policy was written. Statements for other topics or
    /// written by other tools are kept.
    pub async fn attach_access_policy(&self, queue: &QueueRef, topic: &TopicRef) -> Result<bool> {
        let statement = topic_delivery_statement(&queue.arn, &topic.arn);
        let current = self
            .queues
            .get_attributes(&queue.url, &[QueueAttribute::Policy])
            .await?;

        let mut policy = match current.get(&QueueAttribute::Policy) {
            Some(document) if !document.trim().is_empty() => {
                AccessPolicy::parse(&queue.url, document)?
            }
            _ => AccessPolicy::default(),
        };
        if policy.contains(&statement) {
            debug!(queue = %queue.name, topic = %topic.name, "Access policy up to date");
            return Ok(false);
        }

        policy.upsert(statement);
        let mut update = HashMap::new();
        update.insert(QueueAttribute::Policy, policy.to_json());
        self.queues.set_attributes(&queue.url, update).await?;
        info!(queue = %queue.name, topic = %topic.name, "Attached access policy");
        Ok(true)
    }

    /// Subscribe `queue` to `topic` unless already subscribed.
    ///
    /// Returns true if a subscription was created.
    pub async fn subscribe(
        &self,
        topics: &dyn TopicApi,
        topic: &TopicRef,
        queue: &QueueRef,
    ) -> Result<bool> {
        let existing = topics.list_subscriptions(&topic.arn).await?;
        if existing
            .iter()
            .any(|s| s.protocol == QUEUE_PROTOCOL && s.endpoint == queue.arn)
        {
            debug!(queue = %queue.name, topic = %topic.name, "Subscription exists");
            return Ok(false);
        }

        let subscription = topics
            .subscribe(&topic.arn, QUEUE_PROTOCOL, &queue.arn)
            .await?;
        info!(
            queue = %queue.name,
            topic = %topic.name,
            subscription = %subscription,
            "Subscribed queue to topic"
        );
        Ok(true)
    }

    async fn queue_arn(&self, url: &str) -> Result<String> {
        let attrs = self
            .queues
            .get_attributes(url, &[QueueAttribute::QueueArn])
            .await?;
        attrs
            .get(&QueueAttribute::QueueArn)
            .cloned()
            .ok_or_else(|| TopologyError::MissingAttribute {
                queue_url: url.to_string(),
                attribute: QueueAttribute::QueueArn.as_str(),
            })
    }
}
