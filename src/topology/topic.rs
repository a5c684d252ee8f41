//! Topic lookup and creation.

use std::sync::Arc;

use tracing::{debug, info};

use super::{Result, TopicRef};
use crate::broker::{resource_name_from_arn, TopicApi};

/// Resolves logical topic names to topic identifiers.
pub struct TopicManager {
    topics: Arc<dyn TopicApi>,
}

impl TopicManager {
    pub fn new(topics: Arc<dyn TopicApi>) -> Self {
        Self { topics }
    }

    /// Find an existing topic whose name is exactly `name`.
    ///
    /// `orders` never matches `arn:...:priority-orders`.
    pub async fn find(&self, name: &str) -> Result<Option<TopicRef>> {
        let arns = self.topics.list_topics().await?;
        Ok(arns
            .into_iter()
            .find(|arn| resource_name_from_arn(arn) == name)
            .map(|arn| TopicRef {
                name: name.to_string(),
                arn,
            }))
    }

    /// Return the topic named `name`, creating it if absent.
    pub async fn ensure(&self, name: &str) -> Result<TopicRef> {
        if let Some(topic) = self.find(name).await? {
            debug!(topic = %name, arn = %topic.arn, "Topic exists");
            return Ok(topic);
        }

        let arn = self.topics.create_topic(name).await?;
        info!(topic = %name, arn = %arn, "Created topic");
        Ok(TopicRef {
            name: name.to_string(),
            arn,
        })
    }
}
