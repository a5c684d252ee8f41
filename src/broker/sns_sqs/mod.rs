//! AWS SNS/SQS broker adapters.
//!
//! `SnsTopics` implements [`TopicApi`] over SNS and `SqsQueues` implements
//! [`QueueApi`] over SQS. Neither holds a client: each call asks the shared
//! [`CredentialProvider`] for one, so expired credentials are refreshed
//! transparently before the request goes out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{DeleteMessageBatchRequestEntry, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use tracing::{debug, info};

use super::{
    BrokerError, DeleteEntry, DeleteOutcome, FailedDelete, OutboundMessage, QueueApi,
    QueueAttribute, ReceiveOptions, ReceivedMessage, Result, Subscription, TopicApi,
};
use crate::credentials::CredentialProvider;

/// Attribute data type used for every published message attribute.
const STRING_DATA_TYPE: &str = "String";

/// SNS-backed topic operations.
#[derive(Debug, Clone)]
pub struct SnsTopics {
    provider: Arc<CredentialProvider>,
}

impl SnsTopics {
    pub fn new(provider: Arc<CredentialProvider>) -> Self {
        Self { provider }
    }

    async fn client(&self) -> Result<SnsClient> {
        Ok(self.provider.client::<SnsClient>().await?)
    }
}

#[async_trait]
impl TopicApi for SnsTopics {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let sns = self.client().await?;
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = sns
                .list_topics()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    BrokerError::Topic(format!("Failed to list SNS topics: {}", DisplayErrorContext(&e)))
                })?;

            arns.extend(
                output
                    .topics()
                    .iter()
                    .filter_map(|topic| topic.topic_arn().map(str::to_string)),
            );

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(arns)
    }

    async fn create_topic(&self, name: &str) -> Result<String> {
        let result = self
            .client()
            .await?
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|e| {
                BrokerError::Topic(format!("Failed to create SNS topic: {}", DisplayErrorContext(&e)))
            })?;

        let arn = result
            .topic_arn()
            .ok_or_else(|| BrokerError::Topic("SNS create_topic returned no ARN".to_string()))?
            .to_string();

        info!(topic = %name, arn = %arn, "Created SNS topic");
        Ok(arn)
    }

    async fn list_subscriptions(&self, topic_arn: &str) -> Result<Vec<Subscription>> {
        let sns = self.client().await?;
        let mut subscriptions = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = sns
                .list_subscriptions_by_topic()
                .topic_arn(topic_arn)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    BrokerError::Topic(format!(
                        "Failed to list subscriptions: {}",
                        DisplayErrorContext(&e)
                    ))
                })?;

            subscriptions.extend(output.subscriptions().iter().map(|sub| Subscription {
                subscription_arn: sub.subscription_arn().unwrap_or_default().to_string(),
                protocol: sub.protocol().unwrap_or_default().to_string(),
                endpoint: sub.endpoint().unwrap_or_default().to_string(),
            }));

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(subscriptions)
    }

    async fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String> {
        let result = self
            .client()
            .await?
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(protocol)
            .endpoint(endpoint)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| {
                BrokerError::Topic(format!(
                    "Failed to subscribe queue to topic: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let subscription_arn = result.subscription_arn().unwrap_or_default().to_string();
        debug!(endpoint = %endpoint, topic_arn = %topic_arn, "Subscribed endpoint to topic");
        Ok(subscription_arn)
    }

    async fn publish(&self, topic_arn: &str, message: &OutboundMessage) -> Result<String> {
        use aws_sdk_sns::types::MessageAttributeValue;

        let mut attrs = HashMap::new();
        for (key, value) in &message.attributes {
            attrs.insert(
                key.clone(),
                MessageAttributeValue::builder()
                    .data_type(STRING_DATA_TYPE)
                    .string_value(value)
                    .build()
                    .map_err(|e| BrokerError::Publish(format!("Failed to build attribute: {}", e)))?,
            );
        }

        let result = self
            .client()
            .await?
            .publish()
            .topic_arn(topic_arn)
            .message(&message.body)
            .set_subject(message.subject.clone())
            .set_message_attributes(Some(attrs))
            .send()
            .await
            .map_err(|e| {
                BrokerError::Publish(format!("Failed to publish to SNS: {}", DisplayErrorContext(&e)))
            })?;

        let message_id = result.message_id().unwrap_or_default().to_string();
        debug!(topic_arn = %topic_arn, message_id = %message_id, "Published message to SNS");
        Ok(message_id)
    }
}

/// SQS-backed queue operations.
#[derive(Debug, Clone)]
pub struct SqsQueues {
    provider: Arc<CredentialProvider>,
}

impl SqsQueues {
    pub fn new(provider: Arc<CredentialProvider>) -> Self {
        Self { provider }
    }

    async fn client(&self) -> Result<SqsClient> {
        Ok(self.provider.client::<SqsClient>().await?)
    }
}

fn attribute_name(attribute: QueueAttribute) -> QueueAttributeName {
    match attribute {
        QueueAttribute::QueueArn => QueueAttributeName::QueueArn,
        QueueAttribute::Policy => QueueAttributeName::Policy,
        QueueAttribute::RedrivePolicy => QueueAttributeName::RedrivePolicy,
        QueueAttribute::VisibilityTimeout => QueueAttributeName::VisibilityTimeout,
    }
}

fn to_sdk_attributes(
    attributes: &HashMap<QueueAttribute, String>,
) -> HashMap<QueueAttributeName, String> {
    attributes
        .iter()
        .map(|(name, value)| (attribute_name(*name), value.clone()))
        .collect()
}

#[async_trait]
impl QueueApi for SqsQueues {
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>> {
        let sqs = self.client().await?;
        let mut urls = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = sqs
                .list_queues()
                .queue_name_prefix(prefix)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    BrokerError::Queue(format!("Failed to list SQS queues: {}", DisplayErrorContext(&e)))
                })?;

            urls.extend(output.queue_urls().iter().cloned());

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(urls)
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<QueueAttribute, String>,
    ) -> Result<String> {
        let result = self
            .client()
            .await?
            .create_queue()
            .queue_name(name)
            .set_attributes(Some(to_sdk_attributes(attributes)))
            .send()
            .await
            .map_err(|e| {
                BrokerError::Queue(format!("Failed to create SQS queue: {}", DisplayErrorContext(&e)))
            })?;

        let url = result
            .queue_url()
            .ok_or_else(|| BrokerError::Queue("SQS create_queue returned no URL".to_string()))?
            .to_string();

        info!(queue = %name, url = %url, "Created SQS queue");
        Ok(url)
    }

    async fn get_attributes(
        &self,
        queue_url: &str,
        names: &[QueueAttribute],
    ) -> Result<HashMap<QueueAttribute, String>> {
        let output = self
            .client()
            .await?
            .get_queue_attributes()
            .queue_url(queue_url)
            .set_attribute_names(Some(names.iter().map(|n| attribute_name(*n)).collect()))
            .send()
            .await
            .map_err(|e| {
                BrokerError::Queue(format!(
                    "Failed to get queue attributes: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let mut found = HashMap::new();
        if let Some(attrs) = output.attributes() {
            for name in names {
                if let Some(value) = attrs.get(&attribute_name(*name)) {
                    found.insert(*name, value.clone());
                }
            }
        }
        Ok(found)
    }

    async fn set_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<QueueAttribute, String>,
    ) -> Result<()> {
        self.client()
            .await?
            .set_queue_attributes()
            .queue_url(queue_url)
            .set_attributes(Some(to_sdk_attributes(&attributes)))
            .send()
            .await
            .map_err(|e| {
                BrokerError::Queue(format!(
                    "Failed to set queue attributes: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        let output = self
            .client()
            .await?
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(options.max_messages)
            .wait_time_seconds(options.wait_time_secs)
            .visibility_timeout(options.visibility_timeout_secs)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| {
                BrokerError::Receive(format!(
                    "Failed to receive messages from SQS: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let receipt_handle = message.receipt_handle()?.to_string();
                let attributes = message
                    .message_attributes()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .filter_map(|(k, v)| Some((k.clone(), v.string_value()?.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(ReceivedMessage {
                    message_id: message.message_id().unwrap_or_default().to_string(),
                    receipt_handle,
                    body: message.body().unwrap_or_default().to_string(),
                    attributes,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete_batch(
        &self,
        queue_url: &str,
        entries: &[DeleteEntry],
    ) -> Result<DeleteOutcome> {
        if entries.is_empty() {
            return Ok(DeleteOutcome::default());
        }

        let sdk_entries = entries
            .iter()
            .map(|entry| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(&entry.id)
                    .receipt_handle(&entry.receipt_handle)
                    .build()
                    .map_err(|e| {
                        BrokerError::Acknowledge(format!("Failed to build delete entry: {}", e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client()
            .await?
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(sdk_entries))
            .send()
            .await
            .map_err(|e| {
                BrokerError::Acknowledge(format!(
                    "Failed to delete message batch: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(DeleteOutcome {
            deleted: output
                .successful()
                .iter()
                .map(|entry| entry.id().to_string())
                .collect(),
            failed: output
                .failed()
                .iter()
                .map(|entry| FailedDelete {
                    id: entry.id().to_string(),
                    code: entry.code().to_string(),
                    message: entry.message().unwrap_or_default().to_string(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_mapping() {
        assert_eq!(
            attribute_name(QueueAttribute::RedrivePolicy),
            QueueAttributeName::RedrivePolicy
        );
        assert_eq!(attribute_name(QueueAttribute::Policy), QueueAttributeName::Policy);
        assert_eq!(attribute_name(QueueAttribute::QueueArn), QueueAttributeName::QueueArn);
    }

    #[test]
    fn test_sdk_attribute_conversion() {
        let mut attrs = HashMap::new();
        attrs.insert(QueueAttribute::VisibilityTimeout, "30".to_string());
        let converted = to_sdk_attributes(&attrs);
        assert_eq!(
            converted.get(&QueueAttributeName::VisibilityTimeout),
            Some(&"30".to_string())
        );
    }

    #[tokio::test]
    async fn test_adapters_build_against_emulator_provider() {
        let provider = Arc::new(CredentialProvider::local_emulator(
            "us-east-1",
            "http://localhost:4566",
        ));
        let topics = SnsTopics::new(Arc::clone(&provider));
        let queues = SqsQueues::new(provider);
        assert!(topics.client().await.is_ok());
        assert!(queues.client().await.is_ok());
    }
}
