//! In-memory broker for testing and local development.
//!
//! Models the parts of SNS/SQS the relay depends on: topic fan-out to
//! subscribed queues (gated by the queue's access policy), per-delivery
//! receipt handles, visibility timeouts, and redrive to a dead-letter queue
//! once `maxReceiveCount` is exceeded. Time comes from `tokio::time`, so
//! tests can pause the clock and advance past visibility timeouts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    BrokerError, DeleteEntry, DeleteOutcome, FailedDelete, OutboundMessage, QueueApi,
    QueueAttribute, ReceiveOptions, ReceivedMessage, Result, Subscription, TopicApi,
    MAX_DELETE_BATCH, QUEUE_PROTOCOL,
};

const REGION: &str = "us-east-1";
const ACCOUNT: &str = "000000000000";
const ENDPOINT: &str = "http://localhost:4566";

/// Number of calls made per operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub list_topics: usize,
    pub create_topic: usize,
    pub subscribe: usize,
    pub publish: usize,
    pub list_queues: usize,
    pub create_queue: usize,
    pub get_attributes: usize,
    pub set_attributes: usize,
    pub receive: usize,
    pub delete_batch: usize,
}

impl MockCalls {
    /// Calls that create or modify broker state.
    pub fn writes(&self) -> usize {
        self.create_topic + self.subscribe + self.create_queue + self.set_attributes
    }
}

struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt_handle: Option<String>,
}

struct QueueState {
    name: String,
    arn: String,
    attributes: HashMap<QueueAttribute, String>,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct TopicState {
    subscriptions: Vec<Subscription>,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicState>,
    queues: BTreeMap<String, QueueState>,
    calls: MockCalls,
    fail_receive: bool,
    fail_next_deletes: usize,
}

/// In-memory SNS/SQS stand-in.
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every receive fail until reset.
    pub fn set_fail_receive(&self, fail: bool) {
        self.lock().fail_receive = fail;
    }

    /// Refuse the next `count` delete entries (reported as failed entries).
    pub fn fail_next_deletes(&self, count: usize) {
        self.lock().fail_next_deletes = count;
    }

    /// Snapshot of call counters.
    pub fn calls(&self) -> MockCalls {
        self.lock().calls.clone()
    }

    /// Messages stored in a queue, visible or in flight.
    pub fn queue_depth(&self, queue_url: &str) -> usize {
        self.lock()
            .queues
            .get(queue_url)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages currently hidden by a visibility timeout.
    pub fn in_flight(&self, queue_url: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue_url)
            .map(|q| {
                q.messages
                    .iter()
                    .filter(|m| m.invisible_until.is_some_and(|until| until > now))
                    .count()
            })
            .unwrap_or(0)
    }

    /// URL of a queue by exact name.
    pub fn queue_url(&self, name: &str) -> Option<String> {
        self.lock()
            .queues
            .iter()
            .find(|(_, q)| q.name == name)
            .map(|(url, _)| url.clone())
    }

    /// Enqueue a raw body directly, bypassing any topic.
    pub fn send_raw(&self, queue_url: &str, body: impl Into<String>) -> Result<String> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| BrokerError::Queue(format!("NonExistentQueue: {}", queue_url)))?;
        let message_id = Uuid::new_v4().to_string();
        queue.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            attributes: HashMap::new(),
            receive_count: 0,
            invisible_until: None,
            receipt_handle: None,
        });
        Ok(message_id)
    }
}

/// True when the queue policy lets `topic_arn` send messages.
fn policy_allows(policy: Option<&String>, topic_arn: &str) -> bool {
    let Some(policy) = policy else {
        return false;
    };
    let Ok(doc) = serde_json::from_str::<Value>(policy) else {
        return false;
    };
    let statements = match doc.get("Statement") {
        Some(Value::Array(items)) => items.clone(),
        Some(single @ Value::Object(_)) => vec![single.clone()],
        _ => return false,
    };
    statements.iter().any(|statement| {
        statement.get("Effect").and_then(Value::as_str) == Some("Allow")
            && statement
                .pointer("/Condition/ArnEquals/aws:SourceArn")
                .and_then(Value::as_str)
                == Some(topic_arn)
    })
}

/// Dead-letter target and threshold from a redrive policy document.
fn redrive_target(policy: Option<&String>) -> Option<(String, u32)> {
    let doc: Value = serde_json::from_str(policy?).ok()?;
    let target = doc.get("deadLetterTargetArn")?.as_str()?.to_string();
    let max = match doc.get("maxReceiveCount")? {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => u32::try_from(n.as_u64()?).ok()?,
        _ => return None,
    };
    Some((target, max))
}

fn notification_body(message_id: &str, topic_arn: &str, message: &OutboundMessage) -> String {
    let attributes: serde_json::Map<String, Value> = message
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), json!({ "Type": "String", "Value": v })))
        .collect();
    json!({
        "Type": "Notification",
        "MessageId": message_id,
        "TopicArn": topic_arn,
        "Subject": message.subject,
        "Message": message.body,
        "Timestamp": Utc::now().to_rfc3339(),
        "MessageAttributes": attributes,
    })
    .to_string()
}

#[async_trait]
impl TopicApi for MockBroker {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.list_topics += 1;
        Ok(state.topics.keys().cloned().collect())
    }

    async fn create_topic(&self, name: &str) -> Result<String> {
        let mut state = self.lock();
        state.calls.create_topic += 1;
        let arn = format!("arn:aws:sns:{}:{}:{}", REGION, ACCOUNT, name);
        state.topics.entry(arn.clone()).or_default();
        Ok(arn)
    }

    async fn list_subscriptions(&self, topic_arn: &str) -> Result<Vec<Subscription>> {
        let state = self.lock();
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| BrokerError::Topic(format!("NotFound: {}", topic_arn)))?;
        Ok(topic.subscriptions.clone())
    }

    async fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String> {
        let mut state = self.lock();
        state.calls.subscribe += 1;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| BrokerError::Topic(format!("NotFound: {}", topic_arn)))?;
        if let Some(existing) = topic
            .subscriptions
            .iter()
            .find(|s| s.protocol == protocol && s.endpoint == endpoint)
        {
            return Ok(existing.subscription_arn.clone());
        }
        let subscription_arn = format!("{}:{}", topic_arn, Uuid::new_v4());
        topic.subscriptions.push(Subscription {
            subscription_arn: subscription_arn.clone(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(subscription_arn)
    }

    async fn publish(&self, topic_arn: &str, message: &OutboundMessage) -> Result<String> {
        let mut state = self.lock();
        state.calls.publish += 1;
        let endpoints: Vec<String> = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| BrokerError::Publish(format!("NotFound: {}", topic_arn)))?
            .subscriptions
            .iter()
            .filter(|s| s.protocol == QUEUE_PROTOCOL)
            .map(|s| s.endpoint.clone())
            .collect();

        let message_id = Uuid::new_v4().to_string();
        let body = notification_body(&message_id, topic_arn, message);
        for queue in state.queues.values_mut() {
            if endpoints.contains(&queue.arn)
                && policy_allows(queue.attributes.get(&QueueAttribute::Policy), topic_arn)
            {
                queue.messages.push(StoredMessage {
                    message_id: Uuid::new_v4().to_string(),
                    body: body.clone(),
                    attributes: message.attributes.clone(),
                    receive_count: 0,
                    invisible_until: None,
                    receipt_handle: None,
                });
            }
        }
        Ok(message_id)
    }
}

#[async_trait]
impl QueueApi for MockBroker {
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.list_queues += 1;
        Ok(state
            .queues
            .iter()
            .filter(|(_, q)| q.name.starts_with(prefix))
            .map(|(url, _)| url.clone())
            .collect())
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<QueueAttribute, String>,
    ) -> Result<String> {
        let mut state = self.lock();
        state.calls.create_queue += 1;
        let url = format!("{}/{}/{}", ENDPOINT, ACCOUNT, name);
        state.queues.entry(url.clone()).or_insert_with(|| {
            let mut attrs = attributes.clone();
            attrs
                .entry(QueueAttribute::VisibilityTimeout)
                .or_insert_with(|| "30".to_string());
            QueueState {
                name: name.to_string(),
                arn: format!("arn:aws:sqs:{}:{}:{}", REGION, ACCOUNT, name),
                attributes: attrs,
                messages: Vec::new(),
            }
        });
        Ok(url)
    }

    async fn get_attributes(
        &self,
        queue_url: &str,
        names: &[QueueAttribute],
    ) -> Result<HashMap<QueueAttribute, String>> {
        let mut state = self.lock();
        state.calls.get_attributes += 1;
        let queue = state
            .queues
            .get(queue_url)
            .ok_or_else(|| BrokerError::Queue(format!("NonExistentQueue: {}", queue_url)))?;
        let mut found = HashMap::new();
        for name in names {
            let value = match name {
                QueueAttribute::QueueArn => Some(queue.arn.clone()),
                other => queue.attributes.get(other).cloned(),
            };
            if let Some(value) = value {
                found.insert(*name, value);
            }
        }
        Ok(found)
    }

    async fn set_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<QueueAttribute, String>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.calls.set_attributes += 1;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| BrokerError::Queue(format!("NonExistentQueue: {}", queue_url)))?;
        queue.attributes.extend(attributes);
        Ok(())
    }

    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        let mut state = self.lock();
        state.calls.receive += 1;
        if state.fail_receive {
            return Err(BrokerError::Receive("Mock receive failure".to_string()));
        }

        let now = Instant::now();
        let visibility = Duration::from_secs(u64::try_from(options.visibility_timeout_secs).unwrap_or(0));
        let limit = usize::try_from(options.max_messages).unwrap_or(0);

        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| BrokerError::Receive(format!("NonExistentQueue: {}", queue_url)))?;
        let redrive = redrive_target(queue.attributes.get(&QueueAttribute::RedrivePolicy));

        let mut delivered = Vec::new();
        let mut dead_lettered = Vec::new();
        let mut index = 0;
        while index < queue.messages.len() && delivered.len() < limit {
            let message = &mut queue.messages[index];
            if message.invisible_until.is_some_and(|until| until > now) {
                index += 1;
                continue;
            }
            message.receive_count += 1;
            if let Some((_, max)) = &redrive {
                if message.receive_count > *max {
                    dead_lettered.push(queue.messages.remove(index));
                    continue;
                }
            }
            let receipt = Uuid::new_v4().to_string();
            message.invisible_until = Some(now + visibility);
            message.receipt_handle = Some(receipt.clone());
            delivered.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                receipt_handle: receipt,
                body: message.body.clone(),
                attributes: message.attributes.clone(),
            });
            index += 1;
        }

        if let Some((dlq_arn, _)) = redrive {
            if let Some(dlq) = state.queues.values_mut().find(|q| q.arn == dlq_arn) {
                for mut message in dead_lettered {
                    message.receive_count = 0;
                    message.invisible_until = None;
                    message.receipt_handle = None;
                    dlq.messages.push(message);
                }
            }
        }

        Ok(delivered)
    }

    async fn delete_batch(
        &self,
        queue_url: &str,
        entries: &[DeleteEntry],
    ) -> Result<DeleteOutcome> {
        let mut state = self.lock();
        state.calls.delete_batch += 1;
        if entries.len() > MAX_DELETE_BATCH {
            return Err(BrokerError::Acknowledge(format!(
                "TooManyEntriesInBatchRequest: {}",
                entries.len()
            )));
        }

        let mut outcome = DeleteOutcome::default();
        for entry in entries {
            if state.fail_next_deletes > 0 {
                state.fail_next_deletes -= 1;
                outcome.failed.push(FailedDelete {
                    id: entry.id.clone(),
                    code: "InternalError".to_string(),
                    message: "Mock delete failure".to_string(),
                });
                continue;
            }
            let queue = state
                .queues
                .get_mut(queue_url)
                .ok_or_else(|| BrokerError::Acknowledge(format!("NonExistentQueue: {}", queue_url)))?;
            let position = queue
                .messages
                .iter()
                .position(|m| m.receipt_handle.as_deref() == Some(entry.receipt_handle.as_str()));
            match position {
                Some(position) => {
                    queue.messages.remove(position);
                    outcome.deleted.push(entry.id.clone());
                }
                None => outcome.failed.push(FailedDelete {
                    id: entry.id.clone(),
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: "The receipt handle is no longer valid".to_string(),
                }),
            }
        }
        Ok(outcome)
    }
}
