//! Topic producer.
//!
//! Publishing and pacing are separate: [`PacingPolicy`] decides how long to
//! wait between messages (fixed interval plus bounded random jitter) and
//! [`Pacer`] enforces it, so the rate can be tested without a broker.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::broker::{BrokerError, OutboundMessage, TopicApi};

/// Minimum spacing between two publishes and the random extra on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub min_interval: Duration,
    pub max_jitter: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            max_jitter: Duration::from_millis(4000),
        }
    }
}

impl PacingPolicy {
    /// No waiting at all.
    pub fn unpaced() -> Self {
        Self {
            min_interval: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self {
            min_interval: interval,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before the next publish, within `min_interval..=min_interval + max_jitter`.
    pub fn next_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.min_interval;
        }
        self.min_interval + Duration::from_millis(rng.random_range(0..=jitter_ms))
    }
}

/// Enforces a [`PacingPolicy`] across successive calls.
pub struct Pacer {
    policy: PacingPolicy,
    rng: StdRng,
    next_slot: Option<Instant>,
}

impl Pacer {
    pub fn new(policy: PacingPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_os_rng())
    }

    pub fn with_rng(policy: PacingPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            rng,
            next_slot: None,
        }
    }

    /// Wait for the next slot. The first call returns immediately.
    pub async fn wait(&mut self) {
        if let Some(slot) = self.next_slot {
            tokio::time::sleep_until(slot).await;
        }
        let delay = self.policy.next_delay(&mut self.rng);
        self.next_slot = Some(Instant::now() + delay);
    }
}

/// Publish counts of a producer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub published: usize,
    pub message_ids: Vec<String>,
}

/// Publishes messages to one topic at a bounded rate.
pub struct ProducerLoop {
    topics: Arc<dyn TopicApi>,
    topic_arn: String,
    pacer: Pacer,
}

impl ProducerLoop {
    pub fn new(topics: Arc<dyn TopicApi>, topic_arn: impl Into<String>, pacer: Pacer) -> Self {
        Self {
            topics,
            topic_arn: topic_arn.into(),
            pacer,
        }
    }

    /// Publish one message after waiting for its slot.
    pub async fn publish(&mut self, message: &OutboundMessage) -> Result<String, BrokerError> {
        self.pacer.wait().await;
        let message_id = self.topics.publish(&self.topic_arn, message).await?;
        debug!(topic = %self.topic_arn, message_id = %message_id, "Published");
        Ok(message_id)
    }

    /// Publish every message in order. Stops at the first failure; nothing is
    /// retried.
    pub async fn publish_all<I>(&mut self, messages: I) -> Result<ProducerSummary, BrokerError>
    where
        I: IntoIterator<Item = OutboundMessage>,
    {
        let mut summary = ProducerSummary::default();
        for message in messages {
            match self.publish(&message).await {
                Ok(id) => {
                    summary.published += 1;
                    summary.message_ids.push(id);
                }
                Err(e) => {
                    error!(
                        topic = %self.topic_arn,
                        published = summary.published,
                        error = %e,
                        "Publish failed"
                    );
                    return Err(e);
                }
            }
        }
        info!(topic = %self.topic_arn, published = summary.published, "Producer finished");
        Ok(summary)
    }
}

/// Numbered demo messages: `"{prefix} {n}"` for n in `1..=count`.
pub fn numbered_messages<'a>(
    count: usize,
    prefix: &'a str,
    subject: Option<&str>,
) -> impl Iterator<Item = OutboundMessage> + 'a {
    let subject = subject.map(str::to_string);
    (1..=count).map(move |n| {
        let message = OutboundMessage::new(format!("{} {}", prefix, n))
            .with_attribute("sequence", n.to_string());
        match &subject {
            Some(subject) => message.with_subject(subject.clone()),
            None => message,
        }
    })
}
