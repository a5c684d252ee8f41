//! sqsink-producer: paced demo publisher
//!
//! Ensures the topic exists and publishes `producer.message_count` numbered
//! messages to it, waiting `min_interval_ms` plus up to `max_jitter_ms`
//! between publishes. Exits non-zero on the first failed publish.
//!
//! ## Configuration
//! - SQSINK_CONFIG: Path to a YAML config file (optional)
//! - SQSINK__PRODUCER__MESSAGE_COUNT: Number of messages (default: 20)
//! - SQSINK_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::info;

use sqsink::broker::{SnsTopics, TopicApi};
use sqsink::config::Config;
use sqsink::credentials::CredentialRegistry;
use sqsink::producer::{numbered_messages, Pacer, ProducerLoop};
use sqsink::topology::TopicManager;
use sqsink::utils::bootstrap::init_tracing;

const MESSAGE_PREFIX: &str = "Test message number:";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    config.validate()?;

    let provider = config
        .identity
        .credential_provider(CredentialRegistry::global())
        .await?;
    let topics: Arc<dyn TopicApi> = Arc::new(SnsTopics::new(provider));
    let topic = TopicManager::new(topics.clone())
        .ensure(config.topology.topic_name()?)
        .await?;

    let producer_config = &config.producer;
    let mut producer = ProducerLoop::new(topics, &topic.arn, Pacer::new(producer_config.pacing()));
    let summary = producer
        .publish_all(numbered_messages(
            producer_config.message_count,
            MESSAGE_PREFIX,
            producer_config.subject.as_deref(),
        ))
        .await?;

    info!(topic = %topic.arn, published = summary.published, "sqsink-producer finished");
    Ok(())
}
