//! sqsink-consumer: queue to store relay
//!
//! Provisions the topic, queue and dead-letter queue, creates the entity's
//! table if needed, then consumes the queue until a shutdown signal.
//!
//! ## Architecture
//! ```text
//! [SNS topic] --> [SQS queue] --(receive)--> [sqsink-consumer] --(insert)--> [Postgres]
//!                      |                           |
//!                      v                           +--(delete after commit)--> [SQS queue]
//!                 [dlq-<queue>]
//! ```
//!
//! ## Configuration
//! - SQSINK_CONFIG: Path to a YAML config file (optional)
//! - SQSINK__*: Overrides for any setting, e.g. SQSINK__STORE__URI
//! - SQSINK_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::info;

use sqsink::broker::{QueueApi, SnsTopics, SqsQueues, TopicApi};
use sqsink::config::Config;
use sqsink::consumer::ConsumerLoop;
use sqsink::credentials::CredentialRegistry;
use sqsink::persist::{Persister, PostgresPersister};
use sqsink::topology::TopologyProvisioner;
use sqsink::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal, ConnectRetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    config.validate()?;
    let entity = config.store.entity()?;

    let provider = config
        .identity
        .credential_provider(CredentialRegistry::global())
        .await?;
    let topics: Arc<dyn TopicApi> = Arc::new(SnsTopics::new(provider.clone()));
    let queues: Arc<dyn QueueApi> = Arc::new(SqsQueues::new(provider));

    let provisioner =
        TopologyProvisioner::new(topics, queues.clone(), config.topology_settings());
    let topology = provisioner
        .ensure_topology(config.topology.topic_name()?, config.topology.queue_name()?)
        .await?;

    let uri = config.store.uri()?;
    let persister = connect_with_retry("postgres", ConnectRetry::default(), || {
        PostgresPersister::connect(uri)
    })
    .await?;
    persister.ensure_table(&entity.table).await?;
    let persister: Arc<dyn Persister> = Arc::new(persister);

    let mut consumer = ConsumerLoop::new(
        queues,
        persister,
        entity,
        config.consumer.settings(&topology.queue.url),
    );

    let stop = consumer.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.stop();
    });

    info!(
        topic = %topology.topic.arn,
        queue = %topology.queue.url,
        dead_letter = %topology.dead_letter.arn,
        "sqsink-consumer started"
    );
    consumer.run().await?;
    info!("sqsink-consumer stopped");
    Ok(())
}
