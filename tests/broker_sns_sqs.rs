//! SNS/SQS adapter integration tests using testcontainers.
//!
//! Run with: cargo test --test broker_sns_sqs --features container-tests -- --nocapture
//!
//! Uses LocalStack to emulate SNS/SQS. Tests share a single container and
//! use distinct topic and queue names.

#![cfg(feature = "container-tests")]

use std::sync::Arc;
use std::time::Duration;

use sqsink::broker::{
    OutboundMessage, QueueApi, QueueAttribute, ReceiveOptions, SnsTopics, SqsQueues, TopicApi,
};
use sqsink::consumer::{ConsumerLoop, ConsumerSettings};
use sqsink::credentials::CredentialProvider;
use sqsink::entity::simple_message;
use sqsink::persist::{MockPersister, Persister};
use sqsink::topology::{AccessPolicy, RedrivePolicy, TopologyProvisioner, TopologySettings};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tokio::sync::OnceCell;

static LOCALSTACK: OnceCell<(ContainerAsync<GenericImage>, String)> = OnceCell::const_new();

/// Endpoint of the shared LocalStack container.
async fn localstack_endpoint() -> String {
    let (_, endpoint) = LOCALSTACK
        .get_or_init(|| async {
            let container = GenericImage::new("localstack/localstack", "latest")
                .with_exposed_port(4566.tcp())
                .with_wait_for(WaitFor::message_on_stdout("Ready."))
                .with_env_var("SERVICES", "sns,sqs")
                .with_env_var("AWS_DEFAULT_REGION", "us-east-1")
                .with_env_var("EAGER_SERVICE_LOADING", "1")
                .with_env_var("SKIP_INFRA_DOWNLOADS", "1")
                .with_env_var("LOCALSTACK_HOST", "localhost")
                .with_startup_timeout(Duration::from_secs(180))
                .start()
                .await
                .expect("Failed to start localstack container");

            // SNS/SQS need a moment after the ready banner.
            tokio::time::sleep(Duration::from_secs(5)).await;

            let port = container
                .get_host_port_ipv4(4566)
                .await
                .expect("Failed to get mapped port");
            let host = container
                .get_host()
                .await
                .expect("Failed to get container host");
            let endpoint = format!("http://{}:{}", host, port);
            println!("LocalStack available at: {}", endpoint);
            (container, endpoint)
        })
        .await;
    endpoint.clone()
}

struct Adapters {
    topics: Arc<SnsTopics>,
    queues: Arc<SqsQueues>,
}

async fn adapters() -> Adapters {
    let provider = Arc::new(CredentialProvider::local_emulator(
        "us-east-1",
        localstack_endpoint().await,
    ));
    Adapters {
        topics: Arc::new(SnsTopics::new(provider.clone())),
        queues: Arc::new(SqsQueues::new(provider)),
    }
}

fn provisioner(adapters: &Adapters) -> TopologyProvisioner {
    TopologyProvisioner::new(
        adapters.topics.clone(),
        adapters.queues.clone(),
        TopologySettings {
            max_receive_count: 2,
            visibility_timeout_secs: Some(2),
        },
    )
}

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    let adapters = adapters().await;
    let first = provisioner(&adapters)
        .ensure_topology("idem-topic", "idem-queue")
        .await
        .unwrap();
    let second = provisioner(&adapters)
        .ensure_topology("idem-topic", "idem-queue")
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.dead_letter.name, "dlq-idem-queue");

    let subscriptions = adapters
        .topics
        .list_subscriptions(&first.topic.arn)
        .await
        .unwrap();
    assert_eq!(
        subscriptions
            .iter()
            .filter(|s| s.endpoint == first.queue.arn)
            .count(),
        1
    );

    let attributes = adapters
        .queues
        .get_attributes(
            &first.queue.url,
            &[QueueAttribute::Policy, QueueAttribute::RedrivePolicy],
        )
        .await
        .unwrap();
    let policy = AccessPolicy::parse(
        &first.queue.url,
        attributes.get(&QueueAttribute::Policy).unwrap(),
    )
    .unwrap();
    assert_eq!(policy.statements.len(), 1);
    let redrive = RedrivePolicy::parse(
        &first.queue.url,
        attributes.get(&QueueAttribute::RedrivePolicy).unwrap(),
    )
    .unwrap();
    assert_eq!(redrive.dead_letter_target_arn, first.dead_letter.arn);
    assert_eq!(redrive.max_receive_count, 2);
}

#[tokio::test]
async fn test_published_messages_are_persisted_and_deleted() {
    let adapters = adapters().await;
    let topology = provisioner(&adapters)
        .ensure_topology("relay-topic", "relay-queue")
        .await
        .unwrap();

    for n in 1..=5 {
        adapters
            .topics
            .publish(
                &topology.topic.arn,
                &OutboundMessage::new(format!("Test message number: {}", n))
                    .with_subject("Test Subject"),
            )
            .await
            .unwrap();
    }

    let entity = simple_message();
    let persister = Arc::new(MockPersister::new());
    persister.ensure_table(&entity.table).await.unwrap();

    let mut settings = ConsumerSettings::new(&topology.queue.url);
    settings.polling_interval = Duration::from_millis(100);
    settings.receive = ReceiveOptions {
        max_messages: 10,
        wait_time_secs: 1,
        visibility_timeout_secs: 30,
    };
    let mut consumer = ConsumerLoop::new(
        adapters.queues.clone(),
        persister.clone(),
        entity.clone(),
        settings,
    );
    let summary = consumer.run_bounded(5, 30).await.unwrap();
    assert_eq!(summary.acknowledged, 5);
    assert_eq!(persister.count(&entity.table).await.unwrap(), 5);

    let leftover = adapters
        .queues
        .receive(
            &topology.queue.url,
            &ReceiveOptions {
                max_messages: 10,
                wait_time_secs: 1,
                visibility_timeout_secs: 0,
            },
        )
        .await
        .unwrap();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn test_unacknowledged_message_returns_after_visibility_timeout() {
    let adapters = adapters().await;
    let topology = provisioner(&adapters)
        .ensure_topology("visibility-topic", "visibility-queue")
        .await
        .unwrap();
    adapters
        .topics
        .publish(&topology.topic.arn, &OutboundMessage::new("retry me"))
        .await
        .unwrap();

    let options = ReceiveOptions {
        max_messages: 1,
        wait_time_secs: 5,
        visibility_timeout_secs: 2,
    };
    let first = adapters
        .queues
        .receive(&topology.queue.url, &options)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    let hidden = adapters
        .queues
        .receive(
            &topology.queue.url,
            &ReceiveOptions {
                wait_time_secs: 0,
                ..options
            },
        )
        .await
        .unwrap();
    assert!(hidden.is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let again = adapters
        .queues
        .receive(&topology.queue.url, &options)
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, first[0].message_id);
}
