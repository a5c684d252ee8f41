//! Queue consumer.
//!
//! One iteration: long-poll receive, transform each message, persist the
//! batch in one call, then delete exactly the messages that call covered.
//! Deletion only happens after the persist call succeeded; a failed persist
//! leaves every message to reappear after its visibility timeout.
//!
//! Iterations are strictly sequential, so at most one batch is ever in
//! flight. Any receive, persist or delete-call error stops the loop; restart
//! is left to the process supervisor.
//!
//! Messages that cannot be transformed are logged and deleted with the batch
//! so they cannot loop forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, DeleteEntry, QueueApi, ReceiveOptions, MAX_DELETE_BATCH};
use crate::entity::EntityDescriptor;
use crate::persist::{PersistError, PersistableRecord, Persister};

/// Result type for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors that stop the consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Persist error: {0}")]
    Persist(#[from] PersistError),

    #[error("Consumer for {0} is stopped")]
    Stopped(String),
}

/// Loop parameters.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue_url: String,
    /// Pause between iterations.
    pub polling_interval: Duration,
    pub receive: ReceiveOptions,
}

impl ConsumerSettings {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            polling_interval: Duration::from_secs(1),
            receive: ReceiveOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    /// Terminal.
    Stopped,
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub received: usize,
    /// Records submitted to the persister.
    pub persisted: usize,
    /// Rows the persister reports as written.
    pub written: u64,
    /// Messages skipped because they could not be transformed.
    pub malformed: usize,
    pub acknowledged: usize,
    /// Deletes refused by the broker; those messages will be redelivered.
    pub ack_failed: usize,
}

/// Totals of a bounded run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub polls: usize,
    pub acknowledged: usize,
}

/// Requests a stop between iterations. Never interrupts a call in flight.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receive, persist, acknowledge, sleep.
pub struct ConsumerLoop {
    queues: Arc<dyn QueueApi>,
    persister: Arc<dyn Persister>,
    entity: EntityDescriptor,
    settings: ConsumerSettings,
    state: ConsumerState,
    stop: StopHandle,
}

impl ConsumerLoop {
    pub fn new(
        queues: Arc<dyn QueueApi>,
        persister: Arc<dyn Persister>,
        entity: EntityDescriptor,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queues,
            persister,
            entity,
            settings,
            state: ConsumerState::Running,
            stop: StopHandle::default(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            ConsumerState::Running => Ok(()),
            ConsumerState::Stopped => Err(ConsumerError::Stopped(self.settings.queue_url.clone())),
        }
    }

    /// Run one iteration without sleeping. A stopped loop refuses to run.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        self.ensure_running()?;
        match self.iterate().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.state = ConsumerState::Stopped;
                error!(queue_url = %self.settings.queue_url, error = %e, "Consumer stopped");
                Err(e)
            }
        }
    }

    /// Iterate until stopped or until an error occurs.
    pub async fn run(&mut self) -> Result<()> {
        self.ensure_running()?;
        info!(
            queue_url = %self.settings.queue_url,
            entity = %self.entity.name,
            strategy = %self.entity.strategy,
            "Consumer running"
        );
        while self.state == ConsumerState::Running {
            if self.stop.is_stopped() {
                self.state = ConsumerState::Stopped;
                info!(queue_url = %self.settings.queue_url, "Consumer stop requested");
                break;
            }
            self.poll_once().await?;
            tokio::time::sleep(self.settings.polling_interval).await;
        }
        Ok(())
    }

    /// Iterate until `target_acks` messages were acknowledged or `max_polls`
    /// iterations have run, whichever comes first.
    pub async fn run_bounded(&mut self, target_acks: usize, max_polls: usize) -> Result<RunSummary> {
        self.ensure_running()?;
        let mut summary = RunSummary::default();
        while summary.acknowledged < target_acks
            && summary.polls < max_polls
            && !self.stop.is_stopped()
        {
            let outcome = self.poll_once().await?;
            summary.polls += 1;
            summary.acknowledged += outcome.acknowledged;
            if summary.acknowledged < target_acks {
                tokio::time::sleep(self.settings.polling_interval).await;
            }
        }
        if self.stop.is_stopped() {
            self.state = ConsumerState::Stopped;
        }
        info!(
            polls = summary.polls,
            acknowledged = summary.acknowledged,
            target_acks,
            "Bounded run finished"
        );
        Ok(summary)
    }

    async fn iterate(&self) -> Result<PollOutcome> {
        let queue_url = self.settings.queue_url.as_str();
        let messages = self.queues.receive(queue_url, &self.settings.receive).await?;

        let mut outcome = PollOutcome {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            debug!(queue_url = %queue_url, "No messages");
            return Ok(outcome);
        }

        let now = Utc::now();
        let mut records: Vec<PersistableRecord> = Vec::with_capacity(messages.len());
        let mut receipts = Vec::with_capacity(messages.len());
        for message in &messages {
            match self.entity.apply(message, now) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        queue_url = %queue_url,
                        message_id = %message.message_id,
                        error = %e,
                        "Skipping malformed message"
                    );
                    outcome.malformed += 1;
                }
            }
            receipts.push(message.receipt_handle.clone());
        }

        if !records.is_empty() {
            outcome.written = self
                .persister
                .insert_batch(&self.entity.table, &records, self.entity.strategy)
                .await?;
            outcome.persisted = records.len();
        }

        let (acknowledged, failed) = self.acknowledge(&receipts).await?;
        outcome.acknowledged = acknowledged;
        outcome.ack_failed = failed;

        debug!(
            queue_url = %queue_url,
            received = outcome.received,
            written = outcome.written,
            malformed = outcome.malformed,
            acknowledged = outcome.acknowledged,
            "Batch done"
        );
        Ok(outcome)
    }

    /// Delete `receipts` in broker-sized chunks. Refused entries are logged
    /// and left for redelivery.
    async fn acknowledge(&self, receipts: &[String]) -> Result<(usize, usize)> {
        let mut acknowledged = 0;
        let mut failed = 0;
        for chunk in receipts.chunks(MAX_DELETE_BATCH) {
            let entries: Vec<DeleteEntry> = chunk
                .iter()
                .enumerate()
                .map(|(i, receipt)| DeleteEntry {
                    id: i.to_string(),
                    receipt_handle: receipt.clone(),
                })
                .collect();

            let result = self
                .queues
                .delete_batch(&self.settings.queue_url, &entries)
                .await?;
            for refused in &result.failed {
                warn!(
                    queue_url = %self.settings.queue_url,
                    entry = %refused.id,
                    code = %refused.code,
                    reason = %refused.message,
                    "Delete refused; message will be redelivered"
                );
            }
            acknowledged += result.deleted.len();
            failed += result.failed.len();
        }
        Ok((acknowledged, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, OutboundMessage, TopicApi};
    use crate::entity::simple_message;
    use crate::persist::MockPersister;
    use crate::topology::{Topology, TopologyProvisioner, TopologySettings};

    struct Harness {
        broker: Arc<MockBroker>,
        persister: Arc<MockPersister>,
        topology: Topology,
    }

    impl Harness {
        async fn new() -> Self {
            let broker = Arc::new(MockBroker::new());
            let topology = TopologyProvisioner::new(
                broker.clone(),
                broker.clone(),
                TopologySettings::default(),
            )
            .ensure_topology("events", "events-queue")
            .await
            .unwrap();
            let persister = Arc::new(MockPersister::new());
            persister.ensure_table(&simple_message().table).await.unwrap();
            Self {
                broker,
                persister,
                topology,
            }
        }

        async fn publish(&self, count: usize) {
            for i in 0..count {
                self.broker
                    .publish(
                        &self.topology.topic.arn,
                        &OutboundMessage::new(format!("message {}", i)),
                    )
                    .await
                    .unwrap();
            }
        }

        fn consumer(&self) -> ConsumerLoop {
            ConsumerLoop::new(
                self.broker.clone(),
                self.persister.clone(),
                simple_message(),
                ConsumerSettings::new(&self.topology.queue.url),
            )
        }

        async fn rows(&self) -> u64 {
            self.persister.count(&simple_message().table).await.unwrap()
        }

        fn depth(&self) -> usize {
            self.broker.queue_depth(&self.topology.queue.url)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_persists_then_acknowledges() {
        let h = Harness::new().await;
        h.publish(3).await;

        let outcome = h.consumer().poll_once().await.unwrap();
        assert_eq!(outcome.received, 3);
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.acknowledged, 3);
        assert_eq!(h.rows().await, 3);
        assert_eq!(h.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_does_no_work() {
        let h = Harness::new().await;
        let outcome = h.consumer().poll_once().await.unwrap();
        assert_eq!(outcome, PollOutcome::default());
        assert_eq!(h.persister.insert_calls().await, 0);
        assert_eq!(h.broker.calls().delete_batch, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failure_deletes_nothing() {
        let h = Harness::new().await;
        h.publish(3).await;
        h.persister.set_fail_on_insert(true).await;

        let mut consumer = h.consumer();
        let result = consumer.poll_once().await;
        assert!(matches!(result, Err(ConsumerError::Persist(_))));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(h.broker.calls().delete_batch, 0);
        assert_eq!(h.depth(), 3);

        tokio::time::advance(Duration::from_secs(31)).await;
        h.persister.set_fail_on_insert(false).await;
        let redelivered = h
            .broker
            .receive(&h.topology.queue.url, &ReceiveOptions::default())
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_consumer_never_polls_again() {
        let h = Harness::new().await;
        h.publish(2).await;
        h.persister.set_fail_on_insert(true).await;

        let mut consumer = h.consumer();
        assert!(consumer.poll_once().await.is_err());
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        let calls = h.broker.calls();
        assert_eq!(calls.receive, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        h.persister.set_fail_on_insert(false).await;

        assert!(matches!(consumer.poll_once().await, Err(ConsumerError::Stopped(_))));
        assert!(matches!(
            consumer.run_bounded(2, 5).await,
            Err(ConsumerError::Stopped(_))
        ));
        assert!(matches!(consumer.run().await, Err(ConsumerError::Stopped(_))));

        let after = h.broker.calls();
        assert_eq!(after.receive, 1);
        assert_eq!(after.delete_batch, 0);
        assert_eq!(h.rows().await, 0);
        assert_eq!(h.depth(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_is_idempotent() {
        let h = Harness::new().await;
        h.publish(2).await;

        // A slow consumer takes the batch and outlives its visibility timeout.
        let slow = h
            .broker
            .receive(&h.topology.queue.url, &ReceiveOptions::default())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let outcome = h.consumer().poll_once().await.unwrap();
        assert_eq!(outcome.acknowledged, 2);
        assert_eq!(h.rows().await, 2);

        // The slow consumer finally persists its copies.
        let entity = simple_message();
        let records: Vec<_> = slow
            .iter()
            .map(|m| entity.apply(m, Utc::now()).unwrap())
            .collect();
        h.persister
            .insert_batch(&entity.table, &records, entity.strategy)
            .await
            .unwrap();
        assert_eq!(h.rows().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_is_skipped_and_acknowledged() {
        let h = Harness::new().await;
        h.publish(1).await;
        h.broker.send_raw(&h.topology.queue.url, "not an envelope").unwrap();

        let outcome = h.consumer().poll_once().await.unwrap();
        assert_eq!(outcome.malformed, 1);
        assert_eq!(outcome.persisted, 1);
        assert_eq!(outcome.acknowledged, 2);
        assert_eq!(h.rows().await, 1);
        assert_eq!(h.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_malformed_messages_skip_persist() {
        let h = Harness::new().await;
        h.broker.send_raw(&h.topology.queue.url, "{}").unwrap();

        let outcome = h.consumer().poll_once().await.unwrap();
        assert_eq!(outcome.malformed, 1);
        assert_eq!(outcome.acknowledged, 1);
        assert_eq!(h.persister.insert_calls().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_delete_is_redelivered() {
        let h = Harness::new().await;
        h.publish(3).await;
        h.broker.fail_next_deletes(1);

        let mut consumer = h.consumer();
        let outcome = consumer.poll_once().await.unwrap();
        assert_eq!(outcome.acknowledged, 2);
        assert_eq!(outcome.ack_failed, 1);
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert_eq!(h.depth(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let outcome = consumer.poll_once().await.unwrap();
        assert_eq!(outcome.received, 1);
        assert_eq!(outcome.acknowledged, 1);
        assert_eq!(h.rows().await, 3);
        assert_eq!(h.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletes_are_chunked() {
        let h = Harness::new().await;
        h.publish(15).await;

        let mut settings = ConsumerSettings::new(&h.topology.queue.url);
        settings.receive.max_messages = 15;
        let mut consumer = ConsumerLoop::new(
            h.broker.clone(),
            h.persister.clone(),
            simple_message(),
            settings,
        );
        let outcome = consumer.poll_once().await.unwrap();
        assert_eq!(outcome.received, 15);
        assert_eq!(outcome.acknowledged, 15);
        assert_eq!(h.broker.calls().delete_batch, 2);
        assert_eq!(h.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_stops_run() {
        let h = Harness::new().await;
        h.broker.set_fail_receive(true);

        let mut consumer = h.consumer();
        let result = consumer.run().await;
        assert!(matches!(result, Err(ConsumerError::Broker(_))));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_handle_ends_run() {
        let h = Harness::new().await;
        h.publish(2).await;

        let mut consumer = h.consumer();
        let stop = consumer.stop_handle();
        let task = tokio::spawn(async move {
            let result = consumer.run().await;
            (result, consumer.state())
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stop.stop();

        let (result, state) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, ConsumerState::Stopped);
        assert_eq!(h.rows().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_bounded_stops_at_target() {
        let h = Harness::new().await;
        h.publish(25).await;

        let summary = h.consumer().run_bounded(25, 50).await.unwrap();
        assert_eq!(summary.acknowledged, 25);
        assert_eq!(summary.polls, 3);
        assert_eq!(h.rows().await, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_bounded_gives_up_after_max_polls() {
        let h = Harness::new().await;
        let summary = h.consumer().run_bounded(5, 4).await.unwrap();
        assert_eq!(summary, RunSummary { polls: 4, acknowledged: 0 });
    }
}
