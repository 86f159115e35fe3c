use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Delivery};
use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::projector::{ProjectionError, Projector};

/// Wait before polling again after the broker itself failed.
const BROKER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on pending deliveries replayed at startup.
const RECOVERY_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer name within the group. A stable name replays its own pending
    /// deliveries at startup; other workers claim them once they go idle.
    pub worker_name: String,
    /// Retries after the first failed attempt, for retryable failures only.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry, capped at 32x.
    pub retry_base: Duration,
    pub batch_size: usize,
    /// How long one poll waits for new records.
    pub block: Duration,
    /// Deliveries left unacked this long by any consumer are taken over.
    pub claim_idle: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker-local".into(),
            max_retries: 3,
            retry_base: Duration::from_millis(1000),
            batch_size: 10,
            block: Duration::from_secs(2),
            claim_idle: Duration::from_secs(30),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Projected,
    DeadLettered,
    /// Could not be dead-lettered either; left pending on the broker.
    Unacked,
}

/// Delay before retry number `retry` (0-based).
pub fn backoff(base: Duration, retry: u32) -> Duration {
    base * (1u32 << retry.min(5))
}

/// Reads one projector kind's topics and feeds them to its projector.
pub struct Consumer {
    projector: Projector,
    broker: Arc<dyn Broker>,
    dead_letters: DeadLetterQueue,
    config: ConsumerConfig,
    group: String,
}

impl Consumer {
    pub fn new(projector: Projector, broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        let group = projector.kind().group();
        Self {
            dead_letters: DeadLetterQueue::new(broker.clone()),
            projector,
            broker,
            config,
            group,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create the consumer group on every partition this consumer reads.
    pub async fn prepare(&self) -> Result<(), BrokerError> {
        self.broker
            .ensure_group(&self.group, self.projector.kind().topics())
            .await
    }

    /// Consume until `shutdown` fires. The batch in hand is finished before
    /// returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        let kind = self.projector.kind();
        self.prepare().await?;
        info!(
            "{} projector consuming {:?} as {}/{}",
            kind,
            kind.topics(),
            self.group,
            self.config.worker_name
        );

        let mut projected: u64 = 0;
        let mut dead_lettered: u64 = 0;

        match self.recover_pending().await {
            Ok(0) => {}
            Ok(count) => info!(projector = %kind, count, "Replayed pending deliveries"),
            Err(e) => warn!(projector = %kind, error = %e, "Failed to read pending deliveries"),
        }

        let mut last_claim = Instant::now();
        self.claim_and_handle().await;

        loop {
            if last_claim.elapsed() >= self.config.claim_idle {
                last_claim = Instant::now();
                self.claim_and_handle().await;
            }

            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.poll() => polled,
            };

            match polled {
                Ok(batch) => {
                    for delivery in &batch {
                        match self.handle(delivery).await {
                            Outcome::Projected => projected += 1,
                            Outcome::DeadLettered => dead_lettered += 1,
                            Outcome::Unacked => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(projector = %kind, error = %e, "Broker poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(BROKER_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!(projector = %kind, projected, dead_lettered, "Projector stopped");
        Ok(())
    }

    /// Poll one batch and handle it. Returns the number of deliveries seen.
    pub async fn run_once(&self) -> Result<usize, BrokerError> {
        let batch = self.poll().await?;
        for delivery in &batch {
            self.handle(delivery).await;
        }
        Ok(batch.len())
    }

    async fn poll(&self) -> Result<Vec<Delivery>, BrokerError> {
        self.broker
            .poll(
                &self.group,
                &self.config.worker_name,
                self.projector.kind().topics(),
                self.config.batch_size,
                self.config.block,
            )
            .await
    }

    /// Replay deliveries this worker received before a restart but never acked.
    async fn recover_pending(&self) -> Result<usize, BrokerError> {
        let pending = self
            .broker
            .pending(
                &self.group,
                &self.config.worker_name,
                self.projector.kind().topics(),
                RECOVERY_BATCH,
            )
            .await?;
        for delivery in &pending {
            self.handle(delivery).await;
        }
        Ok(pending.len())
    }

    /// Take over deliveries other consumers left idle and handle them.
    /// Returns the number claimed.
    pub async fn claim_idle(&self) -> Result<usize, BrokerError> {
        let claimed = self
            .broker
            .claim_idle(
                &self.group,
                &self.config.worker_name,
                self.projector.kind().topics(),
                self.config.claim_idle,
                RECOVERY_BATCH,
            )
            .await?;
        for delivery in &claimed {
            self.handle(delivery).await;
        }
        Ok(claimed.len())
    }

    async fn claim_and_handle(&self) {
        let kind = self.projector.kind();
        match self.claim_idle().await {
            Ok(0) => {}
            Ok(count) => info!(projector = %kind, count, "Claimed idle deliveries"),
            Err(e) => warn!(projector = %kind, error = %e, "Failed to claim idle deliveries"),
        }
    }

    /// Project one delivery, retrying cache failures with backoff and
    /// dead-lettering whatever cannot be projected, then ack it.
    pub async fn handle(&self, delivery: &Delivery) -> Outcome {
        let kind = self.projector.kind();

        let outcome = match self.projector.decode(delivery.topic, &delivery.payload) {
            Ok(envelope) => {
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    match self.projector.project(&envelope).await {
                        Ok(()) => break Outcome::Projected,
                        Err(e) if e.is_retryable() && attempts <= self.config.max_retries => {
                            let delay = backoff(self.config.retry_base, attempts - 1);
                            warn!(
                                projector = %kind,
                                id = %delivery.id,
                                attempt = attempts,
                                backoff_ms = delay.as_millis() as u64,
                                error = %e,
                                "Projection failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => break self.dead_letter(delivery, &e, attempts).await,
                    }
                }
            }
            Err(e) => self.dead_letter(delivery, &e, 1).await,
        };

        if outcome != Outcome::Unacked {
            if let Err(e) = self.broker.ack(&self.group, delivery).await {
                error!(projector = %kind, id = %delivery.id, error = %e, "Failed to ack delivery");
            } else {
                debug!(projector = %kind, id = %delivery.id, outcome = ?outcome, "Acked delivery");
            }
        }
        outcome
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &ProjectionError, attempts: u32) -> Outcome {
        warn!(
            projector = %self.projector.kind(),
            topic = %delivery.topic,
            id = %delivery.id,
            attempts,
            error = %error,
            "Giving up on delivery"
        );

        match self
            .dead_letters
            .send(&DeadLetter::new(delivery, error, attempts))
            .await
        {
            Ok(_) => Outcome::DeadLettered,
            Err(e) => {
                error!(
                    id = %delivery.id,
                    payload = %delivery.payload,
                    error = %e,
                    "Dead-letter write failed, leaving delivery pending"
                );
                Outcome::Unacked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use media_cache::{Cache, CacheError, MemoryCache, Mutation, QueryService};
    use media_types::events::{DomainEvent, Topic};
    use media_types::models::{Channel, Group, Relationship, User, UserChannel, UserGroup};

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::projector::ProjectorKind;
    use crate::publisher::Publisher;

    /// Fails the next `failures` applies with a connection error.
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
        failures: AtomicU32,
    }

    impl FlakyCache {
        fn failing(failures: u32) -> Self {
            Self {
                inner: MemoryCache::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl Cache for FlakyCache {
        async fn apply(&self, plan: &[Mutation]) -> Result<(), CacheError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(CacheError::Connection("connection refused".into()));
            }
            self.inner.apply(plan).await
        }

        async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
            self.inner.hash_get_all(key).await
        }

        async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
            self.inner.hash_get(key, field).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
            self.inner.set_members(key).await
        }

        async fn ping(&self) -> Result<(), CacheError> {
            self.inner.ping().await
        }
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig {
            worker_name: "test-worker".into(),
            retry_base: Duration::from_millis(1),
            block: Duration::from_millis(10),
            ..ConsumerConfig::default()
        }
    }

    async fn consumer(kind: ProjectorKind, cache: Arc<dyn Cache>, broker: Arc<MemoryBroker>) -> Consumer {
        let consumer = Consumer::new(Projector::new(kind, cache), broker, test_config());
        consumer.prepare().await.unwrap();
        consumer
    }

    async fn drain_all(cache: Arc<dyn Cache>, broker: Arc<MemoryBroker>) {
        for kind in ProjectorKind::ALL {
            let consumer = consumer(kind, cache.clone(), broker.clone()).await;
            while consumer.run_once().await.unwrap() > 0 {}
        }
    }

    fn letters(broker: &MemoryBroker) -> Vec<DeadLetter> {
        broker
            .published(Topic::DeadLetter)
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff(base, 0), Duration::from_millis(1000));
        assert_eq!(backoff(base, 1), Duration::from_millis(2000));
        assert_eq!(backoff(base, 5), Duration::from_millis(32000));
        assert_eq!(backoff(base, 9), Duration::from_millis(32000));
    }

    #[tokio::test]
    async fn published_group_is_queryable_after_projection() {
        let broker = Arc::new(MemoryBroker::new());
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let publisher = Publisher::new(broker.clone());
        let queries = QueryService::new(cache.clone());

        let owner = "ann@example.com";
        publisher
            .publish_all(
                vec![
                    DomainEvent::UserCreated(User::with_email(owner)),
                    DomainEvent::GroupCreated(Group {
                        id: "g1".into(),
                        name: "Climbers".into(),
                        code: "AB12CD".into(),
                        hidden: false,
                        created_by: owner.into(),
                        created_at: 1_700_000_000_000,
                    }),
                    DomainEvent::ChannelCreated(Channel {
                        channel_id: "ch_1".into(),
                        name: "general".into(),
                        group_id: "g1".into(),
                    }),
                    DomainEvent::UserGroupLinked(UserGroup {
                        user_id: owner.into(),
                        group_id: "g1".into(),
                        relationship: Relationship::Create,
                    }),
                    DomainEvent::UserChannelLinked(UserChannel {
                        user_id: owner.into(),
                        channel_id: "ch_1".into(),
                        relationship: Relationship::Create,
                    }),
                ],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        drain_all(cache.clone(), broker.clone()).await;

        assert!(queries.get_user(owner).await.unwrap().is_some());
        assert_eq!(
            queries.get_group_by_code("AB12CD").await.unwrap().map(|g| g.id),
            Some("g1".into())
        );
        assert_eq!(
            queries.get_default_channel("g1").await.unwrap().map(|c| c.channel_id),
            Some("ch_1".into())
        );
        assert_eq!(queries.get_group_users("g1").await.unwrap(), vec![owner]);
        assert_eq!(queries.get_user_channels(owner).await.unwrap(), vec!["ch_1"]);
        assert!(letters(&broker).is_empty());
        for kind in ProjectorKind::ALL {
            assert_eq!(broker.pending_count(&kind.group()), 0);
        }
    }

    #[tokio::test]
    async fn redelivery_leaves_the_same_state() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(MemoryCache::new());
        let consumer = consumer(ProjectorKind::UserGroup, cache.clone(), broker.clone()).await;

        Publisher::new(broker.clone())
            .publish(DomainEvent::UserGroupLinked(UserGroup {
                user_id: "bob@example.com".into(),
                group_id: "g1".into(),
                relationship: Relationship::Join,
            }))
            .await
            .unwrap();

        let batch = consumer.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(consumer.handle(&batch[0]).await, Outcome::Projected);
        let keys = cache.len().await;
        assert_eq!(consumer.handle(&batch[0]).await, Outcome::Projected);

        assert_eq!(cache.len().await, keys);
        let queries = QueryService::new(cache);
        assert_eq!(queries.get_group_users("g1").await.unwrap(), vec!["bob@example.com"]);
    }

    #[tokio::test]
    async fn undecodable_delivery_is_dead_lettered_and_acked() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(MemoryCache::new());
        let consumer = consumer(ProjectorKind::Post, cache.clone(), broker.clone()).await;

        broker.send(Topic::PostCreated, "p1", "not json").await.unwrap();
        assert_eq!(consumer.run_once().await.unwrap(), 1);

        let letters = letters(&broker);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].topic, Topic::PostCreated);
        assert_eq!(letters[0].payload, "not json");
        assert_eq!(letters[0].attempts, 1);
        assert_eq!(broker.pending_count(consumer.group()), 0);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn transient_cache_failure_is_retried() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(FlakyCache::failing(2));
        let consumer = consumer(ProjectorKind::User, cache.clone(), broker.clone()).await;

        Publisher::new(broker.clone())
            .publish(DomainEvent::UserCreated(User::with_email("ann@example.com")))
            .await
            .unwrap();

        let batch = consumer.poll().await.unwrap();
        assert_eq!(consumer.handle(&batch[0]).await, Outcome::Projected);
        assert!(letters(&broker).is_empty());
        assert!(cache.inner.hash_get("user:ann@example.com", "email").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn persistent_cache_failure_ends_in_dead_letter() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(FlakyCache::failing(u32::MAX));
        let consumer = consumer(ProjectorKind::User, cache, broker.clone()).await;

        Publisher::new(broker.clone())
            .publish(DomainEvent::UserCreated(User::with_email("ann@example.com")))
            .await
            .unwrap();

        assert_eq!(consumer.run_once().await.unwrap(), 1);

        let letters = letters(&broker);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 4);
        assert!(letters[0].error.contains("connection refused"));
        assert_eq!(broker.pending_count(consumer.group()), 0);
    }

    #[tokio::test]
    async fn delivery_abandoned_by_another_worker_is_claimed() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(MemoryCache::new());
        let queries = QueryService::new(cache.clone());

        Publisher::new(broker.clone())
            .publish(DomainEvent::UserCreated(User::with_email("ann@example.com")))
            .await
            .unwrap();

        // A worker that received the record and went away under another name.
        let gone = Consumer::new(
            Projector::new(ProjectorKind::User, cache.clone()),
            broker.clone(),
            ConsumerConfig {
                worker_name: "worker-gone".into(),
                ..test_config()
            },
        );
        gone.prepare().await.unwrap();
        assert_eq!(gone.poll().await.unwrap().len(), 1);

        let survivor = Consumer::new(
            Projector::new(ProjectorKind::User, cache.clone()),
            broker.clone(),
            ConsumerConfig {
                claim_idle: Duration::ZERO,
                ..test_config()
            },
        );
        assert_eq!(survivor.run_once().await.unwrap(), 0);
        assert_eq!(survivor.claim_idle().await.unwrap(), 1);

        assert!(queries.get_user("ann@example.com").await.unwrap().is_some());
        assert_eq!(broker.pending_count(survivor.group()), 0);
    }

    #[tokio::test]
    async fn recently_delivered_records_are_not_claimed() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(MemoryCache::new());

        Publisher::new(broker.clone())
            .publish(DomainEvent::UserCreated(User::with_email("ann@example.com")))
            .await
            .unwrap();
        let busy = Consumer::new(
            Projector::new(ProjectorKind::User, cache.clone()),
            broker.clone(),
            ConsumerConfig {
                worker_name: "worker-busy".into(),
                ..test_config()
            },
        );
        busy.prepare().await.unwrap();
        assert_eq!(busy.poll().await.unwrap().len(), 1);

        let other = consumer(ProjectorKind::User, cache, broker.clone()).await;
        assert_eq!(other.claim_idle().await.unwrap(), 0);
        assert_eq!(broker.pending_count(other.group()), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(ProjectorKind::Comment, Arc::new(MemoryCache::new()), broker).await;
        let shutdown = CancellationToken::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
