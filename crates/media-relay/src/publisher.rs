use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use tracing::{debug, error};

use media_types::events::{DomainEvent, Envelope};

use crate::broker::{Broker, BrokerError, Receipt};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Wraps domain events in envelopes and sends them to their topic.
/// Failures are returned to the caller, never retried here.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn publish(&self, event: DomainEvent) -> Result<Receipt, PublishError> {
        let envelope = Envelope::new(event);
        let topic = envelope.topic();
        let payload = serde_json::to_string(&envelope)?;

        match self.broker.send(topic, &envelope.key, &payload).await {
            Ok(receipt) => {
                debug!(
                    topic = %topic,
                    partition = receipt.partition,
                    id = %receipt.id,
                    event = envelope.event.name(),
                    "Published event"
                );
                Ok(receipt)
            }
            Err(e) => {
                error!(topic = %topic, key = %envelope.key, error = %e, "Failed to publish event");
                Err(e.into())
            }
        }
    }

    /// Publish a batch concurrently, failing if any send fails or the whole
    /// batch takes longer than `timeout`. Sends already completed are not
    /// rolled back.
    pub async fn publish_all(
        &self,
        events: Vec<DomainEvent>,
        timeout: Duration,
    ) -> Result<Vec<Receipt>, PublishError> {
        let sends = events.into_iter().map(|event| self.publish(event));
        match tokio::time::timeout(timeout, try_join_all(sends)).await {
            Ok(result) => result,
            Err(_) => {
                error!(timeout = ?timeout, "Timed out waiting for batch publish");
                Err(PublishError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use media_types::events::Topic;
    use media_types::models::{Relationship, User, UserGroup};

    #[tokio::test]
    async fn publish_routes_by_topic_and_key() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(broker.clone());

        let receipt = publisher
            .publish(DomainEvent::UserGroupLinked(UserGroup {
                user_id: "ann@example.com".into(),
                group_id: "g1".into(),
                relationship: Relationship::Join,
            }))
            .await
            .unwrap();

        assert_eq!(receipt.topic, Topic::UserGroupJoin);
        assert_eq!(
            receipt.partition,
            crate::broker::partition_for("ann@example.com:g1", 3)
        );

        let sent = broker.published(Topic::UserGroupJoin);
        assert_eq!(sent.len(), 1);
        let envelope: Envelope = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(envelope.key, "ann@example.com:g1");
    }

    #[tokio::test]
    async fn publish_all_sends_every_event() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(broker.clone());

        let receipts = publisher
            .publish_all(
                vec![
                    DomainEvent::UserCreated(User::with_email("a@example.com")),
                    DomainEvent::UserUpdated(User::with_email("a@example.com")),
                ],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(receipts.len(), 2);
        assert_eq!(receipts[0].partition, receipts[1].partition);
        assert_eq!(broker.published(Topic::UserCreate).len(), 1);
        assert_eq!(broker.published(Topic::UserUpdate).len(), 1);
    }

    #[tokio::test]
    async fn broker_failure_is_returned() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_unavailable(true);
        let publisher = Publisher::new(broker);

        let err = publisher
            .publish(DomainEvent::UserCreated(User::with_email("a@example.com")))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Broker(BrokerError::Connection(_))));
    }
}
