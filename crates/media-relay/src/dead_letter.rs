//! Dead-letter topic for deliveries that could not be projected.
//!
//! A dead letter keeps the raw payload exactly as it was received, so an
//! operator can inspect it and republish it to its original topic once the
//! cause is fixed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use media_types::events::Topic;

use crate::broker::{Broker, BrokerError, Delivery, Receipt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Topic the delivery was read from.
    pub topic: Topic,
    pub partition: u32,
    /// Broker id of the original delivery.
    pub delivery_id: String,
    /// Raw payload, undecoded.
    pub payload: String,
    /// Error from the last attempt.
    pub error: String,
    /// Projection attempts made before giving up.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(delivery: &Delivery, error: impl ToString, attempts: u32) -> Self {
        Self {
            topic: delivery.topic,
            partition: delivery.partition,
            delivery_id: delivery.id.clone(),
            payload: delivery.payload.clone(),
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("failed to encode dead letter: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    broker: Arc<dyn Broker>,
}

impl DeadLetterQueue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn send(&self, letter: &DeadLetter) -> Result<Receipt, DeadLetterError> {
        let payload = serde_json::to_string(letter)?;
        let receipt = self
            .broker
            .send(Topic::DeadLetter, &letter.delivery_id, &payload)
            .await
            .map_err(|e| {
                error!(delivery_id = %letter.delivery_id, error = %e, "Failed to write dead letter");
                e
            })?;

        info!(
            dead_letter_id = %receipt.id,
            topic = %letter.topic,
            delivery_id = %letter.delivery_id,
            attempts = letter.attempts,
            error = %letter.error,
            "Delivery moved to dead-letter topic"
        );
        Ok(receipt)
    }
}
