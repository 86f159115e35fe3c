//! Event relay: publishing domain events to the broker and projecting them
//! into the read cache.

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod projector;
pub mod publisher;

pub use broker::{Broker, BrokerError, Delivery, MemoryBroker, Receipt, RedisStreamBroker};
pub use consumer::{Consumer, ConsumerConfig, Outcome};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterQueue};
pub use projector::{ProjectionError, Projector, ProjectorKind};
pub use publisher::{PublishError, Publisher};
