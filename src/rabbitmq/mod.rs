// src/rabbitmq/mod.rs
// Connection lifecycle, event notification and queue draining over AMQP

pub mod errors;
pub mod amqp_client;      // Broker client seam and its lapin implementation
pub mod connection;       // Connect / recover state machine
pub mod consumer;
pub mod events;

#[cfg(test)]
pub(crate) mod mock;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{
    AmqpChannel, AmqpClient, AmqpConnection, ExchangeType, InboundMessage, LapinClient,
};
pub use connection::{ConnectionManager, ManagerState};
pub use consumer::{DeliveryOutcome, QueueDrain, Topology};
pub use errors::{RabbitMQError, Result};
pub use events::{EventKind, EventNotifier, LifecycleEvent};
