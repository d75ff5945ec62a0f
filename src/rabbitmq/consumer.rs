// src/rabbitmq/consumer.rs
// Topology installation and the ack-then-parse delivery loop

use std::sync::{Arc, Weak};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpChannel, AmqpClient, ExchangeType, InboundMessage};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::events::{EventKind, EventNotifier, LifecycleEvent};

// Fixed declaration policy
pub const EXCHANGE_TYPE: ExchangeType = ExchangeType::Fanout;
pub const DURABLE_EXCHANGE: bool = true;
pub const DURABLE_QUEUE: bool = true;

/// The exchange and queue a consumer drains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub queue_name: String,
}

impl Topology {
    pub fn new(exchange_name: &str, queue_name: &str) -> Self {
        Topology {
            exchange_name: exchange_name.to_string(),
            queue_name: queue_name.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange_name.trim().is_empty() || self.queue_name.trim().is_empty() {
            return Err(RabbitMQError::Configuration(
                "missing exchange/queue name".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Parsed and dispatched as a `message` event
    Forwarded,
    /// Not valid JSON; acknowledged and dropped
    Malformed,
    /// The notifier is gone; acknowledged and dropped
    Orphaned,
}

/// Declares the topology on a channel and forwards its deliveries to the
/// `message` subscribers of a notifier.
pub struct QueueDrain<Ch> {
    topology: Topology,
    notifier: Weak<EventNotifier<Ch>>,
    silent: bool,
}

impl<Ch> Clone for QueueDrain<Ch> {
    fn clone(&self) -> Self {
        QueueDrain {
            topology: self.topology.clone(),
            notifier: self.notifier.clone(),
            silent: self.silent,
        }
    }
}

impl<Ch: AmqpChannel> QueueDrain<Ch> {
    pub fn new(topology: Topology, notifier: &Arc<EventNotifier<Ch>>, silent: bool) -> Result<Self> {
        topology.validate()?;
        Ok(QueueDrain {
            topology,
            notifier: Arc::downgrade(notifier),
            silent,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare exchange, queue and binding, then start consuming. Safe to
    /// repeat on every new channel: declares are no-ops when the entities
    /// already exist with the same properties.
    pub async fn install(&self, channel: &Ch) -> Result<JoinHandle<()>> {
        let Topology {
            exchange_name,
            queue_name,
        } = &self.topology;

        channel
            .assert_exchange(exchange_name, EXCHANGE_TYPE, DURABLE_EXCHANGE)
            .await?;
        channel.assert_queue(queue_name, DURABLE_QUEUE).await?;
        channel.bind_queue(queue_name, exchange_name).await?;

        let consumer_tag = format!("consumer-{}", uuid::Uuid::new_v4());
        let mut deliveries = channel.consume(queue_name, &consumer_tag).await?;
        if !self.silent {
            info!(consumer_tag = %consumer_tag, "Channel opened, consuming {}", queue_name);
        }

        let drain = self.clone();
        let channel = channel.clone();
        Ok(tokio::spawn(async move {
            while let Some(next) = deliveries.next().await {
                match next {
                    Ok(message) => {
                        drain.handle_delivery(&channel, message).await;
                    }
                    Err(e) => {
                        warn!("Error receiving message: {}", e);
                        break;
                    }
                }
            }
            debug!(consumer_tag = %consumer_tag, "Delivery stream ended");
        }))
    }

    /// Acknowledge first, then parse and dispatch.
    pub async fn handle_delivery(&self, channel: &Ch, message: Ch::Message) -> DeliveryOutcome {
        if !self.silent {
            info!("Message = {}", String::from_utf8_lossy(message.payload()));
        }

        if let Err(e) = channel.ack(&message).await {
            error!("Failed to acknowledge message: {}", e);
        }

        let value: Value = match serde_json::from_slice(message.payload()) {
            Ok(value) => value,
            Err(e) => {
                error!(
                    error = %e,
                    "Cannot parse message {}",
                    String::from_utf8_lossy(message.payload())
                );
                return DeliveryOutcome::Malformed;
            }
        };

        let Some(notifier) = self.notifier.upgrade() else {
            debug!("No notifier left, dropping message");
            return DeliveryOutcome::Orphaned;
        };
        if let Err(e) = notifier.emit(LifecycleEvent::MessageReceived(value)).await {
            error!("message subscriber failed: {}", e);
        }
        DeliveryOutcome::Forwarded
    }
}

impl<C: AmqpClient> ConnectionManager<C> {
    /// Drain `topology` into `message` events: the topology is installed on
    /// every channel this manager opens from now on, then the connection is
    /// opened. Fails before touching the network when the topology is
    /// incomplete.
    pub async fn drain(&mut self, topology: Topology) -> Result<()> {
        let events = self.events();
        let drain = QueueDrain::new(topology, &events, self.config().silent)?;

        events.subscribe(EventKind::ChannelOpened, move |event| {
            let drain = drain.clone();
            async move {
                if let LifecycleEvent::ChannelOpened(channel) = event {
                    let _delivery_task = drain.install(&channel).await?;
                }
                Ok(())
            }
        });

        self.open().await;
        Ok(())
    }
}
