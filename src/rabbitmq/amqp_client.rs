// src/rabbitmq/amqp_client.rs

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use lapin::{
    message::Delivery, options::*, types::FieldTable, Channel, Connection, ConnectionProperties,
    ExchangeKind,
};
use tracing::debug;

use super::errors::{RabbitMQError, Result};

/// Callback invoked when a connection or channel reports an error or closes.
/// May be called from a thread owned by the broker library.
pub type FailureHook = Arc<dyn Fn(RabbitMQError) + Send + Sync>;

pub type DeliveryStream<M> = BoxStream<'static, Result<M>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Fanout,
}

/// Entry point into the broker: turns a URI into a live connection.
#[async_trait]
pub trait AmqpClient: Send + Sync + 'static {
    type Connection: AmqpConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    type Channel: AmqpChannel;

    async fn create_channel(&self) -> Result<Self::Channel>;

    /// Register the observer for asynchronous errors and closes.
    fn on_failure(&self, hook: FailureHook);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Clone + Send + Sync + 'static {
    type Message: InboundMessage;

    async fn assert_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()>;

    async fn assert_queue(&self, name: &str, durable: bool) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream<Self::Message>>;

    async fn ack(&self, message: &Self::Message) -> Result<()>;

    /// Register the observer for asynchronous errors and closes.
    fn on_failure(&self, hook: FailureHook);

    async fn close(&self) -> Result<()>;
}

/// A delivered message, valid for one callback invocation.
pub trait InboundMessage: Send + Sync + 'static {
    fn payload(&self) -> &[u8];
}

/// `AmqpClient` backed by lapin.
#[derive(Default)]
pub struct LapinClient {
    properties: ConnectionProperties,
}

impl LapinClient {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl AmqpClient for LapinClient {
    type Connection = LapinConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection> {
        let inner = Connection::connect(uri, self.properties.clone())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;
        Ok(LapinConnection { inner })
    }
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn create_channel(&self) -> Result<Self::Channel> {
        let inner = self
            .inner
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;
        Ok(LapinChannel {
            inner,
            failure: FailureSlot::default(),
        })
    }

    fn on_failure(&self, hook: FailureHook) {
        self.inner.on_error(move |err| {
            hook(RabbitMQError::ConnectionError(err.to_string()));
        });
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(0, "Closing connection").await?;
        Ok(())
    }
}

/// Holds the failure hook of a channel. Delivery streams created before the
/// hook is attached still report through it.
#[derive(Clone, Default)]
pub(crate) struct FailureSlot(Arc<Mutex<Option<FailureHook>>>);

impl FailureSlot {
    pub(crate) fn set(&self, hook: FailureHook) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = Some(hook);
        }
    }

    pub(crate) fn notify(&self, error: RabbitMQError) {
        let hook = match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match hook {
            Some(hook) => hook(error),
            None => debug!("Channel failure with no observer attached: {}", error),
        }
    }
}

/// Wrap a consumer stream so that its first error, or its end, is reported
/// to `failure` once. The error is still yielded, and nothing follows it.
pub(crate) fn watch_deliveries<M, S>(deliveries: S, failure: FailureSlot) -> DeliveryStream<M>
where
    M: Send + 'static,
    S: Stream<Item = Result<M>> + Send + Unpin + 'static,
{
    stream::unfold(Some((deliveries, failure)), |state| async move {
        let (mut deliveries, failure) = state?;
        match deliveries.next().await {
            Some(Ok(message)) => Some((Ok(message), Some((deliveries, failure)))),
            Some(Err(e)) => {
                failure.notify(RabbitMQError::ChannelError(format!(
                    "consumer stream failed: {}",
                    e
                )));
                Some((Err(e), None))
            }
            None => {
                failure.notify(RabbitMQError::ChannelClosed(
                    "consumer stream ended".to_string(),
                ));
                None
            }
        }
    })
    .boxed()
}

/// Channel loss is reported twice by lapin: through `Channel::on_error` and
/// by the consumer stream ending. Both go to the same hook; the manager
/// ignores whichever arrives second.
#[derive(Clone)]
pub struct LapinChannel {
    inner: Channel,
    failure: FailureSlot,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    type Message = LapinDelivery;

    async fn assert_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        let kind = match kind {
            ExchangeType::Fanout => ExchangeKind::Fanout,
        };
        self.inner
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::TopologyError(format!("Failed to declare exchange: {}", e)))
    }

    async fn assert_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::TopologyError(format!("Failed to declare queue: {}", e)))?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        // Fan-out exchanges ignore the routing key
        self.inner
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::TopologyError(format!("Failed to bind queue: {}", e)))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<Self::Message>> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let deliveries = consumer.map(|next| {
            next.map(LapinDelivery)
                .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
        });
        Ok(watch_deliveries(deliveries, self.failure.clone()))
    }

    async fn ack(&self, message: &Self::Message) -> Result<()> {
        message
            .0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    fn on_failure(&self, hook: FailureHook) {
        self.failure.set(hook.clone());
        self.inner.on_error(move |err| {
            hook(RabbitMQError::ChannelError(err.to_string()));
        });
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(200, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

pub struct LapinDelivery(Delivery);

impl InboundMessage for LapinDelivery {
    fn payload(&self) -> &[u8] {
        &self.0.data
    }
}
