// src/rabbitmq/mock.rs
// Scripted in-memory broker used by the unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};

use super::amqp_client::{
    watch_deliveries, AmqpChannel, AmqpClient, AmqpConnection, DeliveryStream, ExchangeType,
    FailureHook, FailureSlot, InboundMessage,
};
use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    CreateChannel,
    AssertExchange(String, ExchangeType, bool),
    AssertQueue(String, bool),
    BindQueue(String, String),
    Consume(String),
    Ack(String),
    CloseChannel,
    CloseConnection,
    /// Written by test subscribers to order their own work against broker calls
    Marker(String),
}

#[derive(Default)]
struct BrokerState {
    calls: Vec<Call>,
    failing_connects: usize,
    failing_channels: usize,
    exchanges: HashMap<String, (ExchangeType, bool)>,
    connection_hook: Option<FailureHook>,
    channel_failure: Option<FailureSlot>,
    consumer: Option<UnboundedSender<Result<MockMessage>>>,
}

#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.state().failing_connects = n;
    }

    pub fn fail_next_channels(&self, n: usize) {
        self.state().failing_channels = n;
    }

    /// Pre-declare an exchange so a later declare with other properties fails.
    pub fn existing_exchange(&self, name: &str, kind: ExchangeType, durable: bool) {
        self.state()
            .exchanges
            .insert(name.to_string(), (kind, durable));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn connect_attempts(&self) -> usize {
        self.count(|c| matches!(c, Call::Connect(_)))
    }

    pub fn mark(&self, label: &str) {
        self.state().calls.push(Call::Marker(label.to_string()));
    }

    /// Push a payload to the active consumer. Returns false when nobody consumes.
    pub fn deliver(&self, payload: &str) -> bool {
        let state = self.state();
        match &state.consumer {
            Some(tx) => tx
                .unbounded_send(Ok(MockMessage {
                    payload: payload.as_bytes().to_vec(),
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Broker-side channel close: the consumer stream ends and reports
    /// through the channel's stream watcher.
    pub fn close_channel(&self) {
        self.state().consumer = None;
    }

    /// Protocol error raised on the channel itself, without touching the
    /// consumer.
    pub fn channel_error(&self, reason: &str) {
        let slot = self.state().channel_failure.clone();
        if let Some(slot) = slot {
            slot.notify(RabbitMQError::ChannelError(reason.to_string()));
        }
    }

    /// Network drop on the connection.
    pub fn drop_connection(&self) {
        let hook = {
            let mut state = self.state();
            state.consumer = None;
            state.channel_failure = None;
            state.connection_hook.take()
        };
        if let Some(hook) = hook {
            hook(RabbitMQError::ConnectionError("connection reset".to_string()));
        }
    }
}

#[async_trait]
impl AmqpClient for MockBroker {
    type Connection = MockConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection> {
        let mut state = self.state();
        state.calls.push(Call::Connect(uri.to_string()));
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RabbitMQError::ConnectionError("connection refused".to_string()));
        }
        Ok(MockConnection {
            broker: self.clone(),
        })
    }
}

pub struct MockConnection {
    broker: MockBroker,
}

#[async_trait]
impl AmqpConnection for MockConnection {
    type Channel = MockChannel;

    async fn create_channel(&self) -> Result<Self::Channel> {
        let mut state = self.broker.state();
        state.calls.push(Call::CreateChannel);
        if state.failing_channels > 0 {
            state.failing_channels -= 1;
            return Err(RabbitMQError::ChannelError("channel limit reached".to_string()));
        }
        Ok(MockChannel {
            broker: self.broker.clone(),
            failure: FailureSlot::default(),
        })
    }

    fn on_failure(&self, hook: FailureHook) {
        self.broker.state().connection_hook = Some(hook);
    }

    async fn close(&self) -> Result<()> {
        self.broker.state().calls.push(Call::CloseConnection);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockChannel {
    broker: MockBroker,
    failure: FailureSlot,
}

#[async_trait]
impl AmqpChannel for MockChannel {
    type Message = MockMessage;

    async fn assert_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        let mut state = self.broker.state();
        state
            .calls
            .push(Call::AssertExchange(name.to_string(), kind, durable));
        match state.exchanges.get(name) {
            Some(existing) if *existing != (kind, durable) => Err(RabbitMQError::TopologyError(
                format!("PRECONDITION_FAILED - inequivalent arg for exchange '{}'", name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), (kind, durable));
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.broker
            .state()
            .calls
            .push(Call::AssertQueue(name.to_string(), durable));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        self.broker
            .state()
            .calls
            .push(Call::BindQueue(queue.to_string(), exchange.to_string()));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream<Self::Message>> {
        let (tx, rx) = unbounded();
        let mut state = self.broker.state();
        state.calls.push(Call::Consume(queue.to_string()));
        state.consumer = Some(tx);
        Ok(watch_deliveries(rx, self.failure.clone()))
    }

    async fn ack(&self, message: &Self::Message) -> Result<()> {
        let payload = String::from_utf8_lossy(&message.payload).into_owned();
        self.broker.state().calls.push(Call::Ack(payload));
        Ok(())
    }

    fn on_failure(&self, hook: FailureHook) {
        self.failure.set(hook);
        self.broker.state().channel_failure = Some(self.failure.clone());
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();
        state.calls.push(Call::CloseChannel);
        state.consumer = None;
        Ok(())
    }
}

pub struct MockMessage {
    payload: Vec<u8>,
}

impl InboundMessage for MockMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }
}
