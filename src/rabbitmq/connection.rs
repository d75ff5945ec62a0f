// src/rabbitmq/connection.rs
// Owns the broker connection and channel and recovers them after failures

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpChannel, AmqpClient, AmqpConnection, FailureHook};
use super::errors::{RabbitMQError, Result};
use super::events::{EventNotifier, LifecycleEvent};
use crate::config::ConnectionConfig;

pub type ChannelOf<C> = <<C as AmqpClient>::Connection as AmqpConnection>::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Closed,
    Connecting,
    Connected,
    ChannelOpen,
    ReconnectPending,
}

enum Signal {
    /// Error or close reported by the connection or channel of `generation`
    Failure {
        generation: u64,
        error: RabbitMQError,
    },
    /// Sent by the reconnect timer `timer_id` when its delay elapses
    ReconnectDue { timer_id: u64 },
}

enum ReconnectTimer {
    Idle,
    Pending { id: u64, handle: JoinHandle<()> },
}

/// Keeps at most one connection and one channel open against the broker.
///
/// Every failure, whether returned while opening, raised by a subscriber, or
/// reported later by the broker library, goes through the same recovery path:
/// drop the handles, emit `connection.closed`, and schedule a single delayed
/// reconnect when auto-reconnect is enabled.
///
/// Broker callbacks only enqueue signals; the manager reacts to them from
/// [`run`](Self::run) or [`step`](Self::step).
pub struct ConnectionManager<C: AmqpClient> {
    config: ConnectionConfig,
    client: C,
    connection: Option<C::Connection>,
    channel: Option<ChannelOf<C>>,
    state: ManagerState,
    generation: u64,
    reconnect_timer: ReconnectTimer,
    next_timer_id: u64,
    events: Arc<EventNotifier<ChannelOf<C>>>,
    signal_tx: UnboundedSender<Signal>,
    signal_rx: UnboundedReceiver<Signal>,
}

impl<C: AmqpClient> ConnectionManager<C> {
    pub fn new(config: ConnectionConfig, client: C) -> Result<Self> {
        config.validate()?;
        let (signal_tx, signal_rx) = unbounded_channel();

        Ok(ConnectionManager {
            config,
            client,
            connection: None,
            channel: None,
            state: ManagerState::Closed,
            generation: 0,
            reconnect_timer: ReconnectTimer::Idle,
            next_timer_id: 0,
            events: Arc::new(EventNotifier::new()),
            signal_tx,
            signal_rx,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Subscription surface for lifecycle events and messages.
    pub fn events(&self) -> Arc<EventNotifier<ChannelOf<C>>> {
        self.events.clone()
    }

    /// Open a connection and a channel. Failures never reach the caller;
    /// they are routed through recovery.
    pub async fn open(&mut self) {
        if self.connection.is_some() {
            warn!("AMQP connection already open, ignoring open()");
            return;
        }
        // An explicit open supersedes a scheduled one
        if let ReconnectTimer::Pending { handle, .. } =
            std::mem::replace(&mut self.reconnect_timer, ReconnectTimer::Idle)
        {
            debug!("Cancelling pending reconnect in favour of explicit open");
            handle.abort();
        }

        if let Err(err) = self.try_open().await {
            self.on_error(err).await;
        }
    }

    async fn try_open(&mut self) -> Result<()> {
        self.state = ManagerState::Connecting;
        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();

        let connection = self.client.connect(&self.config.endpoint).await?;
        if !self.config.silent {
            info!(generation, "Connected to AMQP at {}", self.config.endpoint);
        }
        connection.on_failure(self.failure_hook(generation));
        let connection = self.connection.insert(connection);
        self.state = ManagerState::Connected;
        events.emit(LifecycleEvent::ConnectionOpened).await?;

        let channel = connection.create_channel().await?;
        if !self.config.silent {
            info!(generation, "AMQP channel opened");
        }
        channel.on_failure(self.failure_hook(generation));
        self.channel = Some(channel.clone());
        self.state = ManagerState::ChannelOpen;
        events.emit(LifecycleEvent::ChannelOpened(channel)).await?;

        Ok(())
    }

    fn failure_hook(&self, generation: u64) -> FailureHook {
        let tx = self.signal_tx.clone();
        Arc::new(move |error| {
            // The receiver lives as long as the manager
            let _ = tx.send(Signal::Failure { generation, error });
        })
    }

    /// The single recovery procedure. Errors that retrying cannot fix end
    /// in `Closed` without a reconnect.
    async fn on_error(&mut self, error: RabbitMQError) {
        if self.config.display_errors {
            error!(error = %error, "AMQP failure");
        }
        let recoverable = error.is_recoverable();

        self.channel = None;
        if let Some(connection) = self.connection.take() {
            // Best effort: a broken connection just fails to close
            tokio::spawn(async move {
                if let Err(e) = connection.close().await {
                    debug!("Discarded connection did not close cleanly: {}", e);
                }
            });
        }
        self.state = ManagerState::Closed;

        if let Err(e) = self.events.emit(LifecycleEvent::ConnectionClosed).await {
            warn!("connection.closed subscriber failed: {}", e);
        }
        if !recoverable {
            warn!("Not reconnecting after a non-recoverable error");
            return;
        }
        self.reopen();
    }

    fn reopen(&mut self) {
        if !self.config.auto_reconnect {
            warn!("Reconnection aborted (auto-reconnect is off)");
            return;
        }
        if let ReconnectTimer::Pending { .. } = self.reconnect_timer {
            warn!("Already reopening connection");
            return;
        }

        let delay = self.config.reconnect_delay();
        warn!("Trying to reopen connection in {}ms", delay.as_millis());
        self.next_timer_id += 1;
        let timer_id = self.next_timer_id;
        let tx = self.signal_tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Signal::ReconnectDue { timer_id });
        });
        self.reconnect_timer = ReconnectTimer::Pending {
            id: timer_id,
            handle,
        };
        self.state = ManagerState::ReconnectPending;
    }

    /// True once nothing can bring the connection back without an explicit
    /// `open()`.
    pub fn is_terminal(&self) -> bool {
        self.connection.is_none() && matches!(self.reconnect_timer, ReconnectTimer::Idle)
    }

    /// Wait for and handle one signal. Returns false without waiting when
    /// the manager is terminally closed.
    pub async fn step(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.signal_rx.recv().await {
            Some(signal) => {
                self.handle_signal(signal).await;
                true
            }
            None => false,
        }
    }

    /// Drive recovery until the manager is terminally closed.
    pub async fn run(&mut self) {
        while self.step().await {}
        debug!("AMQP connection manager is closed");
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Failure { generation, error }
                if generation == self.generation && self.connection.is_some() =>
            {
                self.on_error(error).await;
            }
            Signal::Failure { generation, error } => {
                debug!(generation, "Ignoring failure from discarded connection: {}", error);
            }
            Signal::ReconnectDue { timer_id } => {
                // An aborted timer may already have queued its signal
                let current = matches!(
                    self.reconnect_timer,
                    ReconnectTimer::Pending { id, .. } if id == timer_id
                );
                if !current {
                    debug!(timer_id, "Ignoring signal from a cancelled reconnect timer");
                    return;
                }
                self.reconnect_timer = ReconnectTimer::Idle;
                self.open().await;
            }
        }
    }

    /// Close channel and connection without scheduling a reconnect.
    pub async fn close(&mut self) -> Result<()> {
        if let ReconnectTimer::Pending { handle, .. } =
            std::mem::replace(&mut self.reconnect_timer, ReconnectTimer::Idle)
        {
            handle.abort();
        }
        // Notifications from the handles being closed are now stale
        self.generation += 1;
        self.state = ManagerState::Closed;

        let channel = self.channel.take();
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        info!("Closing AMQP connection gracefully");
        let mut outcome = Ok(());
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close channel: {}", e);
                outcome = Err(e);
            }
        }
        if let Err(e) = connection.close().await {
            warn!("Failed to close connection: {}", e);
            outcome = outcome.and(Err(e));
        }

        if let Err(e) = self.events.emit(LifecycleEvent::ConnectionClosed).await {
            warn!("connection.closed subscriber failed: {}", e);
        }
        outcome
    }
}

impl<C: AmqpClient> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let ReconnectTimer::Pending { handle, .. } = &self.reconnect_timer {
            handle.abort();
        }
    }
}
