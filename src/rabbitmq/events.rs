// src/rabbitmq/events.rs
// Typed publish/subscribe surface for lifecycle transitions and messages

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionOpened,
    ConnectionClosed,
    ChannelOpened,
    Message,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ConnectionOpened => "connection.opened",
            EventKind::ConnectionClosed => "connection.closed",
            EventKind::ChannelOpened => "channel.opened",
            EventKind::Message => "message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = RabbitMQError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "connection.opened" => Ok(EventKind::ConnectionOpened),
            "connection.closed" => Ok(EventKind::ConnectionClosed),
            "channel.opened" => Ok(EventKind::ChannelOpened),
            "message" => Ok(EventKind::Message),
            other => Err(RabbitMQError::Configuration(format!(
                "unknown event name '{}'",
                other
            ))),
        }
    }
}

/// A lifecycle transition or a delivered application message.
///
/// `ChannelOpened` carries a handle to the channel that was just opened so
/// subscribers can declare topology against that generation.
#[derive(Debug, Clone)]
pub enum LifecycleEvent<Ch> {
    ConnectionOpened,
    ConnectionClosed,
    ChannelOpened(Ch),
    MessageReceived(Value),
}

impl<Ch> LifecycleEvent<Ch> {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::ConnectionOpened => EventKind::ConnectionOpened,
            LifecycleEvent::ConnectionClosed => EventKind::ConnectionClosed,
            LifecycleEvent::ChannelOpened(_) => EventKind::ChannelOpened,
            LifecycleEvent::MessageReceived(_) => EventKind::Message,
        }
    }
}

type Handler<Ch> = Arc<dyn Fn(LifecycleEvent<Ch>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Dispatches events to handlers registered per `EventKind`, in
/// subscription order, one at a time. The first handler error stops
/// dispatch and is returned to the emitter.
pub struct EventNotifier<Ch> {
    subscriptions: Mutex<Vec<(EventKind, Handler<Ch>)>>,
}

impl<Ch> Default for EventNotifier<Ch> {
    fn default() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

impl<Ch: Clone + Send + 'static> EventNotifier<Ch> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(LifecycleEvent<Ch>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler<Ch> = Arc::new(move |event| handler(event).boxed());
        match self.subscriptions.lock() {
            Ok(mut subs) => subs.push((kind, handler)),
            Err(poisoned) => poisoned.into_inner().push((kind, handler)),
        }
        debug!(event = %kind, "Subscriber registered");
    }

    /// Convenience for handlers that never suspend.
    pub fn subscribe_sync<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&LifecycleEvent<Ch>) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(kind, move |event| {
            let outcome = handler(&event);
            async move { outcome }
        });
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.snapshot(kind).len()
    }

    pub async fn emit(&self, event: LifecycleEvent<Ch>) -> Result<()> {
        let kind = event.kind();
        // Handlers run without the lock held so they may subscribe in turn
        for handler in self.snapshot(kind) {
            handler(event.clone()).await?;
        }
        Ok(())
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Handler<Ch>> {
        let subs = match self.subscriptions.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| h.clone())
            .collect()
    }
}
