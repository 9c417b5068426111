//! Broker abstraction: connections, channels and topology descriptions.
//!
//! The publisher, scheduler and retry handler only talk to a broker through
//! [`BrokerConnector`] and [`BrokerChannel`]. Two implementations ship with
//! the crate: [`crate::providers::InMemoryBroker`] and
//! [`crate::providers::AmqpConnector`] (RabbitMQ via `lapin`).
//!
//! ## Returned messages
//!
//! Every connection is opened with a [`ReturnNotifier`]. When the broker
//! returns a mandatory message, the provider hands it to the notifier, which
//! forwards it over an unbounded channel to a task owned by the publisher.
//! That task never performs broker operations on the connection that raised
//! the notification.

use crate::error::BrokerError;
use crate::message::{Delivery, HeaderValue, Headers, MessageProperties, ReturnedMessage};
use crate::publisher::RepairTracker;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Queue argument selecting lazy (disk-first) queue mode.
pub const X_QUEUE_MODE: &str = "x-queue-mode";
/// Queue argument holding the per-queue message TTL in milliseconds.
pub const X_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument naming the exchange expired messages are dead-lettered to.
pub const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key of dead-lettered messages.
pub const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header binding argument selecting `all`/`any` matching.
pub const X_MATCH: &str = "x-match";

/// Receiving end of a consumer subscription
pub type DeliveryReceiver = mpsc::Receiver<Delivery>;

// ============================================================================
// Topology Descriptions
// ============================================================================

/// Exchange types used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
        }
    }
}

/// Exchange declaration parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSpec {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    pub fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Durable headers exchange used for delayed messages
    pub fn delayed() -> Self {
        Self::new(ExchangeKind::Headers)
    }
}

impl Default for ExchangeSpec {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Headers::new(),
        }
    }
}

impl QueueOptions {
    /// Options of a delay tier queue
    ///
    /// Messages sit in the (lazy, never consumed) queue for `delay_seconds`
    /// and are then dead-lettered to `dead_letter_exchange` with their
    /// original routing key.
    pub fn delay_tier(delay_seconds: u64, dead_letter_exchange: &str) -> Self {
        let ttl_ms = i64::try_from(delay_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);

        let mut arguments = Headers::new();
        arguments.insert(X_QUEUE_MODE.to_string(), HeaderValue::from("lazy"));
        arguments.insert(X_MESSAGE_TTL.to_string(), HeaderValue::Int(ttl_ms));
        arguments.insert(
            X_DEAD_LETTER_EXCHANGE.to_string(),
            HeaderValue::from(dead_letter_exchange),
        );

        Self {
            durable: true,
            arguments,
            ..Self::default()
        }
    }

    /// Message TTL in milliseconds, if configured
    pub fn message_ttl_ms(&self) -> Option<i64> {
        self.arguments.get(X_MESSAGE_TTL).and_then(HeaderValue::as_i64)
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments
            .get(X_DEAD_LETTER_EXCHANGE)
            .and_then(HeaderValue::as_str)
    }
}

/// How a queue is bound to an exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Direct/topic binding on a routing key (or pattern)
    RoutingKey(String),
    /// Headers binding requiring every listed header to match exactly
    Headers(Headers),
}

impl Binding {
    /// Headers binding on a single header value
    pub fn header(key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        let mut headers = Headers::new();
        headers.insert(key.into(), value.into());
        Self::Headers(headers)
    }

    /// Routing key sent with the bind call
    pub fn routing_key(&self) -> &str {
        match self {
            Self::RoutingKey(key) => key,
            Self::Headers(_) => "",
        }
    }

    /// Binding arguments sent with the bind call
    pub fn arguments(&self) -> Headers {
        match self {
            Self::RoutingKey(_) => Headers::new(),
            Self::Headers(headers) => {
                let mut arguments = headers.clone();
                arguments.insert(X_MATCH.to_string(), HeaderValue::from("all"));
                arguments
            }
        }
    }
}

/// Consumer subscription parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub prefetch: u16,
    pub consumer_tag: Option<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 10,
            consumer_tag: None,
        }
    }
}

// ============================================================================
// Return Notifications
// ============================================================================

/// Hands returned messages from a connection to the publisher's handler task
#[derive(Clone)]
pub struct ReturnNotifier {
    sender: mpsc::UnboundedSender<ReturnedMessage>,
    tracker: Option<Arc<RepairTracker>>,
}

impl ReturnNotifier {
    /// Untracked notifier and its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReturnedMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                tracker: None,
            },
            receiver,
        )
    }

    /// Notifier that registers every returned message as a pending repair
    pub fn tracked(
        tracker: Arc<RepairTracker>,
    ) -> (Self, mpsc::UnboundedReceiver<ReturnedMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                tracker: Some(tracker),
            },
            receiver,
        )
    }

    /// Forward a returned message; never blocks
    pub fn notify(&self, returned: ReturnedMessage) {
        let kind = self.tracker.as_ref().map(|t| t.begin(&returned.exchange));

        if let Err(err) = self.sender.send(returned) {
            let lost = err.0;
            warn!(
                exchange = %lost.exchange,
                routing_key = %lost.routing_key,
                reply_code = lost.reply_code,
                "Returned message dropped: no handler is listening"
            );
            if let (Some(tracker), Some(kind)) = (&self.tracker, kind) {
                tracker.finish(kind);
            }
        }
    }
}

// ============================================================================
// Broker Traits
// ============================================================================

/// Opens broker connections
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open one connection with one channel
    ///
    /// Messages the broker returns for mandatory publishes made on the
    /// resulting channel are delivered to `returns`.
    async fn connect(
        &self,
        label: &str,
        returns: ReturnNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// A single channel on its own connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Label given at connect time (e.g. `publish`, `republish`)
    fn label(&self) -> &str;

    /// Check if both the connection and the channel are open
    fn is_connected(&self) -> bool;

    /// Declare an exchange if it does not exist
    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declare a queue if it does not exist
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &Binding,
    ) -> Result<(), BrokerError>;

    /// Publish a message
    ///
    /// With `mandatory` set, an unroutable message is handed back through the
    /// connection's [`ReturnNotifier`]; the call itself still succeeds.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<(), BrokerError>;

    /// Subscribe to a queue
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryReceiver, BrokerError>;

    /// Close the channel and its connection
    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
