//! Message types: header values, broker properties, returned messages,
//! deliveries and the job envelope.

use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Content type used for serialized job payloads.
pub const JOB_CONTENT_TYPE: &str = "application/vnd.activejob+json";

// ============================================================================
// Header Values
// ============================================================================

/// Message headers, ordered by key
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single AMQP header value
///
/// Covers the field-table shapes this crate reads and writes: numbers,
/// strings, timestamps and nested arrays/tables (e.g. `x-death`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<HeaderValue>),
    Table(Headers),
    Bytes(Vec<u8>),
    Timestamp(u64),
    Void,
}

impl HeaderValue {
    /// Integer view of the value; timestamps and integral strings are accepted
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Timestamp(v) => i64::try_from(*v).ok(),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HeaderValue]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Headers> {
        match self {
            Self::Table(table) => Some(table),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<Vec<HeaderValue>> for HeaderValue {
    fn from(values: Vec<HeaderValue>) -> Self {
        Self::Array(values)
    }
}

impl From<Headers> for HeaderValue {
    fn from(table: Headers) -> Self {
        Self::Table(table)
    }
}

// ============================================================================
// Broker Properties
// ============================================================================

/// Broker message properties (AMQP basic properties)
///
/// Passed through unchanged on publish and republish. Priority in particular
/// is never interpreted by this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub app_id: Option<String>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Mark the message persistent (delivery mode 2)
    pub fn persistent(mut self) -> Self {
        self.delivery_mode = Some(2);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Optional headers and properties accepted by the publish entry points
///
/// Headers given here are merged over `properties.headers`; on a key clash
/// the explicit header wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub headers: Headers,
    pub properties: MessageProperties,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.properties.priority = Some(priority);
        self
    }

    /// Collapse into the final property set sent to the broker
    pub fn into_properties(self) -> MessageProperties {
        let mut properties = self.properties;
        properties.headers.extend(self.headers);
        properties
    }
}

// ============================================================================
// Returned Messages
// ============================================================================

/// A mandatory message the broker could not route and sent back
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

impl ReturnedMessage {
    /// Check if the broker returned the message because no queue matched
    pub fn is_no_route(&self) -> bool {
        self.reply_code == crate::error::NO_ROUTE
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the delivery from its queue
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject the delivery, optionally putting it back on the queue
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message delivered to a consumer
pub struct Delivery {
    pub payload: Bytes,
    pub exchange: String,
    pub routing_key: String,
    /// Queue the consumer is subscribed to
    pub queue: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Bytes,
        exchange: String,
        routing_key: String,
        queue: String,
        redelivered: bool,
        properties: MessageProperties,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            exchange,
            routing_key,
            queue,
            redelivered,
            properties,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ============================================================================
// Job Envelope
// ============================================================================

/// A deserialized job together with the metadata of the delivery carrying it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub job: T,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub redelivered: bool,
    pub headers: Headers,
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decode the delivery payload as a JSON job
    ///
    /// Payloads are JSON regardless of the advertised content type, so
    /// messages published by older producers still decode.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, serde_json::Error> {
        let job = serde_json::from_slice(&delivery.payload)?;
        Ok(Self {
            job,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            queue: delivery.queue.clone(),
            redelivered: delivery.redelivered,
            headers: delivery.properties.headers.clone(),
        })
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
