//! RabbitMQ provider built on `lapin` (AMQP 0-9-1).
//!
//! Each [`AmqpConnector::connect`] call opens its own connection with a single
//! channel in publisher-confirm mode. A `basic.return` for a mandatory
//! publish arrives attached to the publish confirmation; it is forwarded to
//! the connection's [`ReturnNotifier`] and the publish itself succeeds. A
//! broker `nack` fails the publish.
//!
//! Round trips are bounded by the client's own connection timeouts and the
//! heartbeat carried in the connection URI.

use crate::broker::{
    Binding, BrokerChannel, BrokerConnector, ConsumeOptions, DeliveryReceiver, ExchangeKind,
    ExchangeSpec, QueueOptions, ReturnNotifier,
};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::message::{
    Acknowledger, Delivery, HeaderValue, Headers, MessageProperties, ReturnedMessage,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::{BasicReturnMessage, Delivery as AmqpDelivery};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, ByteArray, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

// ============================================================================
// Connector
// ============================================================================

/// Opens RabbitMQ connections from a [`BrokerConfig`]
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn connection_name(&self, label: &str) -> String {
        let base = self.config.connection_name.as_deref().unwrap_or("job-relay");
        format!("{} ({})", base, label)
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(
        &self,
        label: &str,
        returns: ReturnNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name(label)));

        let connection = Connection::connect(&self.config.connection_uri(), properties)
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                message: e.to_string(),
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                message: format!("channel creation failed: {}", e),
            })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                message: format!("enabling publisher confirms failed: {}", e),
            })?;

        info!(connection = %label, "Connected to broker");

        Ok(Arc::new(AmqpChannel {
            label: label.to_string(),
            connection,
            channel,
            returns,
        }))
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A confirm-mode channel on its own connection
pub struct AmqpChannel {
    label: String,
    connection: Connection,
    channel: Channel,
    returns: ReturnNotifier,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(name, to_exchange_kind(spec.kind), options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::DeclareFailed {
                object: "exchange".to_string(),
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };

        self.channel
            .queue_declare(name, declare, to_field_table(&options.arguments))
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::DeclareFailed {
                object: "queue".to_string(),
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &Binding,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding.routing_key(),
                QueueBindOptions::default(),
                to_field_table(&binding.arguments()),
            )
            .await
            .map_err(|e| BrokerError::BindFailed {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                message: e.to_string(),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<(), BrokerError> {
        let publish_failed = |e: lapin::Error| BrokerError::PublishFailed {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: e.to_string(),
        };

        let options = BasicPublishOptions {
            mandatory,
            ..BasicPublishOptions::default()
        };

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options,
                &payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(publish_failed)?
            .await
            .map_err(publish_failed)?;

        match confirmation {
            Confirmation::Ack(returned) => {
                if let Some(returned) = returned {
                    debug!(
                        connection = %self.label,
                        exchange = %exchange,
                        routing_key = %routing_key,
                        reply_code = returned.reply_code,
                        "Broker returned message"
                    );
                    self.returns.notify(from_return(*returned));
                }
                Ok(())
            }
            Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(BrokerError::Nacked {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            }),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryReceiver, BrokerError> {
        let consume_failed = |e: lapin::Error| BrokerError::ConsumeFailed {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        self.channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await
            .map_err(consume_failed)?;

        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.label, uuid::Uuid::new_v4()));

        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(consume_failed)?;

        let (sender, receiver) = mpsc::channel(usize::from(options.prefetch.max(1)));
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        if sender.send(from_delivery(delivery, &queue_name)).await.is_err() {
                            debug!(queue = %queue_name, "Delivery receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue_name, error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
        });

        Ok(receiver)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "OK")
                .await
                .map_err(|e| BrokerError::ConnectionFailed {
                    message: e.to_string(),
                })?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(|e| BrokerError::ConnectionFailed {
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckFailed {
                message: e.to_string(),
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::AckFailed {
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn to_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

pub(crate) fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        HeaderValue::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        HeaderValue::Table(table) => AMQPValue::FieldTable(to_field_table(table)),
        HeaderValue::Bytes(bytes) => AMQPValue::ByteArray(ByteArray::from(bytes.clone())),
        HeaderValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        HeaderValue::Void => AMQPValue::Void,
    }
}

pub(crate) fn from_amqp_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::DecimalValue(d) => {
            HeaderValue::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
        }
        AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_string()),
        AMQPValue::LongString(v) => {
            HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(values) => {
            HeaderValue::Array(values.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::Timestamp(v) => HeaderValue::Timestamp(*v),
        AMQPValue::FieldTable(table) => HeaderValue::Table(from_field_table(table)),
        AMQPValue::ByteArray(bytes) => HeaderValue::Bytes(bytes.as_slice().to_vec()),
        AMQPValue::Void => HeaderValue::Void,
    }
}

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    table
}

pub(crate) fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

pub(crate) fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(v) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(v.as_str()));
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_field_table(&properties.headers));
    }
    if let Some(v) = properties.delivery_mode {
        basic = basic.with_delivery_mode(v);
    }
    if let Some(v) = properties.priority {
        basic = basic.with_priority(v);
    }
    if let Some(v) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = properties.timestamp {
        basic = basic.with_timestamp(v);
    }
    if let Some(v) = &properties.kind {
        basic = basic.with_kind(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(v.as_str()));
    }

    basic
}

pub(crate) fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    MessageProperties {
        content_type: text(basic.content_type()),
        content_encoding: text(basic.content_encoding()),
        headers: basic
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        delivery_mode: *basic.delivery_mode(),
        priority: *basic.priority(),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        expiration: text(basic.expiration()),
        message_id: text(basic.message_id()),
        timestamp: *basic.timestamp(),
        kind: text(basic.kind()),
        app_id: text(basic.app_id()),
    }
}

fn from_return(returned: BasicReturnMessage) -> ReturnedMessage {
    ReturnedMessage {
        reply_code: returned.reply_code,
        reply_text: returned.reply_text.as_str().to_string(),
        exchange: returned.delivery.exchange.as_str().to_string(),
        routing_key: returned.delivery.routing_key.as_str().to_string(),
        properties: from_basic_properties(&returned.delivery.properties),
        payload: Bytes::from(returned.delivery.data),
    }
}

fn from_delivery(delivery: AmqpDelivery, queue: &str) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);
    Delivery::new(
        Bytes::from(delivery.data),
        delivery.exchange.as_str().to_string(),
        delivery.routing_key.as_str().to_string(),
        queue.to_string(),
        delivery.redelivered,
        properties,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}
