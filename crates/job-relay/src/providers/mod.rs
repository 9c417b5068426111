//! Broker implementations.
//!
//! - [`InMemoryBroker`]: in-process broker for tests and local development
//! - [`AmqpConnector`]: RabbitMQ over AMQP 0-9-1

pub mod amqp;
pub mod memory;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use memory::{BrokerMessage, InMemoryBroker, InMemoryChannel, PublishRecord};
