//! # Job Relay
//!
//! Reliable job publishing on top of an AMQP 0-9-1 broker (RabbitMQ).
//!
//! This library provides:
//! - Mandatory publishing with on-the-fly creation of missing queues and
//!   bindings for unrouted messages
//! - Delayed delivery through TTL delay-tier queues and dead-lettering,
//!   without an external scheduler
//! - Retry with a fixed backoff schedule, recording failure history in
//!   RabbitMQ-compatible `x-death` headers
//! - Consumer selection by strategy and topic-style queue patterns
//!
//! ## Module Organization
//!
//! - [`broker`] - Broker traits and topology descriptions
//! - [`providers`] - In-memory broker and the `lapin` AMQP provider
//! - [`publisher`] - The reliable publisher and its return handler
//! - [`delay`] - Delay tier naming and declaration
//! - [`retry`] - Failure recording and rescheduling
//! - [`backoff`] - The retry schedule
//! - [`patterns`] - Queue pattern matching
//! - [`jobs`] - Job contract, enqueueing and destination resolution
//! - [`workers`] - Consumer registry and the job worker loop
//! - [`config`] - Layered configuration
//! - [`message`] - Headers, properties, deliveries and envelopes
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use job_relay::{AmqpConnector, JobEnqueuer, RelayConfig, ReliablePublisher, SerializedJob};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::load(None)?;
//! let connector = Arc::new(AmqpConnector::new(config.broker.clone()));
//! let publisher = Arc::new(ReliablePublisher::new(connector, config));
//!
//! let enqueuer = JobEnqueuer::new(publisher.clone());
//! enqueuer
//!     .enqueue(&SerializedJob::new("ImportJob", "default", vec![]))
//!     .await?;
//!
//! publisher.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod delay;
pub mod error;
pub mod jobs;
pub mod message;
pub mod patterns;
pub mod providers;
pub mod publisher;
pub mod retry;
pub mod workers;

// Re-export commonly used types at crate root for convenience
pub use backoff::{retry_delay, BackoffFn, BACKOFF_SCHEDULE};
pub use broker::{
    Binding, BrokerChannel, BrokerConnector, ConsumeOptions, ExchangeKind, ExchangeSpec,
    QueueOptions, ReturnNotifier,
};
pub use config::RelayConfig;
pub use delay::{DelayScheduler, QueueNaming, DELAY_HEADER};
pub use error::{
    BrokerError, ConfigurationError, PublishError, RetryError, SelectionError, ValidationError,
    WorkerError,
};
pub use jobs::{
    DestinationResolver, Job, JobEnqueuer, JobOptions, JsonQueueNameResolver, SerializedJob,
};
pub use message::{
    Delivery, Envelope, HeaderValue, Headers, MessageProperties, PublishOptions, ReturnedMessage,
    JOB_CONTENT_TYPE,
};
pub use patterns::QueuePattern;
pub use providers::{AmqpConnector, InMemoryBroker};
pub use publisher::{PublishFailure, ReliablePublisher};
pub use retry::{JobFailure, RetryHandler};
pub use workers::{
    json_handler, start_workers, ConsumerDescriptor, ConsumerRegistry, JobHandler, JobWorker,
    WorkerStats, WorkerStrategy,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
