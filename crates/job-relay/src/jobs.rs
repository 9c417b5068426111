//! Job-framework boundary.
//!
//! The core only needs three things from the application's job framework: a
//! serialized payload, the target queue name, and optional publish settings.
//! [`Job`] captures that contract; [`SerializedJob`] is a ready-made
//! implementation using the ActiveJob JSON layout (`job_class`, `job_id`,
//! `queue_name`, `arguments`, ...), which also lets returned messages be
//! traced back to their queue by [`JsonQueueNameResolver`].

use crate::error::{PublishError, ValidationError};
use crate::message::{HeaderValue, Headers, PublishOptions};
use crate::publisher::ReliablePublisher;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Payload field holding the destination queue
pub const QUEUE_NAME_FIELD: &str = "queue_name";

// ============================================================================
// Job Contract
// ============================================================================

/// Per-job publish settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// Routing key to use instead of the queue name
    pub routing_key: Option<String>,
    pub priority: Option<u8>,
    pub headers: Headers,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn into_publish_options(self) -> PublishOptions {
        let mut options = PublishOptions::new().with_headers(self.headers);
        if let Some(priority) = self.priority {
            options = options.with_priority(priority);
        }
        options
    }
}

/// A job that can be enqueued through a [`JobEnqueuer`]
pub trait Job: Send + Sync {
    /// Queue the job is destined for, including any tenant prefix
    ///
    /// The name is used as-is for routing. `queues.name_prefix` is not
    /// applied here; it only renames delay tiers.
    fn queue_name(&self) -> String;

    /// Serialized job
    fn payload(&self) -> Result<Bytes, PublishError>;

    fn publish_options(&self) -> JobOptions {
        JobOptions::default()
    }
}

/// A job in the ActiveJob JSON layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedJob {
    pub job_class: String,
    pub job_id: String,
    pub queue_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
    #[serde(default)]
    pub executions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub options: JobOptions,
}

impl SerializedJob {
    pub fn new(
        job_class: impl Into<String>,
        queue_name: impl Into<String>,
        arguments: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            job_class: job_class.into(),
            job_id: uuid::Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            priority: None,
            arguments,
            executions: 0,
            enqueued_at: None,
            options: JobOptions::default(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

impl Job for SerializedJob {
    fn queue_name(&self) -> String {
        self.queue_name.clone()
    }

    fn payload(&self) -> Result<Bytes, PublishError> {
        let mut job = self.clone();
        job.enqueued_at.get_or_insert_with(Utc::now);
        Ok(Bytes::from(serde_json::to_vec(&job)?))
    }

    fn publish_options(&self) -> JobOptions {
        let mut options = self.options.clone();
        if options.priority.is_none() {
            options.priority = self.priority;
        }
        options
    }
}

// ============================================================================
// Destination Resolution
// ============================================================================

/// Recovers the destination queue of a returned message from its payload
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, payload: &[u8]) -> Result<String, PublishError>;
}

/// Reads the top-level `queue_name` field of a JSON job payload
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonQueueNameResolver;

impl DestinationResolver for JsonQueueNameResolver {
    fn resolve(&self, payload: &[u8]) -> Result<String, PublishError> {
        let unresolved = |message: String| PublishError::UnresolvedDestination { message };

        let job: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| unresolved(e.to_string()))?;

        match job.get(QUEUE_NAME_FIELD).and_then(serde_json::Value::as_str) {
            Some(queue) if !queue.trim().is_empty() => Ok(queue.to_string()),
            Some(_) => Err(unresolved(format!("'{}' is blank", QUEUE_NAME_FIELD))),
            None => Err(unresolved(format!("payload has no '{}'", QUEUE_NAME_FIELD))),
        }
    }
}

// ============================================================================
// Enqueueing
// ============================================================================

/// Converts a scheduled time into a delay in whole seconds
pub type DelayFn = Arc<dyn Fn(DateTime<Utc>) -> i64 + Send + Sync>;

/// Seconds from `now` until `timestamp`, rounded to the nearest second
pub fn delay_between(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> i64 {
    let millis = (timestamp - now).num_milliseconds();
    (millis as f64 / 1000.0).round() as i64
}

/// Default [`DelayFn`]: seconds from now until `timestamp`
pub fn default_delay() -> DelayFn {
    Arc::new(|timestamp| delay_between(Utc::now(), timestamp))
}

/// Publishes [`Job`]s through a [`ReliablePublisher`]
#[derive(Clone)]
pub struct JobEnqueuer {
    publisher: Arc<ReliablePublisher>,
    delay: DelayFn,
}

impl JobEnqueuer {
    pub fn new(publisher: Arc<ReliablePublisher>) -> Self {
        Self {
            publisher,
            delay: default_delay(),
        }
    }

    /// Replace how scheduled times are turned into delays
    pub fn with_delay_fn(
        mut self,
        delay: impl Fn(DateTime<Utc>) -> i64 + Send + Sync + 'static,
    ) -> Self {
        self.delay = Arc::new(delay);
        self
    }

    pub fn publisher(&self) -> &Arc<ReliablePublisher> {
        &self.publisher
    }

    /// Publish a job for immediate processing
    ///
    /// The routing key is the job's override, or its queue name.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::InvalidJob`] for a blank queue name, or any
    /// serialization or publish error.
    pub async fn enqueue(&self, job: &dyn Job) -> Result<(), PublishError> {
        let (payload, routing_key, options) = Self::prepare(job)?;

        debug!(routing_key = %routing_key, "Enqueueing job");
        self.publisher
            .publish(payload, &routing_key, options.into_publish_options())
            .await
    }

    /// Publish a job to run at `timestamp`
    ///
    /// Times in the past (or rounding to now) fall back to [`Self::enqueue`].
    pub async fn enqueue_at(
        &self,
        job: &dyn Job,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PublishError> {
        let delay = (self.delay)(timestamp);
        if delay <= 0 {
            return self.enqueue(job).await;
        }

        let (payload, routing_key, options) = Self::prepare(job)?;
        let delay = u64::try_from(delay).unwrap_or(u64::MAX);

        debug!(routing_key = %routing_key, delay = delay, "Scheduling job");
        self.publisher
            .publish_delayed(payload, &routing_key, delay, options.into_publish_options())
            .await
    }

    fn prepare(job: &dyn Job) -> Result<(Bytes, String, JobOptions), PublishError> {
        let queue = job.queue_name();
        if queue.trim().is_empty() {
            return Err(ValidationError::Required {
                field: QUEUE_NAME_FIELD.to_string(),
            }
            .into());
        }

        let mut options = job.publish_options();
        let routing_key = options.routing_key.take().unwrap_or(queue);
        Ok((job.payload()?, routing_key, options))
    }
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
