//! Retry handling for failed job deliveries.
//!
//! A delivery whose handler fails is not requeued. Instead its headers are
//! updated the way a broker dead-lettering the message would update them, the
//! triggering error is recorded, and the message is republished as a new
//! delayed message. The delay comes from the backoff schedule, indexed by how
//! many times the message failed on the delivering queue. The original
//! delivery is acknowledged once the delayed copy has been published.
//!
//! ## Headers
//!
//! - `x-death`: array of tables, one per queue, each
//!   `{queue, exchange, routing-keys, reason, count, time}`
//! - `x-first-death-exchange`, `x-first-death-queue`, `x-first-death-reason`:
//!   set on the first failure, never overwritten
//! - `x-last-error-name`: type name of the latest error
//! - `x-last-error-details`: base64 of the gzipped error details

use crate::backoff::{default_backoff, BackoffFn};
use crate::error::RetryError;
use crate::message::{Delivery, HeaderValue, Headers, PublishOptions};
use crate::publisher::ReliablePublisher;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::error::Error as StdError;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{info, warn};

pub const X_DEATH: &str = "x-death";
pub const X_FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";
pub const X_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
pub const X_FIRST_DEATH_REASON: &str = "x-first-death-reason";
pub const X_LAST_ERROR_NAME: &str = "x-last-error-name";
pub const X_LAST_ERROR_DETAILS: &str = "x-last-error-details";

/// Death reason recorded for failed processing
pub const REASON_REJECTED: &str = "rejected";
/// Death reason a broker records when a message TTL elapses
pub const REASON_EXPIRED: &str = "expired";

// ============================================================================
// Job Failures
// ============================================================================

/// The error a job handler failed with
///
/// Any `std::error::Error` converts into a `JobFailure`, capturing its type
/// name and its full details (message, source chain and, when enabled, a
/// backtrace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    name: String,
    details: String,
}

impl JobFailure {
    pub fn new(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: details.into(),
        }
    }

    /// Capture a boxed error under an explicit name
    pub fn from_boxed(name: impl Into<String>, error: Box<dyn StdError + Send + Sync>) -> Self {
        Self::new(name, render_details(error.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn details(&self) -> &str {
        &self.details
    }
}

impl<E> From<E> for JobFailure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(std::any::type_name::<E>(), render_details(&error))
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.details.lines().next().unwrap_or_default();
        write!(f, "{}: {}", self.name, message)
    }
}

fn render_details(error: &(dyn StdError + 'static)) -> String {
    let mut details = error.to_string();

    let mut source = error.source();
    while let Some(cause) = source {
        details.push_str("\nCaused by: ");
        details.push_str(&cause.to_string());
        source = cause.source();
    }

    let backtrace = std::backtrace::Backtrace::capture();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        details.push('\n');
        details.push_str(&backtrace.to_string());
    }

    details
}

// ============================================================================
// Header Updates
// ============================================================================

/// Where and why a message died
#[derive(Debug, Clone, Copy)]
pub struct Death<'a> {
    pub queue: &'a str,
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub reason: &'a str,
}

/// Build a single `x-death` table
pub fn death_entry(death: &Death<'_>, count: i64, time: u64) -> Headers {
    let mut entry = Headers::new();
    entry.insert("count".to_string(), HeaderValue::Int(count));
    entry.insert("reason".to_string(), HeaderValue::from(death.reason));
    entry.insert("queue".to_string(), HeaderValue::from(death.queue));
    entry.insert("time".to_string(), HeaderValue::Timestamp(time));
    entry.insert("exchange".to_string(), HeaderValue::from(death.exchange));
    entry.insert(
        "routing-keys".to_string(),
        HeaderValue::Array(vec![HeaderValue::from(death.routing_key)]),
    );
    entry
}

/// Set the `x-first-death-*` headers unless already present
pub fn record_first_death(headers: &mut Headers, death: &Death<'_>) {
    headers
        .entry(X_FIRST_DEATH_EXCHANGE.to_string())
        .or_insert_with(|| HeaderValue::from(death.exchange));
    headers
        .entry(X_FIRST_DEATH_QUEUE.to_string())
        .or_insert_with(|| HeaderValue::from(death.queue));
    headers
        .entry(X_FIRST_DEATH_REASON.to_string())
        .or_insert_with(|| HeaderValue::from(death.reason));
}

/// Failure count recorded for `queue`, if any
pub fn death_count(headers: &Headers, queue: &str) -> Option<i64> {
    headers
        .get(X_DEATH)?
        .as_array()?
        .iter()
        .filter_map(HeaderValue::as_table)
        .find(|entry| entry.get("queue").and_then(HeaderValue::as_str) == Some(queue))
        .and_then(|entry| entry.get("count"))
        .and_then(HeaderValue::as_i64)
}

/// Record a failure on `death.queue` and return the updated count
///
/// Increments the existing entry for the queue or appends a new one with
/// count 1. Entries of other queues are left untouched.
///
/// # Errors
///
/// Returns [`RetryError::MalformedHeader`] if `x-death` is present but is
/// not an array.
pub fn record_death(
    headers: &mut Headers,
    death: &Death<'_>,
    time: u64,
) -> Result<i64, RetryError> {
    record_first_death(headers, death);

    let deaths = match headers
        .entry(X_DEATH.to_string())
        .or_insert_with(|| HeaderValue::Array(Vec::new()))
    {
        HeaderValue::Array(deaths) => deaths,
        _ => {
            return Err(RetryError::MalformedHeader {
                header: X_DEATH.to_string(),
                queue: death.queue.to_string(),
            })
        }
    };

    for entry in deaths.iter_mut() {
        let HeaderValue::Table(entry) = entry else {
            continue;
        };
        if entry.get("queue").and_then(HeaderValue::as_str) != Some(death.queue) {
            continue;
        }

        let count = entry
            .get("count")
            .and_then(HeaderValue::as_i64)
            .unwrap_or(0)
            .saturating_add(1);
        entry.insert("count".to_string(), HeaderValue::Int(count));
        return Ok(count);
    }

    deaths.push(HeaderValue::Table(death_entry(death, 1, time)));
    Ok(1)
}

/// Store the error name and compressed details, replacing earlier values
pub fn record_error(headers: &mut Headers, failure: &JobFailure) -> Result<(), RetryError> {
    headers.insert(
        X_LAST_ERROR_NAME.to_string(),
        HeaderValue::from(failure.name()),
    );
    headers.insert(
        X_LAST_ERROR_DETAILS.to_string(),
        HeaderValue::String(encode_error_details(failure.details())?),
    );
    Ok(())
}

/// base64(gzip(details))
pub fn encode_error_details(details: &str) -> Result<String, RetryError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(details.as_bytes())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Reverse of [`encode_error_details`]; line breaks in the input are ignored
pub fn decode_error_details(encoded: &str) -> Result<String, RetryError> {
    let compact: String = encoded.split_whitespace().collect();
    let compressed = STANDARD
        .decode(compact)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut details = String::new();
    GzDecoder::new(compressed.as_slice()).read_to_string(&mut details)?;
    Ok(details)
}

// ============================================================================
// Retry Handler
// ============================================================================

/// Reschedules failed deliveries through the delay tiers
pub struct RetryHandler {
    publisher: Arc<ReliablePublisher>,
    backoff: BackoffFn,
}

impl RetryHandler {
    pub fn new(publisher: Arc<ReliablePublisher>) -> Self {
        Self {
            publisher,
            backoff: default_backoff(),
        }
    }

    /// Replace the retry schedule (death count to delay seconds)
    pub fn with_backoff(mut self, backoff: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Republish a failed delivery with a delay, then acknowledge it
    ///
    /// Returns the delay in seconds the message was rescheduled with.
    ///
    /// # Errors
    ///
    /// Returns an error if the headers cannot be updated or the delayed
    /// publish fails; the delivery is then left unacknowledged. Returns
    /// [`RetryError::Ack`] if the delayed copy was published but the
    /// acknowledgement failed.
    pub async fn on_failure(
        &self,
        delivery: &Delivery,
        failure: &JobFailure,
    ) -> Result<u64, RetryError> {
        let mut properties = delivery.properties.clone();
        let death = Death {
            queue: &delivery.queue,
            exchange: &delivery.exchange,
            routing_key: &delivery.routing_key,
            reason: REASON_REJECTED,
        };

        record_error(&mut properties.headers, failure)?;
        let count = record_death(&mut properties.headers, &death, unix_now())?;
        let delay = (self.backoff)(u64::try_from(count).unwrap_or(0));

        warn!(
            queue = %delivery.queue,
            routing_key = %delivery.routing_key,
            count = count,
            delay = delay,
            error = %failure,
            "Job failed, rescheduling"
        );

        self.publisher
            .publish_delayed(
                delivery.payload.clone(),
                &delivery.routing_key,
                delay,
                PublishOptions::new().with_properties(properties),
            )
            .await?;

        delivery.ack().await.map_err(RetryError::Ack)?;

        info!(
            queue = %delivery.queue,
            delay = delay,
            "Failed job rescheduled"
        );
        Ok(delay)
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
