//! Delay tiers: TTL queues that hold a message for a fixed number of seconds.
//!
//! A delayed message is published to the headers exchange `<exchange>-delayed`
//! with a `delay` header. Each distinct delay value has one durable, lazy queue
//! bound on `delay = <seconds>`. The queue never has consumers; once the
//! message TTL elapses the broker dead-letters the message back to the main
//! exchange with its original routing key.

use crate::broker::{Binding, BrokerChannel, QueueOptions};
use crate::error::BrokerError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

/// Header carrying the delay in seconds.
///
/// Headers exchanges ignore `x-` prefixed headers when matching, so the name
/// carries no prefix.
pub const DELAY_HEADER: &str = "delay";

// ============================================================================
// Queue Naming
// ============================================================================

/// Application queue naming convention shared by main and delay tier queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNaming {
    prefix: Option<String>,
    delimiter: String,
    delayed_prefix: String,
}

impl QueueNaming {
    pub fn new(prefix: Option<String>, delimiter: String, delayed_prefix: String) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            delimiter,
            delayed_prefix,
        }
    }

    /// Full queue name for a base name, e.g. `tenant_custom`
    pub fn queue_name(&self, base: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}{}", prefix, self.delimiter, base),
            None => base.to_string(),
        }
    }

    /// Name of the tier queue for `delay_seconds`, e.g. `delayed:30`
    pub fn delayed_queue_name(&self, delay_seconds: u64) -> String {
        self.queue_name(&format!("{}:{}", self.delayed_prefix, delay_seconds))
    }
}

impl Default for QueueNaming {
    fn default() -> Self {
        Self::new(None, "_".to_string(), "delayed".to_string())
    }
}

// ============================================================================
// Delay Scheduler
// ============================================================================

/// Declares delay tier queues and remembers which ones exist
///
/// Declarations are cached per tier queue name. Concurrent first use of the
/// same delay performs a single declare; later calls return immediately.
pub struct DelayScheduler {
    naming: QueueNaming,
    delayed_exchange: String,
    dead_letter_exchange: String,
    tiers: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl DelayScheduler {
    /// Create a scheduler
    ///
    /// # Arguments
    ///
    /// * `naming` - Queue naming convention for tier queues
    /// * `delayed_exchange` - Headers exchange tier queues are bound to
    /// * `dead_letter_exchange` - Exchange expired messages return to
    pub fn new(
        naming: QueueNaming,
        delayed_exchange: impl Into<String>,
        dead_letter_exchange: impl Into<String>,
    ) -> Self {
        Self {
            naming,
            delayed_exchange: delayed_exchange.into(),
            dead_letter_exchange: dead_letter_exchange.into(),
            tiers: Mutex::new(HashMap::new()),
        }
    }

    pub fn delayed_exchange(&self) -> &str {
        &self.delayed_exchange
    }

    pub fn tier_queue_name(&self, delay_seconds: u64) -> String {
        self.naming.delayed_queue_name(delay_seconds)
    }

    pub fn tier_options(&self, delay_seconds: u64) -> QueueOptions {
        QueueOptions::delay_tier(delay_seconds, &self.dead_letter_exchange)
    }

    /// Check whether the tier for `delay_seconds` was declared by this scheduler
    pub fn is_declared(&self, delay_seconds: u64) -> bool {
        let name = self.tier_queue_name(delay_seconds);
        self.tiers
            .lock()
            .map(|tiers| tiers.get(&name).is_some_and(|cell| cell.initialized()))
            .unwrap_or(false)
    }

    /// Ensure the tier for `delay_seconds` exists, declaring it on first use
    ///
    /// Returns the tier queue name.
    ///
    /// # Errors
    ///
    /// Returns the broker error of a failed declare or bind. A failed attempt
    /// is not cached, so the next call declares again.
    ///
    /// # Example
    ///
    /// ```rust
    /// use job_relay::broker::{BrokerConnector, ExchangeSpec, ReturnNotifier};
    /// use job_relay::delay::{DelayScheduler, QueueNaming};
    /// use job_relay::providers::InMemoryBroker;
    ///
    /// # tokio_test::block_on(async {
    /// let broker = InMemoryBroker::new();
    /// let (notifier, _returns) = ReturnNotifier::channel();
    /// let channel = broker.connect("publish", notifier).await.unwrap();
    /// channel
    ///     .declare_exchange("activejob-delayed", &ExchangeSpec::delayed())
    ///     .await
    ///     .unwrap();
    ///
    /// let scheduler =
    ///     DelayScheduler::new(QueueNaming::default(), "activejob-delayed", "activejob");
    /// let queue = scheduler.ensure_tier(channel.as_ref(), 30).await.unwrap();
    ///
    /// assert_eq!(queue, "delayed:30");
    /// assert_eq!(broker.declare_count("delayed:30"), 1);
    /// # });
    /// ```
    pub async fn ensure_tier(
        &self,
        channel: &dyn BrokerChannel,
        delay_seconds: u64,
    ) -> Result<String, BrokerError> {
        let name = self.tier_queue_name(delay_seconds);
        let cell = self.tier_cell(&name);

        cell.get_or_try_init(|| self.declare(channel, &name, delay_seconds))
            .await?;

        Ok(name)
    }

    /// Declare the tier for `delay_seconds` regardless of the cache
    ///
    /// Used when the broker reports the tier missing (e.g. deleted by an
    /// operator after it was cached).
    pub async fn declare_tier(
        &self,
        channel: &dyn BrokerChannel,
        delay_seconds: u64,
    ) -> Result<String, BrokerError> {
        let name = self.tier_queue_name(delay_seconds);
        self.declare(channel, &name, delay_seconds).await?;

        // A concurrent ensure_tier may already hold the cell; either way the tier exists
        let _ = self.tier_cell(&name).set(());

        Ok(name)
    }

    fn tier_cell(&self, name: &str) -> Arc<OnceCell<()>> {
        let mut tiers = match self.tiers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tiers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn declare(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
        delay_seconds: u64,
    ) -> Result<(), BrokerError> {
        debug!(
            queue = %name,
            delay = delay_seconds,
            exchange = %self.delayed_exchange,
            channel = channel.label(),
            "Declaring delay tier"
        );

        channel
            .declare_queue(name, &self.tier_options(delay_seconds))
            .await?;

        let delay = i64::try_from(delay_seconds).unwrap_or(i64::MAX);
        channel
            .bind_queue(
                name,
                &self.delayed_exchange,
                &Binding::header(DELAY_HEADER, delay),
            )
            .await
    }
}

#[cfg(test)]
#[path = "delay_tests.rs"]
mod tests;
