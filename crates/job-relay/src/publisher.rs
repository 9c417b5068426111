//! Reliable publisher: mandatory publishing with on-the-fly routing repair.
//!
//! Every message is published as *mandatory*, so the broker hands back
//! anything it cannot route instead of dropping it. Returned messages travel
//! over a [`ReturnNotifier`] to a handler task which, for the `NO_ROUTE`
//! reply code:
//!
//! - immediate messages: declares the destination queue recovered from the
//!   payload, binds it with the original routing key and republishes
//! - delayed messages: redeclares the delay tier and republishes
//!
//! The handler performs all broker work on a second *republish* connection.
//! The publish connection that raised the notification is never used from
//! the handler.
//!
//! Any other reply code is unrecoverable: it is logged and broadcast to
//! [`ReliablePublisher::subscribe_failures`] subscribers.

use crate::broker::{
    Binding, BrokerChannel, BrokerConnector, ExchangeSpec, QueueOptions, ReturnNotifier,
};
use crate::config::RelayConfig;
use crate::delay::{DelayScheduler, DELAY_HEADER};
use crate::error::{BrokerError, PublishError};
use crate::jobs::{DestinationResolver, JsonQueueNameResolver};
use crate::message::{
    HeaderValue, MessageProperties, PublishOptions, ReturnedMessage, JOB_CONTENT_TYPE,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Label of the connection used by `publish` and `publish_delayed`
pub const PUBLISH_CONNECTION: &str = "publish";

/// Label of the connection used by the return handler
pub const REPUBLISH_CONNECTION: &str = "republish";

const FAILURE_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Repair Tracking
// ============================================================================

/// Which exchange a returned message was published to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    Immediate,
    Delayed,
}

/// Counts returned messages whose repair has not finished yet
///
/// A repair begins when the broker hands a message back and finishes once the
/// handler has republished, discarded or reported it. Shutdown waits for both
/// counters to reach zero.
#[derive(Debug)]
pub struct RepairTracker {
    delayed_exchange: String,
    immediate: AtomicUsize,
    delayed: AtomicUsize,
}

impl RepairTracker {
    pub fn new(delayed_exchange: impl Into<String>) -> Self {
        Self {
            delayed_exchange: delayed_exchange.into(),
            immediate: AtomicUsize::new(0),
            delayed: AtomicUsize::new(0),
        }
    }

    pub fn kind_for(&self, exchange: &str) -> RepairKind {
        if exchange == self.delayed_exchange {
            RepairKind::Delayed
        } else {
            RepairKind::Immediate
        }
    }

    /// Register a pending repair for a message returned by `exchange`
    pub fn begin(&self, exchange: &str) -> RepairKind {
        let kind = self.kind_for(exchange);
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        kind
    }

    pub fn finish(&self, kind: RepairKind) {
        let _ = self
            .counter(kind)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn pending_immediate(&self) -> usize {
        self.immediate.load(Ordering::SeqCst)
    }

    pub fn pending_delayed(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending_immediate() == 0 && self.pending_delayed() == 0
    }

    fn counter(&self, kind: RepairKind) -> &AtomicUsize {
        match kind {
            RepairKind::Immediate => &self.immediate,
            RepairKind::Delayed => &self.delayed,
        }
    }
}

/// A returned message that could not be repaired
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub message: ReturnedMessage,
    pub reason: String,
}

// ============================================================================
// Return Handling
// ============================================================================

/// State the return handler task needs; owns the republish channel
struct ReturnHandler {
    republish: Arc<dyn BrokerChannel>,
    exchange: String,
    queue_options: QueueOptions,
    handle_unrouted_messages: bool,
    scheduler: Arc<DelayScheduler>,
    resolver: Arc<dyn DestinationResolver>,
    tracker: Arc<RepairTracker>,
    failures: broadcast::Sender<PublishFailure>,
}

impl ReturnHandler {
    async fn run(self, mut returns: mpsc::UnboundedReceiver<ReturnedMessage>) {
        while let Some(returned) = returns.recv().await {
            let kind = self.tracker.kind_for(&returned.exchange);

            let outcome = if !returned.is_no_route() {
                Err(PublishError::Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.clone(),
                    exchange: returned.exchange.clone(),
                    routing_key: returned.routing_key.clone(),
                })
            } else {
                match kind {
                    RepairKind::Immediate => self.repair_immediate(&returned).await,
                    RepairKind::Delayed => self.repair_delayed(&returned).await,
                }
            };

            if let Err(e) = outcome {
                self.report(returned, e);
            }

            self.tracker.finish(kind);
        }

        debug!("Return handler stopped: publish connection closed");
    }

    async fn repair_immediate(&self, returned: &ReturnedMessage) -> Result<(), PublishError> {
        if !self.handle_unrouted_messages {
            warn!(
                exchange = %returned.exchange,
                routing_key = %returned.routing_key,
                reply_code = returned.reply_code,
                payload = %String::from_utf8_lossy(&returned.payload),
                "Message is not routed and was discarded"
            );
            return Ok(());
        }

        let queue = self.resolver.resolve(&returned.payload)?;

        debug!(
            queue = %queue,
            exchange = %self.exchange,
            routing_key = %returned.routing_key,
            "Creating queue and binding for unrouted message"
        );

        self.republish
            .declare_queue(&queue, &self.queue_options)
            .await?;
        self.republish
            .bind_queue(
                &queue,
                &self.exchange,
                &Binding::RoutingKey(returned.routing_key.clone()),
            )
            .await?;

        self.republish
            .publish(
                &self.exchange,
                &returned.routing_key,
                returned.payload.clone(),
                &returned.properties,
                false,
            )
            .await?;

        info!(
            queue = %queue,
            routing_key = %returned.routing_key,
            "Republished unrouted message"
        );
        Ok(())
    }

    async fn repair_delayed(&self, returned: &ReturnedMessage) -> Result<(), PublishError> {
        let delay = returned
            .properties
            .headers
            .get(DELAY_HEADER)
            .and_then(HeaderValue::as_i64)
            .and_then(|d| u64::try_from(d).ok())
            .ok_or(PublishError::MissingDelay)?;

        let queue = self
            .scheduler
            .declare_tier(self.republish.as_ref(), delay)
            .await?;

        self.republish
            .publish(
                self.scheduler.delayed_exchange(),
                &returned.routing_key,
                returned.payload.clone(),
                &returned.properties,
                false,
            )
            .await?;

        info!(
            queue = %queue,
            delay = delay,
            routing_key = %returned.routing_key,
            "Republished unrouted delayed message"
        );
        Ok(())
    }

    fn report(&self, returned: ReturnedMessage, e: PublishError) {
        error!(
            exchange = %returned.exchange,
            routing_key = %returned.routing_key,
            reply_code = returned.reply_code,
            reply_text = %returned.reply_text,
            error = %e,
            "Returned message could not be republished"
        );

        // No subscribers is fine; the error log above is the record
        let _ = self.failures.send(PublishFailure {
            message: returned,
            reason: e.to_string(),
        });
    }
}

// ============================================================================
// Reliable Publisher
// ============================================================================

/// Publish and republish channels
///
/// The return handler task is not owned here. It keeps running after the
/// pair is closed and settles every return still queued (failing repairs
/// against the closed republish channel are reported), then stops once the
/// publish channel and its notifier are dropped.
struct ConnectionPair {
    publish: Arc<dyn BrokerChannel>,
    republish: Arc<dyn BrokerChannel>,
}

impl ConnectionPair {
    fn is_connected(&self) -> bool {
        self.publish.is_connected() && self.republish.is_connected()
    }

    async fn close(self) {
        close_channels(&[&self.publish, &self.republish]).await;
    }
}

async fn close_channels(channels: &[&Arc<dyn BrokerChannel>]) {
    for channel in channels {
        if let Err(e) = channel.close().await {
            debug!(channel = channel.label(), error = %e, "Closing channel failed");
        }
    }
}

/// Publishes jobs with guaranteed routing
///
/// Connections are opened lazily on first publish. Concurrent callers wait on
/// a single setup; a dropped connection is replaced on the next publish.
pub struct ReliablePublisher {
    connector: Arc<dyn BrokerConnector>,
    config: RelayConfig,
    scheduler: Arc<DelayScheduler>,
    resolver: Arc<dyn DestinationResolver>,
    tracker: Arc<RepairTracker>,
    failures: broadcast::Sender<PublishFailure>,
    connections: Mutex<Option<ConnectionPair>>,
}

impl ReliablePublisher {
    /// Create a publisher; no connection is opened until the first publish
    pub fn new(connector: Arc<dyn BrokerConnector>, config: RelayConfig) -> Self {
        let delayed_exchange = config.exchange.delayed_name();
        let scheduler = DelayScheduler::new(
            config.queues.naming(),
            delayed_exchange.clone(),
            config.exchange.name.clone(),
        );
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);

        Self {
            connector,
            scheduler: Arc::new(scheduler),
            resolver: Arc::new(JsonQueueNameResolver),
            tracker: Arc::new(RepairTracker::new(delayed_exchange)),
            failures,
            connections: Mutex::new(None),
            config,
        }
    }

    /// Replace the destination resolver used to repair unrouted messages
    pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &DelayScheduler {
        &self.scheduler
    }

    pub fn tracker(&self) -> Arc<RepairTracker> {
        self.tracker.clone()
    }

    /// Receive returned messages that could not be repaired
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PublishFailure> {
        self.failures.subscribe()
    }

    /// Publish to the main exchange
    ///
    /// # Arguments
    ///
    /// * `payload` - Serialized job
    /// * `routing_key` - Routing key on the main exchange
    /// * `options` - Extra headers and broker properties, passed through unchanged
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the broker
    /// rejects the publish. An unroutable message is not an error here; it is
    /// repaired (or reported) asynchronously.
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        routing_key: &str,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        let channel = self.ensure_connected().await?;
        let properties = Self::job_properties(options);
        let exchange = &self.config.exchange.name;

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            "Publishing message"
        );

        channel
            .publish(exchange, routing_key, payload.into(), &properties, true)
            .await?;
        Ok(())
    }

    /// Publish to the delayed exchange so the message reaches the main
    /// exchange after `delay_seconds`
    ///
    /// The delay is added as the `delay` header, overriding any header of
    /// the same name in `options`. The delay tier is declared on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established, the delay
    /// tier cannot be declared or the broker rejects the publish.
    pub async fn publish_delayed(
        &self,
        payload: impl Into<Bytes>,
        routing_key: &str,
        delay_seconds: u64,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        let channel = self.ensure_connected().await?;
        let delay = i64::try_from(delay_seconds).unwrap_or(i64::MAX);
        let properties = Self::job_properties(options.with_header(DELAY_HEADER, delay));

        self.scheduler
            .ensure_tier(channel.as_ref(), delay_seconds)
            .await?;

        let exchange = self.scheduler.delayed_exchange();
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            delay = delay_seconds,
            "Publishing delayed message"
        );

        channel
            .publish(exchange, routing_key, payload.into(), &properties, true)
            .await?;
        Ok(())
    }

    /// Wait for in-flight repairs of returned messages
    ///
    /// Gives the broker a short grace period to return late messages, then
    /// polls until no repair is pending or the drain timeout elapses. Returns
    /// `false` if repairs were still pending at the timeout.
    pub async fn drain_repairs(&self) -> bool {
        let settings = &self.config.publisher;
        tokio::time::sleep(settings.drain_grace()).await;

        if self.tracker.is_idle() {
            return true;
        }

        warn!(
            timeout_seconds = settings.drain_timeout_seconds,
            "Waiting for unrouted messages handling"
        );

        let poll = settings.drain_poll_interval().max(Duration::from_millis(1));
        let tracker = self.tracker.clone();
        let wait = async move {
            while !tracker.is_idle() {
                tokio::time::sleep(poll).await;
            }
        };

        match tokio::time::timeout(settings.drain_timeout(), wait).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending_immediate = self.tracker.pending_immediate(),
                    pending_delayed = self.tracker.pending_delayed(),
                    "Some unrouted messages are lost on shutdown"
                );
                false
            }
        }
    }

    /// Drain pending repairs, then close both connections
    pub async fn shutdown(&self) -> bool {
        let drained = self.drain_repairs().await;

        if let Some(pair) = self.connections.lock().await.take() {
            pair.close().await;
        }

        info!(drained = drained, "Publisher shut down");
        drained
    }

    /// Return the live publish channel, setting up the connection pair if needed
    async fn ensure_connected(&self) -> Result<Arc<dyn BrokerChannel>, PublishError> {
        let mut connections = self.connections.lock().await;

        if let Some(pair) = connections.as_ref() {
            if pair.is_connected() {
                return Ok(pair.publish.clone());
            }
        }

        if let Some(stale) = connections.take() {
            warn!("Broker connection lost, reconnecting");
            stale.close().await;
        }

        let pair = self.connect().await?;
        let publish = pair.publish.clone();
        *connections = Some(pair);
        Ok(publish)
    }

    async fn connect(&self) -> Result<ConnectionPair, BrokerError> {
        let (notifier, returns) = ReturnNotifier::tracked(self.tracker.clone());
        let publish = self.connector.connect(PUBLISH_CONNECTION, notifier).await?;

        // Republishes are never mandatory, so nothing comes back on this notifier
        let (republish_notifier, _) = ReturnNotifier::channel();
        let republish = match self
            .connector
            .connect(REPUBLISH_CONNECTION, republish_notifier)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                close_channels(&[&publish]).await;
                return Err(e);
            }
        };

        let exchange = &self.config.exchange;
        if let Err(e) = self.declare_exchanges(publish.as_ref()).await {
            close_channels(&[&publish, &republish]).await;
            return Err(e);
        }

        let handler = ReturnHandler {
            republish: republish.clone(),
            exchange: exchange.name.clone(),
            queue_options: self.config.queues.options.clone(),
            handle_unrouted_messages: self.config.publisher.handle_unrouted_messages,
            scheduler: self.scheduler.clone(),
            resolver: self.resolver.clone(),
            tracker: self.tracker.clone(),
            failures: self.failures.clone(),
        };
        tokio::spawn(handler.run(returns));

        info!(
            exchange = %exchange.name,
            delayed_exchange = %self.scheduler.delayed_exchange(),
            "Publisher connected"
        );

        Ok(ConnectionPair { publish, republish })
    }

    async fn declare_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        let exchange = &self.config.exchange;
        channel
            .declare_exchange(&exchange.name, &exchange.spec())
            .await?;
        channel
            .declare_exchange(self.scheduler.delayed_exchange(), &ExchangeSpec::delayed())
            .await
    }

    fn job_properties(options: PublishOptions) -> MessageProperties {
        let mut properties = options.into_properties();
        if properties.content_type.is_none() {
            properties.content_type = Some(JOB_CONTENT_TYPE.to_string());
        }
        properties
    }
}

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;
