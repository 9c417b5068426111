//! In-memory broker for testing and development.
//!
//! Behaves like a single RabbitMQ vhost:
//! - direct, topic, fanout and headers exchanges
//! - idempotent declarations; inequivalent redeclarations fail
//! - mandatory publishes that match no queue are returned with `NO_ROUTE`
//! - per-queue message TTL with dead-lettering and broker `x-death` headers
//! - consumers with prefetch, acknowledgements and requeue on reject
//!
//! Time-based behaviour (TTL expiry) is evaluated lazily on every broker
//! operation using `tokio::time::Instant`, so tests can drive it with a
//! paused clock and [`InMemoryBroker::tick`].

use crate::broker::{
    Binding, BrokerChannel, BrokerConnector, ConsumeOptions, DeliveryReceiver, ExchangeKind,
    ExchangeSpec, QueueOptions, ReturnNotifier, X_DEAD_LETTER_ROUTING_KEY, X_MATCH,
};
use crate::error::{BrokerError, NO_ROUTE};
use crate::message::{
    Acknowledger, Delivery, HeaderValue, Headers, MessageProperties, ReturnedMessage,
};
use crate::patterns::QueuePattern;
use crate::retry::{
    death_entry, record_first_death, Death, REASON_EXPIRED, REASON_REJECTED, X_DEATH,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Upper bound on dead-letter cascades evaluated per operation
const MAX_EXPIRY_PASSES: usize = 64;

// ============================================================================
// Public Inspection Types
// ============================================================================

/// A message as stored by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub payload: Bytes,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
}

/// One publish as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    /// Label of the connection the publish was made on
    pub connection: String,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    /// Queues the message was delivered to
    pub routed_to: Vec<String>,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct StoredMessage {
    message: BrokerMessage,
    expires_at: Option<Instant>,
    redelivered: bool,
}

struct Unacked {
    message: BrokerMessage,
    consumer_tag: String,
}

struct Subscriber {
    tag: String,
    connection: u64,
    prefetch: usize,
    in_flight: usize,
    sender: mpsc::Sender<Delivery>,
}

struct MemoryQueue {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    subscribers: Vec<Subscriber>,
    cursor: usize,
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            subscribers: Vec::new(),
            cursor: 0,
        }
    }

    fn ttl(&self) -> Option<Duration> {
        self.options
            .message_ttl_ms()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }

    fn push(&mut self, message: BrokerMessage) {
        let expires_at = self.ttl().map(|ttl| Instant::now() + ttl);
        self.ready.push_back(StoredMessage {
            message,
            expires_at,
            redelivered: false,
        });
    }

    /// Put a delivery back at the head of the queue
    fn requeue(&mut self, message: BrokerMessage) {
        let expires_at = self.ttl().map(|ttl| Instant::now() + ttl);
        self.ready.push_front(StoredMessage {
            message,
            expires_at,
            redelivered: true,
        });
    }

    fn release(&mut self, consumer_tag: &str) {
        if let Some(subscriber) = self.subscribers.iter_mut().find(|s| s.tag == consumer_tag) {
            subscriber.in_flight = subscriber.in_flight.saturating_sub(1);
        }
    }

    /// Drop subscribers matching `predicate` and requeue their unacked deliveries
    fn remove_subscribers(&mut self, predicate: impl Fn(&Subscriber) -> bool) {
        let removed: Vec<String> = self
            .subscribers
            .iter()
            .filter(|s| predicate(s))
            .map(|s| s.tag.clone())
            .collect();
        if removed.is_empty() {
            return;
        }

        self.subscribers.retain(|s| !removed.contains(&s.tag));

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| removed.contains(&u.consumer_tag))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked.message);
            }
        }
    }
}

struct BindingRecord {
    queue: String,
    exchange: String,
    binding: Binding,
}

struct ConnectionRecord {
    id: u64,
    label: String,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: BTreeMap<String, MemoryQueue>,
    bindings: Vec<BindingRecord>,
    declare_counts: HashMap<String, usize>,
    publish_log: Vec<PublishRecord>,
    connections: Vec<ConnectionRecord>,
    fail_publishes: bool,
    forced_return: Option<(u16, String)>,
    next_delivery_tag: u64,
    next_consumer: u64,
}

impl BrokerState {
    /// Queues a message published to `exchange` is routed to
    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: &Headers,
    ) -> Result<Vec<String>, BrokerError> {
        // Default exchange routes by queue name
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound {
                exchange: exchange.to_string(),
            })?;

        let mut routed: Vec<String> = Vec::new();
        for record in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match spec.kind {
                ExchangeKind::Direct => record.binding.routing_key() == routing_key,
                ExchangeKind::Topic => topic_matches(record.binding.routing_key(), routing_key),
                ExchangeKind::Fanout => true,
                ExchangeKind::Headers => headers_match(&record.binding, headers),
            };
            if matched && !routed.contains(&record.queue) {
                routed.push(record.queue.clone());
            }
        }
        Ok(routed)
    }

    /// Route a published message; an unroutable mandatory message is handed back
    fn publish(
        &mut self,
        connection: &str,
        message: BrokerMessage,
        mandatory: bool,
    ) -> Result<Option<ReturnedMessage>, BrokerError> {
        if self.fail_publishes {
            return Err(BrokerError::PublishFailed {
                exchange: message.exchange,
                routing_key: message.routing_key,
                message: "broker unreachable".to_string(),
            });
        }

        let mut routed = self.route(
            &message.exchange,
            &message.routing_key,
            &message.properties.headers,
        )?;
        let mut reply = (NO_ROUTE, "NO_ROUTE".to_string());
        if let (Some(forced), true) = (&self.forced_return, mandatory) {
            reply = forced.clone();
            routed.clear();
        }

        self.publish_log.push(PublishRecord {
            connection: connection.to_string(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            mandatory,
            routed_to: routed.clone(),
        });

        if routed.is_empty() {
            return Ok(mandatory.then(|| ReturnedMessage {
                reply_code: reply.0,
                reply_text: reply.1,
                exchange: message.exchange,
                routing_key: message.routing_key,
                payload: message.payload,
                properties: message.properties,
            }));
        }

        self.enqueue(&routed, &message);
        Ok(None)
    }

    fn enqueue(&mut self, queues: &[String], message: &BrokerMessage) {
        for name in queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.push(message.clone());
            }
        }
    }

    /// Dead-letter expired messages; repeats while expiry cascades
    fn expire(&mut self) {
        for _ in 0..MAX_EXPIRY_PASSES {
            let now = Instant::now();
            let mut expired: Vec<(String, BrokerMessage)> = Vec::new();

            for (name, queue) in self.queues.iter_mut() {
                while queue
                    .ready
                    .front()
                    .and_then(|m| m.expires_at)
                    .is_some_and(|at| at <= now)
                {
                    if let Some(stored) = queue.ready.pop_front() {
                        expired.push((name.clone(), stored.message));
                    }
                }
            }

            if expired.is_empty() {
                return;
            }

            for (queue, message) in expired {
                self.dead_letter(&queue, message, REASON_EXPIRED);
            }
        }
    }

    /// Route a dead message to its queue's dead-letter exchange, if any
    fn dead_letter(&mut self, queue_name: &str, mut message: BrokerMessage, reason: &str) {
        let Some(options) = self.queues.get(queue_name).map(|q| q.options.clone()) else {
            return;
        };
        let Some(dlx) = options.dead_letter_exchange().map(str::to_string) else {
            debug!(
                queue = %queue_name,
                reason = reason,
                "Dropping dead message: no dead-letter exchange"
            );
            return;
        };
        let routing_key = options
            .arguments
            .get(X_DEAD_LETTER_ROUTING_KEY)
            .and_then(HeaderValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| message.routing_key.clone());

        record_broker_death(
            &mut message.properties.headers,
            &Death {
                queue: queue_name,
                exchange: &message.exchange,
                routing_key: &message.routing_key,
                reason,
            },
        );
        message.exchange = dlx.clone();
        message.routing_key = routing_key;

        match self.route(&dlx, &message.routing_key, &message.properties.headers) {
            Ok(queues) if !queues.is_empty() => {
                debug!(
                    queue = %queue_name,
                    exchange = %dlx,
                    routing_key = %message.routing_key,
                    reason = reason,
                    "Dead-lettered message"
                );
                self.enqueue(&queues, &message);
            }
            _ => {
                debug!(
                    queue = %queue_name,
                    exchange = %dlx,
                    routing_key = %message.routing_key,
                    "Dead-lettered message is unroutable and was dropped"
                );
            }
        }
    }

    /// Push ready messages to subscribers with free prefetch slots
    fn dispatch(&mut self, broker: &Weak<Mutex<BrokerState>>) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch_queue(&name, broker);
        }
    }

    fn dispatch_queue(&mut self, name: &str, broker: &Weak<Mutex<BrokerState>>) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        queue.remove_subscribers(|s| s.sender.is_closed());

        while !queue.ready.is_empty() && !queue.subscribers.is_empty() {
            let count = queue.subscribers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| queue.subscribers[i].in_flight < queue.subscribers[i].prefetch)
            else {
                return;
            };
            let Some(stored) = queue.ready.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let subscriber = &mut queue.subscribers[index];

            let delivery = Delivery::new(
                stored.message.payload.clone(),
                stored.message.exchange.clone(),
                stored.message.routing_key.clone(),
                name.to_string(),
                stored.redelivered,
                stored.message.properties.clone(),
                Box::new(MemoryAcker {
                    broker: broker.clone(),
                    queue: name.to_string(),
                    delivery_tag,
                }),
            );

            match subscriber.sender.try_send(delivery) {
                Ok(()) => {
                    subscriber.in_flight += 1;
                    queue.unacked.insert(
                        delivery_tag,
                        Unacked {
                            message: stored.message,
                            consumer_tag: subscriber.tag.clone(),
                        },
                    );
                    queue.cursor = (index + 1) % count;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    queue.ready.push_front(stored);
                    queue.remove_subscribers(|s| s.sender.is_closed());
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    queue.ready.push_front(stored);
                    return;
                }
            }
        }
    }

    fn settle(
        &mut self,
        queue_name: &str,
        delivery_tag: u64,
        outcome: Settlement,
    ) -> Result<(), BrokerError> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::AckFailed {
                message: format!("queue '{}' no longer exists", queue_name),
            })?;
        let unacked = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::AckFailed {
                message: format!("unknown delivery tag {}", delivery_tag),
            })?;
        queue.release(&unacked.consumer_tag);

        match outcome {
            Settlement::Ack => {}
            Settlement::Requeue => queue.requeue(unacked.message),
            Settlement::Discard => self.dead_letter(queue_name, unacked.message, REASON_REJECTED),
        }
        Ok(())
    }

    fn close_connection(&mut self, id: u64) {
        for queue in self.queues.values_mut() {
            queue.remove_subscribers(|s| s.connection == id);
        }
        for record in self.connections.iter().filter(|c| c.id == id) {
            record.open.store(false, Ordering::SeqCst);
        }
    }
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

/// Append or bump a broker death entry (newest first, keyed by queue and reason)
fn record_broker_death(headers: &mut Headers, death: &Death<'_>) {
    record_first_death(headers, death);

    let mut deaths = match headers.remove(X_DEATH) {
        Some(HeaderValue::Array(deaths)) => deaths,
        _ => Vec::new(),
    };

    let existing = deaths.iter().position(|entry| {
        entry.as_table().is_some_and(|t| {
            t.get("queue").and_then(HeaderValue::as_str) == Some(death.queue)
                && t.get("reason").and_then(HeaderValue::as_str) == Some(death.reason)
        })
    });

    let time = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
    let entry = match existing {
        Some(index) => {
            let mut entry = match deaths.remove(index) {
                HeaderValue::Table(entry) => entry,
                _ => death_entry(death, 0, time),
            };
            let count = entry
                .get("count")
                .and_then(HeaderValue::as_i64)
                .unwrap_or(0)
                .saturating_add(1);
            entry.insert("count".to_string(), HeaderValue::Int(count));
            entry.insert("time".to_string(), HeaderValue::Timestamp(time));
            entry
        }
        None => death_entry(death, 1, time),
    };

    deaths.insert(0, HeaderValue::Table(entry));
    headers.insert(X_DEATH.to_string(), HeaderValue::Array(deaths));
}

fn topic_matches(binding_key: &str, routing_key: &str) -> bool {
    match QueuePattern::parse(binding_key) {
        Ok(pattern) => pattern.matches(routing_key),
        Err(_) => binding_key == routing_key,
    }
}

fn headers_match(binding: &Binding, headers: &Headers) -> bool {
    let arguments = binding.arguments();
    let match_any = arguments.get(X_MATCH).and_then(HeaderValue::as_str) == Some("any");

    let mut required = arguments.iter().filter(|(key, _)| !key.starts_with("x-"));
    let check = |(key, value): (&String, &HeaderValue)| headers.get(key) == Some(value);

    if match_any {
        required.any(|entry| check(entry))
    } else {
        required.all(|entry| check(entry))
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-process broker; clones share the same state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `operation` with expired messages dead-lettered first and ready
    /// messages dispatched afterwards
    fn with_state<R>(&self, operation: impl FnOnce(&mut BrokerState) -> R) -> R {
        let mut state = self.lock();
        state.expire();
        let result = operation(&mut state);
        state.expire();
        state.dispatch(&Arc::downgrade(&self.state));
        result
    }

    /// Process expired messages and dispatch to consumers
    pub fn tick(&self) {
        self.with_state(|_| ());
    }

    /// Names of all declared queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        self.with_state(|state| state.queues.keys().cloned().collect())
    }

    /// Number of messages ready for delivery in `queue`
    pub fn message_count(&self, queue: &str) -> usize {
        self.with_state(|state| state.queues.get(queue).map_or(0, |q| q.ready.len()))
    }

    /// Number of delivered but unsettled messages in `queue`
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_state(|state| state.queues.get(queue).map_or(0, |q| q.unacked.len()))
    }

    /// Take the next ready message from `queue` (auto-ack)
    pub fn get(&self, queue: &str) -> Option<BrokerMessage> {
        self.with_state(|state| {
            state
                .queues
                .get_mut(queue)
                .and_then(|q| q.ready.pop_front())
                .map(|stored| stored.message)
        })
    }

    /// Bindings of `queue` as `(exchange, binding)` pairs
    pub fn bindings(&self, queue: &str) -> Vec<(String, Binding)> {
        self.with_state(|state| {
            state
                .bindings
                .iter()
                .filter(|b| b.queue == queue)
                .map(|b| (b.exchange.clone(), b.binding.clone()))
                .collect()
        })
    }

    /// Number of declare calls made for `queue`
    pub fn declare_count(&self, queue: &str) -> usize {
        self.lock().declare_counts.get(queue).copied().unwrap_or(0)
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options.clone())
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn publish_log(&self) -> Vec<PublishRecord> {
        self.lock().publish_log.clone()
    }

    /// Number of connections opened so far
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Labels of connections that are still open, in opening order
    pub fn open_connections(&self) -> Vec<String> {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .map(|c| c.label.clone())
            .collect()
    }

    /// Make every publish fail as if the broker were unreachable
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Return every mandatory publish with the given reply code and text
    pub fn force_returns(&self, reply: Option<(u16, &str)>) {
        self.lock().forced_return = reply.map(|(code, text)| (code, text.to_string()));
    }

    /// Delete a queue with its bindings and messages
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.lock();
        state.bindings.retain(|b| b.queue != queue);
        state.queues.remove(queue).is_some()
    }

    /// Close every open connection with the given label
    pub fn disconnect(&self, label: &str) {
        let ids: Vec<u64> = self
            .lock()
            .connections
            .iter()
            .filter(|c| c.label == label && c.open.load(Ordering::SeqCst))
            .map(|c| c.id)
            .collect();
        self.with_state(|state| {
            for id in ids {
                state.close_connection(id);
            }
        });
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        label: &str,
        returns: ReturnNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let open = Arc::new(AtomicBool::new(true));
        let id = {
            let mut state = self.lock();
            let id = state.connections.len() as u64 + 1;
            state.connections.push(ConnectionRecord {
                id,
                label: label.to_string(),
                open: open.clone(),
            });
            id
        };

        debug!(connection = %label, id = id, "Opened in-memory connection");

        Ok(Arc::new(InMemoryChannel {
            broker: self.clone(),
            id,
            label: label.to_string(),
            open,
            returns,
        }))
    }
}

// ============================================================================
// InMemoryChannel
// ============================================================================

/// Channel on an in-memory connection
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    label: String,
    open: Arc<AtomicBool>,
    returns: ReturnNotifier,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed {
                label: self.label.clone(),
            })
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.with_state(|state| match state.exchanges.get(name) {
            Some(existing) if existing != spec => Err(BrokerError::DeclareFailed {
                object: "exchange".to_string(),
                name: name.to_string(),
                message: format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type': existing '{}', requested '{}'",
                    existing.kind.as_str(),
                    spec.kind.as_str()
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), spec.clone());
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.with_state(|state| {
            *state.declare_counts.entry(name.to_string()).or_insert(0) += 1;

            match state.queues.get(name) {
                Some(existing)
                    if existing.options.durable != options.durable
                        || existing.options.arguments != options.arguments =>
                {
                    Err(BrokerError::DeclareFailed {
                        object: "queue".to_string(),
                        name: name.to_string(),
                        message: "PRECONDITION_FAILED - inequivalent arguments".to_string(),
                    })
                }
                Some(_) => Ok(()),
                None => {
                    state
                        .queues
                        .insert(name.to_string(), MemoryQueue::new(options.clone()));
                    Ok(())
                }
            }
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding: &Binding,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.with_state(|state| {
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::ExchangeNotFound {
                    exchange: exchange.to_string(),
                });
            }
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound {
                    queue: queue.to_string(),
                });
            }

            let exists = state
                .bindings
                .iter()
                .any(|b| b.queue == queue && b.exchange == exchange && &b.binding == binding);
            if !exists {
                state.bindings.push(BindingRecord {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    binding: binding.clone(),
                });
            }
            Ok(())
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
        self.ensure_open()?;

        let message = BrokerMessage {
            payload,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
        };
        let returned = self
            .broker
            .with_state(|state| state.publish(&self.label, message, mandatory))?;

        if let Some(returned) = returned {
            debug!(
                connection = %self.label,
                exchange = %exchange,
                routing_key = %routing_key,
                reply_code = returned.reply_code,
                "Returning unroutable mandatory message"
            );
            self.returns.notify(returned);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryReceiver, BrokerError> {
        self.ensure_open()?;

        let prefetch = usize::from(options.prefetch.max(1));
        let (sender, receiver) = mpsc::channel(prefetch);
        let connection = self.id;

        self.broker.with_state(|state| -> Result<DeliveryReceiver, BrokerError> {
            state.next_consumer += 1;
            let tag = options
                .consumer_tag
                .clone()
                .unwrap_or_else(|| format!("ctag-{}", state.next_consumer));

            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound {
                    queue: queue.to_string(),
                })?;
            target.subscribers.push(Subscriber {
                tag,
                connection,
                prefetch,
                in_flight: 0,
                sender,
            });
            Ok(receiver)
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let id = self.id;
        self.broker.with_state(|state| state.close_connection(id));
        Ok(())
    }
}

// ============================================================================
// Acknowledgements
// ============================================================================

struct MemoryAcker {
    broker: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settlement) -> Result<(), BrokerError> {
        let state = self.broker.upgrade().ok_or_else(|| BrokerError::AckFailed {
            message: "broker dropped".to_string(),
        })?;
        let broker = InMemoryBroker { state };
        broker.with_state(|state| state.settle(&self.queue, self.delivery_tag, outcome))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Settlement::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        })
    }
}
