//! Consumer registry, worker selection and the job worker loop.
//!
//! Consumers are registered explicitly at startup: framework-native consumers
//! and one generated consumer per job queue, kept in separate sets. The
//! configured [`WorkerStrategy`] picks which sets run, and operator-supplied
//! queue patterns narrow the selection further.

use crate::broker::{
    Binding, BrokerChannel, BrokerConnector, ConsumeOptions, QueueOptions, ReturnNotifier,
};
use crate::config::RelayConfig;
use crate::error::{BrokerError, RetryError, SelectionError, WorkerError};
use crate::message::{Delivery, Envelope};
use crate::patterns;
use crate::retry::{JobFailure, RetryHandler};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// Strategy
// ============================================================================

/// Which consumer sets a worker process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStrategy {
    /// Native consumers and job consumers
    #[default]
    Include,
    /// Native consumers only
    Exclude,
    /// Job consumers only
    Only,
}

/// Combine the native and job consumer sets according to `strategy`
pub fn select_consumers<T: Clone>(strategy: WorkerStrategy, native: &[T], jobs: &[T]) -> Vec<T> {
    match strategy {
        WorkerStrategy::Include => native.iter().chain(jobs).cloned().collect(),
        WorkerStrategy::Exclude => native.to_vec(),
        WorkerStrategy::Only => jobs.to_vec(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Processes one delivery
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), JobFailure>;
}

/// Handler decoding the payload into an [`Envelope`] before calling `perform`
pub struct JsonHandler<T, F> {
    perform: F,
    _job: PhantomData<fn() -> T>,
}

/// Wrap an async function over [`Envelope<T>`] as a [`JobHandler`]
///
/// The payload is decoded as JSON whatever its content type says; a payload
/// that does not decode fails the delivery like any other job error.
pub fn json_handler<T, F, Fut>(perform: F) -> Arc<dyn JobHandler>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobFailure>> + Send + 'static,
{
    Arc::new(JsonHandler {
        perform,
        _job: PhantomData,
    })
}

#[async_trait]
impl<T, F, Fut> JobHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobFailure>> + Send + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), JobFailure> {
        let envelope = Envelope::from_delivery(delivery)?;
        (self.perform)(envelope).await
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Consumer name derived from a queue name, e.g. `foo.bar` -> `FooBarConsumer`
///
/// Non-alphanumeric characters separate words; a name starting with a digit
/// is prefixed with `Queue`.
pub fn consumer_name(queue: &str) -> String {
    let mut name: String = queue
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars
                .next()
                .map(|first| first.to_ascii_uppercase().to_string() + chars.as_str())
                .unwrap_or_default()
        })
        .collect();

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "Queue");
    }
    name.push_str("Consumer");
    name
}

/// A consumer bound to one queue
#[derive(Clone)]
pub struct ConsumerDescriptor {
    pub queue: String,
    pub handler: Arc<dyn JobHandler>,
    pub queue_options: QueueOptions,
}

impl ConsumerDescriptor {
    pub fn new(queue: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue: queue.into(),
            handler,
            queue_options: QueueOptions::default(),
        }
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    pub fn consumer_name(&self) -> String {
        consumer_name(&self.queue)
    }
}

impl fmt::Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDescriptor")
            .field("queue", &self.queue)
            .field("queue_options", &self.queue_options)
            .finish_non_exhaustive()
    }
}

/// Queue name to consumer mapping, built once at startup
#[derive(Debug, Default, Clone)]
pub struct ConsumerRegistry {
    native: BTreeMap<String, ConsumerDescriptor>,
    jobs: BTreeMap<String, ConsumerDescriptor>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a framework-native consumer; the first registration per queue wins
    pub fn register_native(&mut self, descriptor: ConsumerDescriptor) -> &ConsumerDescriptor {
        self.native
            .entry(descriptor.queue.clone())
            .or_insert(descriptor)
    }

    /// Define the job consumer for `queue` unless one exists
    pub fn define_consumer(
        &mut self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
    ) -> &ConsumerDescriptor {
        self.jobs
            .entry(queue.to_string())
            .or_insert_with(|| ConsumerDescriptor::new(queue, handler))
    }

    pub fn native(&self) -> impl Iterator<Item = &ConsumerDescriptor> {
        self.native.values()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &ConsumerDescriptor> {
        self.jobs.values()
    }

    /// Consumers enabled by `strategy`
    pub fn select(&self, strategy: WorkerStrategy) -> Vec<ConsumerDescriptor> {
        let native: Vec<ConsumerDescriptor> = self.native.values().cloned().collect();
        let jobs: Vec<ConsumerDescriptor> = self.jobs.values().cloned().collect();
        select_consumers(strategy, &native, &jobs)
    }

    /// Consumers enabled by `strategy` whose queue matches one of `requested`
    ///
    /// An empty pattern list selects every enabled consumer.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::Unmatched`] listing every
    /// pattern that matched no enabled queue.
    pub fn locate<P: AsRef<str>>(
        &self,
        strategy: WorkerStrategy,
        requested: &[P],
    ) -> Result<Vec<ConsumerDescriptor>, SelectionError> {
        let candidates = self.select(strategy);
        if requested.iter().all(|p| p.as_ref().trim().is_empty()) {
            return Ok(candidates);
        }

        let names: Vec<&str> = candidates.iter().map(|c| c.queue.as_str()).collect();
        let selected = patterns::select(requested, &names)?;

        Ok(candidates
            .into_iter()
            .filter(|c| selected.contains(&c.queue))
            .collect())
    }
}

// ============================================================================
// Job Worker
// ============================================================================

/// Outcome counters of a finished worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub succeeded: u64,
    pub rescheduled: u64,
    pub errors: u64,
}

/// Consumes one queue and runs its handler for every delivery
pub struct JobWorker {
    descriptor: ConsumerDescriptor,
    channel: Arc<dyn BrokerChannel>,
    retry: Arc<RetryHandler>,
    config: RelayConfig,
}

impl JobWorker {
    pub fn new(
        descriptor: ConsumerDescriptor,
        channel: Arc<dyn BrokerChannel>,
        retry: Arc<RetryHandler>,
        config: RelayConfig,
    ) -> Self {
        Self {
            descriptor,
            channel,
            retry,
            config,
        }
    }

    /// Declare the queue, bind it on its own name and consume until shutdown
    ///
    /// Successful deliveries are acknowledged. Failed ones go to the
    /// [`RetryHandler`].
    ///
    /// # Errors
    ///
    /// Returns an error if the topology cannot be declared or the
    /// subscription fails.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerStats, BrokerError> {
        let queue = self.descriptor.queue.clone();
        let exchange = &self.config.exchange;

        self.channel
            .declare_exchange(&exchange.name, &exchange.spec())
            .await?;
        self.channel
            .declare_queue(&queue, &self.descriptor.queue_options)
            .await?;
        self.channel
            .bind_queue(&queue, &exchange.name, &Binding::RoutingKey(queue.clone()))
            .await?;

        let options = ConsumeOptions {
            prefetch: self.config.workers.prefetch,
            consumer_tag: Some(self.descriptor.consumer_name()),
        };
        let mut deliveries = self.channel.consume(&queue, &options).await?;

        info!(
            queue = %queue,
            consumer = %self.descriptor.consumer_name(),
            prefetch = options.prefetch,
            "Worker started"
        );

        let mut stats = WorkerStats::default();
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(queue = %queue, "Shutdown sender dropped");
                        break;
                    }
                }
                next = deliveries.recv() => match next {
                    Some(delivery) => self.process(delivery, &mut stats).await,
                    None => {
                        warn!(queue = %queue, "Delivery stream closed");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.channel.close().await {
            debug!(queue = %queue, error = %e, "Closing worker channel failed");
        }

        info!(
            queue = %queue,
            succeeded = stats.succeeded,
            rescheduled = stats.rescheduled,
            errors = stats.errors,
            "Worker stopped"
        );
        Ok(stats)
    }

    async fn process(&self, delivery: Delivery, stats: &mut WorkerStats) {
        let failure = match self.descriptor.handler.handle(&delivery).await {
            Ok(()) => {
                match delivery.ack().await {
                    Ok(()) => stats.succeeded += 1,
                    Err(e) => {
                        error!(queue = %delivery.queue, error = %e, "Acknowledging job failed");
                        stats.errors += 1;
                    }
                }
                return;
            }
            Err(failure) => failure,
        };

        match self.retry.on_failure(&delivery, &failure).await {
            Ok(_) => stats.rescheduled += 1,
            Err(e) => {
                stats.errors += 1;
                self.settle_unscheduled(&delivery, e).await;
            }
        }
    }

    /// Settle a failed delivery whose retry could not be scheduled
    async fn settle_unscheduled(&self, delivery: &Delivery, e: RetryError) {
        let requeue = match &e {
            // The delayed copy exists; settling again would duplicate the job
            RetryError::Ack(_) => {
                error!(queue = %delivery.queue, error = %e, "Rescheduled job was not acknowledged");
                return;
            }
            RetryError::Republish(_) => true,
            RetryError::MalformedHeader { .. } | RetryError::Compression(_) => false,
        };

        error!(
            queue = %delivery.queue,
            routing_key = %delivery.routing_key,
            requeue = requeue,
            error = %e,
            "Rescheduling failed job failed"
        );

        if let Err(e) = delivery.reject(requeue).await {
            error!(queue = %delivery.queue, error = %e, "Rejecting job failed");
        }
    }
}

/// Start one [`JobWorker`] per selected consumer, each on its own connection
///
/// # Arguments
///
/// * `connector` - Opens the worker connections
/// * `registry` - Every consumer this process knows about
/// * `requested` - Queue patterns narrowing the selection; empty runs all
/// * `retry` - Reschedules failed deliveries
/// * `config` - Exchange, strategy and prefetch settings
/// * `shutdown` - Workers stop once this turns `true`
///
/// # Errors
///
/// Returns an error if a pattern matches nothing or a connection cannot be
/// opened. Workers already started keep running until `shutdown`.
pub async fn start_workers<P: AsRef<str>>(
    connector: Arc<dyn BrokerConnector>,
    registry: &ConsumerRegistry,
    requested: &[P],
    retry: Arc<RetryHandler>,
    config: &RelayConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<Result<WorkerStats, BrokerError>>>, WorkerError> {
    let selected = registry.locate(config.workers.strategy, requested)?;

    let mut handles = Vec::with_capacity(selected.len());
    for descriptor in selected {
        // Workers never publish mandatory messages
        let (notifier, _) = ReturnNotifier::channel();
        let label = format!("consumer:{}", descriptor.queue);
        let channel = connector.connect(&label, notifier).await?;

        let worker = JobWorker::new(descriptor, channel, retry.clone(), config.clone());
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    info!(
        workers = handles.len(),
        strategy = ?config.workers.strategy,
        "Workers started"
    );
    Ok(handles)
}

#[cfg(test)]
#[path = "workers_tests.rs"]
mod tests;
