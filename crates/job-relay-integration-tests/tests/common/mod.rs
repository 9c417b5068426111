//! Common test utilities for job-relay integration tests
//!
//! This module provides:
//! - One-time tracing setup and log capture
//! - A relay fixture wiring the in-memory broker, publisher and retry handler
//! - Recording job handlers
//! - Polling helpers

use async_trait::async_trait;
use job_relay::broker::{Binding, BrokerConnector, ExchangeSpec, QueueOptions, ReturnNotifier};
use job_relay::{
    Delivery, InMemoryBroker, JobFailure, JobHandler, MessageProperties, RelayConfig,
    ReliablePublisher, RetryHandler, SerializedJob,
};
use std::io;
use std::sync::{Arc, Mutex, Once};
use tokio::time::{sleep, Duration};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Formatted log output collected by [`capture_logs`]
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

#[allow(dead_code)]
impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Record events on this thread until the guard is dropped
///
/// Only usable from current-thread runtimes, where spawned tasks share the
/// test thread.
#[allow(dead_code)]
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}

// ============================================================================
// Relay Fixture
// ============================================================================

/// In-memory broker with a publisher and retry handler on top
#[allow(dead_code)]
pub struct Relay {
    pub broker: InMemoryBroker,
    pub config: RelayConfig,
    pub publisher: Arc<ReliablePublisher>,
    pub retry: Arc<RetryHandler>,
}

#[allow(dead_code)]
impl Relay {
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    pub fn with_config(config: RelayConfig) -> Self {
        init_tracing();

        let broker = InMemoryBroker::new();
        let publisher = Arc::new(ReliablePublisher::new(
            Arc::new(broker.clone()),
            config.clone(),
        ));
        let retry = Arc::new(RetryHandler::new(publisher.clone()));

        Self {
            broker,
            config,
            publisher,
            retry,
        }
    }

    /// Declare `queue` bound to the main exchange on its own name
    pub async fn declare_queue(&self, queue: &str) {
        let (notifier, _returns) = ReturnNotifier::channel();
        let channel = self
            .broker
            .connect("setup", notifier)
            .await
            .expect("setup connection");
        channel
            .declare_exchange(&self.config.exchange.name, &self.config.exchange.spec())
            .await
            .expect("declare exchange");
        channel
            .declare_queue(queue, &QueueOptions::default())
            .await
            .expect("declare queue");
        channel
            .bind_queue(
                queue,
                &self.config.exchange.name,
                &Binding::RoutingKey(queue.to_string()),
            )
            .await
            .expect("bind queue");
        channel.close().await.expect("close setup connection");
    }

    /// Ensure the delayed exchange exists without publishing
    pub async fn declare_delayed_exchange(&self) {
        let (notifier, _returns) = ReturnNotifier::channel();
        let channel = self
            .broker
            .connect("setup", notifier)
            .await
            .expect("setup connection");
        channel
            .declare_exchange(&self.config.exchange.delayed_name(), &ExchangeSpec::delayed())
            .await
            .expect("declare delayed exchange");
        channel.close().await.expect("close setup connection");
    }
}

/// Serialized ActiveJob-style payload destined for `queue`
#[allow(dead_code)]
pub fn job_payload(queue: &str) -> Vec<u8> {
    let job = SerializedJob::new("ImportJob", queue, vec![serde_json::json!(42)]);
    serde_json::to_vec(&job).expect("serialize job")
}

// ============================================================================
// Recording Handler
// ============================================================================

/// What a handler saw of one delivery
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Seen {
    pub queue: String,
    pub routing_key: String,
    pub properties: MessageProperties,
}

/// Job handler that records every delivery and fails the first `failures`
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<Seen>>>,
    failures: Arc<Mutex<usize>>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries
    pub fn failing(count: usize) -> Self {
        let handler = Self::default();
        *handler.failures.lock().unwrap() = count;
        handler
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), JobFailure> {
        self.seen.lock().unwrap().push(Seen {
            queue: delivery.queue.clone(),
            routing_key: delivery.routing_key.clone(),
            properties: delivery.properties.clone(),
        });

        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(JobFailure::new("ImportJob::RecordMissing", "record 42 missing"));
        }
        Ok(())
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `check` every 10ms until it holds; panics after five seconds
#[allow(dead_code)]
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
