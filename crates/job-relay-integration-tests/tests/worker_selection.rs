//! Starting workers for the queues an operator asks for.

mod common;

use common::{RecordingHandler, Relay};
use job_relay::{
    start_workers, BrokerError, ConsumerDescriptor, ConsumerRegistry, RelayConfig, SelectionError,
    WorkerError, WorkerStats, WorkerStrategy,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const QUEUES: [&str; 4] = ["one.foo.two", "one.bar.two", "one.foo.bar.two", "other"];

fn registry() -> ConsumerRegistry {
    let handler = Arc::new(RecordingHandler::new());
    let mut registry = ConsumerRegistry::new();
    for queue in QUEUES {
        registry.define_consumer(queue, handler.clone());
    }
    registry.register_native(ConsumerDescriptor::new("mailers", handler));
    registry
}

fn relay_with_strategy(strategy: WorkerStrategy) -> Relay {
    let mut config = RelayConfig::default();
    config.workers.strategy = strategy;
    Relay::with_config(config)
}

async fn start(
    relay: &Relay,
    requested: &[&str],
) -> Result<(watch::Sender<bool>, Vec<JoinHandle<Result<WorkerStats, BrokerError>>>), WorkerError>
{
    let (stop, shutdown) = watch::channel(false);
    let handles = start_workers(
        Arc::new(relay.broker.clone()),
        &registry(),
        requested,
        relay.retry.clone(),
        &relay.config,
        shutdown,
    )
    .await?;
    Ok((stop, handles))
}

async fn stop_all(
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<Result<WorkerStats, BrokerError>>>,
) {
    stop.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

/// Verify that single word wildcard selects matching queues.
#[tokio::test]
async fn test_single_word_wildcard_selects_matching_queues() {
    let relay = relay_with_strategy(WorkerStrategy::Include);

    let (stop, handles) = start(&relay, &["one.*.two"]).await.unwrap();
    assert_eq!(handles.len(), 2);
    stop_all(stop, handles).await;

    assert_eq!(relay.broker.queue_names(), vec!["one.bar.two", "one.foo.two"]);
    assert_eq!(relay.broker.connection_count(), 2);
}

/// Verify that multi word wildcard selects whole subtree.
#[tokio::test]
async fn test_multi_word_wildcard_selects_whole_subtree() {
    let relay = relay_with_strategy(WorkerStrategy::Include);

    let (stop, handles) = start(&relay, &["one.#"]).await.unwrap();
    assert_eq!(handles.len(), 3);
    stop_all(stop, handles).await;

    assert_eq!(
        relay.broker.queue_names(),
        vec!["one.bar.two", "one.foo.bar.two", "one.foo.two"]
    );
}

/// Verify that an unmatched pattern starts nothing.
#[tokio::test]
async fn test_unmatched_pattern_starts_nothing() {
    let relay = relay_with_strategy(WorkerStrategy::Include);

    let err = start(&relay, &["on.#"]).await.unwrap_err();

    match err {
        WorkerError::Selection(SelectionError::Unmatched { patterns }) => {
            assert_eq!(patterns, vec!["on.#"]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(relay.broker.connection_count(), 0);
    assert!(relay.broker.queue_names().is_empty());
}

/// Verify that no patterns start every enabled consumer.
#[tokio::test]
async fn test_no_patterns_start_every_enabled_consumer() {
    let relay = relay_with_strategy(WorkerStrategy::Include);

    let (stop, handles) = start(&relay, &[]).await.unwrap();
    assert_eq!(handles.len(), 5);
    stop_all(stop, handles).await;
}

/// Verify that exclude strategy runs native consumers only.
#[tokio::test]
async fn test_exclude_strategy_runs_native_consumers_only() {
    let relay = relay_with_strategy(WorkerStrategy::Exclude);

    let (stop, handles) = start(&relay, &[]).await.unwrap();
    assert_eq!(handles.len(), 1);
    stop_all(stop, handles).await;

    assert_eq!(relay.broker.queue_names(), vec!["mailers"]);

    // Job queues are not candidates under this strategy
    assert!(start(&relay, &["one.#"]).await.is_err());
}

/// Verify that only strategy skips native consumers.
#[tokio::test]
async fn test_only_strategy_skips_native_consumers() {
    let relay = relay_with_strategy(WorkerStrategy::Only);

    let (stop, handles) = start(&relay, &["#"]).await.unwrap();
    assert_eq!(handles.len(), 4);
    stop_all(stop, handles).await;

    assert!(!relay.broker.queue_names().contains(&"mailers".to_string()));
}
