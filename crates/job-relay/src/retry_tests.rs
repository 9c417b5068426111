//! Tests for failure recording and retry scheduling.

use super::*;
use crate::broker::{
    Binding, BrokerChannel, BrokerConnector, ConsumeOptions, DeliveryReceiver, ExchangeSpec,
    QueueOptions, ReturnNotifier,
};
use crate::config::RelayConfig;
use crate::error::PublishError;
use crate::providers::InMemoryBroker;
use std::time::Duration;

fn death<'a>(queue: &'a str) -> Death<'a> {
    Death {
        queue,
        exchange: "activejob",
        routing_key: queue,
        reason: REASON_REJECTED,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

#[derive(Debug, thiserror::Error)]
#[error("job could not load its record")]
struct LoadFailed {
    #[source]
    source: std::io::Error,
}

// ============================================================================
// Death Records
// ============================================================================

mod deaths {
    use super::*;

    /// Verify that a first failure appends a death entry.
    #[test]
    fn test_first_failure_appends_entry() {
        let mut headers = Headers::new();

        let count = record_death(&mut headers, &death("default"), 1_700_000_000).unwrap();

        assert_eq!(count, 1);
        let entries = headers.get(X_DEATH).and_then(HeaderValue::as_array).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = entries[0].as_table().unwrap();
        assert_eq!(entry.get("queue"), Some(&HeaderValue::from("default")));
        assert_eq!(entry.get("reason"), Some(&HeaderValue::from("rejected")));
        assert_eq!(entry.get("exchange"), Some(&HeaderValue::from("activejob")));
        assert_eq!(entry.get("time"), Some(&HeaderValue::Timestamp(1_700_000_000)));
        assert_eq!(
            entry.get("routing-keys"),
            Some(&HeaderValue::Array(vec![HeaderValue::from("default")]))
        );
    }

    /// Verify that a repeated failure increments its entry in place.
    #[test]
    fn test_repeated_failure_increments_in_place() {
        let mut headers = Headers::new();

        record_death(&mut headers, &death("default"), 1).unwrap();
        record_death(&mut headers, &death("default"), 2).unwrap();
        let count = record_death(&mut headers, &death("default"), 3).unwrap();

        assert_eq!(count, 3);
        assert_eq!(death_count(&headers, "default"), Some(3));
        let entries = headers.get(X_DEATH).and_then(HeaderValue::as_array).unwrap();
        assert_eq!(entries.len(), 1);
        // time of the first failure is kept
        assert_eq!(
            entries[0].as_table().unwrap().get("time"),
            Some(&HeaderValue::Timestamp(1))
        );
    }

    /// Verify that entries for other queues are left untouched.
    #[test]
    fn test_other_queues_are_left_untouched() {
        let mut headers = Headers::new();
        let expired = Death {
            queue: "delayed:3",
            exchange: "activejob-delayed",
            routing_key: "default",
            reason: REASON_EXPIRED,
        };
        headers.insert(
            X_DEATH.to_string(),
            HeaderValue::Array(vec![HeaderValue::Table(death_entry(&expired, 4, 1))]),
        );

        let count = record_death(&mut headers, &death("default"), 2).unwrap();

        assert_eq!(count, 1);
        assert_eq!(death_count(&headers, "delayed:3"), Some(4));
        assert_eq!(death_count(&headers, "default"), Some(1));
        let entries = headers.get(X_DEATH).and_then(HeaderValue::as_array).unwrap();
        assert_eq!(entries.len(), 2);
    }

    /// Verify that the first-death headers are set only once.
    #[test]
    fn test_first_death_headers_set_once() {
        let mut headers = Headers::new();

        record_death(&mut headers, &death("default"), 1).unwrap();
        record_death(&mut headers, &death("mailers"), 2).unwrap();

        assert_eq!(
            headers.get(X_FIRST_DEATH_QUEUE),
            Some(&HeaderValue::from("default"))
        );
        assert_eq!(
            headers.get(X_FIRST_DEATH_EXCHANGE),
            Some(&HeaderValue::from("activejob"))
        );
        assert_eq!(
            headers.get(X_FIRST_DEATH_REASON),
            Some(&HeaderValue::from("rejected"))
        );
    }

    /// Verify that a non-array x-death header is malformed.
    #[test]
    fn test_non_array_x_death_is_malformed() {
        let mut headers = Headers::new();
        headers.insert(X_DEATH.to_string(), HeaderValue::from("garbage"));

        let result = record_death(&mut headers, &death("default"), 1);

        assert!(matches!(
            result,
            Err(RetryError::MalformedHeader { ref header, ref queue })
                if header == X_DEATH && queue == "default"
        ));
    }

    /// Verify that the death count is absent for an unknown queue.
    #[test]
    fn test_count_missing_for_unknown_queue() {
        let headers = Headers::new();
        assert_eq!(death_count(&headers, "default"), None);
    }
}

// ============================================================================
// Error Details
// ============================================================================

mod errors {
    use super::*;

    /// Verify that a failure is named after its error type.
    #[test]
    fn test_failure_named_after_error_type() {
        let failure = JobFailure::from(Boom);

        assert!(failure.name().ends_with("Boom"));
        assert!(failure.details().starts_with("boom"));
        assert!(failure.to_string().ends_with("Boom: boom"));
    }

    /// Verify that failure details include the source chain.
    #[test]
    fn test_failure_details_include_source_chain() {
        let failure = JobFailure::from(LoadFailed {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "record 42 missing"),
        });

        assert!(failure.details().starts_with("job could not load its record"));
        assert!(failure.details().contains("Caused by: record 42 missing"));
    }

    /// Verify that a boxed failure keeps its given name.
    #[test]
    fn test_boxed_failure_keeps_given_name() {
        let failure = JobFailure::from_boxed("ImportJob::Timeout", Box::new(Boom));

        assert_eq!(failure.name(), "ImportJob::Timeout");
        assert!(failure.details().starts_with("boom"));
    }

    /// Verify that failure details survive encoding.
    #[test]
    fn test_details_survive_encoding() {
        let details = "undefined method `name' for nil\napp/jobs/import.rb:12\n".repeat(20);

        let encoded = encode_error_details(&details).unwrap();

        assert!(!encoded.contains('\n'));
        assert_eq!(decode_error_details(&encoded).unwrap(), details);
    }

    /// Verify that decoding ignores line breaks.
    #[test]
    fn test_decoding_ignores_line_breaks() {
        let encoded = encode_error_details("boom").unwrap();
        let wrapped: String = encoded
            .as_bytes()
            .chunks(8)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join("\n");

        assert_eq!(decode_error_details(&wrapped).unwrap(), "boom");
    }

    /// Verify that invalid base64 is rejected.
    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(matches!(
            decode_error_details("not base64!"),
            Err(RetryError::Compression(_))
        ));
    }

    /// Verify that recording an error replaces previous values.
    #[test]
    fn test_record_error_replaces_previous_values() {
        let mut headers = Headers::new();

        record_error(&mut headers, &JobFailure::new("First", "one")).unwrap();
        record_error(&mut headers, &JobFailure::new("Second", "two")).unwrap();

        assert_eq!(headers.get(X_LAST_ERROR_NAME), Some(&HeaderValue::from("Second")));
        let encoded = headers
            .get(X_LAST_ERROR_DETAILS)
            .and_then(HeaderValue::as_str)
            .unwrap();
        assert_eq!(decode_error_details(encoded).unwrap(), "two");
    }
}

// ============================================================================
// Retry Handler
// ============================================================================

mod handler {
    use super::*;

    const JOB: &str = r#"{"job_class":"ImportJob","queue_name":"default","arguments":[]}"#;

    struct Fixture {
        broker: InMemoryBroker,
        publisher: Arc<ReliablePublisher>,
        deliveries: DeliveryReceiver,
        _consumer: Arc<dyn BrokerChannel>,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let (notifier, _returns) = ReturnNotifier::channel();
        let consumer = broker.connect("worker", notifier).await.unwrap();
        consumer
            .declare_exchange("activejob", &ExchangeSpec::default())
            .await
            .unwrap();
        consumer
            .declare_queue("default", &QueueOptions::default())
            .await
            .unwrap();
        consumer
            .bind_queue("default", "activejob", &Binding::RoutingKey("default".to_string()))
            .await
            .unwrap();
        let deliveries = consumer
            .consume("default", &ConsumeOptions::default())
            .await
            .unwrap();

        let publisher = Arc::new(ReliablePublisher::new(
            Arc::new(broker.clone()),
            RelayConfig::default(),
        ));

        Fixture {
            broker,
            publisher,
            deliveries,
            _consumer: consumer,
        }
    }

    async fn next_delivery(fixture: &mut Fixture) -> Delivery {
        fixture.broker.tick();
        fixture.deliveries.try_recv().expect("no delivery ready")
    }

    /// Verify that a failed delivery moves to the first tier.
    #[tokio::test]
    async fn test_failed_delivery_moves_to_first_tier() {
        let mut fixture = fixture().await;
        fixture
            .publisher
            .publish(JOB, "default", PublishOptions::new().with_header("foo", "bar"))
            .await
            .unwrap();
        let delivery = next_delivery(&mut fixture).await;

        let retry = RetryHandler::new(fixture.publisher.clone());
        let delay = retry
            .on_failure(&delivery, &JobFailure::from(Boom))
            .await
            .unwrap();

        assert_eq!(delay, 3);
        assert_eq!(fixture.broker.unacked_count("default"), 0);
        assert_eq!(fixture.broker.message_count("default"), 0);

        let message = fixture.broker.get("delayed:3").unwrap();
        let headers = &message.properties.headers;
        assert_eq!(message.routing_key, "default");
        assert_eq!(death_count(headers, "default"), Some(1));
        assert_eq!(headers.get("foo"), Some(&HeaderValue::from("bar")));
        assert!(headers
            .get(X_LAST_ERROR_NAME)
            .and_then(HeaderValue::as_str)
            .is_some_and(|name| name.ends_with("Boom")));
    }

    /// Verify that a second failure moves to the second tier.
    #[tokio::test(start_paused = true)]
    async fn test_second_failure_moves_to_second_tier() {
        let mut fixture = fixture().await;
        let retry = RetryHandler::new(fixture.publisher.clone());
        fixture
            .publisher
            .publish(JOB, "default", PublishOptions::new())
            .await
            .unwrap();

        let first = next_delivery(&mut fixture).await;
        assert_eq!(retry.on_failure(&first, &JobFailure::from(Boom)).await.unwrap(), 3);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = next_delivery(&mut fixture).await;
        assert_eq!(death_count(&second.properties.headers, "delayed:3"), Some(1));

        let delay = retry
            .on_failure(&second, &JobFailure::from(Boom))
            .await
            .unwrap();

        assert_eq!(delay, 30);
        let message = fixture.broker.get("delayed:30").unwrap();
        assert_eq!(death_count(&message.properties.headers, "default"), Some(2));
        assert_eq!(
            message.properties.headers.get(X_FIRST_DEATH_QUEUE),
            Some(&HeaderValue::from("default"))
        );
    }

    /// Verify that a custom backoff function picks the retry delay.
    #[tokio::test]
    async fn test_custom_backoff() {
        let mut fixture = fixture().await;
        fixture
            .publisher
            .publish(JOB, "default", PublishOptions::new())
            .await
            .unwrap();
        let delivery = next_delivery(&mut fixture).await;

        let retry = RetryHandler::new(fixture.publisher.clone()).with_backoff(|count| count * 10);
        let delay = retry
            .on_failure(&delivery, &JobFailure::new("Timeout", "took too long"))
            .await
            .unwrap();

        assert_eq!(delay, 10);
        assert_eq!(fixture.broker.message_count("delayed:10"), 1);
    }

    /// Verify that a failed publish leaves the delivery unacked.
    #[tokio::test]
    async fn test_failed_publish_leaves_delivery_unacked() {
        let mut fixture = fixture().await;
        fixture
            .publisher
            .publish(JOB, "default", PublishOptions::new())
            .await
            .unwrap();
        let delivery = next_delivery(&mut fixture).await;
        fixture.broker.fail_publishes(true);

        let retry = RetryHandler::new(fixture.publisher.clone());
        let result = retry.on_failure(&delivery, &JobFailure::from(Boom)).await;

        assert!(matches!(
            result,
            Err(RetryError::Republish(PublishError::Broker(_)))
        ));
        assert_eq!(fixture.broker.unacked_count("default"), 1);
    }
}
