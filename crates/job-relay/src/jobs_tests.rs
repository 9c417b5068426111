use super::*;
use crate::broker::{Binding, BrokerConnector, ExchangeSpec, QueueOptions, ReturnNotifier};
use crate::config::RelayConfig;
use crate::delay::DELAY_HEADER;
use crate::providers::InMemoryBroker;
use chrono::Duration;
use serde_json::json;

async fn enqueuer_with_queue(queue: &str) -> (InMemoryBroker, JobEnqueuer) {
    let broker = InMemoryBroker::new();
    let (notifier, _returns) = ReturnNotifier::channel();
    let channel = broker.connect("setup", notifier).await.unwrap();
    channel
        .declare_exchange("activejob", &ExchangeSpec::default())
        .await
        .unwrap();
    channel
        .declare_queue(queue, &QueueOptions::default())
        .await
        .unwrap();
    channel
        .bind_queue(queue, "activejob", &Binding::RoutingKey(queue.to_string()))
        .await
        .unwrap();

    let publisher = ReliablePublisher::new(Arc::new(broker.clone()), RelayConfig::default());
    (broker, JobEnqueuer::new(Arc::new(publisher)))
}

// ============================================================================
// Serialized Jobs
// ============================================================================

mod serialized {
    use super::*;

    /// Verify that the payload uses the ActiveJob layout.
    #[test]
    fn test_payload_uses_activejob_layout() {
        let job = SerializedJob::new("ImportJob", "default", vec![json!(42), json!("full")]);

        let payload: serde_json::Value = serde_json::from_slice(&job.payload().unwrap()).unwrap();

        assert_eq!(payload["job_class"], "ImportJob");
        assert_eq!(payload["queue_name"], "default");
        assert_eq!(payload["arguments"], json!([42, "full"]));
        assert_eq!(payload["executions"], 0);
        assert!(payload["enqueued_at"].is_string());
        assert!(payload.get("priority").is_none());
    }

    /// Verify that job ids are unique.
    #[test]
    fn test_job_ids_are_unique() {
        let first = SerializedJob::new("ImportJob", "default", vec![]);
        let second = SerializedJob::new("ImportJob", "default", vec![]);
        assert_ne!(first.job_id, second.job_id);
    }

    /// Verify that the job priority becomes the publish priority.
    #[test]
    fn test_job_priority_becomes_publish_priority() {
        let job = SerializedJob::new("ImportJob", "default", vec![]).with_priority(5);
        assert_eq!(job.publish_options().priority, Some(5));

        let job = job.with_options(JobOptions::new().with_priority(1));
        assert_eq!(job.publish_options().priority, Some(1));
    }

    /// Verify that a payload without optional fields decodes.
    #[test]
    fn test_decodes_payload_without_optional_fields() {
        let job: SerializedJob = serde_json::from_str(
            r#"{"job_class":"ImportJob","job_id":"abc","queue_name":"default"}"#,
        )
        .unwrap();

        assert!(job.arguments.is_empty());
        assert_eq!(job.executions, 0);
        assert_eq!(job.options, JobOptions::default());
    }
}

// ============================================================================
// Destination Resolution
// ============================================================================

mod resolver {
    use super::*;

    /// Verify that the queue name is read from the payload.
    #[test]
    fn test_reads_queue_name() {
        let payload = br#"{"job_class":"ImportJob","queue_name":"tenant_imports"}"#;
        assert_eq!(JsonQueueNameResolver.resolve(payload).unwrap(), "tenant_imports");
    }

    /// Verify that non-JSON payloads are rejected.
    #[test]
    fn test_rejects_non_json() {
        let result = JsonQueueNameResolver.resolve(b"not json");
        assert!(matches!(result, Err(PublishError::UnresolvedDestination { .. })));
    }

    /// Verify that a missing or blank queue name is rejected.
    #[test]
    fn test_rejects_missing_or_blank_queue_name() {
        let payloads: [&[u8]; 3] = [
            br#"{"job_class":"ImportJob"}"#,
            br#"{"queue_name":"  "}"#,
            br#"{"queue_name":3}"#,
        ];
        for payload in payloads {
            let result = JsonQueueNameResolver.resolve(payload);
            assert!(matches!(result, Err(PublishError::UnresolvedDestination { .. })));
        }
    }
}

// ============================================================================
// Delay Computation
// ============================================================================

mod delays {
    use super::*;

    /// Verify that the delay rounds to the nearest second.
    #[test]
    fn test_delay_rounds_to_nearest_second() {
        let now = Utc::now();

        assert_eq!(delay_between(now, now + Duration::milliseconds(2_400)), 2);
        assert_eq!(delay_between(now, now + Duration::milliseconds(2_600)), 3);
        assert_eq!(delay_between(now, now + Duration::seconds(30)), 30);
    }

    /// Verify that past timestamps give non-positive delays.
    #[test]
    fn test_past_timestamps_give_non_positive_delays() {
        let now = Utc::now();

        assert_eq!(delay_between(now, now), 0);
        assert_eq!(delay_between(now, now - Duration::seconds(5)), -5);
    }
}

// ============================================================================
// Enqueueing
// ============================================================================

mod enqueue {
    use super::*;

    /// Verify that jobs are routed by queue name.
    #[tokio::test]
    async fn test_routes_by_queue_name() {
        let (broker, enqueuer) = enqueuer_with_queue("default").await;
        let job = SerializedJob::new("ImportJob", "default", vec![json!(1)]);

        enqueuer.enqueue(&job).await.unwrap();

        let message = broker.get("default").unwrap();
        assert_eq!(message.routing_key, "default");
        let decoded: SerializedJob = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded.job_id, job.job_id);
    }

    /// Verify that a routing key override replaces the queue name.
    #[tokio::test]
    async fn test_routing_key_override() {
        let (broker, enqueuer) = enqueuer_with_queue("reports").await;
        let job = SerializedJob::new("ReportJob", "default", vec![])
            .with_options(JobOptions::new().with_routing_key("reports"));

        enqueuer.enqueue(&job).await.unwrap();

        assert_eq!(broker.message_count("reports"), 1);
        assert!(!broker.queue_names().contains(&"default".to_string()));
    }

    /// Verify that priority and headers pass through.
    #[tokio::test]
    async fn test_priority_and_headers_pass_through() {
        let (broker, enqueuer) = enqueuer_with_queue("default").await;
        let job = SerializedJob::new("ImportJob", "default", vec![])
            .with_options(JobOptions::new().with_priority(2).with_header("foo", "bar"));

        enqueuer.enqueue(&job).await.unwrap();

        let message = broker.get("default").unwrap();
        assert_eq!(message.properties.priority, Some(2));
        assert_eq!(
            message.properties.headers.get("foo"),
            Some(&HeaderValue::from("bar"))
        );
    }

    /// Verify that a blank queue name is rejected.
    #[tokio::test]
    async fn test_blank_queue_name_is_rejected() {
        let (broker, enqueuer) = enqueuer_with_queue("default").await;
        let job = SerializedJob::new("ImportJob", " ", vec![]);

        let result = enqueuer.enqueue(&job).await;

        assert!(matches!(
            result,
            Err(PublishError::InvalidJob(ValidationError::Required { .. }))
        ));
        assert!(broker.publish_log().is_empty());
    }

    /// Verify that a future job goes to a delay tier.
    #[tokio::test]
    async fn test_future_job_goes_to_delay_tier() {
        let (broker, enqueuer) = enqueuer_with_queue("default").await;
        let enqueuer = enqueuer.with_delay_fn(|_| 90);
        let job = SerializedJob::new("ImportJob", "default", vec![]);

        enqueuer
            .enqueue_at(&job, Utc::now() + Duration::seconds(90))
            .await
            .unwrap();

        assert_eq!(broker.message_count("default"), 0);
        let message = broker.get("delayed:90").unwrap();
        assert_eq!(message.routing_key, "default");
        assert_eq!(
            message.properties.headers.get(DELAY_HEADER),
            Some(&HeaderValue::Int(90))
        );
    }

    /// Verify that a past job is enqueued immediately.
    #[tokio::test]
    async fn test_past_job_is_enqueued_immediately() {
        let (broker, enqueuer) = enqueuer_with_queue("default").await;
        let job = SerializedJob::new("ImportJob", "default", vec![]);

        enqueuer
            .enqueue_at(&job, Utc::now() - Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(broker.message_count("default"), 1);
        assert!(!broker.queue_names().iter().any(|q| q.starts_with("delayed:")));
    }
}
