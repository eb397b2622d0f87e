//! Integration tests for the publish bridge
//!
//! The VU is driven from the test thread itself, so these are plain tests
//! with their own runtime rather than `#[tokio::test]`.

use mqtt_publisher::error::PublishError;
use mqtt_publisher::publish::{ErrorEvent, PublishEvent, PublishHandlers, PublishRequest};
use mqtt_publisher::testing::MockClient;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use test_helpers::BridgeHarness;

fn sensor_request(timeout_millis: u64) -> PublishRequest {
    PublishRequest::new("sensors/temp", 0, "23.5", false, timeout_millis).unwrap()
}

/// Records which handler ran, how often and on which thread
#[derive(Default)]
struct HandlerLog {
    successes: Mutex<Vec<(PublishEvent, ThreadId)>>,
    failures: Mutex<Vec<(ErrorEvent, ThreadId)>>,
}

impl HandlerLog {
    fn handlers(self: &Arc<Self>) -> PublishHandlers {
        let on_success = self.clone();
        let on_failure = self.clone();
        PublishHandlers::new()
            .on_success(move |event| {
                on_success
                    .successes
                    .lock()
                    .unwrap()
                    .push((event, thread::current().id()));
                Ok(())
            })
            .on_failure(move |event| {
                on_failure
                    .failures
                    .lock()
                    .unwrap()
                    .push((event, thread::current().id()));
                Ok(())
            })
    }

    fn calls(&self) -> usize {
        self.successes.lock().unwrap().len() + self.failures.lock().unwrap().len()
    }

    fn failure_messages(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.message().to_string())
            .collect()
    }
}

#[test]
fn test_sync_publish_success_records_three_samples() {
    // Arrange: connected client acknowledging after 50ms
    let mut harness =
        BridgeHarness::new(MockClient::connected().with_ack_delay(Duration::from_millis(50)));
    let before = chrono::Utc::now().timestamp_millis() as f64;

    // Act
    let result = harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), PublishHandlers::new());

    // Assert
    assert!(result.is_ok(), "publish should succeed: {result:?}");
    assert!(harness.vu.take_exception().is_none());

    let published = harness.client.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "sensors/temp");
    assert_eq!(published[0].payload.as_ref(), b"23.5");

    let samples = harness.drain_samples();
    let values: Vec<(&str, f64)> = samples
        .iter()
        .map(|s| (s.metric.name(), s.value))
        .collect();
    assert_eq!(values.len(), 3);
    assert_eq!(values[0], ("mqtt_sent_messages_count", 1.0));
    assert_eq!(values[1], ("mqtt_sent_bytes", 4.0));
    assert_eq!(values[2].0, "mqtt_sent_dates");
    assert!(values[2].1 >= before);
    assert!(samples.iter().all(|s| s.tags.get("scenario") == Some("default")));
}

#[test]
fn test_async_publish_success_runs_handler_on_owning_thread() {
    // Arrange
    let mut harness =
        BridgeHarness::new(MockClient::connected().with_ack_delay(Duration::from_millis(50)));
    let log = Arc::new(HandlerLog::default());
    let owner = thread::current().id();

    // Act: the call returns before the broker has acknowledged
    harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), log.handlers())
        .unwrap();
    assert_eq!(harness.vu.pending_callbacks(), 1);
    assert_eq!(log.calls(), 0);

    harness.vu.run_event_loop().unwrap();

    // Assert: exactly one success, on this thread
    let successes = log.successes.lock().unwrap();
    assert_eq!(successes.len(), 1);
    assert!(log.failures.lock().unwrap().is_empty());
    let (event, thread_id) = &successes[0];
    assert_eq!(event.event_type(), "publish");
    assert_eq!(event.topic(), "sensors/temp");
    assert_eq!(*thread_id, owner);
    assert_eq!(
        serde_json::to_value(event).unwrap(),
        serde_json::json!({"type": "publish", "topic": "sensors/temp"})
    );

    assert_eq!(harness.drain_samples().len(), 3);
}

#[test]
fn test_sync_publish_not_connected() {
    let mut harness = BridgeHarness::new(MockClient::disconnected());

    let result = harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), PublishHandlers::new());

    assert!(matches!(result, Err(PublishError::NotConnected)));
    assert!(matches!(
        harness.vu.take_exception(),
        Some(PublishError::NotConnected)
    ));
    assert_eq!(harness.client.publish_count(), 0);
    assert!(harness.drain_samples().is_empty());
}

#[test]
fn test_async_publish_not_connected_calls_failure_handler() {
    let mut harness = BridgeHarness::new(MockClient::disconnected());
    let log = Arc::new(HandlerLog::default());

    let result = harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), log.handlers());
    assert!(result.is_ok());
    assert!(harness.vu.take_exception().is_none());

    harness.vu.run_event_loop().unwrap();

    assert_eq!(log.failure_messages(), vec!["publish not connected"]);
    assert!(log.successes.lock().unwrap().is_empty());
    assert_eq!(harness.client.publish_count(), 0);
    assert!(harness.drain_samples().is_empty());
}

#[test]
fn test_invalid_timeout_fails_before_any_network_work() {
    let harness = BridgeHarness::new(MockClient::connected());
    let log = Arc::new(HandlerLog::default());

    for handlers in [PublishHandlers::new(), log.handlers()] {
        let result = harness
            .publisher
            .publish(&harness.vu, sensor_request(u64::MAX), handlers);

        assert!(matches!(
            result,
            Err(PublishError::TimeoutValueInvalid { millis }) if millis == u64::MAX
        ));
        assert!(matches!(
            harness.vu.take_exception(),
            Some(PublishError::TimeoutValueInvalid { .. })
        ));
    }

    assert_eq!(harness.client.publish_count(), 0);
    assert_eq!(harness.vu.pending_callbacks(), 0);
    assert_eq!(log.calls(), 0);
}

#[test]
fn test_sync_checks_connection_before_timeout() {
    let harness = BridgeHarness::new(MockClient::disconnected());

    let result = harness
        .publisher
        .publish(&harness.vu, sensor_request(u64::MAX), PublishHandlers::new());

    assert!(matches!(result, Err(PublishError::NotConnected)));
}

#[test]
fn test_late_acknowledgment_is_reported_as_timeout_once() {
    // Arrange: broker takes 500ms, caller waits 1ms
    let mut harness =
        BridgeHarness::new(MockClient::connected().with_ack_delay(Duration::from_millis(500)));
    let log = Arc::new(HandlerLog::default());

    // Act: one synchronous and one asynchronous publish
    let sync_result = harness
        .publisher
        .publish(&harness.vu, sensor_request(1), PublishHandlers::new());
    harness
        .publisher
        .publish(&harness.vu, sensor_request(1), log.handlers())
        .unwrap();
    harness.vu.run_event_loop().unwrap();

    // Assert: both paths time out
    assert!(matches!(sync_result, Err(PublishError::Timeout)));
    assert!(matches!(
        harness.vu.take_exception(),
        Some(PublishError::Timeout)
    ));
    assert_eq!(log.failure_messages(), vec!["publish timeout"]);

    // The acks still arrive later and are dropped without another callback
    thread::sleep(Duration::from_millis(800));
    assert_eq!(harness.client.discarded_completions(), 2);
    assert_eq!(harness.vu.run_ready().unwrap(), 0);
    assert_eq!(harness.vu.pending_callbacks(), 0);
    assert_eq!(log.calls(), 1);
    assert!(harness.drain_samples().is_empty());
}

#[test]
fn test_protocol_error_reaches_failure_handler() {
    let harness = BridgeHarness::new(
        MockClient::connected()
            .with_ack_delay(Duration::from_millis(10))
            .with_failure("connection lost: broker went away"),
    );
    let log = Arc::new(HandlerLog::default());

    harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), log.handlers())
        .unwrap();
    harness.vu.run_event_loop().unwrap();

    assert_eq!(
        log.failure_messages(),
        vec!["connection lost: broker went away"]
    );
}

#[test]
fn test_handler_error_fails_the_callback_job() {
    let harness = BridgeHarness::new(MockClient::connected());
    let handlers = PublishHandlers::new().on_success(|_| Err("script handler threw".into()));

    harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), handlers)
        .unwrap();
    let result = harness.vu.run_event_loop();

    match result {
        Err(PublishError::HandlerError(source)) => {
            assert_eq!(source.to_string(), "script handler threw")
        }
        other => panic!("expected handler error, got {other:?}"),
    }
}

#[test]
fn test_failure_handler_error_fails_the_callback_job() {
    let harness = BridgeHarness::new(MockClient::disconnected());
    let calls = Arc::new(AtomicUsize::new(0));

    let on_failure = calls.clone();
    let handlers = PublishHandlers::new().on_failure(move |event| {
        on_failure.fetch_add(1, Ordering::SeqCst);
        Err(format!("script rejected: {}", event.message()).into())
    });
    harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), handlers)
        .unwrap();
    let result = harness.vu.run_event_loop();

    match result {
        Err(PublishError::HandlerError(source)) => {
            assert_eq!(source.to_string(), "script rejected: publish not connected")
        }
        other => panic!("expected handler error, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.vu.pending_callbacks(), 0);
    assert!(harness.vu.take_exception().is_none());
}

#[test]
fn test_teardown_skips_metrics_but_still_delivers() {
    let mut harness =
        BridgeHarness::new(MockClient::connected().with_ack_delay(Duration::from_millis(20)));
    let log = Arc::new(HandlerLog::default());

    harness
        .publisher
        .publish(&harness.vu, sensor_request(1000), log.handlers())
        .unwrap();
    harness.vu.teardown();
    harness.vu.run_event_loop().unwrap();

    assert_eq!(log.successes.lock().unwrap().len(), 1);
    assert!(harness.drain_samples().is_empty());
    assert_eq!(harness.publisher.state_unavailable_count(), 1);
}

#[test]
fn test_concurrent_publishes_each_deliver_exactly_once() {
    let harness =
        BridgeHarness::new(MockClient::connected().with_ack_delay(Duration::from_millis(5)));
    let delivered = Arc::new(AtomicUsize::new(0));
    let publishes = 25;

    for i in 0..publishes {
        let on_success = delivered.clone();
        let on_failure = delivered.clone();
        let handlers = PublishHandlers::new()
            .on_success(move |_| {
                on_success.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_failure(move |_| {
                on_failure.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        // Every other publish times out
        let timeout = if i % 2 == 0 { 1000 } else { 0 };
        harness
            .publisher
            .publish(&harness.vu, sensor_request(timeout), handlers)
            .unwrap();
    }

    assert_eq!(harness.vu.pending_callbacks(), publishes);
    harness.vu.run_event_loop().unwrap();

    assert_eq!(delivered.load(Ordering::SeqCst), publishes);
    assert_eq!(harness.client.publish_count(), publishes);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_sync_publish_with_valid_timeout_succeeds(
        timeout in 1..=mqtt_publisher::publish::MAX_TIMEOUT_MILLIS,
        qos in 0u8..=2,
    ) {
        let mut harness = BridgeHarness::new(MockClient::connected());
        let request = PublishRequest::new("sensors/temp", qos, "23.5", false, timeout).unwrap();

        let result = harness.publisher.publish(&harness.vu, request, PublishHandlers::new());

        prop_assert!(result.is_ok());
        prop_assert_eq!(harness.drain_samples().len(), 3);
    }
}
