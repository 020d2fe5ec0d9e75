//! Synchronous facade over the request/reply queue pair.

use crate::{
    error::BridgeError,
    queue::{QueueClient, QueueError},
    registry::{CorrelationHandle, CorrelationRegistry},
};
use async_trait::async_trait;
use catalog_bridge_common::helpers::{
    shutdown_handler::ShutdownHandler, sqs::CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;

pub const MAX_CORRELATION_ID_LENGTH: usize = 128;

/// Publishes a request tagged with its correlation id.
#[async_trait]
pub trait RequestPublisher: Send + Sync {
    async fn publish(&self, correlation_id: &str, body: &str) -> Result<(), QueueError>;
}

/// [`RequestPublisher`] sending to a queue through its own [`QueueClient`].
#[derive(Debug, Clone)]
pub struct QueuePublisher<Q> {
    client:      Q,
    destination: String,
}

impl<Q: QueueClient> QueuePublisher<Q> {
    pub fn new(client: Q, destination: impl Into<String>) -> Self {
        Self {
            client,
            destination: destination.into(),
        }
    }
}

#[async_trait]
impl<Q: QueueClient> RequestPublisher for QueuePublisher<Q> {
    async fn publish(&self, correlation_id: &str, body: &str) -> Result<(), QueueError> {
        let attributes = HashMap::from([(
            CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME.to_string(),
            correlation_id.to_string(),
        )]);
        let message_id = self
            .client
            .send(&self.destination, body, &attributes)
            .await?;
        tracing::debug!(correlation_id, message_id = %message_id, "Request published");
        Ok(())
    }
}

/// What a caller of [`SyncBridge::request`] gets back. Never a hang.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome<T> {
    Ok(T),
    /// Another request with the same correlation id is in flight.
    InProgress,
    Timeout,
    Error(BridgeError),
}

impl<T> RequestOutcome<T> {
    fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Ok(_) => "ok",
            RequestOutcome::InProgress => "in_progress",
            RequestOutcome::Timeout => "timeout",
            RequestOutcome::Error(_) => "error",
        }
    }
}

/// Rejects ids that are empty, too long, or contain anything besides ASCII
/// alphanumerics and `-_.:`.
pub fn validate_correlation_id(correlation_id: &str) -> Result<(), BridgeError> {
    let reason = if correlation_id.is_empty() {
        "must not be empty"
    } else if correlation_id.len() > MAX_CORRELATION_ID_LENGTH {
        "must be at most 128 characters"
    } else if !correlation_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        "contains unsupported characters"
    } else {
        return Ok(());
    };
    Err(BridgeError::Validation {
        correlation_id: correlation_id.to_owned(),
        reason,
    })
}

/// Removes the registration on every exit path, including the request future
/// being dropped mid-wait.
struct Registration<'a, T: Clone> {
    registry: &'a CorrelationRegistry<T>,
    handle:   CorrelationHandle<T>,
}

impl<T: Clone> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        self.registry.release(&self.handle);
    }
}

struct PendingRequest<'a>(&'a ShutdownHandler);

impl<'a> PendingRequest<'a> {
    fn start(shutdown: &'a ShutdownHandler) -> Self {
        shutdown.increment_requests_pending_completion();
        Self(shutdown)
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.0.decrement_requests_pending_completion();
    }
}

pub struct SyncBridge<T, P> {
    registry:        Arc<CorrelationRegistry<T>>,
    publisher:       P,
    shutdown:        ShutdownHandler,
    default_timeout: Duration,
}

impl<T, P> SyncBridge<T, P>
where
    T: Clone + Send + Sync,
    P: RequestPublisher,
{
    pub fn new(
        registry: Arc<CorrelationRegistry<T>>,
        publisher: P,
        shutdown: ShutdownHandler,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            publisher,
            shutdown,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry<T>> {
        &self.registry
    }

    /// Publishes `body` under `correlation_id` and waits up to `timeout` for
    /// the matching reply.
    ///
    /// A concurrent duplicate returns [`RequestOutcome::InProgress`] without
    /// publishing again. When the reply is already parked as an orphan it is
    /// returned without publishing at all.
    pub async fn request(
        &self,
        correlation_id: &str,
        body: &str,
        timeout: Duration,
    ) -> RequestOutcome<T> {
        let started = Instant::now();
        let outcome = self.exchange(correlation_id, body, timeout).await;

        metrics::histogram!("bridge.request.duration").record(started.elapsed().as_secs_f64());
        metrics::counter!("bridge.request.outcome", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn exchange(
        &self,
        correlation_id: &str,
        body: &str,
        timeout: Duration,
    ) -> RequestOutcome<T> {
        let started = Instant::now();
        if let Err(err) = validate_correlation_id(correlation_id) {
            tracing::info!(error = %err, "Rejected request");
            return RequestOutcome::Error(err);
        }
        if self.shutdown.is_shutting_down() {
            return RequestOutcome::Error(BridgeError::ShuttingDown);
        }
        let _pending = PendingRequest::start(&self.shutdown);

        let registration = match self.registry.register(correlation_id) {
            Ok(handle) => Registration {
                registry: &self.registry,
                handle,
            },
            Err(BridgeError::Conflict(_)) => {
                tracing::info!(correlation_id, "Request already in progress");
                return RequestOutcome::InProgress;
            }
            Err(err) => return RequestOutcome::Error(err),
        };

        // Publishing counts against the caller's timeout.
        let deadline = started + timeout;
        if !registration.handle.is_ready() {
            let publish = self.publisher.publish(correlation_id, body);
            match tokio::time::timeout_at(deadline, publish).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(correlation_id, error = %err, "Failed to publish request");
                    self.registry.fail(correlation_id, err.to_string());
                    return RequestOutcome::Error(BridgeError::Transport(err));
                }
                Err(_) => {
                    tracing::warn!(correlation_id, ?timeout, "Request timed out while publishing");
                    return RequestOutcome::Timeout;
                }
            }
        } else {
            tracing::debug!(correlation_id, "Reply already available, skipping publish");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self
            .registry
            .await_result(&registration.handle, remaining)
            .await
        {
            Ok(payload) => RequestOutcome::Ok(payload),
            Err(BridgeError::Timeout(_)) => {
                tracing::warn!(correlation_id, ?timeout, "Request timed out");
                RequestOutcome::Timeout
            }
            Err(err) => RequestOutcome::Error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{InMemoryQueue, QueueCall},
        reaper::Reaper,
    };
    use rstest::rstest;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    const REQUESTS: &str = "product-find-request";

    /// Answers from inside `publish`, after the waiter registered.
    struct AnsweringPublisher {
        registry:  Arc<CorrelationRegistry<Value>>,
        published: Mutex<Vec<String>>,
        reply:     Option<Result<Value, String>>,
    }

    impl AnsweringPublisher {
        fn new(
            registry: &Arc<CorrelationRegistry<Value>>,
            reply: Option<Result<Value, String>>,
        ) -> Self {
            Self {
                registry: Arc::clone(registry),
                published: Mutex::new(Vec::new()),
                reply,
            }
        }

        fn published(&self) -> Vec<String> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RequestPublisher for AnsweringPublisher {
        async fn publish(&self, correlation_id: &str, _body: &str) -> Result<(), QueueError> {
            self.published
                .lock()
                .unwrap()
                .push(correlation_id.to_string());
            match &self.reply {
                Some(Ok(payload)) => {
                    self.registry.resolve(correlation_id, payload.clone());
                }
                Some(Err(error)) => {
                    self.registry.fail(correlation_id, error.clone());
                }
                None => {}
            }
            Ok(())
        }
    }

    fn bridge<P: RequestPublisher>(
        registry: &Arc<CorrelationRegistry<Value>>,
        publisher: P,
    ) -> SyncBridge<Value, P> {
        SyncBridge::new(
            Arc::clone(registry),
            publisher,
            ShutdownHandler::new(Duration::from_secs(1)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_request_returns_reply_and_cleans_up() {
        let registry = Arc::new(CorrelationRegistry::new());
        let bridge = bridge(
            &registry,
            AnsweringPublisher::new(&registry, Some(Ok(json!([{"sku": "X"}])))),
        );

        let outcome = bridge.request("abc", "{}", Duration::from_secs(1)).await;

        assert_eq!(outcome, RequestOutcome::Ok(json!([{"sku": "X"}])));
        assert!(!registry.contains("abc"));
        assert_eq!(bridge.shutdown.requests_pending_completion(), 0);
    }

    #[tokio::test]
    async fn test_failed_reply_is_returned_as_error() {
        let registry = Arc::new(CorrelationRegistry::new());
        let bridge = bridge(
            &registry,
            AnsweringPublisher::new(&registry, Some(Err("catalog offline".into()))),
        );

        let outcome = bridge.request("abc", "{}", Duration::from_secs(1)).await;

        assert_eq!(
            outcome,
            RequestOutcome::Error(BridgeError::Failed("catalog offline".into()))
        );
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_an_outcome_and_leaves_no_entry() {
        let registry = Arc::new(CorrelationRegistry::new());
        let bridge = bridge(&registry, AnsweringPublisher::new(&registry, None));

        let outcome = bridge.request("slow", "{}", Duration::from_secs(3)).await;

        assert_eq!(outcome, RequestOutcome::Timeout);
        assert!(registry.is_empty());
        assert_eq!(
            registry.resolve("slow", json!([])),
            crate::registry::ResolveOutcome::Orphaned
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_is_in_progress_and_not_republished() {
        let registry = Arc::new(CorrelationRegistry::new());
        let queue = InMemoryQueue::new();
        let bridge = Arc::new(bridge(
            &registry,
            QueuePublisher::new(queue.clone(), REQUESTS),
        ));

        let first = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.request("dup", "{}", Duration::from_secs(10)).await }
        });
        while !registry.contains("dup") {
            tokio::task::yield_now().await;
        }

        let second = bridge.request("dup", "{}", Duration::from_secs(10)).await;
        assert_eq!(second, RequestOutcome::InProgress);

        registry.resolve("dup", json!("done"));
        assert_eq!(first.await.unwrap(), RequestOutcome::Ok(json!("done")));

        let sends = queue
            .calls()
            .iter()
            .filter(|call| matches!(call, QueueCall::Send { .. }))
            .count();
        assert_eq!(sends, 1);
        assert_eq!(queue.len(REQUESTS), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_propagates_without_dangling_waiter() {
        let registry = Arc::new(CorrelationRegistry::<Value>::new());
        let queue = InMemoryQueue::new();
        queue.fail_next_sends(1);
        let bridge = bridge(&registry, QueuePublisher::new(queue.clone(), REQUESTS));

        let outcome = bridge.request("abc", "{}", Duration::from_secs(1)).await;

        assert!(matches!(
            outcome,
            RequestOutcome::Error(BridgeError::Transport(QueueError::Send { .. }))
        ));
        assert!(registry.is_empty());
        assert!(queue.is_empty(REQUESTS));
    }

    #[tokio::test]
    async fn test_published_request_carries_correlation_id() {
        let registry = Arc::new(CorrelationRegistry::<Value>::new());
        let queue = InMemoryQueue::new();
        let publisher = QueuePublisher::new(queue.clone(), REQUESTS);

        publisher.publish("abc", r#"{"limit":10}"#).await.unwrap();

        let received = queue.receive(REQUESTS, 1, 0, 30).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body.as_deref(), Some(r#"{"limit":10}"#));
        assert_eq!(
            received[0].attribute(CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME),
            Some("abc")
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_reply_is_returned_without_publishing() {
        let registry = Arc::new(CorrelationRegistry::new());
        registry.resolve("early", json!("P"));
        let publisher = AnsweringPublisher::new(&registry, None);
        let bridge = bridge(&registry, publisher);

        let outcome = bridge.request("early", "{}", Duration::from_secs(1)).await;

        assert_eq!(outcome, RequestOutcome::Ok(json!("P")));
        assert!(bridge.publisher.published().is_empty());
        assert!(registry.is_empty());
    }

    #[rstest]
    #[case("")]
    #[case("has space")]
    #[case("semi;colon")]
    #[case("ünïcode")]
    #[tokio::test]
    async fn test_invalid_ids_are_rejected_before_registration(#[case] correlation_id: &str) {
        let registry = Arc::new(CorrelationRegistry::new());
        let bridge = bridge(&registry, AnsweringPublisher::new(&registry, None));

        let outcome = bridge.request(correlation_id, "{}", Duration::from_secs(1)).await;

        assert!(matches!(
            outcome,
            RequestOutcome::Error(BridgeError::Validation { .. })
        ));
        assert!(bridge.publisher.published().is_empty());
        assert!(registry.is_empty());
    }

    #[rstest]
    #[case("abc")]
    #[case("3f2b9c1e-8d4a-4c55-9f0e-1a2b3c4d5e6f")]
    #[case("tenant:42.batch_7")]
    fn test_valid_ids(#[case] correlation_id: &str) {
        assert!(validate_correlation_id(correlation_id).is_ok());
    }

    #[test]
    fn test_overlong_id_is_rejected() {
        let id = "a".repeat(MAX_CORRELATION_ID_LENGTH + 1);
        assert!(validate_correlation_id(&id).is_err());
        assert!(validate_correlation_id(&id[1..]).is_ok());
    }

    #[tokio::test]
    async fn test_requests_are_refused_during_shutdown() {
        let registry = Arc::new(CorrelationRegistry::new());
        let bridge = bridge(&registry, AnsweringPublisher::new(&registry, None));
        bridge.shutdown.trigger_manual_shutdown();

        let outcome = bridge.request("abc", "{}", Duration::from_secs(1)).await;

        assert_eq!(outcome, RequestOutcome::Error(BridgeError::ShuttingDown));
        assert!(bridge.publisher.published().is_empty());
    }

    struct StalledPublisher;

    #[async_trait]
    impl RequestPublisher for StalledPublisher {
        async fn publish(&self, _correlation_id: &str, _body: &str) -> Result<(), QueueError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_publish_is_bounded_by_request_timeout() {
        let registry = Arc::new(CorrelationRegistry::<Value>::new());
        let bridge = bridge(&registry, StalledPublisher);

        let started = Instant::now();
        let outcome = bridge.request("stuck", "{}", Duration::from_secs(3)).await;

        assert_eq!(outcome, RequestOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(registry.is_empty());
        assert_eq!(bridge.shutdown.requests_pending_completion(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_leaves_long_running_request_alone() {
        let registry = Arc::new(CorrelationRegistry::new());
        let queue = InMemoryQueue::new();
        let bridge = Arc::new(bridge(
            &registry,
            QueuePublisher::new(queue.clone(), REQUESTS),
        ));
        let reaper = Reaper::new(
            Arc::clone(&registry),
            Duration::from_secs(60),
            Duration::from_secs(300),
            bridge.shutdown.clone(),
        );

        let first = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.request("abc", "{}", Duration::from_secs(600)).await }
        });
        while queue.is_empty(REQUESTS) {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(301)).await;

        assert_eq!(reaper.reap_once(), 0);
        let second = bridge.request("abc", "{}", Duration::from_secs(600)).await;
        assert_eq!(second, RequestOutcome::InProgress);

        assert_eq!(
            registry.resolve("abc", json!("done")),
            crate::registry::ResolveOutcome::Claimed
        );
        assert_eq!(first.await.unwrap(), RequestOutcome::Ok(json!("done")));

        let sends = queue
            .calls()
            .iter()
            .filter(|call| matches!(call, QueueCall::Send { .. }))
            .count();
        assert_eq!(sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_releases_registration() {
        let registry = Arc::new(CorrelationRegistry::new());
        let bridge = bridge(&registry, AnsweringPublisher::new(&registry, None));

        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            bridge.request("gone", "{}", Duration::from_secs(30)),
        )
        .await;

        assert!(cancelled.is_err());
        assert!(!registry.contains("gone"));
        assert_eq!(bridge.shutdown.requests_pending_completion(), 0);
    }
}
