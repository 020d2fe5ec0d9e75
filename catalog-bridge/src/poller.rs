//! The single consumer of the reply queue.
//!
//! Each cycle receives one batch, routes every message through the
//! registry, then acknowledges the whole batch with at most one delete call
//! and one release call. Receive failures are retried with exponential
//! backoff; the loop only ends on shutdown, and never before the batch in
//! hand has been acknowledged.

use crate::{
    codec::MessageCodec,
    queue::{AckToken, QueueClient, QueueError, QueueMessage},
    registry::{CorrelationRegistry, ResolveOutcome},
};
use backon::{BackoffBuilder, ExponentialBuilder};
use catalog_bridge_common::{
    config::{Config, UnresolvedMessagePolicy},
    helpers::{
        shutdown_handler::ShutdownHandler,
        sqs::{CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME, ERROR_MESSAGE_ATTRIBUTE_NAME},
    },
};
use std::{fmt, sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Processing,
    Acknowledging,
    Backoff,
    Stopped,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub queue_url:                  String,
    pub batch_size:                 i32,
    pub long_poll_wait_seconds:     i32,
    pub visibility_timeout_seconds: i32,
    pub release_visibility_seconds: i32,
    pub unresolved_policy:          UnresolvedMessagePolicy,
    pub max_receive_attempts:       usize,
    pub backoff_base:               Duration,
    pub backoff_max:                Duration,
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_url:                  config.responses_queue_url.clone(),
            batch_size:                 config.poll_batch_size,
            long_poll_wait_seconds:     config.long_poll_wait_seconds,
            visibility_timeout_seconds: config.visibility_timeout_seconds,
            release_visibility_seconds: config.release_visibility_seconds,
            unresolved_policy:          config.unresolved_message_policy,
            max_receive_attempts:       config.max_receive_attempts,
            backoff_base:               config.receive_backoff_base(),
            backoff_max:                config.receive_backoff_max(),
        }
    }
}

/// Counters of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub received:         usize,
    pub claimed:          usize,
    pub orphaned:         usize,
    pub rejected:         usize,
    pub poison:           usize,
    pub untracked:        usize,
    pub deleted:          usize,
    pub released:         usize,
    pub delete_failures:  usize,
    pub release_failures: usize,
}

enum Disposition {
    Delete,
    Release,
}

pub struct Poller<Q, C: MessageCodec> {
    client:   Q,
    codec:    C,
    registry: Arc<CorrelationRegistry<C::Output>>,
    settings: PollerSettings,
    shutdown: ShutdownHandler,
    state:    PollerState,
}

impl<Q, C> Poller<Q, C>
where
    Q: QueueClient,
    C: MessageCodec,
{
    pub fn new(
        client: Q,
        codec: C,
        registry: Arc<CorrelationRegistry<C::Output>>,
        settings: PollerSettings,
        shutdown: ShutdownHandler,
    ) -> Self {
        Self {
            client,
            codec,
            registry,
            settings,
            shutdown,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    fn transition(&mut self, next: PollerState) {
        tracing::trace!(from = %self.state, to = %next, "Poller state change");
        self.state = next;
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::new()
            .with_min_delay(self.settings.backoff_base)
            .with_max_delay(self.settings.backoff_max)
            .with_factor(2.0)
            .with_jitter()
            .with_max_times(self.settings.max_receive_attempts)
    }

    /// Polls until shutdown. Receive failures never end the loop.
    pub async fn run(&mut self) -> eyre::Result<()> {
        tracing::info!(
            queue_url = %self.settings.queue_url,
            batch_size = self.settings.batch_size,
            policy = %self.settings.unresolved_policy,
            "Starting reply poller"
        );

        let mut backoff = self.backoff().build();
        let mut consecutive_failures = 0usize;

        while !self.shutdown.is_shutting_down() {
            match self.poll_once().await {
                Ok(Some(report)) => {
                    if consecutive_failures > 0 {
                        tracing::info!(
                            attempts = consecutive_failures,
                            "Receive recovered after failures"
                        );
                        consecutive_failures = 0;
                        backoff = self.backoff().build();
                    }
                    if report.received > 0 {
                        tracing::debug!(?report, "Poll cycle completed");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    consecutive_failures += 1;
                    self.transition(PollerState::Backoff);
                    let delay = match backoff.next() {
                        Some(delay) => delay,
                        None => {
                            tracing::error!(
                                attempts = consecutive_failures,
                                "Receive keeps failing after exhausting backoff attempts"
                            );
                            self.settings.backoff_max
                        }
                    };
                    tracing::warn!(
                        error = %err,
                        attempt = consecutive_failures,
                        ?delay,
                        "Failed to receive replies, backing off"
                    );
                    metrics::counter!("bridge.poller.receive_errors").increment(1);

                    let interrupted = tokio::select! {
                        _ = self.shutdown.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    self.transition(PollerState::Idle);
                    if interrupted {
                        break;
                    }
                }
            }
        }

        self.transition(PollerState::Stopped);
        tracing::info!("Stopping reply poller.");
        Ok(())
    }

    /// Runs one receive, route and acknowledge cycle.
    ///
    /// Returns `Ok(None)` when shutdown interrupted the receive. Once messages
    /// have been received the cycle always runs to the end.
    pub async fn poll_once(&mut self) -> Result<Option<CycleReport>, QueueError> {
        self.transition(PollerState::Polling);

        let received = {
            let shutdown = &self.shutdown;
            let receive = self.client.receive(
                &self.settings.queue_url,
                self.settings.batch_size,
                self.settings.long_poll_wait_seconds,
                self.settings.visibility_timeout_seconds,
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                received = receive => Some(received),
            }
        };

        let messages = match received {
            Some(Ok(messages)) => messages,
            Some(Err(err)) => return Err(err),
            None => {
                self.transition(PollerState::Idle);
                return Ok(None);
            }
        };

        let mut report = CycleReport {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            tracing::trace!("No replies received");
            self.transition(PollerState::Idle);
            return Ok(Some(report));
        }

        self.transition(PollerState::Processing);
        let mut to_delete = Vec::with_capacity(messages.len());
        let mut to_release = Vec::new();
        for message in messages {
            match self.route(&message, &mut report) {
                Disposition::Delete => to_delete.push(message.ack_token),
                Disposition::Release => to_release.push(message.ack_token),
            }
        }

        self.transition(PollerState::Acknowledging);
        self.acknowledge(&to_delete, &to_release, &mut report).await;
        self.transition(PollerState::Idle);

        record_metrics(&report);
        Ok(Some(report))
    }

    fn route(&self, message: &QueueMessage, report: &mut CycleReport) -> Disposition {
        let Some(correlation_id) = message
            .attribute(CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME)
            .filter(|id| !id.trim().is_empty())
        else {
            tracing::warn!(
                message_id = %message.id,
                "Reply without correlation id, dropping poison message"
            );
            report.poison += 1;
            return Disposition::Delete;
        };

        if let Some(error) = message.attribute(ERROR_MESSAGE_ATTRIBUTE_NAME) {
            tracing::info!(
                correlation_id,
                message_id = %message.id,
                error,
                "Downstream reported failure"
            );
            let outcome = match self.settings.unresolved_policy {
                UnresolvedMessagePolicy::Orphan => Some(self.registry.fail(correlation_id, error)),
                UnresolvedMessagePolicy::Release => {
                    self.registry.fail_tracked(correlation_id, error)
                }
            };
            return Self::dispose(outcome, correlation_id, message, report);
        }

        let Some(body) = message.body.as_deref().filter(|body| !body.trim().is_empty()) else {
            tracing::warn!(
                correlation_id,
                message_id = %message.id,
                "Reply without body, dropping poison message"
            );
            report.poison += 1;
            return Disposition::Delete;
        };

        let payload = match self.codec.decode(body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    correlation_id,
                    message_id = %message.id,
                    error = %err,
                    "Undecodable reply, dropping poison message"
                );
                report.poison += 1;
                return Disposition::Delete;
            }
        };

        let outcome = match self.settings.unresolved_policy {
            UnresolvedMessagePolicy::Orphan => Some(self.registry.resolve(correlation_id, payload)),
            UnresolvedMessagePolicy::Release => {
                self.registry.resolve_tracked(correlation_id, payload)
            }
        };
        Self::dispose(outcome, correlation_id, message, report)
    }

    fn dispose(
        outcome: Option<ResolveOutcome>,
        correlation_id: &str,
        message: &QueueMessage,
        report: &mut CycleReport,
    ) -> Disposition {
        match outcome {
            Some(ResolveOutcome::Claimed) => {
                tracing::debug!(correlation_id, message_id = %message.id, "Reply claimed");
                report.claimed += 1;
                Disposition::Delete
            }
            Some(ResolveOutcome::Orphaned) => {
                report.orphaned += 1;
                Disposition::Delete
            }
            Some(ResolveOutcome::Rejected) => {
                tracing::debug!(
                    correlation_id,
                    message_id = %message.id,
                    "Duplicate delivery dropped"
                );
                report.rejected += 1;
                Disposition::Delete
            }
            None => {
                tracing::debug!(
                    correlation_id,
                    message_id = %message.id,
                    "No waiter for reply, releasing"
                );
                report.untracked += 1;
                Disposition::Release
            }
        }
    }

    async fn acknowledge(
        &self,
        to_delete: &[AckToken],
        to_release: &[AckToken],
        report: &mut CycleReport,
    ) {
        let queue_url = &self.settings.queue_url;

        if !to_delete.is_empty() {
            match self.client.delete_batch(queue_url, to_delete).await {
                Ok(failures) => {
                    for failure in &failures {
                        tracing::warn!(
                            code = %failure.code,
                            message = ?failure.message,
                            "Failed to delete reply"
                        );
                    }
                    report.delete_failures = failures.len();
                    report.deleted = to_delete.len().saturating_sub(failures.len());
                }
                Err(err) => {
                    // The leases expire and the queue redelivers; duplicates
                    // are rejected by the registry.
                    tracing::error!(error = %err, count = to_delete.len(), "Batch delete failed");
                    report.delete_failures = to_delete.len();
                }
            }
        }

        if !to_release.is_empty() {
            match self
                .client
                .release_batch(
                    queue_url,
                    to_release,
                    self.settings.release_visibility_seconds,
                )
                .await
            {
                Ok(failures) => {
                    for failure in &failures {
                        tracing::warn!(
                            code = %failure.code,
                            message = ?failure.message,
                            "Failed to release reply"
                        );
                    }
                    report.release_failures = failures.len();
                    report.released = to_release.len().saturating_sub(failures.len());
                }
                Err(err) => {
                    tracing::error!(error = %err, count = to_release.len(), "Batch release failed");
                    report.release_failures = to_release.len();
                }
            }
        }
    }
}

fn record_metrics(report: &CycleReport) {
    metrics::counter!("bridge.poller.received").increment(report.received as u64);
    metrics::counter!("bridge.poller.claimed").increment(report.claimed as u64);
    metrics::counter!("bridge.poller.orphaned").increment(report.orphaned as u64);
    metrics::counter!("bridge.poller.rejected").increment(report.rejected as u64);
    metrics::counter!("bridge.poller.poison").increment(report.poison as u64);
    metrics::counter!("bridge.poller.released").increment(report.released as u64);
    metrics::counter!("bridge.poller.ack_failures")
        .increment((report.delete_failures + report.release_failures) as u64);
}
