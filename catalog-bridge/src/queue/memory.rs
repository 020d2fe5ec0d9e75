use super::{AckToken, BatchFailure, QueueClient, QueueError, QueueMessage};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use uuid::Uuid;

/// A call observed by [`InMemoryQueue`], with the number of entries involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCall {
    Send { destination: String },
    Receive { destination: String, returned: usize },
    DeleteBatch { destination: String, tokens: usize },
    ReleaseBatch { destination: String, tokens: usize },
}

#[derive(Debug)]
struct StoredMessage {
    id:         String,
    body:       Option<String>,
    attributes: HashMap<String, String>,
    visible_at: Instant,
    receipt:    Option<AckToken>,
}

#[derive(Debug, Default)]
struct QueueState {
    queues:           HashMap<String, VecDeque<StoredMessage>>,
    calls:            Vec<QueueCall>,
    failing_receives: usize,
    failing_sends:    usize,
}

/// Process-local queue with SQS-like semantics: leases with a visibility
/// timeout, a fresh receipt on every delivery and long polling.
///
/// Test support for the poller, bridge and service tests; the service binary
/// always talks to SQS. Every call is recorded and the log is never trimmed,
/// so instances are meant to be short-lived.
///
/// Clones share the same queues, so one clone can be handed to a poller while
/// another one is used to publish and inspect.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    state:   Arc<Mutex<QueueState>>,
    arrived: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the state half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues a raw message, bypassing `send` bookkeeping. Useful to inject
    /// replies with arbitrary bodies or missing attributes.
    pub fn push(
        &self,
        destination: &str,
        body: Option<&str>,
        attributes: HashMap<String, String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.lock()
            .queues
            .entry(destination.to_owned())
            .or_default()
            .push_back(StoredMessage {
                id: id.clone(),
                body: body.map(str::to_owned),
                attributes,
                visible_at: Instant::now(),
                receipt: None,
            });
        self.arrived.notify_waiters();
        id
    }

    /// Makes the next `n` receive calls fail with a transport error.
    pub fn fail_next_receives(&self, n: usize) {
        self.lock().failing_receives = n;
    }

    /// Makes the next `n` send calls fail with a transport error.
    pub fn fail_next_sends(&self, n: usize) {
        self.lock().failing_sends = n;
    }

    /// Messages still stored, visible or leased.
    pub fn len(&self, destination: &str) -> usize {
        self.lock()
            .queues
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, destination: &str) -> bool {
        self.len(destination) == 0
    }

    /// Messages that a receive issued right now would return.
    pub fn visible_len(&self, destination: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(destination)
            .map_or(0, |queue| queue.iter().filter(|m| m.visible_at <= now).count())
    }

    pub fn calls(&self) -> Vec<QueueCall> {
        self.lock().calls.clone()
    }

    fn take_visible(
        &self,
        destination: &str,
        max_messages: usize,
        visibility: Duration,
    ) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(destination) else {
            return Vec::new();
        };

        queue
            .iter_mut()
            .filter(|message| message.visible_at <= now)
            .take(max_messages)
            .map(|message| {
                let token = AckToken(Uuid::new_v4().to_string());
                message.visible_at = now + visibility;
                message.receipt = Some(token.clone());
                QueueMessage {
                    id:         message.id.clone(),
                    body:       message.body.clone(),
                    attributes: message.attributes.clone(),
                    ack_token:  token,
                }
            })
            .collect()
    }

    fn record(&self, call: QueueCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn send(
        &self,
        destination: &str,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError> {
        {
            let mut state = self.lock();
            state.calls.push(QueueCall::Send {
                destination: destination.to_owned(),
            });
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(QueueError::Send {
                    destination: destination.to_owned(),
                    reason:      "injected send failure".into(),
                });
            }
        }
        Ok(self.push(destination, Some(body), attributes.clone()))
    }

    async fn receive(
        &self,
        destination: &str,
        max_messages: i32,
        wait_seconds: i32,
        visibility_timeout_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        {
            let mut state = self.lock();
            if state.failing_receives > 0 {
                state.failing_receives -= 1;
                state.calls.push(QueueCall::Receive {
                    destination: destination.to_owned(),
                    returned:    0,
                });
                return Err(QueueError::Receive {
                    destination: destination.to_owned(),
                    reason:      "injected receive failure".into(),
                });
            }
        }

        let max_messages = usize::try_from(max_messages)
            .map_err(|_| QueueError::InvalidRequest(format!("max_messages {max_messages}")))?;
        let visibility = Duration::from_secs(u64::try_from(visibility_timeout_seconds).map_err(
            |_| QueueError::InvalidRequest(format!("visibility {visibility_timeout_seconds}")),
        )?);
        let deadline =
            Instant::now() + Duration::from_secs(u64::try_from(wait_seconds).unwrap_or_default());

        let messages = loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let messages = self.take_visible(destination, max_messages, visibility);
            if !messages.is_empty() || Instant::now() >= deadline {
                break messages;
            }

            // Leased messages become visible again without any notification,
            // so wake up at least once per second to re-check.
            let recheck = (Instant::now() + Duration::from_secs(1)).min(deadline);
            let _ = tokio::time::timeout_at(recheck, arrived).await;
        };

        self.record(QueueCall::Receive {
            destination: destination.to_owned(),
            returned:    messages.len(),
        });
        Ok(messages)
    }

    async fn delete_batch(
        &self,
        destination: &str,
        tokens: &[AckToken],
    ) -> Result<Vec<BatchFailure>, QueueError> {
        let mut state = self.lock();
        state.calls.push(QueueCall::DeleteBatch {
            destination: destination.to_owned(),
            tokens:      tokens.len(),
        });

        let queue = state.queues.entry(destination.to_owned()).or_default();
        let mut failures = Vec::new();
        for token in tokens {
            match queue
                .iter()
                .position(|message| message.receipt.as_ref() == Some(token))
            {
                Some(position) => {
                    queue.remove(position);
                }
                None => failures.push(BatchFailure {
                    token:   token.clone(),
                    code:    "ReceiptHandleIsInvalid".into(),
                    message: Some("unknown or superseded receipt".into()),
                }),
            }
        }
        Ok(failures)
    }

    async fn release_batch(
        &self,
        destination: &str,
        tokens: &[AckToken],
        new_visibility_seconds: i32,
    ) -> Result<Vec<BatchFailure>, QueueError> {
        let visible_at = Instant::now()
            + Duration::from_secs(u64::try_from(new_visibility_seconds).unwrap_or_default());
        let mut failures = Vec::new();
        {
            let mut state = self.lock();
            state.calls.push(QueueCall::ReleaseBatch {
                destination: destination.to_owned(),
                tokens:      tokens.len(),
            });

            let queue = state.queues.entry(destination.to_owned()).or_default();
            for token in tokens {
                match queue
                    .iter_mut()
                    .find(|message| message.receipt.as_ref() == Some(token))
                {
                    Some(message) => message.visible_at = visible_at,
                    None => failures.push(BatchFailure {
                        token:   token.clone(),
                        code:    "ReceiptHandleIsInvalid".into(),
                        message: Some("unknown or superseded receipt".into()),
                    }),
                }
            }
        }
        self.arrived.notify_waiters();
        Ok(failures)
    }
}
