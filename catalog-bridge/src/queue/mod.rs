//! Queue transport boundary.
//!
//! Everything that talks to the message queue goes through [`QueueClient`].
//! The poller owns the client it receives replies with; producers publish
//! through their own instance.

mod memory;
mod sqs;

pub use memory::{InMemoryQueue, QueueCall};
pub use sqs::SqsQueueClient;

use async_trait::async_trait;
use std::{collections::HashMap, fmt};
use thiserror::Error;

/// Opaque lease handle returned by `receive`, needed to acknowledge or
/// release the delivery. Changes on every redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(pub String);

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id:         String,
    pub body:       Option<String>,
    pub attributes: HashMap<String, String>,
    pub ack_token:  AckToken,
}

impl QueueMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A single entry of a batch call that the queue refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub token:   AckToken,
    pub code:    String,
    pub message: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Failed to send message to {destination}: {reason}")]
    Send { destination: String, reason: String },

    #[error("Failed to receive messages from {destination}: {reason}")]
    Receive { destination: String, reason: String },

    #[error("Failed to delete messages from {destination}: {reason}")]
    Delete { destination: String, reason: String },

    #[error("Failed to change message visibility on {destination}: {reason}")]
    ChangeVisibility { destination: String, reason: String },

    #[error("Invalid queue request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Publishes `body` with string `attributes`; returns the queue-assigned
    /// message id.
    async fn send(
        &self,
        destination: &str,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError>;

    /// Receives up to `max_messages`, waiting at most `wait_seconds` for the
    /// first one. Received messages stay invisible for
    /// `visibility_timeout_seconds` unless deleted or released. An empty
    /// vector is an idle poll, not an error.
    async fn receive(
        &self,
        destination: &str,
        max_messages: i32,
        wait_seconds: i32,
        visibility_timeout_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledges every token in one logical call. Per-entry refusals are
    /// returned, a transport failure is an error.
    async fn delete_batch(
        &self,
        destination: &str,
        tokens: &[AckToken],
    ) -> Result<Vec<BatchFailure>, QueueError>;

    /// Makes the deliveries visible again after `new_visibility_seconds`.
    async fn release_batch(
        &self,
        destination: &str,
        tokens: &[AckToken],
        new_visibility_seconds: i32,
    ) -> Result<Vec<BatchFailure>, QueueError>;
}
