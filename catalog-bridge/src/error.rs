use crate::queue::QueueError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Invalid correlation id {correlation_id:?}: {reason}")]
    Validation {
        correlation_id: String,
        reason:         &'static str,
    },

    #[error("Request {0} is already in progress")]
    Conflict(String),

    #[error(transparent)]
    Transport(#[from] QueueError),

    #[error("No reply received within {0:?}")]
    Timeout(Duration),

    #[error("Request failed: {0}")]
    Failed(String),

    #[error("Service is shutting down")]
    ShuttingDown,
}
