use serde::de::DeserializeOwned;
use std::{fmt, marker::PhantomData};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message body is empty")]
    EmptyBody,

    #[error("Failed to parse message body JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),
}

/// Turns a raw reply body into the payload handed to waiters. Stateless.
pub trait MessageCodec: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    fn decode(&self, body: &str) -> Result<Self::Output, CodecError>;
}

/// Decodes JSON bodies into any deserializable payload.
pub struct JsonCodec<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Output = T;

    fn decode(&self, body: &str) -> Result<T, CodecError> {
        if body.trim().is_empty() {
            return Err(CodecError::EmptyBody);
        }
        Ok(serde_json::from_str(body)?)
    }
}
