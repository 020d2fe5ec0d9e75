use super::{AckToken, BatchFailure, QueueClient, QueueError, QueueMessage};
use async_trait::async_trait;
use aws_sdk_sqs::{
    error::DisplayErrorContext,
    types::{
        BatchResultErrorEntry, ChangeMessageVisibilityBatchRequestEntry,
        DeleteMessageBatchRequestEntry, Message,
    },
    Client,
};
use catalog_bridge_common::helpers::sqs::{
    construct_message_attributes, string_message_attributes,
};
use std::collections::HashMap;

/// Maximum number of entries SQS accepts in one batch request.
const SQS_MAX_BATCH_ENTRIES: usize = 10;

const ALL_MESSAGE_ATTRIBUTES: &str = "All";

/// [`QueueClient`] backed by Amazon SQS.
#[derive(Debug, Clone)]
pub struct SqsQueueClient {
    client: Client,
}

impl SqsQueueClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn into_queue_message(message: Message) -> Option<QueueMessage> {
        let Some(receipt_handle) = message.receipt_handle else {
            tracing::warn!(
                message_id = ?message.message_id,
                "Received SQS message without receipt handle, it cannot be acknowledged"
            );
            return None;
        };

        Some(QueueMessage {
            attributes: string_message_attributes(message.message_attributes.as_ref()),
            id:         message.message_id.unwrap_or_default(),
            body:       message.body,
            ack_token:  AckToken(receipt_handle),
        })
    }

    /// Entries are identified by their position in the chunk, which is the
    /// only id guaranteed to be unique and valid within one batch request.
    fn collect_failures(chunk: &[AckToken], failed: &[BatchResultErrorEntry]) -> Vec<BatchFailure> {
        failed
            .iter()
            .filter_map(|failure| {
                let index = failure.id().parse::<usize>().ok()?;
                Some(BatchFailure {
                    token:   chunk.get(index)?.clone(),
                    code:    failure.code().to_owned(),
                    message: failure.message().map(str::to_owned),
                })
            })
            .collect()
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn send(
        &self,
        destination: &str,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError> {
        let message_attributes = construct_message_attributes(attributes)
            .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

        let output = self
            .client
            .send_message()
            .queue_url(destination)
            .message_body(body)
            .set_message_attributes(Some(message_attributes))
            .send()
            .await
            .map_err(|e| QueueError::Send {
                destination: destination.to_owned(),
                reason:      DisplayErrorContext(&e).to_string(),
            })?;

        Ok(output.message_id().unwrap_or_default().to_owned())
    }

    async fn receive(
        &self,
        destination: &str,
        max_messages: i32,
        wait_seconds: i32,
        visibility_timeout_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let rcv_message_output = self
            .client
            .receive_message()
            .queue_url(destination)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .visibility_timeout(visibility_timeout_seconds)
            .message_attribute_names(ALL_MESSAGE_ATTRIBUTES)
            .send()
            .await
            .map_err(|e| QueueError::Receive {
                destination: destination.to_owned(),
                reason:      DisplayErrorContext(&e).to_string(),
            })?;

        Ok(rcv_message_output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(Self::into_queue_message)
            .collect())
    }

    async fn delete_batch(
        &self,
        destination: &str,
        tokens: &[AckToken],
    ) -> Result<Vec<BatchFailure>, QueueError> {
        let mut failures = Vec::new();

        for chunk in tokens.chunks(SQS_MAX_BATCH_ENTRIES) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(index, token)| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(index.to_string())
                        .receipt_handle(&token.0)
                        .build()
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

            let output = self
                .client
                .delete_message_batch()
                .queue_url(destination)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| QueueError::Delete {
                    destination: destination.to_owned(),
                    reason:      DisplayErrorContext(&e).to_string(),
                })?;

            failures.extend(Self::collect_failures(chunk, output.failed()));
        }

        Ok(failures)
    }

    async fn release_batch(
        &self,
        destination: &str,
        tokens: &[AckToken],
        new_visibility_seconds: i32,
    ) -> Result<Vec<BatchFailure>, QueueError> {
        let mut failures = Vec::new();

        for chunk in tokens.chunks(SQS_MAX_BATCH_ENTRIES) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(index, token)| {
                    ChangeMessageVisibilityBatchRequestEntry::builder()
                        .id(index.to_string())
                        .receipt_handle(&token.0)
                        .visibility_timeout(new_visibility_seconds)
                        .build()
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

            let output = self
                .client
                .change_message_visibility_batch()
                .queue_url(destination)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| QueueError::ChangeVisibility {
                    destination: destination.to_owned(),
                    reason:      DisplayErrorContext(&e).to_string(),
                })?;

            failures.extend(Self::collect_failures(chunk, output.failed()));
        }

        Ok(failures)
    }
}
