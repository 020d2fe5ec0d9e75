#![allow(dead_code)]

use catalog_bridge::queue::{InMemoryQueue, QueueClient};
use catalog_bridge_common::helpers::sqs::CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME;
use std::collections::HashMap;
use tokio::task::JoinHandle;

pub const REQUESTS: &str = "http://localhost:9324/000000000000/product-find-request";
pub const REPLIES: &str = "http://localhost:9324/000000000000/product-find-reply";

/// Plays the catalog service: consumes requests and answers on the reply
/// queue with the same correlation id. `respond` maps a correlation id and
/// request body to the reply body, or `None` to leave the request unanswered.
pub fn spawn_catalog<F>(queue: InMemoryQueue, respond: F) -> JoinHandle<()>
where
    F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let Ok(requests) = queue.receive(REQUESTS, 10, 1, 30).await else {
                continue;
            };
            let mut handled = Vec::with_capacity(requests.len());
            for request in requests {
                let Some(correlation_id) = request.attribute(CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME)
                else {
                    continue;
                };
                let body = request.body.as_deref().unwrap_or_default();
                if let Some(reply) = respond(correlation_id, body) {
                    let attributes = HashMap::from([(
                        CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME.to_string(),
                        correlation_id.to_string(),
                    )]);
                    queue
                        .send(REPLIES, &reply, &attributes)
                        .await
                        .expect("in-memory send");
                }
                handled.push(request.ack_token);
            }
            if !handled.is_empty() {
                queue
                    .delete_batch(REQUESTS, &handled)
                    .await
                    .expect("in-memory delete");
            }
        }
    })
}

pub fn reply_to(queue: &InMemoryQueue, correlation_id: &str, body: &str) {
    queue.push(
        REPLIES,
        Some(body),
        HashMap::from([(
            CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME.to_string(),
            correlation_id.to_string(),
        )]),
    );
}
