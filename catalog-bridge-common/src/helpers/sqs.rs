use crate::config::AwsConfig;
use aws_config::{timeout::TimeoutConfig, SdkConfig};
use aws_sdk_sqs::{
    config::{Builder, Region},
    types::MessageAttributeValue,
    Client as SQSClient,
};
use std::{collections::HashMap, time::Duration};

pub const CORRELATION_ID_MESSAGE_ATTRIBUTE_NAME: &str = "correlationId";
/// Set by the downstream worker when the request cannot be satisfied.
pub const ERROR_MESSAGE_ATTRIBUTE_NAME: &str = "errorMessage";

const DEFAULT_REGION: &str = "eu-north-1";

/// Loads the shared AWS SDK configuration, honouring the configured region
/// and endpoint override.
pub async fn load_sdk_config(aws: Option<&AwsConfig>) -> SdkConfig {
    let region = aws
        .and_then(|aws| aws.region.clone())
        .unwrap_or_else(|| DEFAULT_REGION.to_owned());

    let mut loader = aws_config::from_env().region(Region::new(region));
    if let Some(endpoint) = aws.and_then(|aws| aws.endpoint.as_deref()) {
        tracing::info!("Using custom SQS endpoint {}", endpoint);
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

pub fn create_sqs_client(shared_config: &SdkConfig, wait_time_seconds: usize) -> SQSClient {
    // Creates an SQS client with a client-side operation attempt timeout. Per default, there are two retry
    // attempts, meaning that every operation has three tries in total. This configuration prevents the sqs
    // client from `await`ing forever on broken streams. (see <https://github.com/awslabs/aws-sdk-rust/issues/1094>)
    SQSClient::from_conf(
        Builder::from(shared_config)
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_attempt_timeout(Duration::from_secs((wait_time_seconds + 2) as u64))
                    .build(),
            )
            .build(),
    )
}

pub fn construct_message_attributes(
    attributes: &HashMap<String, String>,
) -> eyre::Result<HashMap<String, MessageAttributeValue>> {
    let mut message_attributes = HashMap::with_capacity(attributes.len());

    for (name, value) in attributes {
        let attribute = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(value)
            .build()?;
        message_attributes.insert(name.clone(), attribute);
    }

    Ok(message_attributes)
}

/// Flattens the string-typed attributes of a received message. Binary and
/// number attributes are skipped.
pub fn string_message_attributes(
    attributes: Option<&HashMap<String, MessageAttributeValue>>,
) -> HashMap<String, String> {
    let Some(attributes) = attributes else {
        return HashMap::new();
    };

    attributes
        .iter()
        .filter_map(|(name, value)| {
            if value.data_type() != "String" {
                tracing::warn!("Skipped attribute {} of type {}", name, value.data_type());
                return None;
            }
            value
                .string_value()
                .map(|string_value| (name.clone(), string_value.to_owned()))
        })
        .collect()
}
