use aws_sdk_sns::operation::publish::PublishError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Failed to publish event: {0}")]
    PublishError(#[from] aws_sdk_sns::error::SdkError<PublishError>),

    #[error("Failed to serialize event payload: {0}")]
    PayloadSerializationError(#[from] serde_json::Error),
}
