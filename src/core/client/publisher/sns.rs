use std::sync::Arc;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sns::Client;

use super::error::PublisherError;
use super::EventPublisher;
use crate::types::jobs::event::JobLifecycleEvent;
use crate::types::params::PublisherArgs;

/// SNS-backed lifecycle event publisher.
///
/// Each event kind maps to its own topic, resolved from the configured
/// topic template (`on_job_finished`, `on_job_failed`, `on_job_cancelled`).
pub struct SnsEventPublisher {
    client: Arc<Client>,
    args: PublisherArgs,
}

impl SnsEventPublisher {
    pub fn new(aws_config: &SdkConfig, args: &PublisherArgs) -> Self {
        Self { client: Arc::new(Client::new(aws_config)), args: args.clone() }
    }

    pub fn client(&self) -> &Client {
        self.client.as_ref()
    }
}

#[async_trait]
impl EventPublisher for SnsEventPublisher {
    #[tracing::instrument(skip(self), fields(kind = %event.kind, job_id = %event.job_id), err)]
    async fn publish(&self, event: JobLifecycleEvent) -> Result<(), PublisherError> {
        let topic_arn = self.args.topic_for(event.kind);
        let message = serde_json::to_string(&event.payload)?;

        self.client()
            .publish()
            .topic_arn(topic_arn)
            .message(message)
            .message_group_id(event.job_id.to_string())
            .send()
            .await?;

        tracing::debug!(job_id = %event.job_id, "published lifecycle event");
        Ok(())
    }
}
