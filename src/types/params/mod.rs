use crate::types::jobs::event::JobEventKind;

/// Validated job-store connection parameters
#[derive(Debug, Clone)]
pub struct DatabaseArgs {
    pub connection_uri: String,
    pub database_name: String,
}

/// Validated event-publisher parameters.
///
/// `topic_template` contains a `{}` placeholder replaced by the event's
/// topic name, ex: `arn:aws:sns:us-east-1:000000000000:{}`.
#[derive(Debug, Clone)]
pub struct PublisherArgs {
    pub topic_template: String,
}

impl PublisherArgs {
    /// Resolve the topic for an event kind from the template
    pub fn topic_for(&self, kind: JobEventKind) -> String {
        self.topic_template.replace("{}", kind.topic_name())
    }
}
