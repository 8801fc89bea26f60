pub mod error;
pub mod sns;

use async_trait::async_trait;

pub use error::PublisherError;

use crate::types::jobs::event::JobLifecycleEvent;

/// Outbound notification contract for terminal job transitions.
///
/// Publishing happens after the state transition is committed, so consumers
/// may observe a terminal job in the store before its event arrives. Events
/// are at-least-once; a publish failure after commit surfaces to the caller
/// for retry and may produce duplicates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: JobLifecycleEvent) -> Result<(), PublisherError>;
}
