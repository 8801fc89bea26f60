//! Job lifecycle state machine for a multi-tenant compute platform.
//!
//! Background jobs (training runs, import/export operations) move through a
//! two-phase execute/revert lifecycle persisted in a document store. This
//! crate is the only writer of job state: scheduler replicas claim work
//! through atomic conditional updates, sweepers recover jobs stuck past a
//! time threshold, and terminal transitions publish lifecycle events to
//! downstream consumers.

pub mod core;
pub mod error;
pub mod lifecycle;
pub mod types;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use error::{JobError, JobResult};
pub use lifecycle::JobStateMachine;
