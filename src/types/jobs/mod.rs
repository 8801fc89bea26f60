pub mod event;
pub mod job_item;
pub mod step_updates;
pub mod types;
