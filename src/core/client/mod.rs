pub mod database;
pub mod publisher;
