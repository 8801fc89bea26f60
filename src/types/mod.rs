pub mod jobs;
pub mod params;
