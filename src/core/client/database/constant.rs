/// Name of the jobs collection. There is one collection per organizational
/// scope; `organization_id`/`workspace_id` are the routing keys within it.
pub const JOBS_COLLECTION: &str = "jobs";
