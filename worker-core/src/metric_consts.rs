pub const TASKS_PROCESSED: &str = "worker_tasks_processed";
pub const TASKS_REQUEUED: &str = "worker_tasks_requeued";
pub const TASKS_STASHED: &str = "worker_tasks_stashed";
pub const TASKS_PUBLISHED: &str = "worker_tasks_published";
