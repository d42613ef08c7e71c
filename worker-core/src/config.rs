use envconfig::Envconfig;

/// Bootstrap configuration shared by every worker process.
#[derive(Envconfig, Clone, Debug)]
pub struct WorkerConfig {
    #[envconfig(from = "BROKER_URL", default = "amqp://localhost:5672")]
    pub broker_url: String,

    /// How many tasks one worker instance handles concurrently. Doubles as
    /// the broker prefetch limit, which is the only backpressure mechanism.
    #[envconfig(from = "SIMULTANEOUS_TASKS", default = "1")]
    pub simultaneous_tasks: usize,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl WorkerConfig {
    /// Defaults without touching the process environment; used by tests.
    pub fn for_tests(simultaneous_tasks: usize) -> Self {
        Self {
            broker_url: "memory://".to_string(),
            simultaneous_tasks,
            log_level: "debug".to_string(),
        }
    }
}
