use envconfig::Envconfig;
use worker_core::WorkerConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct GrouperConfig {
    /// Key for the group hash HMAC. Must be identical across all replicas,
    /// or the same error will group differently per instance.
    #[envconfig(from = "EVENT_SECRET")]
    pub event_secret: String,

    /// How long visited-user lock records live. The TTL only protects
    /// against crashed holders; correctness comes from the re-check after
    /// acquisition.
    #[envconfig(from = "LOCK_TTL_SECONDS", default = "10")]
    pub lock_ttl_seconds: u64,

    #[envconfig(from = "NOTIFIER_ENABLED", default = "true")]
    pub notifier_enabled: bool,

    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(nested = true)]
    pub worker: WorkerConfig,
}

impl GrouperConfig {
    /// Defaults without touching the process environment; used by tests.
    pub fn for_tests() -> Self {
        Self {
            event_secret: "such-secret-much-wow".to_string(),
            lock_ttl_seconds: 10,
            notifier_enabled: true,
            redis_url: "redis://localhost:6379/".to_string(),
            worker: WorkerConfig::for_tests(4),
        }
    }
}
