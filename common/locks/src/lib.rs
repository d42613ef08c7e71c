mod memory;
mod redis_lock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryLockStore;
pub use redis_lock::RedisLockStore;

#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(Arc<redis::RedisError>),
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(Arc::new(e))
    }
}

/// Short-lived advisory locks with a TTL, used to serialize small critical
/// sections across worker instances. Locks are never blocking: callers that
/// lose the race skip the guarded work instead of waiting.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempt to take the lock. Returns false when another holder already
    /// has it. The lock expires on its own after `ttl`.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release the lock early. Releasing an expired or never-held lock is
    /// not an error.
    async fn unlock(&self, key: &str) -> Result<(), LockError>;
}
