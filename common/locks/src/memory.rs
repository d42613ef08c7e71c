use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{LockError, LockStore};

/// In-process lock store with real TTL expiry, for tests and single-node
/// deployments.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.lock_entries();
        let now = Instant::now();
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str) -> Result<(), LockError> {
        self.lock_entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquisition_fails_until_unlock() {
        let locks = MemoryLockStore::new();
        let ttl = Duration::from_secs(10);

        assert!(locks.try_lock("group:user", ttl).await.unwrap());
        assert!(!locks.try_lock("group:user", ttl).await.unwrap());

        locks.unlock("group:user").await.unwrap();
        assert!(locks.try_lock("group:user", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_locks_can_be_retaken() {
        let locks = MemoryLockStore::new();

        assert!(locks.try_lock("k", Duration::ZERO).await.unwrap());
        assert!(locks.try_lock("k", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let locks = MemoryLockStore::new();
        let ttl = Duration::from_secs(10);

        assert!(locks.try_lock("a", ttl).await.unwrap());
        assert!(locks.try_lock("b", ttl).await.unwrap());
    }
}
