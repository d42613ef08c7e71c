use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};

use crate::{LockError, LockStore};

/// Redis-backed lock store. Acquisition is a single SET with NX and EX, so
/// the lock and its expiry are applied atomically and a crashed holder can
/// never wedge the key.
pub struct RedisLockStore {
    connection: MultiplexedConnection,
}

impl RedisLockStore {
    pub async fn new(addr: String) -> Result<RedisLockStore, LockError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(RedisLockStore { connection })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection.clone();
        let seconds = ttl.as_secs().max(1);

        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(key)
            .arg("locked")
            .arg("EX")
            .arg(seconds)
            .arg("NX")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => Ok(true), // Key was set, lock acquired
            Ok(None) => Ok(false),   // Key already existed
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, key: &str) -> Result<(), LockError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
