//! Redis implementation of the requeue backing store.
//!
//! The queue collections map directly onto Redis types: hashes for the job
//! table, the processing leases and the stats counters, a list for the
//! pending queue, and sorted sets for the priority and delayed queues. The
//! two fused dequeue moves the broker requires are small Lua scripts, so
//! the pop and the lease insert commit as one step on the server.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use requeue::store::{Store, StoreError, StoreResult};

const LPOP_TO_HASH: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
    return false
end
redis.call('HSET', KEYS[2], id, ARGV[1])
return id
"#;

const ZPOPMIN_TO_HASH: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
redis.call('HSET', KEYS[2], popped[1], ARGV[1])
return popped[1]
"#;

fn map_err(error: RedisError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

/// A [`Store`] over a managed Redis connection.
///
/// Cheap to clone; clones share the underlying multiplexed connection,
/// which reconnects by itself after network errors.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    lpop_to_hash: Script,
    zpopmin_to_hash: Script,
}

impl RedisStore {
    pub async fn from_url(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            lpop_to_hash: Script::new(LPOP_TO_HASH),
            zpopmin_to_hash: Script::new(ZPOPMIN_TO_HASH),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let _: i64 = self
            .conn
            .clone()
            .hset(key, field, value)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.conn.clone().hget(key, field).await.map_err(map_err)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.conn.clone().hgetall(key).await.map_err(map_err)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .conn
            .clone()
            .hdel(key, field)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.conn
            .clone()
            .hincr(key, field, delta)
            .await
            .map_err(map_err)
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        self.conn.clone().hlen(key).await.map_err(map_err)
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.conn.clone().rpush(key, value).await.map_err(map_err)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.conn.clone().lpop(key, None).await.map_err(map_err)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.conn.clone().llen(key).await.map_err(map_err)
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let _: i64 = self
            .conn
            .clone()
            .zadd(key, member, score)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> StoreResult<Option<(i64, String)>> {
        let popped: Vec<(String, f64)> = self
            .conn
            .clone()
            .zpopmin(key, 1)
            .await
            .map_err(map_err)?;
        Ok(popped
            .into_iter()
            .next()
            .map(|(member, score)| (score as i64, member)))
    }

    async fn zrangebyscore(&self, key: &str, min: i64, max: i64) -> StoreResult<Vec<String>> {
        self.conn
            .clone()
            .zrangebyscore(key, min, max)
            .await
            .map_err(map_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = self
            .conn
            .clone()
            .zrem(key, member)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.conn.clone().zcard(key).await.map_err(map_err)
    }

    async fn lpop_to_hash(
        &self,
        list: &str,
        hash: &str,
        stamp: i64,
    ) -> StoreResult<Option<String>> {
        let popped: Option<String> = self
            .lpop_to_hash
            .key(list)
            .key(hash)
            .arg(stamp)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(popped)
    }

    async fn zpopmin_to_hash(
        &self,
        zset: &str,
        hash: &str,
        stamp: i64,
    ) -> StoreResult<Option<String>> {
        let popped: Option<String> = self
            .zpopmin_to_hash
            .key(zset)
            .key(hash)
            .arg(stamp)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(popped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_URL: &str = "redis://127.0.0.1";

    requeue::test_suite!(
        ignored: "requires a running Redis",
        for: RedisStore::from_url(DEFAULT_URL).await.unwrap()
    );
}
