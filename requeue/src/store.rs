//! The backing-store adapter.
//!
//! The broker talks to its shared key/value service exclusively through the
//! [`Store`] trait, which names the narrow set of primitives the brokerage
//! protocol needs: hash, list and sorted-set operations plus two fused
//! moves that an implementation must make atomic. Everything else about the
//! service (connection pooling, reconnects, clustering) is the adapter's
//! concern.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod testing;

pub use memory::MemoryStore;

/// Errors surfaced by a store implementation.
///
/// The broker never retries store calls; an [`StoreError::Unavailable`] is
/// propagated straight to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A call into the backing service failed.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// Internal adapter state is unusable (poisoned lock, wrong key kind).
    #[error("backing store in bad state")]
    BadState,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic primitives the broker requires of its backing store.
///
/// Scores are signed epoch milliseconds or negated priorities. The two
/// `*_to_hash` moves MUST be indivisible: the pop and the hash insert
/// happen as one step, or not at all. A store that cannot do this natively
/// has to synthesize it with a script or transaction primitive; a crash
/// between a non-atomic pop and insert would leak the popped member.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    /// Returns whether the field existed.
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;
    /// Increments a counter field, creating it at zero first. Returns the
    /// new value.
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;
    async fn hlen(&self, key: &str) -> StoreResult<u64>;

    /// Appends to the tail of a FIFO list. Returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;
    /// Pops from the head of a FIFO list.
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;
    async fn llen(&self, key: &str) -> StoreResult<u64>;

    /// Adds a member with the given score, or updates the score of an
    /// existing member.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;
    /// Pops the lowest-scored member; ties resolve in insertion order.
    async fn zpopmin(&self, key: &str) -> StoreResult<Option<(i64, String)>>;
    /// Members with `min <= score <= max`, in ascending score order.
    async fn zrangebyscore(&self, key: &str, min: i64, max: i64) -> StoreResult<Vec<String>>;
    /// Returns whether the member existed.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Atomically pops the head of `list` and records it in `hash` with
    /// value `stamp`. Returns the moved member.
    async fn lpop_to_hash(&self, list: &str, hash: &str, stamp: i64)
        -> StoreResult<Option<String>>;
    /// Atomically pops the lowest-scored member of `zset` and records it in
    /// `hash` with value `stamp`. Returns the moved member.
    async fn zpopmin_to_hash(
        &self,
        zset: &str,
        hash: &str,
        stamp: i64,
    ) -> StoreResult<Option<String>>;
}
