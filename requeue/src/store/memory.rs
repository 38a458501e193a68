//! Provides an in-memory implementation of [`Store`].
//!
//! It is a correct (but not optimized) implementation, used by the test
//! suites and suitable for single-process deployments where the queue does
//! not have to survive a restart.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use async_trait::async_trait;

use super::{Store, StoreError, StoreResult};

/// An in-memory implementation of [`Store`].
///
/// Missing keys behave as empty collections, and a key keeps the collection
/// kind of its first write; mixing kinds on one key is a
/// [`StoreError::BadState`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    keys: Arc<RwLock<HashMap<String, Entry>>>,
}

enum Entry {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    /// Kept sorted by score; members with equal scores stay in insertion
    /// order.
    Sorted(Vec<(i64, String)>),
}

impl Entry {
    fn as_hash(&self) -> StoreResult<&HashMap<String, String>> {
        match self {
            Self::Hash(h) => Ok(h),
            _ => Err(StoreError::BadState),
        }
    }

    fn as_hash_mut(&mut self) -> StoreResult<&mut HashMap<String, String>> {
        match self {
            Self::Hash(h) => Ok(h),
            _ => Err(StoreError::BadState),
        }
    }

    fn as_list(&self) -> StoreResult<&VecDeque<String>> {
        match self {
            Self::List(l) => Ok(l),
            _ => Err(StoreError::BadState),
        }
    }

    fn as_list_mut(&mut self) -> StoreResult<&mut VecDeque<String>> {
        match self {
            Self::List(l) => Ok(l),
            _ => Err(StoreError::BadState),
        }
    }

    fn as_sorted(&self) -> StoreResult<&Vec<(i64, String)>> {
        match self {
            Self::Sorted(s) => Ok(s),
            _ => Err(StoreError::BadState),
        }
    }

    fn as_sorted_mut(&mut self) -> StoreResult<&mut Vec<(i64, String)>> {
        match self {
            Self::Sorted(s) => Ok(s),
            _ => Err(StoreError::BadState),
        }
    }
}

impl MemoryStore {
    /// Creates a new empty instance of [`MemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.keys.write().map_err(|_| StoreError::BadState)
    }

    fn read<T>(
        &self,
        key: &str,
        on_missing: T,
        f: impl FnOnce(&Entry) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let keys = self.keys.read().map_err(|_| StoreError::BadState)?;
        match keys.get(key) {
            None => Ok(on_missing),
            Some(entry) => f(entry),
        }
    }
}

fn zinsert(sorted: &mut Vec<(i64, String)>, score: i64, member: &str) {
    if let Some(pos) = sorted.iter().position(|(_, m)| m == member) {
        sorted.remove(pos);
    }
    let at = sorted.partition_point(|(s, _)| *s <= score);
    sorted.insert(at, (score, member.to_owned()));
}

#[async_trait]
impl Store for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut keys = self.write()?;
        keys.entry(key.to_owned())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
            .as_hash_mut()?
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.read(key, None, |entry| {
            Ok(entry.as_hash()?.get(field).cloned())
        })
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.read(key, HashMap::new(), |entry| Ok(entry.as_hash()?.clone()))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut keys = self.write()?;
        match keys.get_mut(key) {
            None => Ok(false),
            Some(entry) => Ok(entry.as_hash_mut()?.remove(field).is_some()),
        }
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut keys = self.write()?;
        let hash = keys
            .entry(key.to_owned())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
            .as_hash_mut()?;
        let current = match hash.get(field) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::BadState)?,
        };
        let next = current + delta;
        hash.insert(field.to_owned(), next.to_string());
        Ok(next)
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        self.read(key, 0, |entry| Ok(entry.as_hash()?.len() as u64))
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut keys = self.write()?;
        let list = keys
            .entry(key.to_owned())
            .or_insert_with(|| Entry::List(VecDeque::new()))
            .as_list_mut()?;
        list.push_back(value.to_owned());
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut keys = self.write()?;
        match keys.get_mut(key) {
            None => Ok(None),
            Some(entry) => Ok(entry.as_list_mut()?.pop_front()),
        }
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.read(key, 0, |entry| Ok(entry.as_list()?.len() as u64))
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut keys = self.write()?;
        let sorted = keys
            .entry(key.to_owned())
            .or_insert_with(|| Entry::Sorted(Vec::new()))
            .as_sorted_mut()?;
        zinsert(sorted, score, member);
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> StoreResult<Option<(i64, String)>> {
        let mut keys = self.write()?;
        match keys.get_mut(key) {
            None => Ok(None),
            Some(entry) => {
                let sorted = entry.as_sorted_mut()?;
                if sorted.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(sorted.remove(0)))
                }
            }
        }
    }

    async fn zrangebyscore(&self, key: &str, min: i64, max: i64) -> StoreResult<Vec<String>> {
        self.read(key, Vec::new(), |entry| {
            Ok(entry
                .as_sorted()?
                .iter()
                .filter(|(score, _)| (min..=max).contains(score))
                .map(|(_, member)| member.clone())
                .collect())
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut keys = self.write()?;
        match keys.get_mut(key) {
            None => Ok(false),
            Some(entry) => {
                let sorted = entry.as_sorted_mut()?;
                match sorted.iter().position(|(_, m)| m == member) {
                    None => Ok(false),
                    Some(pos) => {
                        sorted.remove(pos);
                        Ok(true)
                    }
                }
            }
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.read(key, 0, |entry| Ok(entry.as_sorted()?.len() as u64))
    }

    async fn lpop_to_hash(
        &self,
        list: &str,
        hash: &str,
        stamp: i64,
    ) -> StoreResult<Option<String>> {
        let mut keys = self.write()?;
        let popped = match keys.get_mut(list) {
            None => None,
            Some(entry) => entry.as_list_mut()?.pop_front(),
        };
        if let Some(member) = &popped {
            keys.entry(hash.to_owned())
                .or_insert_with(|| Entry::Hash(HashMap::new()))
                .as_hash_mut()?
                .insert(member.clone(), stamp.to_string());
        }
        Ok(popped)
    }

    async fn zpopmin_to_hash(
        &self,
        zset: &str,
        hash: &str,
        stamp: i64,
    ) -> StoreResult<Option<String>> {
        let mut keys = self.write()?;
        let popped = match keys.get_mut(zset) {
            None => None,
            Some(entry) => {
                let sorted = entry.as_sorted_mut()?;
                if sorted.is_empty() {
                    None
                } else {
                    Some(sorted.remove(0).1)
                }
            }
        };
        if let Some(member) = &popped {
            keys.entry(hash.to_owned())
                .or_insert_with(|| Entry::Hash(HashMap::new()))
                .as_hash_mut()?
                .insert(member.clone(), stamp.to_string());
        }
        Ok(popped)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    crate::test_suite!(for: MemoryStore::new());

    #[tokio::test]
    async fn mixing_collection_kinds_is_bad_state() {
        let store = MemoryStore::new();
        store.rpush("k", "v").await.unwrap();
        assert_matches!(
            store.hset("k", "f", "v").await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.zcard("k").await, Err(StoreError::BadState));
    }

    #[tokio::test]
    async fn poisoned_lock_is_bad_state() {
        let store = MemoryStore::new();
        tokio::task::spawn_blocking({
            let store = store.clone();
            move || {
                let _guard = store.keys.write().unwrap();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(store.rpush("k", "v").await, Err(StoreError::BadState));
        assert_matches!(store.hget("k", "f").await, Err(StoreError::BadState));
    }
}
