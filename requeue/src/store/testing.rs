//! Test suite for ensuring a correct implementation of a [`Store`].
//!
//! Store implementors should include this as part of their test suites via
//! the [`test_suite!`](crate::test_suite) macro:
//!
//! ```
//! use requeue::store::MemoryStore;
//! requeue::test_suite!(for: MemoryStore::new());
//! ```
//!
//! For stores backed by a shared service, tests can be generated with an
//! ignore reason so they only run when the service is up:
//!
//! ```ignore
//! requeue::test_suite!(
//!     ignored: "requires a running Redis",
//!     for: RedisStore::from_url(DEFAULT_URL).await.unwrap()
//! );
//! ```

use rand::Rng;

use super::Store;

/// A key unlikely to collide with other suite runs against a shared store.
pub fn unique_key(tag: &str) -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("requeue:suite:{tag}:{suffix:x}")
}

pub async fn list_pops_in_fifo_order(store: impl Store) {
    let key = unique_key("fifo");
    assert_eq!(store.llen(&key).await.unwrap(), 0);
    store.rpush(&key, "a").await.unwrap();
    store.rpush(&key, "b").await.unwrap();
    assert_eq!(store.rpush(&key, "c").await.unwrap(), 3);
    assert_eq!(store.llen(&key).await.unwrap(), 3);
    assert_eq!(store.lpop(&key).await.unwrap().as_deref(), Some("a"));
    assert_eq!(store.lpop(&key).await.unwrap().as_deref(), Some("b"));
    assert_eq!(store.lpop(&key).await.unwrap().as_deref(), Some("c"));
    assert_eq!(store.lpop(&key).await.unwrap(), None);
}

pub async fn hash_fields_are_independent(store: impl Store) {
    let key = unique_key("hash");
    assert_eq!(store.hget(&key, "a").await.unwrap(), None);
    store.hset(&key, "a", "1").await.unwrap();
    store.hset(&key, "b", "2").await.unwrap();
    assert_eq!(store.hget(&key, "a").await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.hlen(&key).await.unwrap(), 2);

    let all = store.hgetall(&key).await.unwrap();
    assert_eq!(all.get("a").map(String::as_str), Some("1"));
    assert_eq!(all.get("b").map(String::as_str), Some("2"));

    assert!(store.hdel(&key, "a").await.unwrap());
    assert!(!store.hdel(&key, "a").await.unwrap());
    assert_eq!(store.hget(&key, "a").await.unwrap(), None);
    assert_eq!(store.hlen(&key).await.unwrap(), 1);
}

pub async fn hash_set_overwrites(store: impl Store) {
    let key = unique_key("overwrite");
    store.hset(&key, "f", "old").await.unwrap();
    store.hset(&key, "f", "new").await.unwrap();
    assert_eq!(store.hget(&key, "f").await.unwrap().as_deref(), Some("new"));
    assert_eq!(store.hlen(&key).await.unwrap(), 1);
}

pub async fn counters_start_at_zero(store: impl Store) {
    let key = unique_key("counters");
    assert_eq!(store.hincrby(&key, "n", 3).await.unwrap(), 3);
    assert_eq!(store.hincrby(&key, "n", -1).await.unwrap(), 2);
    assert_eq!(store.hget(&key, "n").await.unwrap().as_deref(), Some("2"));
}

pub async fn sorted_set_pops_lowest_score_first(store: impl Store) {
    let key = unique_key("zpop");
    store.zadd(&key, 5, "mid").await.unwrap();
    store.zadd(&key, 1, "low").await.unwrap();
    store.zadd(&key, 9, "high").await.unwrap();
    assert_eq!(store.zcard(&key).await.unwrap(), 3);
    assert_eq!(
        store.zpopmin(&key).await.unwrap(),
        Some((1, "low".to_owned()))
    );
    assert_eq!(
        store.zpopmin(&key).await.unwrap(),
        Some((5, "mid".to_owned()))
    );
    assert_eq!(
        store.zpopmin(&key).await.unwrap(),
        Some((9, "high".to_owned()))
    );
    assert_eq!(store.zpopmin(&key).await.unwrap(), None);
}

pub async fn sorted_set_updates_existing_member(store: impl Store) {
    let key = unique_key("zupdate");
    store.zadd(&key, 1, "m").await.unwrap();
    store.zadd(&key, 9, "m").await.unwrap();
    assert_eq!(store.zcard(&key).await.unwrap(), 1);
    assert_eq!(store.zpopmin(&key).await.unwrap(), Some((9, "m".to_owned())));
}

pub async fn sorted_set_range_and_remove(store: impl Store) {
    let key = unique_key("zrange");
    store.zadd(&key, 10, "first").await.unwrap();
    store.zadd(&key, 20, "second").await.unwrap();
    store.zadd(&key, 30, "third").await.unwrap();
    assert_eq!(
        store.zrangebyscore(&key, i64::MIN, 20).await.unwrap(),
        vec!["first".to_owned(), "second".to_owned()]
    );
    assert_eq!(
        store.zrangebyscore(&key, 15, 25).await.unwrap(),
        vec!["second".to_owned()]
    );

    assert!(store.zrem(&key, "second").await.unwrap());
    assert!(!store.zrem(&key, "second").await.unwrap());
    assert_eq!(store.zcard(&key).await.unwrap(), 2);
}

pub async fn lpop_to_hash_moves_in_one_step(store: impl Store) {
    let list = unique_key("movelist");
    let hash = unique_key("movelist-hash");
    assert_eq!(store.lpop_to_hash(&list, &hash, 7).await.unwrap(), None);
    assert_eq!(store.hlen(&hash).await.unwrap(), 0);

    store.rpush(&list, "job-1").await.unwrap();
    assert_eq!(
        store.lpop_to_hash(&list, &hash, 7).await.unwrap().as_deref(),
        Some("job-1")
    );
    assert_eq!(store.llen(&list).await.unwrap(), 0);
    assert_eq!(
        store.hget(&hash, "job-1").await.unwrap().as_deref(),
        Some("7")
    );
}

pub async fn zpopmin_to_hash_moves_in_one_step(store: impl Store) {
    let zset = unique_key("movezset");
    let hash = unique_key("movezset-hash");
    assert_eq!(store.zpopmin_to_hash(&zset, &hash, 9).await.unwrap(), None);

    store.zadd(&zset, 5, "job-b").await.unwrap();
    store.zadd(&zset, 1, "job-a").await.unwrap();
    assert_eq!(
        store
            .zpopmin_to_hash(&zset, &hash, 9)
            .await
            .unwrap()
            .as_deref(),
        Some("job-a")
    );
    assert_eq!(store.zcard(&zset).await.unwrap(), 1);
    assert_eq!(
        store.hget(&hash, "job-a").await.unwrap().as_deref(),
        Some("9")
    );
}

/// Create the store conformance test suite.
///
/// See the [module documentation](self) for usage.
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(@generate [] $store);
    };
    (ignored: $reason:literal, for: $store:expr) => {
        $crate::test_suite!(@generate [#[ignore = $reason]] $store);
    };
    (@generate [$($extra:tt)*] $store:expr) => {
        #[tokio::test]
        $($extra)*
        async fn list_pops_in_fifo_order() {
            $crate::store::testing::list_pops_in_fifo_order($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn hash_fields_are_independent() {
            $crate::store::testing::hash_fields_are_independent($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn hash_set_overwrites() {
            $crate::store::testing::hash_set_overwrites($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn counters_start_at_zero() {
            $crate::store::testing::counters_start_at_zero($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn sorted_set_pops_lowest_score_first() {
            $crate::store::testing::sorted_set_pops_lowest_score_first($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn sorted_set_updates_existing_member() {
            $crate::store::testing::sorted_set_updates_existing_member($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn sorted_set_range_and_remove() {
            $crate::store::testing::sorted_set_range_and_remove($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn lpop_to_hash_moves_in_one_step() {
            $crate::store::testing::lpop_to_hash_moves_in_one_step($store).await;
        }
        #[tokio::test]
        $($extra)*
        async fn zpopmin_to_hash_moves_in_one_step() {
            $crate::store::testing::zpopmin_to_hash_moves_in_one_step($store).await;
        }
    };
}
