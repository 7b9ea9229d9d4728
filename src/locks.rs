use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Ms;

/// Reservation lock scope: one resource, one slot-granularity time bucket.
/// Concurrent requests for clearly non-overlapping times never contend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub resource_id: Ulid,
    pub bucket: i64,
}

impl LockKey {
    pub fn for_start(resource_id: Ulid, start: Ms, bucket_ms: Ms) -> Self {
        Self {
            resource_id,
            bucket: start.div_euclid(bucket_ms),
        }
    }
}

/// Proof of lock ownership. Dropping the token releases the lock, so every
/// exit path — success, conflict, panic — releases.
pub struct LockToken {
    _guard: tokio::sync::OwnedMutexGuard<()>,
    pub expires_at: Ms,
}

/// The distributed-lock seam. The engine only needs acquire-with-ttl and
/// release; a Redis/etcd-backed implementation slots in behind this trait.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire the lock or fail with `LockTimeout` after the service's
    /// acquisition deadline. Retryable with backoff by the caller.
    async fn acquire(&self, key: LockKey, ttl: Duration) -> Result<LockToken, EngineError>;

    async fn release(&self, key: LockKey, token: LockToken);
}

/// In-process lock table. TTL is advisory here — the token's guard holds
/// the slot until dropped; a distributed implementation enforces expiry.
pub struct SlotLocks {
    slots: DashMap<LockKey, Arc<Mutex<()>>>,
    acquire_timeout: Duration,
}

impl SlotLocks {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            acquire_timeout,
        }
    }
}

#[async_trait]
impl LockService for SlotLocks {
    async fn acquire(&self, key: LockKey, ttl: Duration) -> Result<LockToken, EngineError> {
        // Clone the Arc out before awaiting — holding a DashMap shard guard
        // across an await point would stall unrelated buckets.
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = tokio::time::timeout(self.acquire_timeout, slot.lock_owned())
            .await
            .map_err(|_| EngineError::LockTimeout)?;

        let expires_at = crate::engine::now_ms() + ttl.as_millis() as Ms;
        Ok(LockToken {
            _guard: guard,
            expires_at,
        })
    }

    async fn release(&self, key: LockKey, token: LockToken) {
        drop(token);
        // Best-effort cleanup: drop the table entry once nobody holds it.
        self.slots
            .remove_if(&key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn disjoint_buckets_do_not_contend() {
        let locks = SlotLocks::new(Duration::from_millis(100));
        let rid = Ulid::new();
        let a = LockKey::for_start(rid, 0, 1_800_000);
        let b = LockKey::for_start(rid, 1_800_000, 1_800_000);
        assert_ne!(a, b);

        let ta = locks.acquire(a, Duration::from_secs(30)).await.unwrap();
        let tb = locks.acquire(b, Duration::from_secs(30)).await.unwrap();
        locks.release(a, ta).await;
        locks.release(b, tb).await;
    }

    #[tokio::test]
    async fn same_bucket_times_out() {
        let locks = SlotLocks::new(Duration::from_millis(50));
        let key = LockKey::for_start(Ulid::new(), 900_000, 1_800_000);

        let held = tokio_test::assert_ok!(locks.acquire(key, Duration::from_secs(30)).await);
        let result = locks.acquire(key, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(EngineError::LockTimeout)));
        locks.release(key, held).await;

        // Released — second attempt now succeeds
        let token = tokio_test::assert_ok!(locks.acquire(key, Duration::from_secs(30)).await);
        locks.release(key, token).await;
    }

    #[tokio::test]
    async fn release_on_drop() {
        let locks = SlotLocks::new(Duration::from_millis(50));
        let key = LockKey::for_start(Ulid::new(), 0, 1_800_000);
        {
            let _token = locks.acquire(key, Duration::from_secs(30)).await.unwrap();
            // Dropped at the end of scope without an explicit release
        }
        let token = locks.acquire(key, Duration::from_secs(30)).await.unwrap();
        locks.release(key, token).await;
    }
}
