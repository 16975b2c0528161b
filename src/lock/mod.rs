// TTL leases stored in the shared bus
//
// A lease is a single key in a TTL bucket. Whoever creates the key owns the
// lock until it is deleted or expires. Room-creation leases share one bucket
// keyed by room id; each scheduler task has its own bucket.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::naming::{self, LOCK_KEY, ROOM_CREATION_LOCK_BUCKET};
use crate::bus::{BucketConfig, BusError, Substrate};
use crate::shared::StoreError;

const SCHEDULER_TASK: &str = "scheduler";

const POLL_BASE: Duration = Duration::from_millis(50);
const POLL_MAX: Duration = Duration::from_millis(500);

/// Proof of ownership returned by a successful acquisition
///
/// `token` is the revision the lease was written at. It only grows, so a
/// holder whose lease expired and was taken over cannot release the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub bucket: String,
    pub key: String,
    pub holder: String,
    pub token: u64,
}

pub struct LockManager {
    bus: Arc<dyn Substrate>,
    replicas: usize,
}

impl LockManager {
    pub fn new(bus: Arc<dyn Substrate>, replicas: usize) -> Self {
        Self { bus, replicas }
    }

    /// Serializes creation and teardown of one room
    ///
    /// Waits while the lease is held, but never longer than `ttl` plus one
    /// poll interval. A holder that crashed is outlived by its lease's TTL.
    /// Every process should pass the same `ttl`, since it is a property of
    /// the shared lock bucket.
    #[instrument(skip(self))]
    pub async fn acquire_room_creation(
        &self,
        room_id: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let deadline = Instant::now() + ttl + POLL_MAX;
        let mut backoff = POLL_BASE;

        loop {
            if let Some(lease) = self
                .try_create(ROOM_CREATION_LOCK_BUCKET, room_id, ttl)
                .await?
            {
                return Ok(lease);
            }

            if Instant::now() >= deadline {
                warn!(room_id = %room_id, "Gave up waiting for room creation lock");
                return Err(StoreError::LockHeld {
                    key: format!("{ROOM_CREATION_LOCK_BUCKET}/{room_id}"),
                });
            }

            let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64 / 2);
            let pause = backoff + Duration::from_millis(jitter);
            debug!(room_id = %room_id, pause_ms = pause.as_millis() as u64, "Room creation lock held, waiting");
            tokio::time::sleep_until((Instant::now() + pause).min(deadline)).await;
            backoff = (backoff * 2).min(POLL_MAX);
        }
    }

    /// Single attempt at the lock guarding a periodic task
    ///
    /// Returns `LockHeld` immediately when another process runs the task.
    #[instrument(skip(self))]
    pub async fn try_scheduler_task(
        &self,
        task_name: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let bucket = naming::lock_bucket(SCHEDULER_TASK, task_name);
        match self.try_create(&bucket, LOCK_KEY, ttl).await? {
            Some(lease) => Ok(lease),
            None => {
                debug!(task = %task_name, "Scheduler task lock held elsewhere");
                Err(StoreError::LockHeld { key: bucket })
            }
        }
    }

    /// Fast release path; a stale lease is left alone
    #[instrument(skip(self), fields(bucket = %lease.bucket, key = %lease.key, token = lease.token))]
    pub async fn release(&self, lease: Lease) -> Result<(), StoreError> {
        match self
            .bus
            .delete_if_revision(&lease.bucket, &lease.key, lease.token)
            .await
        {
            Ok(true) => {
                debug!("Lease released");
                Ok(())
            }
            Ok(false) => {
                warn!("Lease expired or taken over before release");
                Ok(())
            }
            Err(BusError::BucketNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_room_creation_locked(&self, room_id: &str) -> Result<bool, StoreError> {
        self.is_locked(ROOM_CREATION_LOCK_BUCKET, room_id).await
    }

    pub async fn is_scheduler_task_locked(&self, task_name: &str) -> Result<bool, StoreError> {
        self.is_locked(&naming::lock_bucket(SCHEDULER_TASK, task_name), LOCK_KEY)
            .await
    }

    async fn is_locked(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        match self.bus.get(bucket, key).await {
            Ok(entry) => Ok(entry.is_some()),
            Err(BusError::BucketNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_create(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        self.bus
            .create_bucket(BucketConfig::new(bucket, self.replicas).with_ttl(ttl))
            .await?;

        let holder = Uuid::new_v4().to_string();
        match self
            .bus
            .create(bucket, key, holder.clone().into_bytes())
            .await
        {
            Ok(token) => {
                info!(bucket = %bucket, key = %key, token, "Lease acquired");
                Ok(Some(Lease {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    holder,
                    token,
                }))
            }
            Err(BusError::KeyExists { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemorySubstrate, KvBackend};

    fn manager() -> LockManager {
        LockManager::new(Arc::new(InMemorySubstrate::new()), 1)
    }

    #[tokio::test]
    async fn test_scheduler_lock_is_exclusive() {
        let locks = manager();
        let ttl = Duration::from_secs(60);

        let lease = locks
            .try_scheduler_task("activeRoomChecker", ttl)
            .await
            .unwrap();
        let second = locks.try_scheduler_task("activeRoomChecker", ttl).await;
        assert!(matches!(second, Err(StoreError::LockHeld { .. })));

        locks.release(lease).await.unwrap();
        assert!(locks
            .try_scheduler_task("activeRoomChecker", ttl)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lease_expires() {
        let locks = manager();
        let ttl = Duration::from_secs(5);

        let _abandoned = locks.acquire_room_creation("r1", ttl).await.unwrap();
        assert!(locks.is_room_creation_locked("r1").await.unwrap());

        let started = Instant::now();
        let lease = locks.acquire_room_creation("r1", ttl).await.unwrap();
        assert!(started.elapsed() <= ttl + POLL_MAX);
        assert_eq!(lease.bucket, "pnm-lock-room-creation");
        assert_eq!(lease.key, "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_keeps_new_holder() {
        let locks = manager();
        let ttl = Duration::from_secs(2);

        let stale = locks.try_scheduler_task("emptyRoomChecker", ttl).await.unwrap();
        tokio::time::sleep(ttl + Duration::from_millis(10)).await;

        let current = locks.try_scheduler_task("emptyRoomChecker", ttl).await.unwrap();
        assert!(current.token > stale.token);

        locks.release(stale).await.unwrap();
        assert!(locks
            .is_scheduler_task_locked("emptyRoomChecker")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_room_creation_waits_for_release() {
        let locks = Arc::new(manager());
        let ttl = Duration::from_secs(30);
        let first = locks.acquire_room_creation("r1", ttl).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire_room_creation("r1", ttl).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        locks.release(first).await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.key, "r1");
    }

    #[tokio::test]
    async fn test_room_leases_share_one_bucket() {
        let bus = Arc::new(InMemorySubstrate::new());
        let locks = LockManager::new(bus.clone(), 1);
        let ttl = Duration::from_secs(30);

        let r1 = locks.acquire_room_creation("r1", ttl).await.unwrap();
        let r2 = locks.acquire_room_creation("r2", ttl).await.unwrap();
        assert!(locks.is_room_creation_locked("r1").await.unwrap());

        locks.release(r1).await.unwrap();
        locks.release(r2).await.unwrap();

        assert_eq!(
            bus.bucket_names("pnm-lock").await.unwrap(),
            vec!["pnm-lock-room-creation".to_string()]
        );
        assert!(bus.keys("pnm-lock-room-creation").await.unwrap().is_empty());
    }
}
