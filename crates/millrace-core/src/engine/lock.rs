//! Per-instance execution lock.
//!
//! One queue entry per instance serializes engine-step cycles across
//! workers. Acquisition fails fast when another worker holds a fresh lock;
//! locks older than the confiscation timeout are forcibly reclaimed on the
//! assumption the holder crashed. Release is explicit, never implicit.

use chrono::{DateTime, Utc};
use millrace_types::config::EngineConfig;
use millrace_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::EngineRepository;

/// Errors from lock acquisition and release.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("process instance {0} is locked by another worker")]
    InstanceLocked(Uuid),

    #[error("lock on instance {instance} held for {held_secs}s, past the {max_secs}s limit")]
    HeldTooLong {
        instance: Uuid,
        held_secs: i64,
        max_secs: u64,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Proof of a held instance lock. Carried through engine steps so the
/// programming contract (steps run only under the lock) is checkable.
#[derive(Debug, Clone)]
pub struct InstanceLock {
    pub instance_id: Uuid,
    pub worker: String,
    pub acquired_at: DateTime<Utc>,
}

/// Acquires and releases per-instance locks for one worker.
pub struct InstanceLockService {
    worker_id: String,
    config: EngineConfig,
}

impl InstanceLockService {
    pub fn new(worker_id: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Try to take the lock. Fails fast with [`LockError::InstanceLocked`]
    /// when another worker holds a fresh lock; never blocks or retries.
    pub async fn acquire<R: EngineRepository>(
        &self,
        repo: &R,
        instance_id: &Uuid,
    ) -> Result<InstanceLock, LockError> {
        let now = Utc::now();
        let taken = repo
            .try_lock_instance(
                instance_id,
                &self.worker_id,
                now,
                self.config.lock_confiscation_secs,
            )
            .await?;
        if !taken {
            return Err(LockError::InstanceLocked(*instance_id));
        }
        tracing::debug!(instance = %instance_id, worker = %self.worker_id, "instance lock acquired");
        Ok(InstanceLock {
            instance_id: *instance_id,
            worker: self.worker_id.clone(),
            acquired_at: now,
        })
    }

    /// Assert the lock is still within its expected hold window. A worker
    /// past the window must abandon the cycle rather than risk a
    /// confiscation race.
    pub fn assert_within_hold(&self, lock: &InstanceLock, now: DateTime<Utc>) -> Result<(), LockError> {
        let held_secs = (now - lock.acquired_at).num_seconds();
        if held_secs >= self.config.max_lock_duration_secs as i64 {
            return Err(LockError::HeldTooLong {
                instance: lock.instance_id,
                held_secs,
                max_secs: self.config.max_lock_duration_secs,
            });
        }
        Ok(())
    }

    /// Release the lock. A lock lost to confiscation releases as a no-op.
    pub async fn release<R: EngineRepository>(
        &self,
        repo: &R,
        lock: &InstanceLock,
    ) -> Result<(), LockError> {
        repo.unlock_instance(&lock.instance_id, &lock.worker).await?;
        tracing::debug!(instance = %lock.instance_id, worker = %lock.worker, "instance lock released");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryEngineRepository;
    use millrace_types::queue::QueueEntry;

    fn service(worker: &str) -> InstanceLockService {
        InstanceLockService::new(worker, EngineConfig::default())
    }

    #[tokio::test]
    async fn second_worker_fails_fast_on_held_lock() {
        let repo = InMemoryEngineRepository::default();
        let instance_id = Uuid::now_v7();
        repo.create_queue_entry(&QueueEntry::unlocked(instance_id))
            .await
            .unwrap();

        let a = service("worker-a");
        let b = service("worker-b");
        let lock = a.acquire(&repo, &instance_id).await.unwrap();
        let err = b.acquire(&repo, &instance_id).await.unwrap_err();
        assert!(matches!(err, LockError::InstanceLocked(id) if id == instance_id));

        a.release(&repo, &lock).await.unwrap();
        b.acquire(&repo, &instance_id).await.unwrap();
    }

    #[tokio::test]
    async fn hold_window_assertion() {
        let svc = service("worker-a");
        let lock = InstanceLock {
            instance_id: Uuid::now_v7(),
            worker: "worker-a".to_string(),
            acquired_at: Utc::now(),
        };
        svc.assert_within_hold(&lock, Utc::now()).unwrap();
        let err = svc
            .assert_within_hold(&lock, Utc::now() + chrono::Duration::seconds(301))
            .unwrap_err();
        assert!(matches!(err, LockError::HeldTooLong { .. }));
    }
}
