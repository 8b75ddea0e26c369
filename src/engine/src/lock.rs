use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::channel::LogId;
use crate::error::{Error, Result};

/// LogLocks hands out one reader/writer lock per log. Mutations of a log hold
/// the write side; queries hold the read side. Different logs never contend.
#[derive(Default)]
pub struct LogLocks {
    locks: DashMap<LogId, Arc<RwLock<()>>>,
}

impl LogLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_of(&self, id: &LogId) -> Arc<RwLock<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    pub async fn write(&self, id: &LogId, wait: Duration) -> Result<OwnedRwLockWriteGuard<()>> {
        let lock = self.lock_of(id);
        tokio::time::timeout(wait, lock.write_owned())
            .await
            .map_err(|_| Error::ConcurrentModificationTimeout(id.to_string()))
    }

    pub async fn read(&self, id: &LogId, wait: Duration) -> Result<OwnedRwLockReadGuard<()>> {
        let lock = self.lock_of(id);
        tokio::time::timeout(wait, lock.read_owned())
            .await
            .map_err(|_| Error::ConcurrentModificationTimeout(id.to_string()))
    }

    /// prune drops the entry of a log once nobody holds or waits on it.
    pub fn prune(&self, id: &LogId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// release gives up a guard and prunes the log's entry.
    pub fn release<G>(&self, id: &LogId, guard: G) {
        drop(guard);
        self.prune(id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::channel::LogId;
    use crate::error::ErrorKind;
    use crate::lock::LogLocks;

    #[tokio::test]
    async fn test_write_excludes_and_times_out() {
        let locks = LogLocks::new();
        let a = LogId::new("w", "wb", "a");
        let b = LogId::new("w", "wb", "b");

        let guard = locks.write(&a, Duration::from_secs(1)).await.unwrap();

        let e = locks.write(&a, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConcurrentModificationTimeout);
        assert!(e.is_retryable());

        // other logs are unaffected
        let _b = locks.write(&b, Duration::from_millis(20)).await.unwrap();

        drop(guard);
        let _r1 = locks.read(&a, Duration::from_millis(20)).await.unwrap();
        let _r2 = locks.read(&a, Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = LogLocks::new();
        let a = LogId::new("w", "wb", "a");

        let guard = locks.write(&a, Duration::from_secs(1)).await.unwrap();
        locks.prune(&a);
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.prune(&a);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_release_prunes_unless_waited_on() {
        let locks = LogLocks::new();
        let a = LogId::new("w", "wb", "a");

        let guard = locks.read(&a, Duration::from_secs(1)).await.unwrap();
        let other = locks.read(&a, Duration::from_secs(1)).await.unwrap();
        locks.release(&a, guard);
        assert_eq!(locks.len(), 1);

        locks.release(&a, other);
        assert!(locks.is_empty());
    }
}
