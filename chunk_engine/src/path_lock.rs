use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockTable = Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>;

enum HeldLock {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Scoped hold on one path. Dropping it releases the lock on every exit path.
pub struct PathGuard {
    path: String,
    held: Option<HeldLock>,
    table: LockTable,
}

impl PathGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Some(HeldLock::Exclusive(_)))
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        let mut table = lock_table(&self.table);
        self.held.take();
        // Only the table still references the lock: nobody holds or waits for it.
        let unused = table
            .get(&self.path)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if unused {
            table.remove(&self.path);
        }
    }
}

fn lock_table(table: &LockTable) -> MutexGuard<'_, HashMap<String, Arc<RwLock<()>>>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-path reader/writer locks.
///
/// Structural changes take their own path exclusively and the parent folder
/// shared. Callers holding several guards acquire ancestors first.
#[derive(Clone, Default)]
pub struct PathLockMgr {
    table: LockTable,
}

impl PathLockMgr {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &str) -> Arc<RwLock<()>> {
        let mut table = lock_table(&self.table);
        // A waiter dropped after the last release leaves its entry behind.
        table.retain(|p, lock| p == path || Arc::strong_count(lock) > 1);
        table
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub async fn lock_exclusive(&self, path: &str) -> PathGuard {
        let lock = self.entry(path);
        let guard = lock.write_owned().await;
        debug!("PathLockMgr: exclusive {}", path);
        PathGuard {
            path: path.to_string(),
            held: Some(HeldLock::Exclusive(guard)),
            table: self.table.clone(),
        }
    }

    pub async fn lock_shared(&self, path: &str) -> PathGuard {
        let lock = self.entry(path);
        let guard = lock.read_owned().await;
        PathGuard {
            path: path.to_string(),
            held: Some(HeldLock::Shared(guard)),
            table: self.table.clone(),
        }
    }

    pub fn tracked_paths(&self) -> usize {
        lock_table(&self.table).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_exclusive_serializes() {
        let mgr = PathLockMgr::new();
        let guard = mgr.lock_exclusive("/a/f").await;
        assert!(guard.is_exclusive());

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            let _g = mgr2.lock_exclusive("/a/f").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(mgr.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let mgr = PathLockMgr::new();
        let g1 = mgr.lock_shared("/a").await;
        let g2 = mgr.lock_shared("/a").await;
        assert!(!g1.is_exclusive());

        let mgr2 = mgr.clone();
        let writer = tokio::spawn(async move {
            let _g = mgr2.lock_exclusive("/a").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        drop(g1);
        drop(g2);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_waiter_entry_is_pruned() {
        let mgr = PathLockMgr::new();
        let holder = mgr.lock_exclusive("/a").await;
        let mut waiter = Box::pin(mgr.lock_exclusive("/a"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(holder);
        drop(waiter);
        let _b = mgr.lock_shared("/b").await;
        assert_eq!(mgr.tracked_paths(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_paths_do_not_block() {
        let mgr = PathLockMgr::new();
        let _a = mgr.lock_exclusive("/a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), mgr.lock_exclusive("/b")).await;
        assert!(b.is_ok());
    }
}
