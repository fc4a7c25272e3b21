//! Workspace lock manager
//!
//! Admission discipline for the shared workspace volume: any number of
//! SHARED grants may coexist, an EXCLUSIVE grant requires the table to
//! be empty. Acquisition blocks up to an explicit timeout and returns a
//! non-acquired result on expiry; it never raises and never blocks
//! indefinitely. Locks on different workspace ids never interact.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Workspace create/cleanup; requires zero grants of either kind
    Exclusive,
    /// Concurrent step execution; admitted unless an exclusive is held
    Shared,
}

/// A granted lock
#[derive(Debug, Clone)]
pub struct WorkspaceLock {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub kind: LockKind,
    pub reason: String,
    pub acquired_at: DateTime<Utc>,
}

/// Error raised by the scoped-acquisition form
#[derive(Debug)]
pub enum LockError {
    Timeout {
        workspace_id: Uuid,
        waited: Duration,
    },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout {
                workspace_id,
                waited,
            } => write!(
                f,
                "timed out after {:?} waiting for lock on workspace {}",
                waited, workspace_id
            ),
        }
    }
}

impl std::error::Error for LockError {}

/// Per-workspace lock table
pub struct WorkspaceLockManager {
    grants: Mutex<HashMap<Uuid, Vec<WorkspaceLock>>>,
    released: Notify,
}

impl WorkspaceLockManager {
    pub fn new() -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Try once, without waiting
    pub fn try_acquire(
        &self,
        workspace_id: Uuid,
        kind: LockKind,
        reason: &str,
    ) -> Option<WorkspaceLock> {
        let mut grants = self.grants.lock().unwrap();
        let held = grants.entry(workspace_id).or_default();

        let admitted = match kind {
            LockKind::Exclusive => held.is_empty(),
            LockKind::Shared => !held.iter().any(|g| g.kind == LockKind::Exclusive),
        };
        if !admitted {
            return None;
        }

        let lock = WorkspaceLock {
            id: Uuid::new_v4(),
            workspace_id,
            kind,
            reason: reason.to_string(),
            acquired_at: Utc::now(),
        };
        held.push(lock.clone());
        debug!("Lock {:?} granted on workspace {} ({})", kind, workspace_id, reason);
        Some(lock)
    }

    /// Acquire, waiting up to `timeout`
    ///
    /// Returns `None` if the timeout elapses; a zero timeout probes and
    /// returns immediately.
    pub async fn acquire(
        &self,
        workspace_id: Uuid,
        kind: LockKind,
        reason: &str,
        timeout: Duration,
    ) -> Option<WorkspaceLock> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before re-checking so a release between
            // the check and the wait is not lost.
            let released = self.released.notified();

            if let Some(lock) = self.try_acquire(workspace_id, kind, reason) {
                return Some(lock);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let _ = tokio::time::timeout(remaining, released).await;
        }
    }

    /// Release one grant
    pub fn release(&self, lock: &WorkspaceLock) {
        let mut grants = self.grants.lock().unwrap();
        if let Some(held) = grants.get_mut(&lock.workspace_id) {
            held.retain(|g| g.id != lock.id);
            if held.is_empty() {
                grants.remove(&lock.workspace_id);
            }
        }
        drop(grants);
        self.released.notify_waiters();
    }

    /// Operator break-glass: clear every grant on a workspace
    pub fn force_release(&self, workspace_id: Uuid) -> usize {
        let mut grants = self.grants.lock().unwrap();
        let cleared = grants.remove(&workspace_id).map(|g| g.len()).unwrap_or(0);
        drop(grants);

        if cleared > 0 {
            warn!("Force-released {} grant(s) on workspace {}", cleared, workspace_id);
            self.released.notify_waiters();
        }
        cleared
    }

    pub fn held(&self, workspace_id: Uuid) -> usize {
        self.grants
            .lock()
            .unwrap()
            .get(&workspace_id)
            .map(|g| g.len())
            .unwrap_or(0)
    }

    /// Scoped acquisition: the returned guard releases on drop, on every
    /// exit path. Acquisition timeout is a distinct, raised error.
    pub async fn lock_scoped(
        self: &Arc<Self>,
        workspace_id: Uuid,
        kind: LockKind,
        reason: &str,
        timeout: Duration,
    ) -> Result<ScopedLock, LockError> {
        match self.acquire(workspace_id, kind, reason, timeout).await {
            Some(lock) => Ok(ScopedLock {
                manager: Arc::clone(self),
                lock: Some(lock),
            }),
            None => Err(LockError::Timeout {
                workspace_id,
                waited: timeout,
            }),
        }
    }
}

impl Default for WorkspaceLockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a scoped lock
pub struct ScopedLock {
    manager: Arc<WorkspaceLockManager>,
    lock: Option<WorkspaceLock>,
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.manager.release(&lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_two_shared_grants_coexist() {
        let locks = WorkspaceLockManager::new();
        let ws = Uuid::new_v4();

        let a = locks.acquire(ws, LockKind::Shared, "step 0", SHORT).await;
        let b = locks.acquire(ws, LockKind::Shared, "step 1", SHORT).await;
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(locks.held(ws), 2);
    }

    #[tokio::test]
    async fn test_exclusive_blocked_by_shared_times_out() {
        let locks = WorkspaceLockManager::new();
        let ws = Uuid::new_v4();
        let _shared = locks.acquire(ws, LockKind::Shared, "step 0", SHORT).await.unwrap();

        let start = std::time::Instant::now();
        let exclusive = locks.acquire(ws, LockKind::Exclusive, "cleanup", SHORT).await;
        assert!(exclusive.is_none());
        // Bounded by the requested timeout, generous tolerance
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_shared_blocked_by_exclusive() {
        let locks = WorkspaceLockManager::new();
        let ws = Uuid::new_v4();
        let _excl = locks.acquire(ws, LockKind::Exclusive, "create", SHORT).await.unwrap();
        assert!(locks.acquire(ws, LockKind::Shared, "step 0", SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_timeout_probes() {
        let locks = WorkspaceLockManager::new();
        let ws = Uuid::new_v4();
        let _excl = locks.acquire(ws, LockKind::Exclusive, "create", SHORT).await.unwrap();
        assert!(
            locks
                .acquire(ws, LockKind::Shared, "probe", Duration::ZERO)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let locks = Arc::new(WorkspaceLockManager::new());
        let ws = Uuid::new_v4();
        let shared = locks.acquire(ws, LockKind::Shared, "step 0", SHORT).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire(ws, LockKind::Exclusive, "cleanup", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.release(&shared);

        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_different_workspaces_never_interact() {
        let locks = WorkspaceLockManager::new();
        let _a = locks
            .acquire(Uuid::new_v4(), LockKind::Exclusive, "create", SHORT)
            .await
            .unwrap();
        let b = locks
            .acquire(Uuid::new_v4(), LockKind::Exclusive, "create", SHORT)
            .await;
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_scoped_lock_releases_on_drop() {
        let locks = Arc::new(WorkspaceLockManager::new());
        let ws = Uuid::new_v4();

        {
            let _guard = locks
                .lock_scoped(ws, LockKind::Exclusive, "create", SHORT)
                .await
                .unwrap();
            assert_eq!(locks.held(ws), 1);
        }
        assert_eq!(locks.held(ws), 0);
    }

    #[tokio::test]
    async fn test_scoped_timeout_is_a_distinct_error() {
        let locks = Arc::new(WorkspaceLockManager::new());
        let ws = Uuid::new_v4();
        let _excl = locks.acquire(ws, LockKind::Exclusive, "create", SHORT).await.unwrap();

        let err = locks
            .lock_scoped(ws, LockKind::Shared, "step 0", SHORT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_force_release_clears_everything() {
        let locks = WorkspaceLockManager::new();
        let ws = Uuid::new_v4();
        locks.acquire(ws, LockKind::Shared, "a", SHORT).await.unwrap();
        locks.acquire(ws, LockKind::Shared, "b", SHORT).await.unwrap();

        assert_eq!(locks.force_release(ws), 2);
        assert_eq!(locks.held(ws), 0);
        assert!(locks.acquire(ws, LockKind::Exclusive, "cleanup", SHORT).await.is_some());
    }
}
