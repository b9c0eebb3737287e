//! Per-server mutual exclusion shared by backups and restores.
//!
//! Every operation that reads or rewrites a server's files holds that server's
//! lock for its whole duration. The scheduler only ever tries the lock; API
//! calls may wait a bounded time for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::models::ServerId;

/// What currently holds a server's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LockPurpose {
    Backup,
    Restore,
    Rollback,
    ArchiveMaintenance,
}

#[derive(Default)]
pub struct ServerLocks {
    locks: Mutex<HashMap<ServerId, Arc<AsyncMutex<()>>>>,
    holders: Mutex<HashMap<ServerId, LockPurpose>>,
}

/// Held lock. Released on drop.
pub struct ServerLockGuard {
    server_id: ServerId,
    locks: Arc<ServerLocks>,
    _guard: OwnedMutexGuard<()>,
}

impl ServerLockGuard {
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }
}

impl Drop for ServerLockGuard {
    fn drop(&mut self) {
        self.locks
            .holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.server_id);
        tracing::trace!(server_id = self.server_id, "Server lock released");
    }
}

impl ServerLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mutex_for(&self, server_id: ServerId) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(server_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn guard(
        self: &Arc<Self>,
        server_id: ServerId,
        purpose: LockPurpose,
        guard: OwnedMutexGuard<()>,
    ) -> ServerLockGuard {
        self.holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server_id, purpose);
        tracing::trace!(server_id, ?purpose, "Server lock acquired");
        ServerLockGuard {
            server_id,
            locks: Arc::clone(self),
            _guard: guard,
        }
    }

    /// Take the lock or fail immediately with `BackupInProgress`.
    pub fn try_acquire(
        self: &Arc<Self>,
        server_id: ServerId,
        purpose: LockPurpose,
    ) -> Result<ServerLockGuard> {
        let guard = self
            .mutex_for(server_id)
            .try_lock_owned()
            .map_err(|_| AppError::BackupInProgress(server_id))?;
        Ok(self.guard(server_id, purpose, guard))
    }

    /// Wait up to `wait` for the lock, then fail with `BackupInProgress`.
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        server_id: ServerId,
        purpose: LockPurpose,
        wait: Duration,
    ) -> Result<ServerLockGuard> {
        let mutex = self.mutex_for(server_id);
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(self.guard(server_id, purpose, guard)),
            Err(_) => Err(AppError::BackupInProgress(server_id)),
        }
    }

    /// Purpose of the current holder, if the lock is held.
    pub fn holder(&self, server_id: ServerId) -> Option<LockPurpose> {
        self.holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&server_id)
            .copied()
    }

    pub fn is_locked(&self, server_id: ServerId) -> bool {
        self.holder(server_id).is_some()
    }
}
