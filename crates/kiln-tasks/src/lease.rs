//! Per-project mutual exclusion
//!
//! An attempt holds its project's lease while it touches build-wide state.
//! Slow cache I/O runs inside [`ProjectLease::without_lock`], which gives the
//! lock up for the duration and takes it back afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Lease errors
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("project lock for '{0}' is not held")]
    NotHeld(String),
}

/// Hands out one lock per project
#[derive(Debug, Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, project: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(project.to_string()).or_default())
    }

    /// Wait for and take the lock of `project`
    pub async fn acquire(&self, project: &str) -> ProjectLease {
        let mutex = self.lock_for(project);
        let guard = Arc::clone(&mutex).lock_owned().await;
        trace!(project, "project lock acquired");
        ProjectLease {
            project: project.to_string(),
            mutex,
            guard: Some(guard),
        }
    }

    /// Take the lock only if it is free
    pub fn try_acquire(&self, project: &str) -> Option<ProjectLease> {
        let mutex = self.lock_for(project);
        let guard = Arc::clone(&mutex).try_lock_owned().ok()?;
        Some(ProjectLease {
            project: project.to_string(),
            mutex,
            guard: Some(guard),
        })
    }
}

/// Held project lock, released when dropped
#[derive(Debug)]
pub struct ProjectLease {
    project: String,
    mutex: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ProjectLease {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Token proving the lock is held, required for build-wide mutations
    pub fn permit(&self) -> Result<MutationPermit<'_>, LeaseError> {
        if self.is_held() {
            Ok(MutationPermit {
                project: &self.project,
            })
        } else {
            Err(LeaseError::NotHeld(self.project.clone()))
        }
    }

    /// Run `fut` with the lock released, then re-acquire it
    pub async fn without_lock<F, T>(&mut self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let released = self.guard.take().is_some();
        if released {
            trace!(project = %self.project, "project lock released");
        }
        let output = fut.await;
        if released {
            self.guard = Some(Arc::clone(&self.mutex).lock_owned().await);
            trace!(project = %self.project, "project lock re-acquired");
        }
        output
    }
}

/// Scoped permission to mutate state guarded by a project lock
#[derive(Debug, Clone, Copy)]
pub struct MutationPermit<'a> {
    project: &'a str,
}

impl MutationPermit<'_> {
    pub fn project(&self) -> &str {
        self.project
    }
}
