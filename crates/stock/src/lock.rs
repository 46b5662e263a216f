//! Short-lived exclusive leases on named resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

/// Wait budget and lease length used when locking a stock counter.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long to wait for a busy lock before giving up.
    pub wait: Duration,
    /// How long a granted lock stays valid without being released.
    pub lease: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(3),
            lease: Duration::from_secs(3),
        }
    }
}

/// Errors from lease locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed busy for the whole wait budget.
    #[error("Timed out after {waited_ms}ms waiting for lock {key}")]
    Timeout { key: String, waited_ms: u64 },

    /// The handle's lease expired and the lock was granted to someone else.
    #[error("Lock {key} is no longer held by this handle")]
    NotHeld { key: String },

    /// The lock service could not be reached.
    #[error("Lock service unavailable: {0}")]
    Unavailable(String),
}

/// Proof of holding a lease.
///
/// The token fences the lease: once it expires and the key is granted again,
/// the old handle can neither release nor be used for writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: Uuid,
    expires_at: Instant,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Returns true once the lease has run out.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Exclusive, automatically expiring locks keyed by name.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquires `key`, waiting at most `wait` for the current holder.
    ///
    /// A held lease that has expired counts as free, so a crashed holder
    /// blocks others for at most its lease.
    async fn try_acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError>;

    /// Gives a lease back early.
    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

/// Lease lock kept in process memory.
///
/// Waiters are woken on every release and otherwise re-check when the
/// current lease runs out.
#[derive(Clone, Default)]
pub struct InMemoryLeaseLock {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    released: Arc<Notify>,
}

impl InMemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently leased.
    pub async fn is_locked(&self, key: &str) -> bool {
        self.leases
            .lock()
            .await
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn try_acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = started + wait;

        loop {
            let mut leases = self.leases.lock().await;
            let now = Instant::now();

            let busy_until = leases
                .get(key)
                .map(|held| held.expires_at)
                .filter(|expires_at| *expires_at > now);

            let Some(busy_until) = busy_until else {
                let granted = Lease {
                    token: Uuid::new_v4(),
                    expires_at: now + lease,
                };
                leases.insert(key.to_string(), granted);
                return Ok(LockHandle {
                    key: key.to_string(),
                    token: granted.token,
                    expires_at: granted.expires_at,
                });
            };

            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: (now - started).as_millis() as u64,
                });
            }

            // Registered before the map is unlocked so a release in between is not missed.
            let released = self.released.notified();
            drop(leases);

            let _ = tokio::time::timeout_at(busy_until.min(deadline), released).await;
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let mut leases = self.leases.lock().await;
        match leases.get(&handle.key) {
            Some(held) if held.token == handle.token => {
                leases.remove(&handle.key);
                drop(leases);
                self.released.notify_waiters();
                Ok(())
            }
            _ => Err(LockError::NotHeld {
                key: handle.key.clone(),
            }),
        }
    }
}
