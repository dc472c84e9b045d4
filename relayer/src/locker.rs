// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lease-based mutual exclusion for cross-task critical sections.
//!
//! The sender holds `lock:{relay_id}:nonce` from the moment it reads the
//! next nonce until the broadcast result is applied, so concurrent senders
//! for the same signer cannot hand out the same nonce twice. Leases expire
//! on their own, which keeps a crashed holder from wedging the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{RelayerError, RelayerResult};

/// Releases the underlying lease when dropped. A guard from an expired
/// lease releases nothing; the lease already belongs to the next holder.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Take the lease if it is free or expired. `None` means another holder
    /// still owns it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> RelayerResult<Option<LockGuard>>;

    /// Take the lease, waiting up to `wait` for the current holder.
    async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> RelayerResult<LockGuard> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(key, ttl).await? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(RelayerError::LockError(format!(
                    "timed out after {:?} waiting for lock {}",
                    wait, key
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

struct HeldLease {
    token: u64,
    expires_at: Instant,
}

/// Single-process locker. Every pipeline stage in this process shares one
/// instance, which is all a single-node deployment needs.
#[derive(Default)]
pub struct InProcessLocker {
    leases: Arc<Mutex<HashMap<String, HeldLease>>>,
    next_token: AtomicU64,
}

impl InProcessLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<dyn Locker> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Locker for InProcessLocker {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> RelayerResult<Option<LockGuard>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        {
            let mut leases = self
                .leases
                .lock()
                .map_err(|e| RelayerError::LockError(format!("lock table poisoned: {}", e)))?;
            match leases.get(key) {
                Some(held) if held.expires_at > now => return Ok(None),
                _ => {}
            }
            leases.insert(
                key.to_string(),
                HeldLease {
                    token,
                    expires_at: now + ttl,
                },
            );
        }
        let leases = self.leases.clone();
        let key = key.to_string();
        Ok(Some(LockGuard::new(move || {
            if let Ok(mut leases) = leases.lock() {
                // Only the token that took the lease may clear it. An expired
                // guard must not evict the holder that replaced it.
                if leases.get(&key).map(|held| held.token) == Some(token) {
                    leases.remove(&key);
                }
            }
        })))
    }
}
