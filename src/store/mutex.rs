//! Distributed mutex with handoff.
//!
//! A lock is a pair of sibling keys: `<key>:lock` holds the owner ID and
//! `<key>:list` is a handoff mailbox. Releasing pushes the owner ID onto
//! the mailbox; the waiter that pops it takes the lock over atomically.
//!
//! ```text
//!  acquire ──▶ SET lock NX PX ──ok──▶ held
//!                  │ taken
//!                  ▼
//!            BLPOP list (≤ remaining TTL)
//!                  │ token            │ timeout
//!                  ▼                  └──▶ retry acquire
//!            take over iff lock == token ──ok──▶ held
//! ```
//!
//! Waiters poll the mailbox in short slices and notice cancellation between
//! them. A waiter whose context ends right after popping a token pushes it
//! back, so the next waiter is not left waiting for the TTL.

use super::keys::LockKeys;
use super::{LockAttempt, SharedBackend};
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};
use std::time::Duration;

/// Longest single wait on the handoff mailbox.
const HANDOFF_SLICE: Duration = Duration::from_millis(100);

/// A held lock. Must be released with [`MutexGuard::unlock`]; dropping it
/// leaves the lock to expire after its TTL.
#[derive(Debug)]
#[must_use = "a dropped guard holds the lock until its TTL expires"]
pub struct MutexGuard {
    backend: SharedBackend,
    keys: LockKeys,
    id: String,
    ttl: Duration,
}

impl MutexGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Release the lock, handing it to the next waiter.
    pub async fn unlock(self) -> StoreResult<()> {
        let released = self
            .backend
            .lock_release(self.keys.clone(), self.id.clone(), self.ttl)
            .await?;
        if !released {
            tracing::debug!(lock = %self.keys.lock, id = %self.id, "lock no longer held at unlock");
        }
        Ok(())
    }
}

/// Acquire the mutex scoped to `key` for holder `id`.
pub async fn lock_mutex(
    ctx: &Context,
    backend: &SharedBackend,
    key: &str,
    id: &str,
    ttl: Duration,
) -> StoreResult<MutexGuard> {
    let keys = LockKeys::for_key(key);
    let guard = MutexGuard {
        backend: backend.clone(),
        keys: keys.clone(),
        id: id.to_string(),
        ttl,
    };
    loop {
        ctx.check()?;
        let attempt = ctx
            .run(backend.lock_acquire(keys.clone(), id.to_string(), ttl))
            .await?;
        let remaining = match attempt {
            LockAttempt::Acquired => return Ok(guard),
            LockAttempt::Held { remaining } if remaining.is_zero() => ttl,
            LockAttempt::Held { remaining } => remaining,
        };

        // Never abandoned mid-flight: a token popped by a dropped request
        // would be lost until the TTL expires. Short slices bound how long
        // a canceled waiter keeps waiting.
        let wait = ctx.clamp(remaining.min(HANDOFF_SLICE));
        let popped = backend.blpop(keys.list.clone(), wait).await?;
        let Some(token) = popped else {
            continue;
        };
        let token = String::from_utf8(token.to_vec())
            .map_err(|_| StoreError::corruption(format!("invalid handoff token in {}", keys.list)))?;

        if let Some(err) = ctx.err() {
            match backend.lock_pass_on(keys.clone(), token, ttl).await {
                Ok(_) => tracing::debug!(lock = %keys.lock, "passed handoff token on"),
                Err(e) => {
                    tracing::warn!(lock = %keys.lock, error = %e, "failed to pass handoff token on")
                }
            }
            return Err(err);
        }
        if backend
            .lock_take_over(keys.clone(), token, id.to_string(), ttl)
            .await?
        {
            return Ok(guard);
        }
    }
}
