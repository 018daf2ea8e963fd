//! Typed record access on top of a [`Backend`](super::Backend).

use super::mutex::lock_mutex;
use super::{codec, Pipeline, Read, SharedBackend, Txn};
use crate::core::config::MutexConfig;
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Typed get/set of records and mutex-guarded watched transactions.
#[derive(Debug, Clone)]
pub struct ProtoStore {
    backend: SharedBackend,
    mutex_ttl: Duration,
    max_attempts: u32,
}

impl ProtoStore {
    pub fn new(backend: SharedBackend, config: &MutexConfig) -> Self {
        Self {
            backend,
            mutex_ttl: config.ttl(),
            max_attempts: config.max_attempts,
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn mutex_ttl(&self) -> Duration {
        self.mutex_ttl
    }

    /// Attempts of a watched transaction before giving up with `Aborted`.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fetch and decode the record at `key`.
    pub async fn get_proto<T: DeserializeOwned>(&self, ctx: &Context, key: &str) -> StoreResult<T> {
        let mut replies = ctx.run(self.backend.read(vec![Read::get(key)])).await?;
        let value = replies
            .pop()
            .ok_or_else(|| StoreError::corruption("missing GET reply"))?
            .into_value()?
            .ok_or_else(|| StoreError::not_found(key))?;
        codec::decode(&value)
    }

    /// Encode and store `value` at `key`.
    pub async fn set_proto<T: Serialize>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let bytes = codec::encode(value)?;
        let mut pipe = Pipeline::new();
        match ttl {
            Some(ttl) => pipe.set_px(key, bytes, ttl),
            None => pipe.set(key, bytes),
        };
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        Ok(())
    }

    /// Resolve `index_key` to a record key through `target` and fetch the
    /// record, watching the index.
    pub async fn find_proto<T, F>(&self, ctx: &Context, index_key: &str, target: F) -> StoreResult<T>
    where
        T: DeserializeOwned,
        F: FnOnce(&str) -> StoreResult<String>,
    {
        let txn = ctx.run(self.backend.watch(vec![index_key.to_string()])).await?;
        let res = ctx.run(find_in(&txn, index_key, target)).await;
        if let Err(e) = txn.discard().await {
            tracing::debug!(error = %e, "failed to discard read-only transaction");
        }
        res
    }

    /// Hold the mutex of `key` as `holder`, then run `f` in a transaction
    /// watching `key` and commit the operations it returns.
    ///
    /// `f` is re-run when a watched key changes before commit, so it must
    /// not have side effects outside the returned pipeline. After
    /// `max_attempts` conflicts the call fails with `Aborted`.
    pub async fn locked_watch<T, F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        holder: &str,
        mut f: F,
    ) -> StoreResult<T>
    where
        F: FnMut(Txn) -> Fut,
        Fut: Future<Output = StoreResult<(Pipeline, T)>>,
    {
        let guard = lock_mutex(ctx, &self.backend, key, holder, self.mutex_ttl).await?;
        let res = self.watch_loop(ctx, key, &mut f).await;
        if let Err(e) = guard.unlock().await {
            tracing::warn!(key = %key, error = %e, "failed to unlock mutex");
        }
        res
    }

    async fn watch_loop<T, F, Fut>(&self, ctx: &Context, key: &str, f: &mut F) -> StoreResult<T>
    where
        F: FnMut(Txn) -> Fut,
        Fut: Future<Output = StoreResult<(Pipeline, T)>>,
    {
        for attempt in 1..=self.max_attempts {
            let txn = ctx.run(self.backend.watch(vec![key.to_string()])).await?;
            let (pipe, out) = match ctx.run(f(txn.clone())).await {
                Ok(res) => res,
                Err(e) => {
                    let _ = txn.discard().await;
                    return Err(e);
                }
            };
            if pipe.is_empty() {
                txn.discard().await?;
                return Ok(out);
            }
            match ctx.run(txn.commit(pipe.into_ops())).await {
                Ok(_) => return Ok(out),
                Err(StoreError::Aborted) => {
                    tracing::debug!(key = %key, attempt, "watched transaction aborted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Aborted)
    }
}

/// Read the UID at `index_key` and fetch the record it points to.
pub async fn find_in<T, F>(txn: &Txn, index_key: &str, target: F) -> StoreResult<T>
where
    T: DeserializeOwned,
    F: FnOnce(&str) -> StoreResult<String>,
{
    let uid = txn
        .get(index_key)
        .await?
        .ok_or_else(|| StoreError::not_found(index_key))?;
    let uid = std::str::from_utf8(&uid)
        .map_err(|_| StoreError::corruption(format!("index {index_key} holds invalid UID")))?;
    let key = target(uid)?;
    txn.watch(vec![key.clone()]).await?;
    let value = txn
        .get(key.as_str())
        .await?
        .ok_or_else(|| StoreError::not_found(key))?;
    codec::decode(&value)
}
