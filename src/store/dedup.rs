//! Time-windowed deduplication.
//!
//! Distributed callers that handle the same message (an uplink received by
//! several gateways) contribute their metadata to a shared window. The
//! first caller of a window is told so and is responsible for processing
//! once the window closes; everyone's contributions accumulate in order,
//! capped to the newest `limit`.

use super::keys::LockKeys;
use super::{codec, Read, SharedBackend};
use crate::core::config::DedupConfig;
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProtoDeduplicator {
    backend: SharedBackend,
    window: Duration,
    limit: usize,
}

impl ProtoDeduplicator {
    pub fn new(backend: SharedBackend, window: Duration, limit: usize) -> Self {
        Self {
            backend,
            window,
            limit,
        }
    }

    pub fn from_config(backend: SharedBackend, config: &DedupConfig) -> Self {
        Self::new(backend, Duration::from_millis(config.window_ms), config.limit)
    }

    /// Join the window of `key` with `msgs`.
    ///
    /// Returns true iff this call opened the window.
    pub async fn deduplicate<T: Serialize>(
        &self,
        ctx: &Context,
        key: &str,
        msgs: &[T],
    ) -> StoreResult<bool> {
        let values = msgs.iter().map(codec::encode).collect::<StoreResult<Vec<_>>>()?;
        ctx.run(self.backend.deduplicate(
            LockKeys::for_key(key),
            self.window,
            self.limit,
            values,
        ))
        .await
    }

    /// The messages accumulated in the window of `key`, oldest first.
    pub async fn accumulated<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
    ) -> StoreResult<Vec<T>> {
        let keys = LockKeys::for_key(key);
        let list = ctx
            .run(self.backend.read(vec![Read::LRange { key: keys.list }]))
            .await?
            .pop()
            .ok_or_else(|| StoreError::corruption("missing LRANGE reply"))?
            .into_list()?;
        list.iter().map(|b| codec::decode(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_limit_keeps_newest() {
        let dedup = ProtoDeduplicator::new(
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(1),
            3,
        );
        let ctx = Context::background();
        assert!(dedup.deduplicate(&ctx, "k", &[1u32, 2]).await.unwrap());
        assert!(!dedup.deduplicate(&ctx, "k", &[3u32, 4]).await.unwrap());
        let got: Vec<u32> = dedup.accumulated(&ctx, "k").await.unwrap();
        assert_eq!(got, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_window_reopens_after_expiry() {
        let dedup = ProtoDeduplicator::new(
            Arc::new(MemoryBackend::new()),
            Duration::from_millis(20),
            8,
        );
        let ctx = Context::background();
        assert!(dedup.deduplicate(&ctx, "k", &["a"]).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(dedup.accumulated::<String>(&ctx, "k").await.unwrap().is_empty());
        assert!(dedup.deduplicate::<&str>(&ctx, "k", &[]).await.unwrap());
    }
}
