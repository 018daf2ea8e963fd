use crate::core::config::DownlinkConfig;
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};
use crate::messages::{DownlinkMessage, TxAcknowledgment};
use crate::store::{codec, Namespace, Pipeline, SharedBackend};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static TRANSMISSION_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ns:transmission:([0-9a-zA-Z]+)$").expect("static regex compiles")
});

/// The transmission ID among `correlation_ids`, if any.
pub fn transmission_id(correlation_ids: &[String]) -> Option<&str> {
    correlation_ids.iter().find_map(|cid| {
        TRANSMISSION_ID
            .captures(cid)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    })
}

/// Correlates TX acknowledgments with the downlinks that produced them.
#[derive(Debug, Clone)]
pub struct ScheduledDownlinkMatcher {
    backend: SharedBackend,
    root: Namespace,
    ttl: Duration,
}

impl ScheduledDownlinkMatcher {
    pub fn new(backend: SharedBackend, root: Namespace, config: &DownlinkConfig) -> Self {
        Self {
            backend,
            root,
            ttl: Duration::from_millis(config.match_ttl_ms),
        }
    }

    fn key(&self, tid: &str) -> String {
        self.root.key(&["cid", tid])
    }

    /// Remember a scheduled downlink until its acknowledgment arrives.
    pub async fn add(&self, ctx: &Context, down: &DownlinkMessage) -> StoreResult<()> {
        let tid = transmission_id(&down.correlation_ids)
            .ok_or(StoreError::MissingDownlinkCorrelationId)?;
        let mut pipe = Pipeline::new();
        pipe.set_px(self.key(tid), codec::encode(down)?, self.ttl);
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        Ok(())
    }

    /// Take the downlink acknowledged by `ack`.
    ///
    /// Each scheduled downlink matches at most once.
    pub async fn match_ack(
        &self,
        ctx: &Context,
        ack: &TxAcknowledgment,
    ) -> StoreResult<DownlinkMessage> {
        let cids = ack
            .downlink_message
            .as_ref()
            .map(|d| d.correlation_ids.as_slice())
            .unwrap_or_default();
        let tid = transmission_id(cids).ok_or(StoreError::MissingDownlinkCorrelationId)?;
        let key = self.key(tid);
        let mut pipe = Pipeline::new();
        pipe.getdel(key.clone());
        let value = ctx
            .run(self.backend.exec(pipe.into_ops()))
            .await?
            .pop()
            .ok_or_else(|| StoreError::corruption("missing GETDEL reply"))?
            .into_value()?
            .ok_or_else(|| StoreError::not_found(key))?;
        codec::decode(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmission_id() {
        let cids = vec![
            "c1".to_string(),
            "ns:transmission:01ABcd".to_string(),
        ];
        assert_eq!(transmission_id(&cids), Some("01ABcd"));
        assert_eq!(transmission_id(&["ns:transmission:".to_string()]), None);
        assert_eq!(transmission_id(&["ns:transmission:a-b".to_string()]), None);
        assert_eq!(transmission_id(&[]), None);
    }
}
