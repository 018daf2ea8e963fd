//! Scheduled downlink matcher tests.

mod common;

use lorawan_coord::core::config::DownlinkConfig;
use lorawan_coord::core::context::Context;
use lorawan_coord::core::error::StoreError;
use lorawan_coord::downlink::ScheduledDownlinkMatcher;
use lorawan_coord::messages::{DownlinkMessage, TxAcknowledgment, TxResult};
use lorawan_coord::store::{Namespace, SharedBackend};
use std::time::Duration;

fn matcher(backend: &SharedBackend, ttl_ms: u64) -> ScheduledDownlinkMatcher {
    ScheduledDownlinkMatcher::new(
        backend.clone(),
        Namespace::new("ns:scheduled-downlinks"),
        &DownlinkConfig {
            match_ttl_ms: ttl_ms,
        },
    )
}

fn cids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn ack_for(cid: &str) -> TxAcknowledgment {
    TxAcknowledgment {
        correlation_ids: cids(&["gs:tx:1"]),
        result: TxResult::Success,
        downlink_message: Some(DownlinkMessage {
            correlation_ids: cids(&[cid]),
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn ack_matches_downlink_once() {
    let backend = common::backend();
    let matcher = matcher(&backend, 60_000);
    let ctx = Context::background();

    let down = DownlinkMessage {
        raw_payload: vec![0x60, 0x01, 0x02],
        end_device_ids: None,
        correlation_ids: cids(&["c1", "c2", "ns:transmission:CID"]),
    };
    matcher.add(&ctx, &down).await.unwrap();

    let matched = matcher
        .match_ack(&ctx, &ack_for("ns:transmission:CID"))
        .await
        .unwrap();
    assert_eq!(matched, down);

    let err = matcher
        .match_ack(&ctx, &ack_for("ns:transmission:CID"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn transmission_id_is_required() {
    let backend = common::backend();
    let matcher = matcher(&backend, 60_000);
    let ctx = Context::background();

    let down = DownlinkMessage {
        correlation_ids: cids(&["c1"]),
        ..Default::default()
    };
    assert_eq!(
        matcher.add(&ctx, &down).await.unwrap_err(),
        StoreError::MissingDownlinkCorrelationId
    );

    let ack = TxAcknowledgment::default();
    assert_eq!(
        matcher.match_ack(&ctx, &ack).await.unwrap_err(),
        StoreError::MissingDownlinkCorrelationId
    );
}

#[tokio::test]
async fn unacknowledged_downlink_expires() {
    let backend = common::backend();
    let matcher = matcher(&backend, 30);
    let ctx = Context::background();

    let down = DownlinkMessage {
        correlation_ids: cids(&["ns:transmission:late"]),
        ..Default::default()
    };
    matcher.add(&ctx, &down).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let err = matcher
        .match_ack(&ctx, &ack_for("ns:transmission:late"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
