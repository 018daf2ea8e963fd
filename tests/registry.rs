//! Device registry tests.

mod common;

use common::{create, device, eui, flags, registry, session};
use lorawan_coord::core::context::Context;
use lorawan_coord::core::error::{ErrorCategory, StoreError};
use lorawan_coord::ids::{ApplicationIdentifiers, DevAddr, EndDeviceIdentifiers, Eui64};
use lorawan_coord::messages::UplinkMessage;
use lorawan_coord::registry::device::indexed_uids;
use lorawan_coord::registry::model::{EndDevice, MacSettings, RelayParameters, ServedDevice};
use lorawan_coord::registry::UplinkMatchCandidate;
use lorawan_coord::store::{Backend, Pipeline, Read, ReadReply};
use std::collections::BTreeSet;

fn app() -> ApplicationIdentifiers {
    ApplicationIdentifiers::new("app")
}

fn uplink(addr: u32, f_cnt: u32, ack: bool) -> UplinkMessage {
    UplinkMessage {
        dev_addr: DevAddr::from_u32(addr),
        f_cnt,
        ack,
        ..Default::default()
    }
}

async fn candidates(
    registry: &lorawan_coord::registry::DeviceRegistry,
    up: &UplinkMessage,
) -> Result<Vec<UplinkMatchCandidate>, StoreError> {
    let mut seen = Vec::new();
    let res = registry
        .range_by_uplink_matches(&Context::background(), up, |c| {
            seen.push(c);
            Ok(false)
        })
        .await;
    match res {
        Err(StoreError::NoUplinkMatch) => Ok(seen),
        Err(e) => Err(e),
        Ok(()) => Ok(seen),
    }
}

fn device_ids(candidates: &[UplinkMatchCandidate]) -> Vec<String> {
    candidates.iter().map(|c| c.ids.device_id.clone()).collect()
}

// ============================================================================
// Create, fetch, EUI index
// ============================================================================

#[tokio::test]
async fn create_and_fetch_by_eui() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    let app = ApplicationIdentifiers::new("foo-app");

    let mut ids = EndDeviceIdentifiers::new("foo-app", "foo-device");
    ids.join_eui = Some(Eui64([1, 2, 3, 4, 5, 6, 7, 8]));
    ids.dev_eui = Some(Eui64([0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]));
    let created = registry
        .set_by_id(&ctx, &app, "foo-device", &["ids", "created_at"], |stored| {
            assert!(stored.is_none());
            Ok((Some(EndDevice::new(ids.clone())), vec!["ids".to_string()]))
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.ids, ids);
    assert!(created.created_at.is_some());

    let found = registry
        .get_by_eui(&ctx, ids.join_eui.unwrap(), ids.dev_eui.unwrap(), &["ids"])
        .await
        .unwrap();
    assert_eq!(found.ids, ids);

    // Scenario 2: a second device with the same EUIs is rejected.
    let mut other = ids.clone();
    other.device_id = "bar-device".into();
    let err = registry
        .set_by_id(&ctx, &app, "bar-device", &["ids"], |_| {
            Ok((Some(EndDevice::new(other.clone())), vec!["ids".to_string()]))
        })
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::AlreadyExists);
    let err = registry
        .get_by_id(&ctx, &app, "bar-device", &["ids"])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn get_by_id_projects_paths() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    let mut dev = device("dev-1", 0x10);
    dev.session = Some(session(0x01020304, 12));
    create(&registry, dev).await;

    let got = registry
        .get_by_id(&ctx, &app(), "dev-1", &["session.last_f_cnt_up"])
        .await
        .unwrap();
    assert_eq!(got.ids.device_id, "dev-1");
    let s = got.session.unwrap();
    assert_eq!(s.last_f_cnt_up, 12);
    assert_eq!(s.dev_addr, DevAddr::default());
    assert!(got.created_at.is_none());

    let err = registry
        .get_by_id(&ctx, &app(), "dev-1", &["no_such_field"])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidFieldmask { .. }));
}

#[tokio::test]
async fn update_observes_set_paths() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    create(&registry, device("dev-1", 0x10)).await;

    registry
        .set_by_id(&ctx, &app(), "dev-1", &["name"], |stored| {
            let mut dev = stored.cloned().unwrap_or_default();
            dev.name = "Renamed".into();
            dev.description = "ignored".into();
            Ok((Some(dev), vec!["name".to_string()]))
        })
        .await
        .unwrap();

    let got = registry
        .get_by_id(&ctx, &app(), "dev-1", &["name", "description", "ids"])
        .await
        .unwrap();
    assert_eq!(got.name, "Renamed");
    assert_eq!(got.description, "");
    assert_eq!(got.ids.dev_eui, Some(eui(0x10)));
}

#[tokio::test]
async fn read_only_and_immutable_fields_are_rejected() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    create(&registry, device("dev-1", 0x10)).await;

    for path in ["created_at", "ids.dev_eui", "ids"] {
        let err = registry
            .set_by_id(&ctx, &app(), "dev-1", &[] as &[&str], |stored| {
                Ok((stored.cloned(), vec![path.to_string()]))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnlyField { .. }), "{path}: {err}");
    }
}

#[tokio::test]
async fn create_with_mismatched_ids_is_rejected() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    let err = registry
        .set_by_id(&ctx, &app(), "dev-1", &["ids"], |_| {
            Ok((
                Some(EndDevice::new(EndDeviceIdentifiers::new("app", "dev-2"))),
                vec!["ids".to_string()],
            ))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidIdentifiers { .. }));

    let err = registry
        .get_by_id(&ctx, &app(), "x", &["ids"])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidIdentifiers { .. }));
}

#[tokio::test]
async fn identity_update_keeps_indices() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    let mut dev = device("dev-1", 0x10);
    dev.session = Some(session(0x42FFFFFF, 7));
    dev.pending_session = Some(session(0x11111111, 0));
    create(&registry, dev).await;

    let keys = registry.keys().clone();
    let reads = || {
        vec![
            Read::ZRangeWithScores {
                key: keys.addr_current(DevAddr::from_u32(0x42FFFFFF)),
                rev: false,
            },
            Read::HGetAll {
                key: keys.addr_current_fields(DevAddr::from_u32(0x42FFFFFF)),
            },
            Read::ZRangeWithScores {
                key: keys.addr_pending(DevAddr::from_u32(0x11111111)),
                rev: false,
            },
            Read::get(keys.eui(eui(0x01), eui(0x10))),
        ]
    };
    let before: Vec<ReadReply> = backend.read(reads()).await.unwrap();
    registry
        .set_by_id(&ctx, &app(), "dev-1", &["ids"], |stored| {
            Ok((stored.cloned(), Vec::new()))
        })
        .await
        .unwrap();
    let after = backend.read(reads()).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(
        after[0],
        ReadReply::Scored(vec![("app.dev-1".to_string(), 7.0)])
    );
}

#[tokio::test]
async fn delete_removes_record_and_indices() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    let mut dev = device("dev-1", 0x10);
    dev.session = Some(session(0x01, 1));
    dev.pending_session = Some(session(0x02, 0));
    create(&registry, dev).await;

    let deleted = registry
        .set_by_id(&ctx, &app(), "dev-1", &["ids"], |_| Ok((None, Vec::new())))
        .await
        .unwrap();
    assert!(deleted.is_none());
    let keys = registry.keys();
    let gone = backend
        .read(vec![
            Read::get(keys.uid("app.dev-1")),
            Read::get(keys.eui(eui(0x01), eui(0x10))),
            Read::HGetAll {
                key: keys.addr_current_fields(DevAddr::from_u32(0x01)),
            },
            Read::HGetAll {
                key: keys.addr_pending_fields(DevAddr::from_u32(0x02)),
            },
        ])
        .await
        .unwrap();
    assert_eq!(gone[0], ReadReply::Value(None));
    assert_eq!(gone[1], ReadReply::Value(None));
    assert_eq!(gone[2], ReadReply::Hash(Vec::new()));
    assert_eq!(gone[3], ReadReply::Hash(Vec::new()));
    assert!(indexed_uids(&ctx, &registry, DevAddr::from_u32(0x01))
        .await
        .unwrap()
        .is_empty());
    assert!(indexed_uids(&ctx, &registry, DevAddr::from_u32(0x02))
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Batch operations and iteration
// ============================================================================

#[tokio::test]
async fn batch_get_and_batch_delete() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    for (i, id) in ["dev-1", "dev-2", "dev-3"].iter().enumerate() {
        let mut dev = device(id, 0x10 + i as u8);
        dev.session = Some(session(0x01, i as u32));
        create(&registry, dev).await;
    }

    let ids: Vec<String> = ["dev-1", "dev-9", "dev-3"].iter().map(|s| s.to_string()).collect();
    let got = registry
        .batch_get_by_id(&ctx, &app(), &ids, &["ids"])
        .await
        .unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(got[0].as_ref().unwrap().ids.device_id, "dev-1");
    assert!(got[1].is_none());
    assert_eq!(got[2].as_ref().unwrap().ids.device_id, "dev-3");

    let deleted = registry.batch_delete(&ctx, &app(), &ids).await.unwrap();
    let deleted: Vec<&str> = deleted.iter().map(|ids| ids.device_id.as_str()).collect();
    assert_eq!(deleted, vec!["dev-1", "dev-3"]);

    let remaining = indexed_uids(&ctx, &registry, DevAddr::from_u32(0x01))
        .await
        .unwrap();
    assert_eq!(remaining, BTreeSet::from(["app.dev-2".to_string()]));
    assert!(registry
        .get_by_eui(&ctx, eui(0x01), eui(0x10), &["ids"])
        .await
        .unwrap_err()
        .is_not_found());
    registry
        .get_by_eui(&ctx, eui(0x01), eui(0x11), &["ids"])
        .await
        .unwrap();
}

#[tokio::test]
async fn range_visits_only_devices() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    for i in 0..5u8 {
        let mut dev = device(&format!("dev-{i}"), 0x10 + i);
        dev.session = Some(session(0x01, u32::from(i)));
        create(&registry, dev).await;
    }

    let mut seen = BTreeSet::new();
    registry
        .range(&ctx, &["ids"], 2, |dev| {
            seen.insert(dev.ids.device_id);
            true
        })
        .await
        .unwrap();
    assert_eq!(seen.len(), 5);

    let mut first = 0;
    registry
        .range(&ctx, &["ids"], 2, |_| {
            first += 1;
            false
        })
        .await
        .unwrap();
    assert_eq!(first, 1);

    let mut iter = registry.device_keys(1);
    let mut total = 0;
    while let Some(batch) = iter.next_batch(&ctx).await.unwrap() {
        total += batch.len();
    }
    assert_eq!(total, 5);
    assert_eq!(iter.cursor(), 0);
    iter.restart();
    assert!(iter.next_batch(&ctx).await.unwrap().is_some());
}

// ============================================================================
// Uplink matching
// ============================================================================

#[tokio::test]
async fn rekeyed_session_is_matched_and_rescored() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    let mut dev = device("dev-1", 0x10);
    dev.session = Some(session(0x42FFFFFF, 0x1_0042));
    dev.mac_settings = Some(flags(None, Some(true)));
    create(&registry, dev).await;

    let found = candidates(&registry, &uplink(0x42FFFFFF, 0x0041, false))
        .await
        .unwrap();
    assert_eq!(device_ids(&found), vec!["dev-1"]);
    assert_eq!(found[0].last_f_cnt, 0x1_0042);
    assert_eq!(found[0].supports_32_bit_f_cnt, Some(true));
    assert!(!found[0].is_pending);

    registry
        .set_by_id(&ctx, &app(), "dev-1", &["ids"], |stored| {
            let mut dev = stored.cloned().unwrap_or_default();
            dev.session = Some(session(0x42FFFFFF, 0x1_0041));
            Ok((Some(dev), vec!["session.last_f_cnt_up".to_string()]))
        })
        .await
        .unwrap();
    let scores = backend
        .read(vec![Read::ZRangeWithScores {
            key: registry.keys().addr_current(DevAddr::from_u32(0x42FFFFFF)),
            rev: false,
        }])
        .await
        .unwrap();
    assert_eq!(
        scores[0],
        ReadReply::Scored(vec![("app.dev-1".to_string(), 0x41 as f64)])
    );
}

#[tokio::test]
async fn candidates_follow_pivot_order() {
    let backend = common::backend();
    let registry = registry(&backend);
    for (id, last) in [("dev-a", 10u32), ("dev-b", 40), ("dev-c", 50), ("dev-d", 90)] {
        let mut dev = EndDevice::new(EndDeviceIdentifiers::new("app", id));
        dev.session = Some(session(0x07, last));
        create(&registry, dev).await;
    }

    let found = candidates(&registry, &uplink(0x07, 45, false)).await.unwrap();
    assert_eq!(device_ids(&found), vec!["dev-b", "dev-a", "dev-d", "dev-c"]);
}

#[tokio::test]
async fn skip_rule_and_pending_sessions() {
    let backend = common::backend();
    let registry = registry(&backend);

    // Would need to wrap and cannot.
    let mut strict = EndDevice::new(EndDeviceIdentifiers::new("app", "strict"));
    strict.session = Some(session(0x07, 100));
    strict.mac_settings = Some(flags(None, Some(false)));
    create(&registry, strict).await;

    // May have reset its counter.
    let mut resets = EndDevice::new(EndDeviceIdentifiers::new("app", "resets"));
    resets.session = Some(session(0x07, 100));
    resets.mac_settings = Some(flags(Some(true), Some(false)));
    create(&registry, resets).await;

    let mut joining = EndDevice::new(EndDeviceIdentifiers::new("app", "joining"));
    joining.pending_session = Some(session(0x07, 0));
    create(&registry, joining).await;

    let found = candidates(&registry, &uplink(0x07, 5, false)).await.unwrap();
    assert_eq!(device_ids(&found), vec!["resets", "joining"]);
    assert!(found[1].is_pending);

    // With ACK set, resetting devices are skipped too and pending sessions
    // are not considered.
    let err = registry
        .range_by_uplink_matches(&Context::background(), &uplink(0x07, 5, true), |_| Ok(false))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::NoUplinkMatch);
}

#[tokio::test]
async fn matching_stops_at_first_accept() {
    let backend = common::backend();
    let registry = registry(&backend);
    for (id, last) in [("dev-a", 1u32), ("dev-b", 2)] {
        let mut dev = EndDevice::new(EndDeviceIdentifiers::new("app", id));
        dev.session = Some(session(0x08, last));
        create(&registry, dev).await;
    }
    let mut calls = 0;
    registry
        .range_by_uplink_matches(&Context::background(), &uplink(0x08, 3, false), |c| {
            calls += 1;
            Ok(c.ids.device_id == "dev-b")
        })
        .await
        .unwrap();
    assert_eq!(calls, 1);

    let err = registry
        .range_by_uplink_matches(&Context::background(), &uplink(0x09, 3, false), |_| Ok(true))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::NoUplinkMatch);
}

// ============================================================================
// Relay markers and pruning
// ============================================================================

fn relay(id: &str, served: &[&str]) -> EndDevice {
    let mut dev = EndDevice::new(EndDeviceIdentifiers::new("app", id));
    dev.mac_settings = Some(MacSettings {
        relay: Some(RelayParameters::Serving {
            served: served
                .iter()
                .map(|d| ServedDevice {
                    device_id: d.to_string(),
                })
                .collect(),
        }),
        ..Default::default()
    });
    dev
}

#[tokio::test]
async fn served_device_has_one_relay() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    create(&registry, relay("relay-1", &["leaf-1"])).await;

    let second = relay("relay-2", &["leaf-1"]);
    let err = registry
        .set_by_id(&ctx, &app(), "relay-2", &["ids"], move |_| {
            Ok((Some(second.clone()), vec!["ids".into(), "mac_settings".into()]))
        })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::RelayServed {
            served: "app.leaf-1".into(),
            serving: "app.relay-1".into(),
        }
    );
    assert_eq!(err.category(), ErrorCategory::FailedPrecondition);

    // Releasing the served device frees its marker.
    registry
        .set_by_id(&ctx, &app(), "relay-1", &["ids"], |stored| {
            let mut dev = stored.cloned().unwrap_or_default();
            dev.mac_settings = None;
            Ok((Some(dev), vec!["mac_settings".into()]))
        })
        .await
        .unwrap();
    create(&registry, relay("relay-2", &["leaf-1"])).await;
    let owner = backend
        .read(vec![Read::get(registry.keys().relay_rule("app.leaf-1"))])
        .await
        .unwrap();
    assert_eq!(owner[0], ReadReply::Value(Some("app.relay-2".into())));
}

#[tokio::test]
async fn prune_removes_dangling_entries() {
    let backend = common::backend();
    let registry = registry(&backend);
    let ctx = Context::background();
    let mut dev = device("dev-1", 0x10);
    dev.session = Some(session(0x05, 1));
    create(&registry, dev).await;
    create(&registry, relay("relay-1", &["leaf-1"])).await;

    // Remove the records behind the registry's back.
    let mut pipe = Pipeline::new();
    pipe.del(registry.keys().uid("app.dev-1"))
        .del(registry.keys().uid("app.relay-1"));
    backend.exec(pipe.into_ops()).await.unwrap();

    let dry = registry.prune(&ctx, 10, true).await.unwrap();
    assert_eq!(dry.markers, 2);
    assert_eq!(dry.index_entries, 1);

    let report = registry.prune(&ctx, 10, false).await.unwrap();
    assert_eq!(report, dry);
    assert!(indexed_uids(&ctx, &registry, DevAddr::from_u32(0x05))
        .await
        .unwrap()
        .is_empty());
    let again = registry.prune(&ctx, 10, false).await.unwrap();
    assert_eq!(again.markers + again.index_entries, 0);
}
