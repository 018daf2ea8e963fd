//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use lorawan_coord::core::config::{Config, MutexConfig};
use lorawan_coord::ids::{DevAddr, EndDeviceIdentifiers, Eui64};
use lorawan_coord::registry::model::{EndDevice, MacSettings, Session};
use lorawan_coord::registry::DeviceRegistry;
use lorawan_coord::store::{MemoryBackend, Namespace, ProtoStore, SharedBackend};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// A fresh in-memory backend.
pub fn backend() -> SharedBackend {
    Arc::new(MemoryBackend::new())
}

/// A registry rooted at `ns` on `backend`.
pub fn registry(backend: &SharedBackend) -> DeviceRegistry {
    let store = ProtoStore::new(backend.clone(), &MutexConfig::default());
    DeviceRegistry::new(store, Namespace::new("ns"))
}

/// Create a configuration file with the given content.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// The default configuration.
pub fn config() -> Config {
    Config::default()
}

pub fn eui(b: u8) -> Eui64 {
    Eui64([b; 8])
}

/// A device with identifiers and EUIs, no session.
pub fn device(dev_id: &str, dev_eui: u8) -> EndDevice {
    let mut ids = EndDeviceIdentifiers::new("app", dev_id);
    ids.join_eui = Some(eui(0x01));
    ids.dev_eui = Some(eui(dev_eui));
    EndDevice::new(ids)
}

/// A session on `addr` with frame counter `last`.
pub fn session(addr: u32, last: u32) -> Session {
    Session {
        dev_addr: DevAddr::from_u32(addr),
        last_f_cnt_up: last,
        ..Default::default()
    }
}

/// MAC settings with the given frame counter flags.
pub fn flags(resets: Option<bool>, supports_32: Option<bool>) -> MacSettings {
    MacSettings {
        resets_f_cnt: resets,
        supports_32_bit_f_cnt: supports_32,
        ..Default::default()
    }
}

/// Paths set when creating a device with [`device`] plus a session.
pub const CREATE_PATHS: &[&str] = &["ids", "session", "mac_settings", "pending_session"];

/// Create `dev` through `set_by_id`, setting [`CREATE_PATHS`].
pub async fn create(registry: &DeviceRegistry, dev: EndDevice) -> EndDevice {
    let ctx = lorawan_coord::Context::background();
    let ids = dev.ids.clone();
    registry
        .set_by_id(
            &ctx,
            &ids.application_ids,
            &ids.device_id,
            &["ids", "session", "created_at"],
            move |stored| {
                assert!(stored.is_none(), "device already exists");
                Ok((
                    Some(dev.clone()),
                    CREATE_PATHS.iter().map(|p| p.to_string()).collect(),
                ))
            },
        )
        .await
        .expect("create device")
        .expect("created device")
}
