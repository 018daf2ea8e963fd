//! Secondary index keys and index deltas.
//!
//! Deltas are pure: given the stored and updated device they describe the
//! index writes as a [`Pipeline`], which the caller commits together with
//! the record.

use super::model::EndDevice;
use super::projection::{CurrentProjection, PendingProjection};
use crate::core::error::StoreResult;
use crate::ids::{DevAddr, Eui64};
use crate::store::{Namespace, Pipeline};

/// Score of a UID in the current session index of a DevAddr.
pub fn current_score(last_f_cnt_up: u32) -> f64 {
    f64::from(last_f_cnt_up & 0xFFFF)
}

/// Key layout of a device registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryKeys {
    root: Namespace,
}

impl RegistryKeys {
    pub fn new(root: Namespace) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Namespace {
        &self.root
    }

    /// `<root>:uid:<uid>`
    pub fn uid(&self, uid: &str) -> String {
        self.root.key(&["uid", uid])
    }

    /// `<root>:eui:<JoinEUI>:<DevEUI>`
    pub fn eui(&self, join_eui: Eui64, dev_eui: Eui64) -> String {
        self.root
            .key(&["eui", &join_eui.to_string(), &dev_eui.to_string()])
    }

    pub fn addr_current(&self, addr: DevAddr) -> String {
        self.root.key(&["addr", &addr.to_string(), "current"])
    }

    pub fn addr_current_fields(&self, addr: DevAddr) -> String {
        self.root.key(&["addr", &addr.to_string(), "current", "fields"])
    }

    pub fn addr_pending(&self, addr: DevAddr) -> String {
        self.root.key(&["addr", &addr.to_string(), "pending"])
    }

    pub fn addr_pending_fields(&self, addr: DevAddr) -> String {
        self.root.key(&["addr", &addr.to_string(), "pending", "fields"])
    }

    /// `<root>:relay:rules:<servedUID>`
    pub fn relay_rule(&self, served_uid: &str) -> String {
        self.root.key(&["relay", "rules", served_uid])
    }
}

/// Index writes turning `stored` into `updated` for the device `uid`.
///
/// `now_nanos` scores newly indexed pending sessions.
pub fn session_index_ops(
    keys: &RegistryKeys,
    uid: &str,
    stored: Option<&EndDevice>,
    updated: Option<&EndDevice>,
    now_nanos: i64,
) -> StoreResult<Pipeline> {
    let mut pipe = Pipeline::new();

    let old = stored.and_then(CurrentProjection::of);
    let new = updated.and_then(CurrentProjection::of);
    if let Some((old_addr, _)) = &old {
        if new.as_ref().map_or(true, |(addr, _)| addr != old_addr) {
            pipe.zrem(keys.addr_current(*old_addr), uid);
            pipe.hdel(keys.addr_current_fields(*old_addr), uid);
        }
    }
    if let Some((addr, proj)) = &new {
        let kept = old
            .as_ref()
            .filter(|(old_addr, _)| old_addr == addr)
            .map(|(_, p)| p);
        if kept.map_or(true, |p| p.last_f_cnt != proj.last_f_cnt) {
            pipe.zadd(keys.addr_current(*addr), uid, current_score(proj.last_f_cnt));
        }
        if kept != Some(proj) {
            pipe.hset(keys.addr_current_fields(*addr), uid, proj.encode()?);
        }
    }

    let old = stored.and_then(PendingProjection::of);
    let new = updated.and_then(PendingProjection::of);
    if let Some((old_addr, _)) = &old {
        if new.as_ref().map_or(true, |(addr, _)| addr != old_addr) {
            pipe.zrem(keys.addr_pending(*old_addr), uid);
            pipe.hdel(keys.addr_pending_fields(*old_addr), uid);
        }
    }
    if let Some((addr, proj)) = &new {
        let kept = old
            .as_ref()
            .filter(|(old_addr, _)| old_addr == addr)
            .map(|(_, p)| p);
        if kept.is_none() {
            pipe.zadd(keys.addr_pending(*addr), uid, now_nanos as f64);
        }
        if kept != Some(proj) {
            pipe.hset(keys.addr_pending_fields(*addr), uid, proj.encode()?);
        }
    }
    Ok(pipe)
}

/// Unconditional writes of the `:fields` projections of `dev`.
pub fn session_fields_ops(keys: &RegistryKeys, uid: &str, dev: &EndDevice) -> StoreResult<Pipeline> {
    let mut pipe = Pipeline::new();
    if let Some((addr, proj)) = CurrentProjection::of(dev) {
        pipe.hset(keys.addr_current_fields(addr), uid, proj.encode()?);
    }
    if let Some((addr, proj)) = PendingProjection::of(dev) {
        pipe.hset(keys.addr_pending_fields(addr), uid, proj.encode()?);
    }
    Ok(pipe)
}
