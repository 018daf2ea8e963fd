//! The end device registry.
//!
//! Records live at `<root>:uid:<app>.<dev>`. Every write holds the device's
//! mutex and commits the record together with its index delta in one
//! watched transaction, so the EUI, DevAddr and relay indices never
//! disagree with the records.

use super::fieldmask::{check_writable, project, set_fields, validate_paths};
use super::index::{session_fields_ops, session_index_ops, RegistryKeys};
use super::model::{EndDevice, KeyEnvelope, MacVersion};
use super::projection::{CurrentProjection, PendingProjection};
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};
use crate::core::time::unix_nanos;
use crate::ids::{
    device_uid, parse_device_uid, validate_id, ApplicationIdentifiers, DevAddr,
    EndDeviceIdentifiers, Eui64,
};
use crate::messages::UplinkMessage;
use crate::store::{codec, Namespace, Pipeline, ProtoStore, Read, SharedBackend, Txn};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// A device that may have sent an uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkMatchCandidate {
    pub ids: EndDeviceIdentifiers,
    pub lorawan_version: MacVersion,
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    pub last_f_cnt: u32,
    pub resets_f_cnt: Option<bool>,
    pub supports_32_bit_f_cnt: Option<bool>,
    pub is_pending: bool,
}

/// Whether a current session candidate cannot have sent a frame with
/// counter bits `lsb`: its counter would have to wrap, it does not
/// support 32-bit counters, and it could not have reset its counter.
pub fn skip_current_candidate(last_f_cnt: u32, supports_32: Option<bool>, resets: Option<bool>, ack: bool, lsb: u16) -> bool {
    (last_f_cnt & 0xFFFF) as u16 > lsb
        && supports_32 == Some(false)
        && (ack || resets != Some(true))
}

/// Order current session members for an uplink with counter bits `lsb`:
/// members at or below `lsb` first, then the rest, each by descending
/// score. `members` must already be in descending score order.
pub fn pivot(members: Vec<(String, f64)>, lsb: u16) -> Vec<(String, f64)> {
    let (mut below, above): (Vec<_>, Vec<_>) = members
        .into_iter()
        .partition(|(_, score)| *score <= f64::from(lsb));
    below.extend(above);
    below
}

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// A mutex holder ID unique to this call.
fn holder_id() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        unix_nanos(Utc::now()),
        HOLDER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn with_ids<S: AsRef<str>>(paths: &[S]) -> Vec<String> {
    let mut out = vec!["ids".to_string()];
    out.extend(paths.iter().map(|p| p.as_ref().to_string()));
    out
}

fn uid_of(key: &str) -> StoreResult<EndDeviceIdentifiers> {
    parse_device_uid(key)
        .map_err(|_| StoreError::corruption(format!("invalid device UID `{key}` in index")))
}

/// Device registry on top of a [`ProtoStore`].
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    store: ProtoStore,
    keys: RegistryKeys,
}

impl DeviceRegistry {
    pub fn new(store: ProtoStore, root: Namespace) -> Self {
        Self {
            store,
            keys: RegistryKeys::new(root),
        }
    }

    pub fn keys(&self) -> &RegistryKeys {
        &self.keys
    }

    pub fn backend(&self) -> &SharedBackend {
        self.store.backend()
    }

    fn device_ids(app: &ApplicationIdentifiers, dev_id: &str) -> StoreResult<EndDeviceIdentifiers> {
        let ids = EndDeviceIdentifiers::new(app.application_id.clone(), dev_id);
        ids.validate()?;
        Ok(ids)
    }

    /// Fetch a device, projected on `paths`.
    pub async fn get_by_id<S: AsRef<str>>(
        &self,
        ctx: &Context,
        app: &ApplicationIdentifiers,
        dev_id: &str,
        paths: &[S],
    ) -> StoreResult<EndDevice> {
        let ids = Self::device_ids(app, dev_id)?;
        validate_paths(paths)?;
        let dev: EndDevice = self
            .store
            .get_proto(ctx, &self.keys.uid(&ids.unique_id()))
            .await?;
        project(&dev, &with_ids(paths))
    }

    /// Fetch several devices of one application in one consistent read.
    ///
    /// Missing devices are `None`, in the order of `dev_ids`.
    pub async fn batch_get_by_id<S: AsRef<str>>(
        &self,
        ctx: &Context,
        app: &ApplicationIdentifiers,
        dev_ids: &[String],
        paths: &[S],
    ) -> StoreResult<Vec<Option<EndDevice>>> {
        app.validate()?;
        validate_paths(paths)?;
        if dev_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut reads = Vec::with_capacity(dev_ids.len());
        for dev_id in dev_ids {
            validate_id("device ID", dev_id)?;
            reads.push(Read::get(
                self.keys.uid(&device_uid(&app.application_id, dev_id)),
            ));
        }
        let paths = with_ids(paths);
        ctx.run(self.backend().read(reads))
            .await?
            .into_iter()
            .map(|reply| match reply.into_value()? {
                Some(bytes) => project(&codec::decode::<EndDevice>(&bytes)?, &paths).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    /// Fetch the device registered with `join_eui` and `dev_eui`.
    pub async fn get_by_eui<S: AsRef<str>>(
        &self,
        ctx: &Context,
        join_eui: Eui64,
        dev_eui: Eui64,
        paths: &[S],
    ) -> StoreResult<EndDevice> {
        validate_paths(paths)?;
        let dev: EndDevice = self
            .store
            .find_proto(ctx, &self.keys.eui(join_eui, dev_eui), |uid| {
                Ok(self.keys.uid(&uid_of(uid)?.unique_id()))
            })
            .await?;
        project(&dev, &with_ids(paths))
    }

    /// Create, update or delete a device.
    ///
    /// `mutator` receives the stored device projected on `gets` (or `None`)
    /// and returns the new device with the paths it sets, or `None` to
    /// delete. It is re-run when the device changes concurrently, so it
    /// must be pure. Returns the written device projected on `gets`.
    pub async fn set_by_id<S, F>(
        &self,
        ctx: &Context,
        app: &ApplicationIdentifiers,
        dev_id: &str,
        gets: &[S],
        mutator: F,
    ) -> StoreResult<Option<EndDevice>>
    where
        S: AsRef<str>,
        F: FnMut(Option<&EndDevice>) -> StoreResult<(Option<EndDevice>, Vec<String>)> + Send,
    {
        let ids = Self::device_ids(app, dev_id)?;
        validate_paths(gets)?;
        let gets = with_ids(gets);
        let uid = ids.unique_id();
        let uid_key = self.keys.uid(&uid);
        let mutator = parking_lot::Mutex::new(mutator);

        self.store
            .locked_watch(ctx, &uid_key, &holder_id(), |txn| {
                let (ids, gets, uid_key, mutator) = (&ids, &gets, &uid_key, &mutator);
                async move {
                    let stored = match txn.get(uid_key.as_str()).await? {
                        Some(bytes) => Some(codec::decode::<EndDevice>(&bytes)?),
                        None => None,
                    };
                    let input = stored.as_ref().map(|d| project(d, gets)).transpose()?;
                    let (updated, sets) = {
                        let mut guard = mutator.lock();
                        let f = &mut *guard;
                        f(input.as_ref())?
                    };
                    self.mutation(&txn, ids, stored, updated, &sets, gets).await
                }
            })
            .await
    }

    async fn mutation(
        &self,
        txn: &Txn,
        ids: &EndDeviceIdentifiers,
        stored: Option<EndDevice>,
        updated: Option<EndDevice>,
        sets: &[String],
        gets: &[String],
    ) -> StoreResult<(Pipeline, Option<EndDevice>)> {
        let uid = ids.unique_id();
        let update = match (stored.as_ref(), updated) {
            (None, None) => return Ok((Pipeline::new(), None)),
            (Some(stored), None) => {
                let pipe = self.delete_ops(txn, &uid, stored).await?;
                tracing::debug!(device = %uid, "deleting device");
                return Ok((pipe, None));
            }
            (_, Some(update)) => update,
        };

        validate_paths(sets)?;
        check_writable(sets, stored.is_none())?;
        let now = Utc::now();
        let base = stored.clone().unwrap_or_default();
        let mut merged = set_fields(&base, &update, sets)?;
        let mut pipe = Pipeline::new();
        match &stored {
            None => {
                if merged.ids.application_ids != ids.application_ids
                    || merged.ids.device_id != ids.device_id
                {
                    return Err(StoreError::invalid_identifiers(format!(
                        "created device `{}` does not match `{uid}`",
                        merged.ids.unique_id()
                    )));
                }
                merged.ids.validate()?;
                merged.created_at = Some(now);
                if let Some((join_eui, dev_eui)) = merged.ids.euis() {
                    let eui_key = self.keys.eui(join_eui, dev_eui);
                    txn.watch(vec![eui_key.clone()]).await?;
                    if let Some(owner) = txn.get(eui_key.as_str()).await? {
                        if owner.as_ref() != uid.as_bytes() {
                            return Err(StoreError::already_exists(format!(
                                "device with JoinEUI {join_eui} and DevEUI {dev_eui}"
                            )));
                        }
                    }
                    pipe.set(eui_key, uid.clone());
                }
            }
            Some(stored) => merged.created_at = stored.created_at,
        }
        merged.updated_at = Some(now);

        self.relay_ops(txn, &uid, stored.as_ref(), Some(&merged), &mut pipe)
            .await?;
        pipe.extend(session_index_ops(
            &self.keys,
            &uid,
            stored.as_ref(),
            Some(&merged),
            unix_nanos(now),
        )?);
        pipe.set(self.keys.uid(&uid), codec::encode(&merged)?);
        Ok((pipe, Some(project(&merged, gets)?)))
    }

    /// Writes removing `stored` and all of its index entries.
    async fn delete_ops(&self, txn: &Txn, uid: &str, stored: &EndDevice) -> StoreResult<Pipeline> {
        let mut pipe = Pipeline::new();
        pipe.del(self.keys.uid(uid));
        if let Some((join_eui, dev_eui)) = stored.ids.euis() {
            pipe.del(self.keys.eui(join_eui, dev_eui));
        }
        self.relay_ops(txn, uid, Some(stored), None, &mut pipe).await?;
        pipe.extend(session_index_ops(&self.keys, uid, Some(stored), None, 0)?);
        Ok(pipe)
    }

    /// Claim the relay markers `updated` serves and release those it no
    /// longer serves.
    async fn relay_ops(
        &self,
        txn: &Txn,
        uid: &str,
        stored: Option<&EndDevice>,
        updated: Option<&EndDevice>,
        pipe: &mut Pipeline,
    ) -> StoreResult<()> {
        let old = stored.map(EndDevice::served_device_uids).unwrap_or_default();
        let new = updated.map(EndDevice::served_device_uids).unwrap_or_default();
        let changed: Vec<(&String, bool)> = new
            .difference(&old)
            .map(|served| (served, true))
            .chain(old.difference(&new).map(|served| (served, false)))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }
        let marker_keys: Vec<String> = changed
            .iter()
            .map(|(served, _)| self.keys.relay_rule(served))
            .collect();
        txn.watch(marker_keys.clone()).await?;
        let owners = txn
            .read(marker_keys.iter().map(Read::get).collect())
            .await?;
        for (((served, added), key), owner) in changed.into_iter().zip(marker_keys).zip(owners) {
            let owner = owner.into_value()?;
            let owned_by_self = owner.as_deref() == Some(uid.as_bytes());
            if added {
                if let Some(owner) = owner.filter(|_| !owned_by_self) {
                    return Err(StoreError::RelayServed {
                        served: served.clone(),
                        serving: String::from_utf8_lossy(&owner).into_owned(),
                    });
                }
                pipe.set(key, uid.to_string());
            } else if owned_by_self {
                pipe.del(key);
            }
        }
        Ok(())
    }

    /// Delete devices of one application with all their index entries.
    ///
    /// Returns the identifiers of the devices that existed.
    pub async fn batch_delete(
        &self,
        ctx: &Context,
        app: &ApplicationIdentifiers,
        dev_ids: &[String],
    ) -> StoreResult<Vec<EndDeviceIdentifiers>> {
        app.validate()?;
        let mut uids = Vec::with_capacity(dev_ids.len());
        for dev_id in dev_ids {
            validate_id("device ID", dev_id)?;
            uids.push(device_uid(&app.application_id, dev_id));
        }
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = uids.iter().map(|uid| self.keys.uid(uid)).collect();

        for attempt in 1..=self.store.max_attempts() {
            let txn = ctx.run(self.backend().watch(keys.clone())).await?;
            let res = self.batch_delete_in(ctx, &txn, &uids, &keys).await;
            let (pipe, deleted) = match res {
                Ok(res) => res,
                Err(e) => {
                    let _ = txn.discard().await;
                    return Err(e);
                }
            };
            if pipe.is_empty() {
                txn.discard().await?;
                return Ok(deleted);
            }
            match ctx.run(txn.commit(pipe.into_ops())).await {
                Ok(_) => {
                    tracing::debug!(application = %app.application_id, count = deleted.len(), "deleted devices");
                    return Ok(deleted);
                }
                Err(StoreError::Aborted) => {
                    tracing::debug!(attempt, "batch delete aborted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Aborted)
    }

    async fn batch_delete_in(
        &self,
        ctx: &Context,
        txn: &Txn,
        uids: &[String],
        keys: &[String],
    ) -> StoreResult<(Pipeline, Vec<EndDeviceIdentifiers>)> {
        let replies = ctx
            .run(txn.read(keys.iter().map(Read::get).collect()))
            .await?;
        let mut pipe = Pipeline::new();
        let mut deleted = Vec::new();
        for (uid, reply) in uids.iter().zip(replies) {
            let Some(bytes) = reply.into_value()? else {
                continue;
            };
            let stored: EndDevice = codec::decode(&bytes)?;
            pipe.extend(ctx.run(self.delete_ops(txn, uid, &stored)).await?);
            deleted.push(uid_of(uid)?);
        }
        Ok((pipe, deleted))
    }

    /// Iterate over device keys in batches of about `batch`.
    pub fn device_keys(&self, batch: usize) -> DeviceKeyIter {
        DeviceKeyIter::new(self.backend().clone(), self.keys.root().clone(), batch)
    }

    /// Call `f` with every device, projected on `paths`, until it returns
    /// false.
    pub async fn range<S, F>(&self, ctx: &Context, paths: &[S], batch: usize, mut f: F) -> StoreResult<()>
    where
        S: AsRef<str>,
        F: FnMut(EndDevice) -> bool,
    {
        validate_paths(paths)?;
        let paths = with_ids(paths);
        let mut iter = self.device_keys(batch);
        while let Some(ids) = iter.next_batch(ctx).await? {
            let reads = ids
                .iter()
                .map(|ids| Read::get(self.keys.uid(&ids.unique_id())))
                .collect();
            for reply in ctx.run(self.backend().read(reads)).await? {
                // Deleted since the scan.
                let Some(bytes) = reply.into_value()? else {
                    continue;
                };
                let dev = project(&codec::decode::<EndDevice>(&bytes)?, &paths)?;
                if !f(dev) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Offer the devices that may have sent `up` to `f`, most likely first,
    /// until `f` returns true.
    ///
    /// Current sessions are offered before pending ones; pending sessions
    /// are only considered for uplinks without the ACK bit. Fails with
    /// `NoUplinkMatch` if `f` accepts no candidate.
    pub async fn range_by_uplink_matches<F>(&self, ctx: &Context, up: &UplinkMessage, mut f: F) -> StoreResult<()>
    where
        F: FnMut(UplinkMatchCandidate) -> StoreResult<bool>,
    {
        let addr = up.dev_addr;
        let lsb = up.f_cnt_lsb();
        let mut reads = vec![
            Read::ZRangeWithScores {
                key: self.keys.addr_current(addr),
                rev: true,
            },
            Read::HGetAll {
                key: self.keys.addr_current_fields(addr),
            },
        ];
        if !up.ack {
            reads.push(Read::ZRangeWithScores {
                key: self.keys.addr_pending(addr),
                rev: true,
            });
            reads.push(Read::HGetAll {
                key: self.keys.addr_pending_fields(addr),
            });
        }
        let mut replies = ctx.run(self.backend().read(reads)).await?.into_iter();
        let mut next = || {
            replies
                .next()
                .ok_or_else(|| StoreError::corruption("missing uplink match reply"))
        };

        let current = pivot(next()?.into_scored()?, lsb);
        let fields = into_field_map(next()?.into_hash()?);
        for (uid, _) in current {
            let Some(data) = fields.get(&uid) else {
                tracing::warn!(device = %uid, dev_addr = %addr, "current session index entry without fields");
                continue;
            };
            let proj = CurrentProjection::decode(data)?;
            if skip_current_candidate(proj.last_f_cnt, proj.supports_32_bit_f_cnt, proj.resets_f_cnt, up.ack, lsb) {
                continue;
            }
            let candidate = UplinkMatchCandidate {
                ids: uid_of(&uid)?,
                lorawan_version: proj.lorawan_version,
                f_nwk_s_int_key: proj.f_nwk_s_int_key,
                last_f_cnt: proj.last_f_cnt,
                resets_f_cnt: proj.resets_f_cnt,
                supports_32_bit_f_cnt: proj.supports_32_bit_f_cnt,
                is_pending: false,
            };
            if f(candidate)? {
                return Ok(());
            }
        }

        if !up.ack {
            let pending = next()?.into_scored()?;
            let fields = into_field_map(next()?.into_hash()?);
            for (uid, _) in pending {
                let Some(data) = fields.get(&uid) else {
                    tracing::warn!(device = %uid, dev_addr = %addr, "pending session index entry without fields");
                    continue;
                };
                let proj = PendingProjection::decode(data)?;
                let candidate = UplinkMatchCandidate {
                    ids: uid_of(&uid)?,
                    lorawan_version: proj.lorawan_version,
                    f_nwk_s_int_key: proj.f_nwk_s_int_key,
                    last_f_cnt: 0,
                    resets_f_cnt: None,
                    supports_32_bit_f_cnt: None,
                    is_pending: true,
                };
                if f(candidate)? {
                    return Ok(());
                }
            }
        }
        Err(StoreError::NoUplinkMatch)
    }

    /// Remove EUI, DevAddr and relay index entries pointing at devices that
    /// no longer exist, or (with `dry_run`) only count them.
    pub async fn prune(&self, ctx: &Context, page_size: usize, dry_run: bool) -> StoreResult<PruneReport> {
        let mut report = PruneReport::default();
        let root = self.keys.root();
        let mut cursor = 0;
        loop {
            let page = ctx
                .run(self.backend().scan(cursor, root.pattern("*"), page_size))
                .await?;
            for key in page.keys {
                let Some(rest) = root.strip(&key) else {
                    continue;
                };
                let segments: Vec<&str> = rest.split(':').collect();
                match segments.as_slice() {
                    ["eui", _, _] | ["relay", "rules", _] => {
                        self.prune_marker(ctx, &key, dry_run, &mut report).await?
                    }
                    ["addr", _, "current" | "pending"] => {
                        self.prune_index(ctx, &key, dry_run, &mut report).await?
                    }
                    _ => {}
                }
            }
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        tracing::info!(
            root = %root.root(),
            markers = report.markers,
            index_entries = report.index_entries,
            dry_run,
            "pruned device indices"
        );
        Ok(report)
    }

    async fn prune_marker(
        &self,
        ctx: &Context,
        key: &str,
        dry_run: bool,
        report: &mut PruneReport,
    ) -> StoreResult<()> {
        let txn = ctx.run(self.backend().watch(vec![key.to_string()])).await?;
        let res = async {
            let Some(owner) = txn.get(key).await? else {
                return Ok(Pipeline::new());
            };
            let owner = String::from_utf8_lossy(&owner).into_owned();
            let record = self.keys.uid(&owner);
            txn.watch(vec![record.clone()]).await?;
            let mut pipe = Pipeline::new();
            if txn.get(record.as_str()).await?.is_none() {
                tracing::debug!(key = %key, device = %owner, "dangling index marker");
                pipe.del(key.to_string());
            }
            Ok::<_, StoreError>(pipe)
        };
        let pipe = match ctx.run(res).await {
            Ok(pipe) => pipe,
            Err(e) => {
                let _ = txn.discard().await;
                return Err(e);
            }
        };
        if pipe.is_empty() {
            return txn.discard().await;
        }
        report.markers += 1;
        if dry_run {
            return txn.discard().await;
        }
        match ctx.run(txn.commit(pipe.into_ops())).await {
            Ok(_) | Err(StoreError::Aborted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn prune_index(
        &self,
        ctx: &Context,
        key: &str,
        dry_run: bool,
        report: &mut PruneReport,
    ) -> StoreResult<()> {
        let fields_key = format!("{key}:fields");
        let members = ctx
            .run(crate::store::read_one(
                self.backend().as_ref(),
                Read::ZRangeWithScores {
                    key: key.to_string(),
                    rev: false,
                },
            ))
            .await?
            .into_scored()?;
        if members.is_empty() {
            return Ok(());
        }
        let records: Vec<String> = members.iter().map(|(uid, _)| self.keys.uid(uid)).collect();
        let txn = ctx.run(self.backend().watch(records.clone())).await?;
        let exists = match ctx.run(txn.read(records.iter().map(Read::get).collect())).await {
            Ok(replies) => replies,
            Err(e) => {
                let _ = txn.discard().await;
                return Err(e);
            }
        };
        let mut pipe = Pipeline::new();
        for ((uid, _), reply) in members.iter().zip(exists) {
            if reply.into_value()?.is_none() {
                pipe.zrem(key.to_string(), uid.clone());
                pipe.hdel(fields_key.clone(), uid.clone());
            }
        }
        if pipe.is_empty() {
            return txn.discard().await;
        }
        report.index_entries += pipe.len() / 2;
        if dry_run {
            return txn.discard().await;
        }
        match ctx.run(txn.commit(pipe.into_ops())).await {
            Ok(_) | Err(StoreError::Aborted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Rewrite the `:fields` projections of every device.
    pub async fn rebuild_session_fields(&self, ctx: &Context, batch: usize) -> StoreResult<usize> {
        let mut iter = self.device_keys(batch);
        let mut count = 0;
        while let Some(ids) = iter.next_batch(ctx).await? {
            let uids: Vec<String> = ids.iter().map(EndDeviceIdentifiers::unique_id).collect();
            let reads = uids.iter().map(|uid| Read::get(self.keys.uid(uid))).collect();
            let replies = ctx.run(self.backend().read(reads)).await?;
            let mut pipe = Pipeline::new();
            for (uid, reply) in uids.iter().zip(replies) {
                let Some(bytes) = reply.into_value()? else {
                    continue;
                };
                let dev: EndDevice = codec::decode(&bytes)?;
                pipe.extend(session_fields_ops(&self.keys, uid, &dev)?);
                count += 1;
            }
            if !pipe.is_empty() {
                ctx.run(self.backend().exec(pipe.into_ops())).await?;
            }
        }
        Ok(count)
    }

    /// Delete every `:fields` projection hash.
    pub async fn drop_session_fields(&self, ctx: &Context, page_size: usize) -> StoreResult<usize> {
        let root = self.keys.root();
        let mut cursor = 0;
        let mut count = 0;
        loop {
            let page = ctx
                .run(self.backend().scan(cursor, root.pattern("addr:*:fields"), page_size))
                .await?;
            if !page.keys.is_empty() {
                count += page.keys.len();
                let mut pipe = Pipeline::new();
                for key in page.keys {
                    pipe.del(key);
                }
                ctx.run(self.backend().exec(pipe.into_ops())).await?;
            }
            cursor = page.cursor;
            if cursor == 0 {
                return Ok(count);
            }
        }
    }
}

fn into_field_map(fields: Vec<(String, Bytes)>) -> HashMap<String, Bytes> {
    fields.into_iter().collect()
}

/// What [`DeviceRegistry::prune`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// EUI and relay markers pointing at missing devices.
    pub markers: usize,
    /// DevAddr index members of missing devices.
    pub index_entries: usize,
}

/// Restartable iterator over the device keys of a registry.
///
/// Keys under the registry root that are not device records (locks,
/// indices) are skipped.
#[derive(Debug)]
pub struct DeviceKeyIter {
    backend: SharedBackend,
    root: Namespace,
    batch: usize,
    cursor: u64,
    exhausted: bool,
}

impl DeviceKeyIter {
    pub fn new(backend: SharedBackend, root: Namespace, batch: usize) -> Self {
        Self::resume(backend, root, batch, 0)
    }

    /// Continue a scan from a cursor returned by [`DeviceKeyIter::cursor`].
    pub fn resume(backend: SharedBackend, root: Namespace, batch: usize, cursor: u64) -> Self {
        Self {
            backend,
            root,
            batch: batch.max(1),
            cursor,
            exhausted: false,
        }
    }

    /// Cursor of the next batch; 0 before the first batch and after the last.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Start over from the beginning.
    pub fn restart(&mut self) {
        self.cursor = 0;
        self.exhausted = false;
    }

    /// The next non-empty batch of device identifiers, or `None` when the
    /// scan is complete.
    pub async fn next_batch(&mut self, ctx: &Context) -> StoreResult<Option<Vec<EndDeviceIdentifiers>>> {
        while !self.exhausted {
            let page = ctx
                .run(self.backend.scan(self.cursor, self.root.pattern("uid:*"), self.batch))
                .await?;
            self.cursor = page.cursor;
            self.exhausted = page.cursor == 0;
            let ids: Vec<EndDeviceIdentifiers> = page
                .keys
                .iter()
                .filter_map(|key| self.device_ids_of(key))
                .collect();
            if !ids.is_empty() {
                return Ok(Some(ids));
            }
        }
        Ok(None)
    }

    fn device_ids_of(&self, key: &str) -> Option<EndDeviceIdentifiers> {
        let uid = self.root.strip(key)?.strip_prefix("uid:")?;
        if uid.contains(':') {
            return None;
        }
        parse_device_uid(uid).ok()
    }
}

/// UIDs of the devices currently indexed under `addr`, for diagnostics.
pub async fn indexed_uids(
    ctx: &Context,
    registry: &DeviceRegistry,
    addr: DevAddr,
) -> StoreResult<BTreeSet<String>> {
    let replies = ctx
        .run(registry.backend().read(vec![
            Read::ZRangeWithScores {
                key: registry.keys().addr_current(addr),
                rev: false,
            },
            Read::ZRangeWithScores {
                key: registry.keys().addr_pending(addr),
                rev: false,
            },
        ]))
        .await?;
    let mut uids = BTreeSet::new();
    for reply in replies {
        uids.extend(reply.into_scored()?.into_iter().map(|(uid, _)| uid));
    }
    Ok(uids)
}
