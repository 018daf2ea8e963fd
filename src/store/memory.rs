//! In-memory backend.
//!
//! A process-local model of the store with the same observable semantics
//! the components rely on: strings with TTL, lists, sorted sets, hashes and
//! streams with consumer groups. Blocking reads are woken by a notifier on
//! every write. Watched transactions compare per-key versions, which are
//! kept even after a key is deleted so a delete still aborts a watcher.

use super::keys::{glob_match, LockKeys};
use super::{
    Backend, Fields, LockAttempt, Op, OpReply, Read, ReadReply, ScanPage, StoreFuture,
    StreamEntry, StreamId, StreamRead, Txn, WatchSession,
};
use crate::core::error::{StoreError, StoreResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

type ZSet = HashMap<String, f64>;
type Hash = BTreeMap<String, Bytes>;

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
    consumers: HashSet<String>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug)]
enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
    ZSet(ZSet),
    Hash(Hash),
    Stream(Stream),
}

impl Value {
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::List(l) => l.is_empty(),
            Value::ZSet(z) => z.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::Str(_) | Value::Stream(_) => false,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

fn wrong_type() -> StoreError {
    StoreError::corruption("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn no_group(key: &str, group: &str) -> StoreError {
    StoreError::not_found(format!("consumer group `{group}` on stream `{key}`"))
}

macro_rules! typed_access {
    ($get:ident, $get_or_default:ident, $variant:ident, $ty:ty) => {
        fn $get(&mut self, key: &str) -> StoreResult<Option<&mut $ty>> {
            self.expire(key);
            match self.entries.get_mut(key) {
                None => Ok(None),
                Some(Entry {
                    value: Value::$variant(v),
                    ..
                }) => Ok(Some(v)),
                Some(_) => Err(wrong_type()),
            }
        }

        #[allow(dead_code)]
        fn $get_or_default(&mut self, key: &str) -> StoreResult<&mut $ty> {
            self.expire(key);
            let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::$variant(Default::default()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::$variant(v) => Ok(v),
                _ => Err(wrong_type()),
            }
        }
    };
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    clock: u64,
    cursors: HashMap<u64, String>,
    next_cursor: u64,
}

impl State {
    typed_access!(string, string_or_default, Str, Bytes);
    typed_access!(list, list_or_default, List, VecDeque<Bytes>);
    typed_access!(zset, zset_or_default, ZSet, ZSet);
    typed_access!(hash, hash_or_default, Hash, Hash);
    typed_access!(stream, stream_or_default, Stream, Stream);

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn expire(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn exists(&mut self, key: &str) -> bool {
        self.expire(key);
        self.entries.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expire(key);
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.touch(key);
        }
        removed
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.value.is_empty_collection())
        {
            self.entries.remove(key);
        }
    }

    fn set_string(&mut self, key: &str, value: Bytes, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        self.touch(key);
    }

    fn get_string(&mut self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.string(key)?.cloned())
    }

    fn pexpire(&mut self, key: &str, ttl: Duration) -> bool {
        if !self.exists(key) {
            return false;
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        self.touch(key);
        true
    }

    fn rpush(&mut self, key: &str, values: Vec<Bytes>) -> StoreResult<usize> {
        if values.is_empty() {
            return Ok(self.list(key)?.map_or(0, |l| l.len()));
        }
        let list = self.list_or_default(key)?;
        list.extend(values);
        let len = list.len();
        self.touch(key);
        Ok(len)
    }

    fn lpop(&mut self, key: &str) -> StoreResult<Option<Bytes>> {
        let popped = match self.list(key)? {
            Some(list) => list.pop_front(),
            None => None,
        };
        if popped.is_some() {
            self.drop_if_empty(key);
            self.touch(key);
        }
        Ok(popped)
    }

    fn read(&mut self, read: &Read) -> StoreResult<ReadReply> {
        match read {
            Read::Get { key } => Ok(ReadReply::Value(self.get_string(key)?)),
            Read::ZRangeWithScores { key, rev } => {
                let members = self.zset(key)?.map(|z| sorted(z, *rev)).unwrap_or_default();
                Ok(ReadReply::Scored(members))
            }
            Read::ZRangeByScore { key, max, limit } => {
                let members = self
                    .zset(key)?
                    .map(|z| {
                        sorted(z, false)
                            .into_iter()
                            .filter(|(_, score)| score <= max)
                            .take(limit.unwrap_or(usize::MAX))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ReadReply::Scored(members))
            }
            Read::HGetAll { key } => {
                let fields = self
                    .hash(key)?
                    .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                Ok(ReadReply::Hash(fields))
            }
            Read::LRange { key } => {
                let items = self
                    .list(key)?
                    .map(|l| l.iter().cloned().collect())
                    .unwrap_or_default();
                Ok(ReadReply::List(items))
            }
            Read::PTtl { key } => {
                self.expire(key);
                let ttl = self
                    .entries
                    .get(key)
                    .and_then(|e| e.expires_at)
                    .map(|at| at.saturating_duration_since(Instant::now()));
                Ok(ReadReply::Ttl(ttl))
            }
            Read::XLen { key } => {
                let len = self.stream(key)?.map_or(0, |s| s.entries.len() as u64);
                Ok(ReadReply::Len(len))
            }
        }
    }

    fn apply(&mut self, op: Op) -> StoreResult<OpReply> {
        match op {
            Op::Set { key, value, ttl } => {
                self.set_string(&key, value, ttl);
                Ok(OpReply::Ok)
            }
            Op::Del { key } => Ok(OpReply::Int(self.remove(&key) as i64)),
            Op::PExpire { key, ttl } => Ok(OpReply::Int(self.pexpire(&key, ttl) as i64)),
            Op::GetDel { key } => {
                let value = self.get_string(&key)?;
                if value.is_some() {
                    self.remove(&key);
                }
                Ok(OpReply::Value(value))
            }
            Op::ZAdd {
                key,
                member,
                score,
                only_new,
            } => {
                let zset = self.zset_or_default(&key)?;
                let added = match zset.get(&member).copied() {
                    Some(_) if only_new => return Ok(OpReply::Int(0)),
                    Some(existing) if existing == score => return Ok(OpReply::Int(0)),
                    Some(_) => {
                        zset.insert(member, score);
                        0
                    }
                    None => {
                        zset.insert(member, score);
                        1
                    }
                };
                self.touch(&key);
                Ok(OpReply::Int(added))
            }
            Op::ZRem { key, member } => {
                let removed = match self.zset(&key)? {
                    Some(zset) => zset.remove(&member).is_some(),
                    None => false,
                };
                if removed {
                    self.drop_if_empty(&key);
                    self.touch(&key);
                }
                Ok(OpReply::Int(removed as i64))
            }
            Op::HSet { key, field, value } => {
                let added = self.hash_or_default(&key)?.insert(field, value).is_none();
                self.touch(&key);
                Ok(OpReply::Int(added as i64))
            }
            Op::HDel { key, field } => {
                let removed = match self.hash(&key)? {
                    Some(hash) => hash.remove(&field).is_some(),
                    None => false,
                };
                if removed {
                    self.drop_if_empty(&key);
                    self.touch(&key);
                }
                Ok(OpReply::Int(removed as i64))
            }
            Op::RPush { key, values } => Ok(OpReply::Int(self.rpush(&key, values)? as i64)),
            Op::XAdd {
                key,
                max_len,
                fields,
            } => {
                let stream = self.stream_or_default(&key)?;
                let id = next_stream_id(stream.last_id);
                stream.last_id = id;
                stream.entries.insert(id, fields);
                if let Some(max_len) = max_len {
                    while stream.entries.len() > max_len {
                        stream.entries.pop_first();
                    }
                }
                self.touch(&key);
                Ok(OpReply::Id(id))
            }
            Op::XAck { key, group, ids } => {
                let acked = match self.stream(&key)?.and_then(|s| s.groups.get_mut(&group)) {
                    Some(g) => ids
                        .iter()
                        .filter(|id| g.pending.remove(*id).is_some())
                        .count(),
                    None => 0,
                };
                Ok(OpReply::Int(acked as i64))
            }
            Op::XDel { key, ids } => {
                let deleted = match self.stream(&key)? {
                    Some(stream) => ids
                        .iter()
                        .filter(|id| stream.entries.remove(*id).is_some())
                        .count(),
                    None => 0,
                };
                if deleted > 0 {
                    self.touch(&key);
                }
                Ok(OpReply::Int(deleted as i64))
            }
        }
    }

    fn xgroup_create(&mut self, key: &str, group: &str) -> StoreResult<()> {
        let created = !self.exists(key);
        self.stream_or_default(key)?
            .groups
            .entry(group.to_string())
            .or_default();
        if created {
            self.touch(key);
        }
        Ok(())
    }

    fn xgroup_del_consumer(&mut self, key: &str, group: &str, consumer: &str) -> StoreResult<()> {
        let group_state = self
            .stream(key)?
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(key, group))?;
        group_state.consumers.remove(consumer);
        group_state.pending.retain(|_, p| p.consumer != consumer);
        Ok(())
    }

    fn xreadgroup(
        &mut self,
        group: &str,
        consumer: &str,
        keys: &[String],
        count: usize,
    ) -> StoreResult<Vec<StreamRead>> {
        let now = Instant::now();
        let mut reads = Vec::new();
        for key in keys {
            let stream = self.stream(key)?.ok_or_else(|| no_group(key, group))?;
            let group_state = stream
                .groups
                .get_mut(group)
                .ok_or_else(|| no_group(key, group))?;
            group_state.consumers.insert(consumer.to_string());
            let entries: Vec<StreamEntry> = stream
                .entries
                .range(group_state.last_delivered.next()..)
                .take(count)
                .map(|(id, fields)| StreamEntry {
                    id: *id,
                    fields: fields.clone(),
                })
                .collect();
            if let Some(last) = entries.last() {
                group_state.last_delivered = last.id;
            }
            for entry in &entries {
                group_state.pending.insert(
                    entry.id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                    },
                );
            }
            if !entries.is_empty() {
                reads.push(StreamRead {
                    key: key.clone(),
                    entries,
                });
            }
        }
        Ok(reads)
    }

    fn xpending_entries(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let stream = self.stream(key)?.ok_or_else(|| no_group(key, group))?;
        let entries = &stream.entries;
        let group_state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(key, group))?;
        group_state.consumers.insert(consumer.to_string());
        Ok(group_state
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .filter_map(|(id, _)| {
                entries.get(id).map(|fields| StreamEntry {
                    id: *id,
                    fields: fields.clone(),
                })
            })
            .take(count)
            .collect())
    }

    fn xautoclaim(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let stream = self.stream(key)?.ok_or_else(|| no_group(key, group))?;
        let group_state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(key, group))?;
        group_state.consumers.insert(consumer.to_string());
        let idle: Vec<StreamId> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .collect();
        let mut claimed = Vec::new();
        for id in idle {
            if claimed.len() >= count {
                break;
            }
            match stream.entries.get(&id) {
                Some(fields) => {
                    if let Some(pending) = group_state.pending.get_mut(&id) {
                        pending.consumer = consumer.to_string();
                        pending.delivered_at = now;
                    }
                    claimed.push(StreamEntry {
                        id,
                        fields: fields.clone(),
                    });
                }
                None => {
                    group_state.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> ScanPage {
        let now = Instant::now();
        let after = match cursor {
            0 => None,
            c => self.cursors.remove(&c),
        };
        let mut live: Vec<&String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(true, |at| at > now))
            .map(|(k, _)| k)
            .filter(|k| after.as_ref().map_or(true, |a| *k > a))
            .collect();
        live.sort();
        let examined: Vec<String> = live.into_iter().take(count.max(1)).cloned().collect();
        let done = examined.len() < count.max(1);
        let keys = examined
            .iter()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let cursor = match examined.last() {
            Some(last) if !done => {
                self.next_cursor += 1;
                self.cursors.insert(self.next_cursor, last.clone());
                self.next_cursor
            }
            _ => 0,
        };
        ScanPage { cursor, keys }
    }

    fn live_keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(true, |at| at > now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

fn sorted(zset: &ZSet, rev: bool) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    if rev {
        members.reverse();
    }
    members
}

fn next_stream_id(last: StreamId) -> StreamId {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    if ms > last.ms {
        StreamId::new(ms, 0)
    } else {
        last.next()
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().live_keys()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let res = f(&mut *self.inner.state.lock());
        self.inner.notify.notify_waiters();
        res
    }

    /// Poll `f` until it yields a value or `wait` elapses.
    async fn wait_for<T, F>(&self, wait: Option<Duration>, mut f: F) -> StoreResult<Option<T>>
    where
        F: FnMut(&mut State) -> StoreResult<Option<T>> + Send,
    {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let polled = {
                let mut state = self.inner.state.lock();
                f(&mut *state)?
            };
            if polled.is_some() {
                return Ok(polled);
            }
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }
}

impl Backend for MemoryBackend {
    fn read(&self, reads: Vec<Read>) -> StoreFuture<'_, Vec<ReadReply>> {
        let res: StoreResult<Vec<ReadReply>> = {
            let mut state = self.inner.state.lock();
            reads.iter().map(|r| state.read(r)).collect()
        };
        Box::pin(async move { res })
    }

    fn exec(&self, ops: Vec<Op>) -> StoreFuture<'_, Vec<OpReply>> {
        let res: StoreResult<Vec<OpReply>> =
            self.with_state(|state| ops.into_iter().map(|op| state.apply(op)).collect());
        Box::pin(async move { res })
    }

    fn watch(&self, keys: Vec<String>) -> StoreFuture<'_, Txn> {
        let session = MemoryTxn {
            inner: self.inner.clone(),
            watched: Mutex::new(HashMap::new()),
        };
        session.record(keys);
        Box::pin(async move { Ok(Txn::new(Arc::new(session))) })
    }

    fn scan(&self, cursor: u64, pattern: String, count: usize) -> StoreFuture<'_, ScanPage> {
        let page = self.inner.state.lock().scan(cursor, &pattern, count);
        Box::pin(async move { Ok(page) })
    }

    fn lock_acquire(
        &self,
        keys: LockKeys,
        id: String,
        ttl: Duration,
    ) -> StoreFuture<'_, LockAttempt> {
        let res = self.with_state(|state| {
            if !state.exists(&keys.lock) {
                state.set_string(&keys.lock, Bytes::from(id), Some(ttl));
                state.remove(&keys.list);
                return Ok(LockAttempt::Acquired);
            }
            let remaining = state
                .entries
                .get(&keys.lock)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            Ok(LockAttempt::Held { remaining })
        });
        Box::pin(async move { res })
    }

    fn lock_take_over(
        &self,
        keys: LockKeys,
        token: String,
        id: String,
        ttl: Duration,
    ) -> StoreFuture<'_, bool> {
        let res = self.with_state(|state| {
            if state.get_string(&keys.lock)?.as_deref() != Some(token.as_bytes()) {
                return Ok(false);
            }
            state.set_string(&keys.lock, Bytes::from(id), Some(ttl));
            Ok(true)
        });
        Box::pin(async move { res })
    }

    fn lock_release(&self, keys: LockKeys, id: String, ttl: Duration) -> StoreFuture<'_, bool> {
        let res = self.with_state(|state| {
            if state.get_string(&keys.lock)?.as_deref() != Some(id.as_bytes()) {
                return Ok(false);
            }
            state.rpush(&keys.list, vec![Bytes::from(id)])?;
            state.pexpire(&keys.lock, ttl);
            state.pexpire(&keys.list, ttl);
            Ok(true)
        });
        Box::pin(async move { res })
    }

    fn lock_pass_on(&self, keys: LockKeys, token: String, ttl: Duration) -> StoreFuture<'_, bool> {
        let res = self.with_state(|state| {
            if state.get_string(&keys.lock)?.as_deref() != Some(token.as_bytes()) {
                return Ok(false);
            }
            state
                .list_or_default(&keys.list)?
                .push_front(Bytes::from(token));
            state.touch(&keys.list);
            state.pexpire(&keys.lock, ttl);
            state.pexpire(&keys.list, ttl);
            Ok(true)
        });
        Box::pin(async move { res })
    }

    fn blpop(&self, key: String, wait: Duration) -> StoreFuture<'_, Option<Bytes>> {
        Box::pin(async move { self.wait_for(Some(wait), |state| state.lpop(&key)).await })
    }

    fn deduplicate(
        &self,
        keys: LockKeys,
        window: Duration,
        limit: usize,
        values: Vec<Bytes>,
    ) -> StoreFuture<'_, bool> {
        let res = self.with_state(|state| {
            let first = !state.exists(&keys.lock);
            if first {
                state.set_string(&keys.lock, Bytes::new(), Some(window));
            }
            if !values.is_empty() {
                state.rpush(&keys.list, values)?;
                if let Some(list) = state.list(&keys.list)? {
                    while list.len() > limit {
                        list.pop_front();
                    }
                }
                state.drop_if_empty(&keys.list);
            }
            state.pexpire(&keys.list, window);
            Ok(first)
        });
        Box::pin(async move { res })
    }

    fn xgroup_create(&self, key: String, group: String) -> StoreFuture<'_, ()> {
        let res = self.with_state(|state| state.xgroup_create(&key, &group));
        Box::pin(async move { res })
    }

    fn xgroup_del_consumer(
        &self,
        key: String,
        group: String,
        consumer: String,
    ) -> StoreFuture<'_, ()> {
        let res = self.with_state(|state| state.xgroup_del_consumer(&key, &group, &consumer));
        Box::pin(async move { res })
    }

    fn xreadgroup(
        &self,
        group: String,
        consumer: String,
        keys: Vec<String>,
        count: usize,
        block: Option<Duration>,
    ) -> StoreFuture<'_, Vec<StreamRead>> {
        Box::pin(async move {
            let reads = self
                .wait_for(block, |state| {
                    let reads = state.xreadgroup(&group, &consumer, &keys, count)?;
                    Ok((!reads.is_empty()).then_some(reads))
                })
                .await?;
            Ok(reads.unwrap_or_default())
        })
    }

    fn xpending_entries(
        &self,
        key: String,
        group: String,
        consumer: String,
        count: usize,
    ) -> StoreFuture<'_, Vec<StreamEntry>> {
        let res = self
            .inner
            .state
            .lock()
            .xpending_entries(&key, &group, &consumer, count);
        Box::pin(async move { res })
    }

    fn xautoclaim(
        &self,
        key: String,
        group: String,
        consumer: String,
        min_idle: Duration,
        count: usize,
    ) -> StoreFuture<'_, Vec<StreamEntry>> {
        let res = self
            .inner
            .state
            .lock()
            .xautoclaim(&key, &group, &consumer, min_idle, count);
        Box::pin(async move { res })
    }
}

/// Watched transaction over the in-memory state.
struct MemoryTxn {
    inner: Arc<Inner>,
    watched: Mutex<HashMap<String, u64>>,
}

impl MemoryTxn {
    fn record(&self, keys: Vec<String>) {
        let mut state = self.inner.state.lock();
        let mut watched = self.watched.lock();
        for key in keys {
            state.expire(&key);
            let version = state.version(&key);
            watched.entry(key).or_insert(version);
        }
    }
}

impl WatchSession for MemoryTxn {
    fn watch(&self, keys: Vec<String>) -> StoreFuture<'_, ()> {
        self.record(keys);
        Box::pin(async move { Ok(()) })
    }

    fn read(&self, reads: Vec<Read>) -> StoreFuture<'_, Vec<ReadReply>> {
        let res: StoreResult<Vec<ReadReply>> = {
            let mut state = self.inner.state.lock();
            reads.iter().map(|r| state.read(r)).collect()
        };
        Box::pin(async move { res })
    }

    fn commit(&self, ops: Vec<Op>) -> StoreFuture<'_, Vec<OpReply>> {
        let res: StoreResult<Vec<OpReply>> = {
            let mut state = self.inner.state.lock();
            let watched = std::mem::take(&mut *self.watched.lock());
            let changed = watched.iter().any(|(key, version)| {
                state.expire(key);
                state.version(key) != *version
            });
            if changed {
                Err(StoreError::Aborted)
            } else {
                ops.into_iter().map(|op| state.apply(op)).collect()
            }
        };
        self.inner.notify.notify_waiters();
        Box::pin(async move { res })
    }

    fn discard(&self) -> StoreFuture<'_, ()> {
        self.watched.lock().clear();
        Box::pin(async move { Ok(()) })
    }
}
