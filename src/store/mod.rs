//! Keyed store substrate.
//!
//! Every component talks to the key/value store through the object-safe
//! [`Backend`] trait. Writes are described as pure [`Op`] values and
//! executed atomically; reads are batched as [`Read`] values.
//!
//! ```text
//! ┌──────────────┐   Vec<Op> / Vec<Read>   ┌────────────────┐
//! │ registry,    │ ──────────────────────▶ │ dyn Backend    │
//! │ queues,      │                         │  RedisBackend  │
//! │ matcher ...  │ ◀────────────────────── │  MemoryBackend │
//! └──────────────┘  Vec<OpReply/ReadReply> └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`keys`] - Namespaced key construction
//! - [`codec`] - Record encoding
//! - [`proto`] - Typed get/set/find and locked watched transactions
//! - [`mutex`] - Distributed mutex with handoff
//! - [`dedup`] - Time-windowed deduplication
//! - [`schema`] - Schema version gate and migrations
//! - [`cleanup`] - Removal of orphaned entries
//! - [`memory`] / [`redis`] - Backend implementations

pub mod cleanup;
pub mod codec;
pub mod dedup;
pub mod keys;
pub mod memory;
pub mod mutex;
pub mod proto;
pub mod redis;
pub mod schema;

use crate::core::error::{StoreError, StoreResult};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub use keys::{LockKeys, Namespace};
pub use memory::MemoryBackend;
pub use mutex::MutexGuard;
pub use proto::ProtoStore;
pub use redis::RedisBackend;

/// Boxed future returned by backend methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Shared handle to a backend.
pub type SharedBackend = Arc<dyn Backend>;

/// Field/value pairs of a stream entry.
pub type Fields = Vec<(String, Bytes)>;

/// Stream entry ID (`<ms>-<seq>`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parse `<ms>-<seq>`; a bare `<ms>` means sequence 0.
    pub fn parse(s: &str) -> StoreResult<Self> {
        let bad = || StoreError::corruption(format!("invalid stream ID `{s}`"));
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| bad())?,
                seq: seq.parse().map_err(|_| bad())?,
            }),
            None => Ok(Self {
                ms: s.parse().map_err(|_| bad())?,
                seq: 0,
            }),
        }
    }

    /// The smallest ID after this one.
    pub fn next(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// A stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}

impl StreamEntry {
    /// Value of the first field named `name`.
    pub fn field(&self, name: &str) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
}

/// Entries read from one stream by `XREADGROUP`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRead {
    pub key: String,
    pub entries: Vec<StreamEntry>,
}

/// One page of a key scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    /// Cursor for the next page; 0 when the scan is complete.
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Outcome of a mutex acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Someone else holds the lock for at most `remaining`.
    Held { remaining: Duration },
}

/// A read, executed as part of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Read {
    /// `GET key`
    Get { key: String },
    /// All members with scores, ascending or (`rev`) descending.
    ZRangeWithScores { key: String, rev: bool },
    /// Members with `score <= max`, ascending, at most `limit`.
    ZRangeByScore {
        key: String,
        max: f64,
        limit: Option<usize>,
    },
    /// `HGETALL key`
    HGetAll { key: String },
    /// The whole list.
    LRange { key: String },
    /// `PTTL key`
    PTtl { key: String },
    /// `XLEN key`
    XLen { key: String },
}

impl Read {
    pub fn get(key: impl Into<String>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Get { key }
            | Self::ZRangeWithScores { key, .. }
            | Self::ZRangeByScore { key, .. }
            | Self::HGetAll { key }
            | Self::LRange { key }
            | Self::PTtl { key }
            | Self::XLen { key } => key,
        }
    }
}

/// Reply to a [`Read`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadReply {
    Value(Option<Bytes>),
    Scored(Vec<(String, f64)>),
    Hash(Vec<(String, Bytes)>),
    List(Vec<Bytes>),
    /// Remaining TTL; `None` if the key is missing or persistent.
    Ttl(Option<Duration>),
    Len(u64),
}

impl ReadReply {
    pub fn into_value(self) -> StoreResult<Option<Bytes>> {
        match self {
            Self::Value(v) => Ok(v),
            other => Err(mismatch("value", &other)),
        }
    }

    pub fn into_scored(self) -> StoreResult<Vec<(String, f64)>> {
        match self {
            Self::Scored(v) => Ok(v),
            other => Err(mismatch("scored members", &other)),
        }
    }

    pub fn into_hash(self) -> StoreResult<Vec<(String, Bytes)>> {
        match self {
            Self::Hash(v) => Ok(v),
            other => Err(mismatch("hash", &other)),
        }
    }

    pub fn into_list(self) -> StoreResult<Vec<Bytes>> {
        match self {
            Self::List(v) => Ok(v),
            other => Err(mismatch("list", &other)),
        }
    }

    pub fn into_ttl(self) -> StoreResult<Option<Duration>> {
        match self {
            Self::Ttl(v) => Ok(v),
            other => Err(mismatch("ttl", &other)),
        }
    }

    pub fn into_len(self) -> StoreResult<u64> {
        match self {
            Self::Len(v) => Ok(v),
            other => Err(mismatch("length", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &ReadReply) -> StoreError {
    StoreError::corruption(format!("expected {expected} reply, got {got:?}"))
}

/// A mutation. Batches of these are executed atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Set {
        key: String,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    PExpire {
        key: String,
        ttl: Duration,
    },
    GetDel {
        key: String,
    },
    /// `ZADD key [NX] score member`
    ZAdd {
        key: String,
        member: String,
        score: f64,
        only_new: bool,
    },
    ZRem {
        key: String,
        member: String,
    },
    HSet {
        key: String,
        field: String,
        value: Bytes,
    },
    HDel {
        key: String,
        field: String,
    },
    RPush {
        key: String,
        values: Vec<Bytes>,
    },
    /// `XADD key [MAXLEN ~ n] * fields...`
    XAdd {
        key: String,
        max_len: Option<usize>,
        fields: Fields,
    },
    XAck {
        key: String,
        group: String,
        ids: Vec<StreamId>,
    },
    XDel {
        key: String,
        ids: Vec<StreamId>,
    },
}

impl Op {
    /// The key this operation writes.
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Del { key }
            | Self::PExpire { key, .. }
            | Self::GetDel { key }
            | Self::ZAdd { key, .. }
            | Self::ZRem { key, .. }
            | Self::HSet { key, .. }
            | Self::HDel { key, .. }
            | Self::RPush { key, .. }
            | Self::XAdd { key, .. }
            | Self::XAck { key, .. }
            | Self::XDel { key, .. } => key,
        }
    }
}

/// Reply to an [`Op`].
#[derive(Debug, Clone, PartialEq)]
pub enum OpReply {
    Ok,
    Int(i64),
    Value(Option<Bytes>),
    Id(StreamId),
}

impl OpReply {
    pub fn into_value(self) -> StoreResult<Option<Bytes>> {
        match self {
            Self::Value(v) => Ok(v),
            other => Err(StoreError::corruption(format!(
                "expected value reply, got {other:?}"
            ))),
        }
    }

    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            Self::Int(n) => Ok(n),
            other => Err(StoreError::corruption(format!(
                "expected integer reply, got {other:?}"
            ))),
        }
    }
}

/// Builder for a batch of [`Op`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    ops: Vec<Op>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn extend(&mut self, other: Pipeline) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Bytes>) -> &mut Self {
        self.push(Op::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        })
    }

    pub fn set_px(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> &mut Self {
        self.push(Op::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        })
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Op::Del { key: key.into() })
    }

    pub fn pexpire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Op::PExpire {
            key: key.into(),
            ttl,
        })
    }

    pub fn getdel(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Op::GetDel { key: key.into() })
    }

    pub fn zadd(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.push(Op::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
            only_new: false,
        })
    }

    pub fn zadd_nx(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: f64,
    ) -> &mut Self {
        self.push(Op::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
            only_new: true,
        })
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Op::ZRem {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> &mut Self {
        self.push(Op::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(Op::HDel {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn rpush(&mut self, key: impl Into<String>, values: Vec<Bytes>) -> &mut Self {
        self.push(Op::RPush {
            key: key.into(),
            values,
        })
    }

    pub fn xadd(&mut self, key: impl Into<String>, max_len: Option<usize>, fields: Fields) -> &mut Self {
        self.push(Op::XAdd {
            key: key.into(),
            max_len,
            fields,
        })
    }

    pub fn xack(
        &mut self,
        key: impl Into<String>,
        group: impl Into<String>,
        ids: Vec<StreamId>,
    ) -> &mut Self {
        self.push(Op::XAck {
            key: key.into(),
            group: group.into(),
            ids,
        })
    }

    pub fn xdel(&mut self, key: impl Into<String>, ids: Vec<StreamId>) -> &mut Self {
        self.push(Op::XDel {
            key: key.into(),
            ids,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// Backend half of a watched optimistic transaction.
pub trait WatchSession: Send + Sync {
    /// Add keys to the watched set.
    fn watch(&self, keys: Vec<String>) -> StoreFuture<'_, ()>;

    /// Read inside the transaction.
    fn read(&self, reads: Vec<Read>) -> StoreFuture<'_, Vec<ReadReply>>;

    /// Atomically apply `ops`; fails with [`StoreError::Aborted`] if a
    /// watched key changed since it was watched.
    fn commit(&self, ops: Vec<Op>) -> StoreFuture<'_, Vec<OpReply>>;

    /// End the transaction without writing.
    fn discard(&self) -> StoreFuture<'_, ()>;
}

/// A watched optimistic transaction.
#[derive(Clone)]
pub struct Txn(Arc<dyn WatchSession>);

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Txn")
    }
}

impl Txn {
    pub fn new(session: Arc<dyn WatchSession>) -> Self {
        Self(session)
    }

    pub async fn watch(&self, keys: Vec<String>) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.0.watch(keys).await
    }

    pub async fn read(&self, reads: Vec<Read>) -> StoreResult<Vec<ReadReply>> {
        if reads.is_empty() {
            return Ok(Vec::new());
        }
        self.0.read(reads).await
    }

    /// Read a single string value.
    pub async fn get(&self, key: impl Into<String>) -> StoreResult<Option<Bytes>> {
        let mut replies = self.0.read(vec![Read::get(key)]).await?;
        replies
            .pop()
            .ok_or_else(|| StoreError::corruption("missing GET reply"))?
            .into_value()
    }

    pub async fn commit(&self, ops: Vec<Op>) -> StoreResult<Vec<OpReply>> {
        self.0.commit(ops).await
    }

    pub async fn discard(&self) -> StoreResult<()> {
        self.0.discard().await
    }
}

/// The store operations every component is built on.
pub trait Backend: Send + Sync + 'static {
    /// Atomically run a batch of reads.
    fn read(&self, reads: Vec<Read>) -> StoreFuture<'_, Vec<ReadReply>>;

    /// Atomically run a batch of writes.
    fn exec(&self, ops: Vec<Op>) -> StoreFuture<'_, Vec<OpReply>>;

    /// Start a watched transaction over `keys`.
    fn watch(&self, keys: Vec<String>) -> StoreFuture<'_, Txn>;

    /// One page of keys matching the glob `pattern`, starting at `cursor`.
    fn scan(&self, cursor: u64, pattern: String, count: usize) -> StoreFuture<'_, ScanPage>;

    /// Take the lock if free, clearing its handoff list.
    fn lock_acquire(&self, keys: LockKeys, id: String, ttl: Duration)
        -> StoreFuture<'_, LockAttempt>;

    /// Overwrite the lock with `id` iff it still holds the handed-off `token`.
    fn lock_take_over(
        &self,
        keys: LockKeys,
        token: String,
        id: String,
        ttl: Duration,
    ) -> StoreFuture<'_, bool>;

    /// Hand the lock to the next waiter iff it is held by `id`.
    fn lock_release(&self, keys: LockKeys, id: String, ttl: Duration) -> StoreFuture<'_, bool>;

    /// Return a popped handoff `token` to the list iff the lock still holds it.
    fn lock_pass_on(&self, keys: LockKeys, token: String, ttl: Duration) -> StoreFuture<'_, bool>;

    /// Pop the head of a list, waiting up to `wait`.
    fn blpop(&self, key: String, wait: Duration) -> StoreFuture<'_, Option<Bytes>>;

    /// Open or join a deduplication window and append `values`.
    ///
    /// Returns true iff this call opened the window.
    fn deduplicate(
        &self,
        keys: LockKeys,
        window: Duration,
        limit: usize,
        values: Vec<Bytes>,
    ) -> StoreFuture<'_, bool>;

    /// Create a consumer group reading from the start; existing groups are kept.
    fn xgroup_create(&self, key: String, group: String) -> StoreFuture<'_, ()>;

    /// Remove a consumer from a group.
    fn xgroup_del_consumer(
        &self,
        key: String,
        group: String,
        consumer: String,
    ) -> StoreFuture<'_, ()>;

    /// Read new entries for `consumer`, waiting up to `block` when none are available.
    fn xreadgroup(
        &self,
        group: String,
        consumer: String,
        keys: Vec<String>,
        count: usize,
        block: Option<Duration>,
    ) -> StoreFuture<'_, Vec<StreamRead>>;

    /// Entries of `key` delivered to `consumer` and not yet acked.
    fn xpending_entries(
        &self,
        key: String,
        group: String,
        consumer: String,
        count: usize,
    ) -> StoreFuture<'_, Vec<StreamEntry>>;

    /// Claim up to `count` entries pending for longer than `min_idle`.
    fn xautoclaim(
        &self,
        key: String,
        group: String,
        consumer: String,
        min_idle: Duration,
        count: usize,
    ) -> StoreFuture<'_, Vec<StreamEntry>>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Backend")
    }
}

/// Run reads in one atomic batch, returning the single reply of a one-read batch.
pub async fn read_one(backend: &dyn Backend, read: Read) -> StoreResult<ReadReply> {
    backend
        .read(vec![read])
        .await?
        .pop()
        .ok_or_else(|| StoreError::corruption("missing read reply"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_parse_and_order() {
        let a = StreamId::parse("1526919030474-55").unwrap();
        assert_eq!(a, StreamId::new(1526919030474, 55));
        assert_eq!(a.to_string(), "1526919030474-55");
        assert_eq!(StreamId::parse("7").unwrap(), StreamId::new(7, 0));
        assert!(StreamId::parse("x-1").is_err());
        assert!(a < a.next());
        assert_eq!(StreamId::new(1, u64::MAX).next(), StreamId::new(2, 0));
    }

    #[test]
    fn test_pipeline_builder() {
        let mut pipe = Pipeline::new();
        pipe.set("a", "1").zadd_nx("z", "m", 2.0).del("b");
        assert_eq!(pipe.len(), 3);
        let keys: Vec<_> = pipe.ops().iter().map(Op::key).collect();
        assert_eq!(keys, vec!["a", "z", "b"]);
        assert!(matches!(
            pipe.ops()[1],
            Op::ZAdd { only_new: true, .. }
        ));
    }

    #[test]
    fn test_reply_mismatch_is_corruption() {
        let err = ReadReply::Len(1).into_hash().unwrap_err();
        assert_eq!(
            err.category(),
            crate::core::error::ErrorCategory::Corruption
        );
    }
}
