//! Redis backend.
//!
//! Atomic batches run as `MULTI`/`EXEC`. Mutex and deduplication steps are
//! Lua scripts executed with `EVALSHA`, falling back to `EVAL` when the
//! server has not cached the script.

use super::keys::LockKeys;
use super::{
    Backend, Fields, LockAttempt, Op, OpReply, Read, ReadReply, ScanPage, StoreFuture,
    StreamEntry, StreamId, StreamRead, Txn, WatchSession,
};
use crate::core::error::{StoreError, StoreResult};
use crate::core::time::ttl_millis;
use crate::redis::client::{exec_on, PooledConnection};
use crate::redis::{Cmd, RedisClient, RedisValue};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

const LOCK_ACQUIRE: &str = r#"
if redis.call('set', KEYS[1], ARGV[1], 'px', ARGV[2], 'nx') then
  redis.call('del', KEYS[2])
  return {1, 0}
end
return {0, redis.call('pttl', KEYS[1])}
"#;

const LOCK_TAKE_OVER: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  redis.call('set', KEYS[1], ARGV[2], 'px', ARGV[3])
  return 1
end
return 0
"#;

const LOCK_RELEASE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  redis.call('rpush', KEYS[2], ARGV[1])
  redis.call('pexpire', KEYS[1], ARGV[2])
  redis.call('pexpire', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

const LOCK_PASS_ON: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  redis.call('lpush', KEYS[2], ARGV[1])
  redis.call('pexpire', KEYS[1], ARGV[2])
  redis.call('pexpire', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

const DEDUPLICATE: &str = r#"
local first = redis.call('set', KEYS[1], '', 'px', ARGV[1], 'nx')
if #ARGV > 2 then
  redis.call('rpush', KEYS[2], unpack(ARGV, 3))
  redis.call('ltrim', KEYS[2], -tonumber(ARGV[2]), -1)
end
redis.call('pexpire', KEYS[2], ARGV[1])
if first then
  return 1
end
return 0
"#;

/// A Lua script and its cached server-side SHA1.
#[derive(Debug)]
struct Script {
    source: &'static str,
    sha: RwLock<Option<String>>,
}

impl Script {
    fn new(source: &'static str) -> Self {
        Self {
            source,
            sha: RwLock::new(None),
        }
    }

    async fn invoke(
        &self,
        client: &RedisClient,
        keys: Vec<String>,
        args: Vec<Bytes>,
    ) -> StoreResult<RedisValue> {
        let sha = self.sha.read().clone();
        let sha = match sha {
            Some(sha) => sha,
            None => {
                let sha = client
                    .request(Cmd::new("SCRIPT").arg("LOAD").arg(self.source))
                    .await?
                    .into_string()?;
                *self.sha.write() = Some(sha.clone());
                sha
            }
        };
        let with_args = |cmd: Cmd| {
            cmd.arg(keys.len())
                .args(keys.iter())
                .args(args.iter())
        };
        let reply = client
            .connection()
            .await?
            .request(&with_args(Cmd::new("EVALSHA").arg(sha)))
            .await?;
        match reply {
            RedisValue::Error(e) if e.is_noscript() => {
                tracing::debug!("script not cached by server, falling back to EVAL");
                client.request(with_args(Cmd::new("EVAL").arg(self.source))).await
            }
            other => other.into_result(),
        }
    }
}

#[derive(Debug)]
struct Scripts {
    lock_acquire: Script,
    lock_take_over: Script,
    lock_release: Script,
    lock_pass_on: Script,
    deduplicate: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            lock_acquire: Script::new(LOCK_ACQUIRE),
            lock_take_over: Script::new(LOCK_TAKE_OVER),
            lock_release: Script::new(LOCK_RELEASE),
            lock_pass_on: Script::new(LOCK_PASS_ON),
            deduplicate: Script::new(DEDUPLICATE),
        }
    }
}

/// Store backed by a Redis server.
#[derive(Debug, Clone)]
pub struct RedisBackend {
    client: RedisClient,
    scripts: Arc<Scripts>,
}

impl RedisBackend {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            scripts: Arc::new(Scripts::default()),
        }
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }
}

fn millis(d: Duration) -> u64 {
    ttl_millis(d)
}

fn read_cmd(read: &Read) -> Cmd {
    match read {
        Read::Get { key } => Cmd::new("GET").arg(key),
        Read::ZRangeWithScores { key, rev: false } => Cmd::new("ZRANGE")
            .arg(key)
            .arg("0")
            .arg("-1")
            .arg("WITHSCORES"),
        Read::ZRangeWithScores { key, rev: true } => Cmd::new("ZREVRANGE")
            .arg(key)
            .arg("0")
            .arg("-1")
            .arg("WITHSCORES"),
        Read::ZRangeByScore { key, max, limit } => {
            let cmd = Cmd::new("ZRANGEBYSCORE")
                .arg(key)
                .arg(f64::NEG_INFINITY)
                .arg(*max)
                .arg("WITHSCORES");
            match limit {
                Some(n) => cmd.arg("LIMIT").arg("0").arg(*n),
                None => cmd,
            }
        }
        Read::HGetAll { key } => Cmd::new("HGETALL").arg(key),
        Read::LRange { key } => Cmd::new("LRANGE").arg(key).arg("0").arg("-1"),
        Read::PTtl { key } => Cmd::new("PTTL").arg(key),
        Read::XLen { key } => Cmd::new("XLEN").arg(key),
    }
}

fn pairs(value: RedisValue) -> StoreResult<Vec<(RedisValue, RedisValue)>> {
    let items = value.into_array()?;
    if items.len() % 2 != 0 {
        return Err(StoreError::corruption("odd number of elements in pair reply"));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(a), Some(b)) = (iter.next(), iter.next()) {
        out.push((a, b));
    }
    Ok(out)
}

fn read_reply(read: &Read, value: RedisValue) -> StoreResult<ReadReply> {
    let value = value.into_result()?;
    match read {
        Read::Get { .. } => Ok(ReadReply::Value(value.into_bytes()?)),
        Read::ZRangeWithScores { .. } | Read::ZRangeByScore { .. } => {
            let members = pairs(value)?
                .into_iter()
                .map(|(m, s)| Ok((m.into_string()?, s.into_float()?)))
                .collect::<StoreResult<_>>()?;
            Ok(ReadReply::Scored(members))
        }
        Read::HGetAll { .. } => {
            let fields = pairs(value)?
                .into_iter()
                .map(|(k, v)| Ok((k.into_string()?, v.into_bytes()?.unwrap_or_default())))
                .collect::<StoreResult<_>>()?;
            Ok(ReadReply::Hash(fields))
        }
        Read::LRange { .. } => {
            let items = value
                .into_array()?
                .into_iter()
                .map(|v| Ok(v.into_bytes()?.unwrap_or_default()))
                .collect::<StoreResult<_>>()?;
            Ok(ReadReply::List(items))
        }
        Read::PTtl { .. } => {
            let ms = value.into_int()?;
            Ok(ReadReply::Ttl(
                (ms >= 0).then(|| Duration::from_millis(ms as u64)),
            ))
        }
        Read::XLen { .. } => Ok(ReadReply::Len(value.into_int()?.max(0) as u64)),
    }
}

fn op_cmd(op: &Op) -> Cmd {
    match op {
        Op::Set { key, value, ttl } => {
            let cmd = Cmd::new("SET").arg(key).arg(value);
            match ttl {
                Some(ttl) => cmd.arg("PX").arg(millis(*ttl)),
                None => cmd,
            }
        }
        Op::Del { key } => Cmd::new("DEL").arg(key),
        Op::PExpire { key, ttl } => Cmd::new("PEXPIRE").arg(key).arg(millis(*ttl)),
        Op::GetDel { key } => Cmd::new("GETDEL").arg(key),
        Op::ZAdd {
            key,
            member,
            score,
            only_new,
        } => {
            let cmd = Cmd::new("ZADD").arg(key);
            let cmd = if *only_new { cmd.arg("NX") } else { cmd };
            cmd.arg(*score).arg(member)
        }
        Op::ZRem { key, member } => Cmd::new("ZREM").arg(key).arg(member),
        Op::HSet { key, field, value } => Cmd::new("HSET").arg(key).arg(field).arg(value),
        Op::HDel { key, field } => Cmd::new("HDEL").arg(key).arg(field),
        Op::RPush { key, values } => Cmd::new("RPUSH").arg(key).args(values.iter()),
        Op::XAdd {
            key,
            max_len,
            fields,
        } => {
            let mut cmd = Cmd::new("XADD").arg(key);
            if let Some(n) = max_len {
                cmd = cmd.arg("MAXLEN").arg("~").arg(*n);
            }
            cmd = cmd.arg("*");
            for (field, value) in fields {
                cmd = cmd.arg(field).arg(value);
            }
            cmd
        }
        Op::XAck { key, group, ids } => Cmd::new("XACK")
            .arg(key)
            .arg(group)
            .args(ids.iter().map(|id| id.to_string())),
        Op::XDel { key, ids } => Cmd::new("XDEL")
            .arg(key)
            .args(ids.iter().map(|id| id.to_string())),
    }
}

fn op_reply(op: &Op, value: RedisValue) -> StoreResult<OpReply> {
    let value = value.into_result()?;
    match op {
        Op::Set { .. } => Ok(OpReply::Ok),
        Op::GetDel { .. } => Ok(OpReply::Value(value.into_bytes()?)),
        Op::XAdd { .. } => Ok(OpReply::Id(StreamId::parse(&value.into_string()?)?)),
        _ => Ok(OpReply::Int(value.into_int()?)),
    }
}

fn parse_entry(value: RedisValue) -> StoreResult<Option<StreamEntry>> {
    let mut parts = value.into_array()?.into_iter();
    let (Some(id), fields) = (parts.next(), parts.next()) else {
        return Err(StoreError::corruption("malformed stream entry"));
    };
    let id = StreamId::parse(&id.into_string()?)?;
    let fields = match fields {
        None | Some(RedisValue::Null) => return Ok(None),
        Some(fields) => fields,
    };
    let fields: Fields = pairs(fields)?
        .into_iter()
        .map(|(k, v)| Ok((k.into_string()?, v.into_bytes()?.unwrap_or_default())))
        .collect::<StoreResult<_>>()?;
    Ok(Some(StreamEntry { id, fields }))
}

fn parse_entries(value: RedisValue) -> StoreResult<Vec<StreamEntry>> {
    let mut entries = Vec::new();
    for item in value.into_array()? {
        if let Some(entry) = parse_entry(item)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn blocking_wait(block: Duration) -> Option<u64> {
    // BLOCK 0 waits forever; anything under a millisecond is a plain read.
    let ms = block.as_millis() as u64;
    (ms > 0).then_some(ms)
}

impl Backend for RedisBackend {
    fn read(&self, reads: Vec<Read>) -> StoreFuture<'_, Vec<ReadReply>> {
        Box::pin(async move {
            let cmds = reads.iter().map(read_cmd).collect();
            let replies = self.client.transaction(cmds).await?;
            reads
                .iter()
                .zip(replies)
                .map(|(read, value)| read_reply(read, value))
                .collect()
        })
    }

    fn exec(&self, ops: Vec<Op>) -> StoreFuture<'_, Vec<OpReply>> {
        Box::pin(async move {
            if ops.is_empty() {
                return Ok(Vec::new());
            }
            let cmds = ops.iter().map(op_cmd).collect();
            let replies = self.client.transaction(cmds).await?;
            ops.iter()
                .zip(replies)
                .map(|(op, value)| op_reply(op, value))
                .collect()
        })
    }

    fn watch(&self, keys: Vec<String>) -> StoreFuture<'_, Txn> {
        Box::pin(async move {
            let mut conn = self.client.connection().await?;
            if !keys.is_empty() {
                conn.request(&Cmd::new("WATCH").args(keys.iter()))
                    .await?
                    .into_result()?;
            }
            let session = RedisTxn {
                conn: tokio::sync::Mutex::new(Some(conn)),
            };
            Ok(Txn::new(Arc::new(session)))
        })
    }

    fn scan(&self, cursor: u64, pattern: String, count: usize) -> StoreFuture<'_, ScanPage> {
        Box::pin(async move {
            let reply = self
                .client
                .request(
                    Cmd::new("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(count),
                )
                .await?;
            let mut parts = reply.into_array()?.into_iter();
            let (Some(cursor), Some(keys)) = (parts.next(), parts.next()) else {
                return Err(StoreError::corruption("malformed SCAN reply"));
            };
            let cursor = cursor.into_int()? as u64;
            let keys = keys
                .into_array()?
                .into_iter()
                .map(RedisValue::into_string)
                .collect::<StoreResult<_>>()?;
            Ok(ScanPage { cursor, keys })
        })
    }

    fn lock_acquire(
        &self,
        keys: LockKeys,
        id: String,
        ttl: Duration,
    ) -> StoreFuture<'_, LockAttempt> {
        Box::pin(async move {
            let reply = self
                .scripts
                .lock_acquire
                .invoke(
                    &self.client,
                    vec![keys.lock, keys.list],
                    vec![Bytes::from(id), Bytes::from(millis(ttl).to_string())],
                )
                .await?;
            let mut parts = reply.into_array()?.into_iter();
            let (Some(acquired), Some(pttl)) = (parts.next(), parts.next()) else {
                return Err(StoreError::corruption("malformed lock reply"));
            };
            if acquired.into_int()? == 1 {
                return Ok(LockAttempt::Acquired);
            }
            let pttl = pttl.into_int()?;
            Ok(LockAttempt::Held {
                remaining: Duration::from_millis(pttl.max(0) as u64),
            })
        })
    }

    fn lock_take_over(
        &self,
        keys: LockKeys,
        token: String,
        id: String,
        ttl: Duration,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let reply = self
                .scripts
                .lock_take_over
                .invoke(
                    &self.client,
                    vec![keys.lock],
                    vec![
                        Bytes::from(token),
                        Bytes::from(id),
                        Bytes::from(millis(ttl).to_string()),
                    ],
                )
                .await?;
            Ok(reply.into_int()? == 1)
        })
    }

    fn lock_release(&self, keys: LockKeys, id: String, ttl: Duration) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let reply = self
                .scripts
                .lock_release
                .invoke(
                    &self.client,
                    vec![keys.lock, keys.list],
                    vec![Bytes::from(id), Bytes::from(millis(ttl).to_string())],
                )
                .await?;
            Ok(reply.into_int()? == 1)
        })
    }

    fn lock_pass_on(&self, keys: LockKeys, token: String, ttl: Duration) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let reply = self
                .scripts
                .lock_pass_on
                .invoke(
                    &self.client,
                    vec![keys.lock, keys.list],
                    vec![Bytes::from(token), Bytes::from(millis(ttl).to_string())],
                )
                .await?;
            Ok(reply.into_int()? == 1)
        })
    }

    fn blpop(&self, key: String, wait: Duration) -> StoreFuture<'_, Option<Bytes>> {
        Box::pin(async move {
            if wait < Duration::from_millis(1) {
                return self.client.request(Cmd::new("LPOP").arg(key)).await?.into_bytes();
            }
            let seconds = format!("{:.3}", wait.as_secs_f64());
            let reply = self
                .client
                .request_blocking(Cmd::new("BLPOP").arg(key).arg(seconds), wait)
                .await?;
            // [key, value] or nil on timeout.
            let popped = reply
                .into_array()?
                .into_iter()
                .nth(1)
                .map(RedisValue::into_bytes)
                .transpose()?;
            Ok(popped.flatten())
        })
    }

    fn deduplicate(
        &self,
        keys: LockKeys,
        window: Duration,
        limit: usize,
        values: Vec<Bytes>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut args = vec![
                Bytes::from(millis(window).to_string()),
                Bytes::from(limit.to_string()),
            ];
            args.extend(values);
            let reply = self
                .scripts
                .deduplicate
                .invoke(&self.client, vec![keys.lock, keys.list], args)
                .await?;
            Ok(reply.into_int()? == 1)
        })
    }

    fn xgroup_create(&self, key: String, group: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let reply = self
                .client
                .connection()
                .await?
                .request(
                    &Cmd::new("XGROUP")
                        .arg("CREATE")
                        .arg(key)
                        .arg(group)
                        .arg("0")
                        .arg("MKSTREAM"),
                )
                .await?;
            match reply {
                RedisValue::Error(e) if e.is_busygroup() => Ok(()),
                other => other.into_result().map(|_| ()),
            }
        })
    }

    fn xgroup_del_consumer(
        &self,
        key: String,
        group: String,
        consumer: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.client
                .request(
                    Cmd::new("XGROUP")
                        .arg("DELCONSUMER")
                        .arg(key)
                        .arg(group)
                        .arg(consumer),
                )
                .await?;
            Ok(())
        })
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
            let mut cmd = Cmd::new("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(consumer)
                .arg("COUNT")
                .arg(count);
            let wait = block.and_then(blocking_wait);
            if let Some(ms) = wait {
                cmd = cmd.arg("BLOCK").arg(ms);
            }
            cmd = cmd.arg("STREAMS").args(keys.iter());
            cmd = cmd.args(keys.iter().map(|_| ">"));
            let reply = match wait {
                Some(ms) => {
                    self.client
                        .request_blocking(cmd, Duration::from_millis(ms))
                        .await?
                }
                None => self.client.request(cmd).await?,
            };
            let mut reads = Vec::new();
            for stream in reply.into_array()? {
                let mut parts = stream.into_array()?.into_iter();
                let (Some(key), Some(entries)) = (parts.next(), parts.next()) else {
                    return Err(StoreError::corruption("malformed XREADGROUP reply"));
                };
                let entries = parse_entries(entries)?;
                if !entries.is_empty() {
                    reads.push(StreamRead {
                        key: key.into_string()?,
                        entries,
                    });
                }
            }
            Ok(reads)
        })
    }

    fn xpending_entries(
        &self,
        key: String,
        group: String,
        consumer: String,
        count: usize,
    ) -> StoreFuture<'_, Vec<StreamEntry>> {
        Box::pin(async move {
            // Reading from id 0 returns the consumer's own pending history.
            let reply = self
                .client
                .request(
                    Cmd::new("XREADGROUP")
                        .arg("GROUP")
                        .arg(group)
                        .arg(consumer)
                        .arg("COUNT")
                        .arg(count)
                        .arg("STREAMS")
                        .arg(key)
                        .arg("0"),
                )
                .await?;
            let mut entries = Vec::new();
            for stream in reply.into_array()? {
                let mut parts = stream.into_array()?.into_iter();
                let (Some(_), Some(history)) = (parts.next(), parts.next()) else {
                    return Err(StoreError::corruption("malformed XREADGROUP reply"));
                };
                entries.extend(parse_entries(history)?);
            }
            Ok(entries)
        })
    }

    fn xautoclaim(
        &self,
        key: String,
        group: String,
        consumer: String,
        min_idle: Duration,
        count: usize,
    ) -> StoreFuture<'_, Vec<StreamEntry>> {
        Box::pin(async move {
            let reply = self
                .client
                .request(
                    Cmd::new("XAUTOCLAIM")
                        .arg(key)
                        .arg(group)
                        .arg(consumer)
                        .arg(min_idle.as_millis() as u64)
                        .arg("0-0")
                        .arg("COUNT")
                        .arg(count),
                )
                .await?;
            // [next-cursor, entries, deleted-ids (7.0+)]
            let entries = reply
                .into_array()?
                .into_iter()
                .nth(1)
                .ok_or_else(|| StoreError::corruption("malformed XAUTOCLAIM reply"))?;
            parse_entries(entries)
        })
    }
}

/// Watched transaction pinned to one connection.
struct RedisTxn {
    conn: tokio::sync::Mutex<Option<PooledConnection>>,
}

impl RedisTxn {
    fn closed() -> StoreError {
        StoreError::failed_precondition("transaction already finished")
    }
}

impl Drop for RedisTxn {
    fn drop(&mut self) {
        // Dropped mid-transaction: the connection still has keys watched.
        if let Some(conn) = self.conn.get_mut().take() {
            conn.discard();
        }
    }
}

impl WatchSession for RedisTxn {
    fn watch(&self, keys: Vec<String>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(Self::closed)?;
            conn.request(&Cmd::new("WATCH").args(keys.iter()))
                .await?
                .into_result()?;
            Ok(())
        })
    }

    fn read(&self, reads: Vec<Read>) -> StoreFuture<'_, Vec<ReadReply>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(Self::closed)?;
            let cmds: Vec<Cmd> = reads.iter().map(read_cmd).collect();
            let replies = conn.pipeline(&cmds).await?;
            reads
                .iter()
                .zip(replies)
                .map(|(read, value)| read_reply(read, value))
                .collect()
        })
    }

    fn commit(&self, ops: Vec<Op>) -> StoreFuture<'_, Vec<OpReply>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let mut conn = guard.take().ok_or_else(Self::closed)?;
            let cmds = ops.iter().map(op_cmd).collect();
            let replies = exec_on(&mut conn, cmds).await?;
            ops.iter()
                .zip(replies)
                .map(|(op, value)| op_reply(op, value))
                .collect()
        })
    }

    fn discard(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            if let Some(mut conn) = guard.take() {
                conn.request(&Cmd::new("UNWATCH")).await?.into_result()?;
            }
            Ok(())
        })
    }
}
