//! Time-scheduled task queue.
//!
//! ```text
//!  add ──▶ <base>:input ──dispatch──▶ <base>:waiting ──due──▶ <base>:ready ──pop──▶ f ──▶ ack
//!          (stream)                  (zset payload→start)    (stream)          │
//!                                                                              └─ fails: stays
//!                                                                                 pending, reclaimed
//!                                                                                 after min idle
//! ```
//!
//! The waiting set is keyed by payload, so a payload is scheduled at most
//! once per queue. Dispatchers and poppers share work through consumer
//! groups on both streams.

use crate::core::config::TaskQueueConfig;
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};
use crate::core::time::{from_unix_nanos, unix_nanos, until};
use crate::store::{
    read_one, Namespace, Pipeline, Read, ReadReply, SharedBackend, StreamEntry, StreamId,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

const FIELD_PAYLOAD: &str = "payload";
const FIELD_START_AT: &str = "start_at";
const FIELD_REPLACE: &str = "replace";

/// A task handed to a [`TaskQueue::pop`] callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub payload: String,
    pub start_at: DateTime<Utc>,
}

/// A scheduled task queue rooted at one namespace.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    backend: SharedBackend,
    input_key: String,
    waiting_key: String,
    ready_key: String,
    max_len: usize,
    group: String,
    stream_block_limit: Duration,
    min_idle: Duration,
}

impl TaskQueue {
    pub fn new(backend: SharedBackend, base: &Namespace, config: &TaskQueueConfig) -> Self {
        Self {
            backend,
            input_key: base.key(&["input"]),
            waiting_key: base.key(&["waiting"]),
            ready_key: base.key(&["ready"]),
            max_len: config.max_len,
            group: config.group.clone(),
            stream_block_limit: Duration::from_millis(config.stream_block_limit_ms),
            min_idle: Duration::from_millis(config.min_idle_ms),
        }
    }

    pub fn input_key(&self) -> &str {
        &self.input_key
    }

    pub fn waiting_key(&self) -> &str {
        &self.waiting_key
    }

    pub fn ready_key(&self) -> &str {
        &self.ready_key
    }

    /// Create the consumer groups. Idempotent.
    pub async fn init(&self, ctx: &Context) -> StoreResult<()> {
        for key in [&self.input_key, &self.ready_key] {
            ctx.run(self.backend.xgroup_create(key.clone(), self.group.clone()))
                .await?;
        }
        Ok(())
    }

    /// Remove `consumer` from both groups.
    ///
    /// A consumer that still owns un-acked entries on a stream stays in that
    /// group, so the entries remain claimable by other consumers.
    pub async fn close(&self, ctx: &Context, consumer: &str) -> StoreResult<()> {
        for key in [&self.input_key, &self.ready_key] {
            let owned = match ctx
                .run(self.backend.xpending_entries(
                    key.clone(),
                    self.group.clone(),
                    consumer.to_string(),
                    1,
                ))
                .await
            {
                Ok(owned) => owned,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if !owned.is_empty() {
                tracing::debug!(stream = %key, consumer = %consumer, "keeping consumer with pending entries");
                continue;
            }
            match ctx
                .run(self.backend.xgroup_del_consumer(
                    key.clone(),
                    self.group.clone(),
                    consumer.to_string(),
                ))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Append a task to `pipe`.
    ///
    /// With `replace`, a waiting occurrence of `payload` is rescheduled to
    /// `start_at`; without, an earlier schedule is kept.
    pub fn add(&self, pipe: &mut Pipeline, payload: &str, start_at: DateTime<Utc>, replace: bool) {
        pipe.xadd(
            self.input_key.clone(),
            Some(self.max_len),
            vec![
                (FIELD_PAYLOAD.to_string(), Bytes::copy_from_slice(payload.as_bytes())),
                (
                    FIELD_START_AT.to_string(),
                    Bytes::from(unix_nanos(start_at).to_string()),
                ),
                (
                    FIELD_REPLACE.to_string(),
                    Bytes::from_static(if replace { b"1" } else { b"0" }),
                ),
            ],
        );
    }

    /// Add a single task right away.
    pub async fn add_now(
        &self,
        ctx: &Context,
        payload: &str,
        start_at: DateTime<Utc>,
        replace: bool,
    ) -> StoreResult<()> {
        let mut pipe = Pipeline::new();
        self.add(&mut pipe, payload, start_at, replace);
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        Ok(())
    }

    /// Move tasks from the input stream through the waiting set into the
    /// ready stream until the context ends.
    ///
    /// Context end is a clean return; any other error stops dispatching.
    pub async fn dispatch(&self, ctx: &Context, consumer: &str) -> StoreResult<()> {
        match self.dispatch_loop(ctx, consumer).await {
            Err(e) if e.is_shutdown() => Ok(()),
            res => res,
        }
    }

    async fn dispatch_loop(&self, ctx: &Context, consumer: &str) -> StoreResult<()> {
        // Entries this consumer read before a restart but never scheduled.
        let owned = ctx
            .run(self.backend.xpending_entries(
                self.input_key.clone(),
                self.group.clone(),
                consumer.to_string(),
                self.max_len,
            ))
            .await?;
        if !owned.is_empty() {
            tracing::debug!(stream = %self.input_key, consumer = %consumer, count = owned.len(), "resuming pending input");
            self.schedule(ctx, owned).await?;
        }

        let mut next_wake: Option<DateTime<Utc>> = None;
        loop {
            ctx.check()?;
            let stale = ctx
                .run(self.backend.xautoclaim(
                    self.input_key.clone(),
                    self.group.clone(),
                    consumer.to_string(),
                    self.min_idle,
                    self.max_len,
                ))
                .await?;
            if !stale.is_empty() {
                tracing::debug!(stream = %self.input_key, consumer = %consumer, count = stale.len(), "reclaimed idle input");
                self.schedule(ctx, stale).await?;
            }
            let block = match next_wake {
                Some(at) => until(Utc::now(), at).min(self.stream_block_limit),
                None => self.stream_block_limit,
            };
            let block = ctx.clamp(block);
            let reads = ctx
                .run(self.backend.xreadgroup(
                    self.group.clone(),
                    consumer.to_string(),
                    vec![self.input_key.clone()],
                    self.max_len,
                    (!block.is_zero()).then_some(block),
                ))
                .await?;
            let entries: Vec<StreamEntry> = reads.into_iter().flat_map(|r| r.entries).collect();
            if !entries.is_empty() {
                self.schedule(ctx, entries).await?;
            }
            next_wake = self.move_due(ctx).await?;
        }
    }

    /// Upsert read input entries into the waiting set and ack them.
    async fn schedule(&self, ctx: &Context, entries: Vec<StreamEntry>) -> StoreResult<()> {
        let mut pipe = Pipeline::new();
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(entry.id);
            let (task, replace) = match parse_input(&entry) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(stream = %self.input_key, id = %entry.id, error = %e, "dropping malformed task");
                    continue;
                }
            };
            let score = unix_nanos(task.start_at) as f64;
            if replace {
                pipe.zadd(self.waiting_key.clone(), task.payload, score);
            } else {
                pipe.zadd_nx(self.waiting_key.clone(), task.payload, score);
            }
        }
        pipe.xack(self.input_key.clone(), self.group.clone(), ids);
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        Ok(())
    }

    /// Move due tasks to the ready stream and return the next wake-up.
    async fn move_due(&self, ctx: &Context) -> StoreResult<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let txn = ctx
            .run(self.backend.watch(vec![self.waiting_key.clone()]))
            .await?;
        let due = ctx
            .run(txn.read(vec![Read::ZRangeByScore {
                key: self.waiting_key.clone(),
                max: unix_nanos(now) as f64,
                limit: Some(self.max_len),
            }]))
            .await
            .and_then(|mut replies| single(&mut replies)?.into_scored());
        let due = match due {
            Ok(due) => due,
            Err(e) => {
                let _ = txn.discard().await;
                return Err(e);
            }
        };
        if due.is_empty() {
            txn.discard().await?;
        } else {
            let mut pipe = Pipeline::new();
            for (payload, score) in &due {
                pipe.xadd(
                    self.ready_key.clone(),
                    Some(self.max_len),
                    vec![
                        (FIELD_PAYLOAD.to_string(), Bytes::copy_from_slice(payload.as_bytes())),
                        (
                            FIELD_START_AT.to_string(),
                            Bytes::from((*score as i64).to_string()),
                        ),
                    ],
                );
                pipe.zrem(self.waiting_key.clone(), payload.clone());
            }
            match ctx.run(txn.commit(pipe.into_ops())).await {
                Ok(_) => {
                    tracing::trace!(queue = %self.ready_key, count = due.len(), "tasks ready");
                }
                // Another dispatcher moved them first.
                Err(StoreError::Aborted) => return Ok(Some(now)),
                Err(e) => return Err(e),
            }
        }

        let next = ctx
            .run(read_one(
                self.backend.as_ref(),
                Read::ZRangeByScore {
                    key: self.waiting_key.clone(),
                    max: f64::INFINITY,
                    limit: Some(1),
                },
            ))
            .await?
            .into_scored()?;
        Ok(next
            .first()
            .map(|(_, score)| from_unix_nanos(*score as i64)))
    }

    /// Process at most one ready task with `f`.
    ///
    /// Entries left un-acked by another consumer for longer than the
    /// minimum idle time are claimed first. The pipeline `f` returns is
    /// executed atomically with the ack; if `f` fails, the task stays
    /// pending. Returns whether a task was processed; context end is a
    /// clean `Ok(false)`.
    pub async fn pop<F, Fut>(&self, ctx: &Context, consumer: &str, f: F) -> StoreResult<bool>
    where
        F: FnOnce(Task) -> Fut,
        Fut: Future<Output = StoreResult<Pipeline>>,
    {
        match self.pop_one(ctx, consumer, f).await {
            Err(e) if e.is_shutdown() => Ok(false),
            res => res,
        }
    }

    async fn pop_one<F, Fut>(&self, ctx: &Context, consumer: &str, f: F) -> StoreResult<bool>
    where
        F: FnOnce(Task) -> Fut,
        Fut: Future<Output = StoreResult<Pipeline>>,
    {
        let claimed = ctx
            .run(self.backend.xautoclaim(
                self.ready_key.clone(),
                self.group.clone(),
                consumer.to_string(),
                self.min_idle,
                1,
            ))
            .await?;
        let entry = match claimed.into_iter().next() {
            Some(entry) => {
                tracing::debug!(queue = %self.ready_key, id = %entry.id, consumer = %consumer, "reclaimed idle task");
                entry
            }
            None => {
                let block = ctx.clamp(self.stream_block_limit);
                let reads = ctx
                    .run(self.backend.xreadgroup(
                        self.group.clone(),
                        consumer.to_string(),
                        vec![self.ready_key.clone()],
                        1,
                        (!block.is_zero()).then_some(block),
                    ))
                    .await?;
                match reads.into_iter().flat_map(|r| r.entries).next() {
                    Some(entry) => entry,
                    None => return Ok(false),
                }
            }
        };

        let task = match parse_ready(&entry) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(queue = %self.ready_key, id = %entry.id, error = %e, "dropping malformed task");
                self.ack(ctx, Pipeline::new(), entry.id).await?;
                return Err(e);
            }
        };
        let pipe = ctx.run(f(task)).await?;
        self.ack(ctx, pipe, entry.id).await?;
        Ok(true)
    }

    async fn ack(&self, ctx: &Context, mut pipe: Pipeline, id: StreamId) -> StoreResult<()> {
        pipe.xack(self.ready_key.clone(), self.group.clone(), vec![id]);
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        Ok(())
    }
}

fn single(replies: &mut Vec<ReadReply>) -> StoreResult<ReadReply> {
    replies
        .pop()
        .ok_or_else(|| StoreError::corruption("missing read reply"))
}

fn text_field<'a>(entry: &'a StreamEntry, name: &str) -> StoreResult<&'a str> {
    let value = entry
        .field(name)
        .ok_or_else(|| StoreError::corruption(format!("task entry {} lacks `{name}`", entry.id)))?;
    std::str::from_utf8(value)
        .map_err(|_| StoreError::corruption(format!("task entry {} has invalid `{name}`", entry.id)))
}

fn parse_ready(entry: &StreamEntry) -> StoreResult<Task> {
    let payload = text_field(entry, FIELD_PAYLOAD)?.to_string();
    let start_at = text_field(entry, FIELD_START_AT)?
        .parse::<i64>()
        .map_err(|_| StoreError::corruption(format!("task entry {} has invalid start", entry.id)))?;
    Ok(Task {
        payload,
        start_at: from_unix_nanos(start_at),
    })
}

fn parse_input(entry: &StreamEntry) -> StoreResult<(Task, bool)> {
    let task = parse_ready(entry)?;
    let replace = match text_field(entry, FIELD_REPLACE)? {
        "1" => true,
        "0" => false,
        other => {
            return Err(StoreError::corruption(format!(
                "task entry {} has invalid replace flag `{other}`",
                entry.id
            )))
        }
    };
    Ok((task, replace))
}
