//! Per-application uplink queue.
//!
//! Each application has three sub-streams below `<root>:uid:<app>:uplinks`
//! (`:join-accept`, `:invalidation` and the generic stream itself). Adding
//! messages schedules a task for the application on an internal
//! [`TaskQueue`]; the consumer that pops the task drains the sub-streams in
//! priority order.

use super::task::TaskQueue;
use crate::core::config::{TaskQueueConfig, UplinkQueueConfig};
use crate::core::context::Context;
use crate::core::error::StoreResult;
use crate::ids::ApplicationIdentifiers;
use crate::messages::{ApplicationUp, UpStream};
use crate::store::{codec, Namespace, Pipeline, SharedBackend, StreamEntry, StreamId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

const FIELD_UPLINK: &str = "uplink";

/// Queue of application uplinks, activated per application.
#[derive(Debug, Clone)]
pub struct ApplicationUplinkQueue {
    backend: SharedBackend,
    root: Namespace,
    tasks: TaskQueue,
    max_len: usize,
    group: String,
    min_idle: Duration,
}

impl ApplicationUplinkQueue {
    pub fn new(
        backend: SharedBackend,
        root: Namespace,
        tasks: &TaskQueueConfig,
        config: &UplinkQueueConfig,
    ) -> Self {
        let task_queue = TaskQueue::new(backend.clone(), &root.sub("tasks"), tasks);
        Self {
            backend,
            root,
            tasks: task_queue,
            max_len: config.max_len,
            group: config.group.clone(),
            min_idle: Duration::from_millis(config.min_idle_ms),
        }
    }

    /// Key of one sub-stream of `app_uid`.
    pub fn stream_key(&self, app_uid: &str, stream: UpStream) -> String {
        match stream.suffix() {
            Some(suffix) => self.root.key(&["uid", app_uid, "uplinks", suffix]),
            None => self.root.key(&["uid", app_uid, "uplinks"]),
        }
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub async fn init(&self, ctx: &Context) -> StoreResult<()> {
        self.tasks.init(ctx).await
    }

    pub async fn close(&self, ctx: &Context, consumer: &str) -> StoreResult<()> {
        self.tasks.close(ctx, consumer).await
    }

    /// Append `ups` to their sub-streams and activate their applications.
    pub async fn add(&self, ctx: &Context, ups: &[ApplicationUp]) -> StoreResult<()> {
        if ups.is_empty() {
            return Ok(());
        }
        let mut pipe = Pipeline::new();
        let mut apps = BTreeSet::new();
        for up in ups {
            let app = up.end_device_ids.application_ids.unique_id();
            pipe.xadd(
                self.stream_key(app, up.stream()),
                Some(self.max_len),
                vec![(FIELD_UPLINK.to_string(), codec::encode(up)?)],
            );
            apps.insert(app.to_string());
        }
        let now = Utc::now();
        for app in &apps {
            self.tasks.add(&mut pipe, app, now, false);
        }
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        tracing::trace!(count = ups.len(), applications = apps.len(), "queued application uplinks");
        Ok(())
    }

    /// Run the activation dispatcher until the context ends.
    pub async fn dispatch(&self, ctx: &Context, consumer: &str) -> StoreResult<()> {
        self.tasks.dispatch(ctx, consumer).await
    }

    /// Pop one activated application and hand it to `f` with a [`Drain`].
    ///
    /// If `f` returns a time, the application is activated again at that
    /// time.
    pub async fn pop<F, Fut>(&self, ctx: &Context, consumer: &str, f: F) -> StoreResult<bool>
    where
        F: FnOnce(ApplicationIdentifiers, Drain) -> Fut,
        Fut: Future<Output = StoreResult<Option<DateTime<Utc>>>>,
    {
        self.tasks
            .pop(ctx, consumer, |task| async move {
                let ids = ApplicationIdentifiers::new(task.payload);
                if let Err(e) = ids.validate() {
                    tracing::warn!(payload = %ids.application_id, error = %e, "dropping activation of invalid application");
                    return Ok(Pipeline::new());
                }
                let drain = self.drain_for(&ids, consumer);
                let mut pipe = Pipeline::new();
                if let Some(at) = f(ids.clone(), drain).await? {
                    self.tasks.add(&mut pipe, ids.unique_id(), at, true);
                }
                Ok(pipe)
            })
            .await
    }

    fn drain_for(&self, ids: &ApplicationIdentifiers, consumer: &str) -> Drain {
        Drain {
            backend: self.backend.clone(),
            keys: UpStream::PRIORITY
                .iter()
                .map(|s| self.stream_key(ids.unique_id(), *s))
                .collect(),
            group: self.group.clone(),
            consumer: consumer.to_string(),
            min_idle: self.min_idle,
        }
    }
}

/// Reads the pending uplinks of one application.
#[derive(Debug, Clone)]
pub struct Drain {
    backend: SharedBackend,
    keys: Vec<String>,
    group: String,
    consumer: String,
    min_idle: Duration,
}

impl Drain {
    /// Read up to `limit` messages, highest priority sub-stream first, and
    /// pass them to `g`. Messages are acknowledged and removed only if `g`
    /// succeeds. Returns the number of messages read.
    ///
    /// Within a sub-stream messages arrive in producer order unless stale
    /// messages of another consumer were reclaimed; those come first.
    pub async fn drain<G, Fut>(&self, ctx: &Context, limit: usize, g: G) -> StoreResult<usize>
    where
        G: FnOnce(Vec<ApplicationUp>) -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let mut read: Vec<(&str, StreamEntry)> = Vec::new();
        for key in &self.keys {
            let remaining = limit.saturating_sub(read.len());
            if remaining == 0 {
                break;
            }
            for entry in self.read_stream(ctx, key, remaining).await? {
                read.push((key.as_str(), entry));
            }
        }
        if read.is_empty() {
            return Ok(0);
        }

        let mut ups = Vec::with_capacity(read.len());
        for (key, entry) in &read {
            match entry.field(FIELD_UPLINK).map(|b| codec::decode::<ApplicationUp>(b)) {
                Some(Ok(up)) => ups.push(up),
                Some(Err(e)) => {
                    tracing::warn!(stream = %key, id = %entry.id, error = %e, "dropping undecodable uplink")
                }
                None => tracing::warn!(stream = %key, id = %entry.id, "dropping uplink entry without payload"),
            }
        }
        if !ups.is_empty() {
            ctx.run(g(ups)).await?;
        }

        let mut pipe = Pipeline::new();
        for key in &self.keys {
            let ids: Vec<StreamId> = read
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, e)| e.id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            pipe.xack(key.clone(), self.group.clone(), ids.clone());
            pipe.xdel(key.clone(), ids);
        }
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        Ok(read.len())
    }

    async fn read_stream(
        &self,
        ctx: &Context,
        key: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        match self.read_stream_once(ctx, key, count).await {
            Err(e) if e.is_not_found() => {
                ctx.run(
                    self.backend
                        .xgroup_create(key.to_string(), self.group.clone()),
                )
                .await?;
                self.read_stream_once(ctx, key, count).await
            }
            res => res,
        }
    }

    /// Reclaimed idle entries come before new ones, so entries of one
    /// sub-stream are in producer order only when nothing was reclaimed.
    async fn read_stream_once(
        &self,
        ctx: &Context,
        key: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut entries = ctx
            .run(self.backend.xautoclaim(
                key.to_string(),
                self.group.clone(),
                self.consumer.clone(),
                self.min_idle,
                count,
            ))
            .await?;
        if entries.len() < count {
            let reads = ctx
                .run(self.backend.xreadgroup(
                    self.group.clone(),
                    self.consumer.clone(),
                    vec![key.to_string()],
                    count - entries.len(),
                    None,
                ))
                .await?;
            entries.extend(reads.into_iter().flat_map(|r| r.entries));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EndDeviceIdentifiers;
    use crate::messages::Up;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    #[test]
    fn test_stream_keys() {
        let q = ApplicationUplinkQueue::new(
            Arc::new(MemoryBackend::new()),
            Namespace::new("as"),
            &TaskQueueConfig::default(),
            &UplinkQueueConfig::default(),
        );
        assert_eq!(q.stream_key("app", UpStream::Generic), "as:uid:app:uplinks");
        assert_eq!(
            q.stream_key("app", UpStream::JoinAccept),
            "as:uid:app:uplinks:join-accept"
        );
        assert_eq!(
            q.stream_key("app", UpStream::Invalidation),
            "as:uid:app:uplinks:invalidation"
        );
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_messages() {
        let q = ApplicationUplinkQueue::new(
            Arc::new(MemoryBackend::new()),
            Namespace::new("as"),
            &TaskQueueConfig::default(),
            &UplinkQueueConfig {
                min_idle_ms: 0,
                ..UplinkQueueConfig::default()
            },
        );
        let ctx = Context::background();
        let up = ApplicationUp::new(
            EndDeviceIdentifiers::new("app", "dev"),
            Up::UplinkMessage(Default::default()),
        );
        q.add(&ctx, &[up.clone()]).await.unwrap();

        let drain = q.drain_for(&ApplicationIdentifiers::new("app"), "c");
        let err = drain
            .drain(&ctx, 10, |_| async {
                Err(crate::core::error::StoreError::unavailable("sink down"))
            })
            .await
            .unwrap_err();
        assert!(err.is_retriable());

        let mut got = Vec::new();
        let n = drain
            .drain(&ctx, 10, |ups| {
                got = ups;
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(got, vec![up]);
        assert_eq!(drain.drain(&ctx, 10, |_| async { Ok(()) }).await.unwrap(), 0);
    }
}
