//! Task queue and application uplink queue tests.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use lorawan_coord::core::config::{TaskQueueConfig, UplinkQueueConfig};
use lorawan_coord::core::context::Context;
use lorawan_coord::core::error::StoreError;
use lorawan_coord::ids::EndDeviceIdentifiers;
use lorawan_coord::messages::{
    ApplicationDownlink, ApplicationInvalidatedDownlinks, ApplicationJoinAccept, ApplicationUp,
    ApplicationUplink, Up,
};
use lorawan_coord::queue::{ApplicationUplinkQueue, TaskQueue};
use lorawan_coord::store::{read_one, Backend, Namespace, Pipeline, Read, SharedBackend};
use std::time::Duration;

fn task_config() -> TaskQueueConfig {
    TaskQueueConfig {
        stream_block_limit_ms: 20,
        min_idle_ms: 50,
        ..TaskQueueConfig::default()
    }
}

fn task_queue(backend: &SharedBackend) -> TaskQueue {
    TaskQueue::new(backend.clone(), &Namespace::new("ns:tasks:test"), &task_config())
}

/// Run a dispatcher for `wait`, then return.
async fn dispatch_for(queue: &TaskQueue, wait: Duration) {
    let ctx = Context::background().with_timeout(wait);
    queue.dispatch(&ctx, "dispatcher").await.unwrap();
}

// ============================================================================
// Task queue
// ============================================================================

#[tokio::test]
async fn replace_coalesces_schedules() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();

    let base = Utc::now() - ChronoDuration::minutes(2);
    let scheduled = base + ChronoDuration::minutes(1);
    let mut pipe = Pipeline::new();
    queue.add(&mut pipe, "test", scheduled, true);
    queue.add(&mut pipe, "test", base - ChronoDuration::seconds(1), false);
    backend.exec(pipe.into_ops()).await.unwrap();

    dispatch_for(&queue, Duration::from_millis(60)).await;

    let mut popped = Vec::new();
    assert!(queue
        .pop(&ctx, "worker", |task| {
            popped.push(task);
            async { Ok(Pipeline::new()) }
        })
        .await
        .unwrap());
    assert_eq!(popped.len(), 1);
    assert_eq!(popped[0].payload, "test");
    assert_eq!(
        popped[0].start_at.timestamp_millis(),
        scheduled.timestamp_millis()
    );

    assert!(!queue
        .pop(&ctx, "worker", |_| async { Ok(Pipeline::new()) })
        .await
        .unwrap());
}

#[tokio::test]
async fn replace_moves_schedule_later() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();

    let now = Utc::now();
    queue.add_now(&ctx, "dev", now, false).await.unwrap();
    let later = now + ChronoDuration::minutes(5);
    queue.add_now(&ctx, "dev", later, true).await.unwrap();
    dispatch_for(&queue, Duration::from_millis(60)).await;

    let waiting = read_one(
        backend.as_ref(),
        Read::ZRangeWithScores {
            key: queue.waiting_key().to_string(),
            rev: false,
        },
    )
    .await
    .unwrap()
    .into_scored()
    .unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].0, "dev");
    assert!(!queue
        .pop(&ctx, "worker", |_| async { Ok(Pipeline::new()) })
        .await
        .unwrap());
}

#[tokio::test]
async fn task_becomes_ready_when_due() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();

    let start = Utc::now() + ChronoDuration::milliseconds(100);
    queue.add_now(&ctx, "soon", start, false).await.unwrap();
    dispatch_for(&queue, Duration::from_millis(30)).await;
    assert!(!queue
        .pop(&ctx, "worker", |_| async { Ok(Pipeline::new()) })
        .await
        .unwrap());

    dispatch_for(&queue, Duration::from_millis(200)).await;
    let mut got = None;
    assert!(queue
        .pop(&ctx, "worker", |task| {
            got = Some(task.payload);
            async { Ok(Pipeline::new()) }
        })
        .await
        .unwrap());
    assert_eq!(got.as_deref(), Some("soon"));
}

#[tokio::test]
async fn pop_returns_cleanly_on_deadline() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    queue.init(&Context::background()).await.unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!queue
        .pop(&ctx, "worker", |_| async { Ok(Pipeline::new()) })
        .await
        .unwrap());
}

#[tokio::test]
async fn close_removes_consumer() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();
    dispatch_for(&queue, Duration::from_millis(30)).await;
    queue.close(&ctx, "dispatcher").await.unwrap();
    queue.close(&ctx, "never-seen").await.unwrap();
}

/// Read the input stream as `consumer` without scheduling, as a dispatcher
/// that stops right after reading would.
async fn read_input_and_stop(backend: &SharedBackend, queue: &TaskQueue, consumer: &str) {
    let reads = backend
        .xreadgroup(
            task_config().group,
            consumer.to_string(),
            vec![queue.input_key().to_string()],
            10,
            None,
        )
        .await
        .unwrap();
    assert_eq!(reads.iter().map(|r| r.entries.len()).sum::<usize>(), 1);
}

async fn pop_payload(queue: &TaskQueue, ctx: &Context) -> Option<String> {
    let mut got = None;
    queue
        .pop(ctx, "worker", |task| {
            got = Some(task.payload);
            async { Ok(Pipeline::new()) }
        })
        .await
        .unwrap();
    got
}

#[tokio::test]
async fn restarted_dispatcher_resumes_its_input() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();
    queue.add_now(&ctx, "resumed", Utc::now(), false).await.unwrap();
    read_input_and_stop(&backend, &queue, "dispatcher").await;

    dispatch_for(&queue, Duration::from_millis(60)).await;
    assert_eq!(pop_payload(&queue, &ctx).await.as_deref(), Some("resumed"));
}

#[tokio::test]
async fn idle_input_is_claimed_by_another_dispatcher() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();
    queue.add_now(&ctx, "orphan", Utc::now(), false).await.unwrap();
    read_input_and_stop(&backend, &queue, "gone").await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    let dispatch_ctx = Context::background().with_timeout(Duration::from_millis(60));
    queue.dispatch(&dispatch_ctx, "other").await.unwrap();
    assert_eq!(pop_payload(&queue, &ctx).await.as_deref(), Some("orphan"));
}

#[tokio::test]
async fn close_keeps_pending_tasks_claimable() {
    let backend = common::backend();
    let queue = task_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();
    queue.add_now(&ctx, "kept", Utc::now(), false).await.unwrap();
    dispatch_for(&queue, Duration::from_millis(60)).await;

    let err = queue
        .pop(&ctx, "failing", |_| async {
            Err(StoreError::unavailable("downstream"))
        })
        .await
        .unwrap_err();
    assert!(err.is_retriable());
    queue.close(&ctx, "failing").await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(pop_payload(&queue, &ctx).await.as_deref(), Some("kept"));
}

// ============================================================================
// Application uplink queue
// ============================================================================

fn uplink_queue(backend: &SharedBackend) -> ApplicationUplinkQueue {
    ApplicationUplinkQueue::new(
        backend.clone(),
        Namespace::new("as"),
        &task_config(),
        &UplinkQueueConfig::default(),
    )
}

fn up(dev: &str, event: Up) -> ApplicationUp {
    ApplicationUp::new(EndDeviceIdentifiers::new("app", dev), event)
}

#[tokio::test]
async fn uplinks_drain_in_priority_order() {
    let backend = common::backend();
    let queue = uplink_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();

    let generic = up(
        "dev-1",
        Up::UplinkMessage(ApplicationUplink {
            f_port: 1,
            f_cnt: 42,
            ..Default::default()
        }),
    );
    let invalidated = up(
        "dev-1",
        Up::DownlinkQueueInvalidated(ApplicationInvalidatedDownlinks {
            downlinks: vec![ApplicationDownlink::default()],
            ..Default::default()
        }),
    );
    let join = up("dev-2", Up::JoinAccept(ApplicationJoinAccept::default()));
    queue
        .add(&ctx, &[generic.clone(), invalidated.clone()])
        .await
        .unwrap();
    queue.add(&ctx, &[join.clone()]).await.unwrap();

    let dispatch_ctx = Context::background().with_timeout(Duration::from_millis(60));
    queue.dispatch(&dispatch_ctx, "dispatcher").await.unwrap();

    let mut drained = Vec::new();
    let drain_ctx = &ctx;
    let popped = queue
        .pop(&ctx, "worker", |app, drain| {
            assert_eq!(app.application_id, "app");
            let drained = &mut drained;
            async move {
                drain
                    .drain(drain_ctx, 10, |ups| {
                        *drained = ups;
                        async { Ok(()) }
                    })
                    .await?;
                Ok::<_, StoreError>(None)
            }
        })
        .await
        .unwrap();
    assert!(popped);
    assert_eq!(drained, vec![join, invalidated, generic]);

    // One activation per application and nothing left.
    assert!(!queue
        .pop(&ctx, "worker", |_, _| async { Ok(None) })
        .await
        .unwrap());
}

#[tokio::test]
async fn reactivation_is_scheduled() {
    let backend = common::backend();
    let queue = uplink_queue(&backend);
    let ctx = Context::background();
    queue.init(&ctx).await.unwrap();
    queue
        .add(&ctx, &[up("dev-1", Up::UplinkMessage(Default::default()))])
        .await
        .unwrap();
    queue
        .dispatch(
            &Context::background().with_timeout(Duration::from_millis(60)),
            "dispatcher",
        )
        .await
        .unwrap();

    let again = Utc::now() + ChronoDuration::minutes(10);
    assert!(queue
        .pop(&ctx, "worker", |_, _| async move { Ok(Some(again)) })
        .await
        .unwrap());

    let input = read_one(
        backend.as_ref(),
        Read::XLen {
            key: queue.tasks().input_key().to_string(),
        },
    )
    .await
    .unwrap()
    .into_len()
    .unwrap();
    assert_eq!(input, 2);
}
