//! Start command implementation.

use super::{connect, db::migrator, StoreNamespace};
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::runtime::{Backoff, WorkerSet};
use crate::queue::{ApplicationUplinkQueue, TaskQueue};
use crate::store::SharedBackend;
use anyhow::{Context as _, Result};
use clap::Args;
use std::time::Duration;

/// Run the dispatchers.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Consumer name; defaults to one derived from the process ID.
    #[arg(long)]
    pub consumer: Option<String>,

    /// Seconds to wait for workers on shutdown.
    #[arg(long, default_value_t = 5)]
    pub grace_secs: u64,
}

/// Run the start command until Ctrl-C.
pub async fn run_start(args: StartArgs, config: &Config) -> Result<()> {
    let backend = connect(config);
    let consumer = args
        .consumer
        .unwrap_or_else(|| format!("lorawan-coord-{}", std::process::id()));

    let ctx = Context::background();
    for namespace in [StoreNamespace::Ns, StoreNamespace::As, StoreNamespace::Js] {
        migrator(backend.clone(), config, namespace)
            .gate()
            .check(&ctx)
            .await
            .with_context(|| format!("{namespace:?} store is not ready"))?;
    }

    let mut workers = WorkerSet::new(Backoff::default());
    spawn_dispatchers(&mut workers, backend, config, &consumer, &ctx).await?;
    tracing::info!(consumer = %consumer, workers = workers.len(), "dispatchers started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::warn!("shutdown signal received (SIGINT)");
    workers.shutdown(Duration::from_secs(args.grace_secs)).await;
    Ok(())
}

/// Create the consumer groups and spawn one dispatcher per queue.
pub async fn spawn_dispatchers(
    workers: &mut WorkerSet,
    backend: SharedBackend,
    config: &Config,
    consumer: &str,
    ctx: &Context,
) -> Result<()> {
    let uplinks = ApplicationUplinkQueue::new(
        backend.clone(),
        StoreNamespace::As.root(config),
        &config.tasks,
        &config.uplinks,
    );
    uplinks
        .init(ctx)
        .await
        .context("failed to initialize application uplink queue")?;

    let downlink_tasks = TaskQueue::new(
        backend,
        &StoreNamespace::Ns.root(config).sub("tasks").sub("downlink"),
        &config.tasks,
    );
    downlink_tasks
        .init(ctx)
        .await
        .context("failed to initialize downlink task queue")?;

    let name = consumer.to_string();
    workers.spawn("application-uplink-dispatcher", move |ctx: Context| {
        let uplinks = uplinks.clone();
        let consumer = name.clone();
        async move { uplinks.dispatch(&ctx, &consumer).await }
    });
    let name = consumer.to_string();
    workers.spawn("downlink-task-dispatcher", move |ctx: Context| {
        let tasks = downlink_tasks.clone();
        let consumer = name.clone();
        async move { tasks.dispatch(&ctx, &consumer).await }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_dispatchers_stop_on_shutdown() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let config = Config::default();
        let mut workers = WorkerSet::default();
        spawn_dispatchers(&mut workers, backend, &config, "test", &Context::background())
            .await
            .unwrap();
        assert_eq!(workers.len(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(workers.restarts(), 0);
        workers.shutdown(Duration::from_secs(2)).await;
    }
}
