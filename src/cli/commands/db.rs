//! Db command implementation.

use super::{connect, StoreNamespace};
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::time::parse_duration;
use crate::registry::DeviceRegistry;
use crate::store::cleanup::{Cleaner, CleanupReport, FileIdentitySource, KeyPurge, Purge};
use crate::store::schema::{
    MigrationReport, Migrator, SchemaGate, APPLICATION_SERVER_SCHEMA_VERSION,
    JOIN_SERVER_SCHEMA_VERSION,
};
use crate::store::{ProtoStore, SharedBackend};
use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Store maintenance.
#[derive(Args, Debug)]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommand,
}

/// Db subcommands.
#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Bring the schema up to date.
    Migrate {
        #[arg(long, value_enum)]
        namespace: StoreNamespace,
        /// Re-run every migration after the breakpoint.
        #[arg(long)]
        force: bool,
        /// Undo the newest applied migration.
        #[arg(long, conflicts_with = "force")]
        rollback: bool,
    },
    /// Delete entries of identifiers missing from an authoritative list.
    Cleanup {
        #[arg(long, value_enum)]
        namespace: StoreNamespace,
        /// File with one identifier per line.
        #[arg(long)]
        authoritative: PathBuf,
        /// Only report what would be deleted.
        #[arg(long)]
        dry_run: bool,
        /// Delay between scan pages, e.g. `100ms`.
        #[arg(long, value_parser = parse_duration)]
        pagination_delay: Option<Duration>,
    },
    /// Remove index entries pointing at deleted devices.
    Prune {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Run the db command.
pub async fn run_db(args: DbArgs, config: &Config) -> Result<()> {
    let backend = connect(config);
    run_db_with(backend, config, args.command).await
}

/// Run a db subcommand against `backend`.
pub async fn run_db_with(backend: SharedBackend, config: &Config, command: DbCommand) -> Result<()> {
    let ctx = Context::background();
    match command {
        DbCommand::Migrate {
            namespace,
            force,
            rollback,
        } => {
            let report = migrator(backend, config, namespace)
                .migrate(&ctx, force, rollback)
                .await
                .context("migration failed")?;
            print_migration(namespace, &report);
        }
        DbCommand::Cleanup {
            namespace,
            authoritative,
            dry_run,
            pagination_delay,
        } => {
            let report = cleanup(
                &ctx,
                backend,
                config,
                namespace,
                FileIdentitySource::new(authoritative),
                dry_run,
                pagination_delay,
            )
            .await
            .context("cleanup failed")?;
            print_cleanup(namespace, dry_run, &report);
        }
        DbCommand::Prune { dry_run } => {
            let report = registry(backend, config)
                .prune(&ctx, config.cleanup.page_size, dry_run)
                .await
                .context("prune failed")?;
            let verb = if dry_run { "would remove" } else { "removed" };
            println!(
                "ns: {verb} {} markers and {} index entries",
                report.markers, report.index_entries
            );
        }
    }
    Ok(())
}

fn registry(backend: SharedBackend, config: &Config) -> DeviceRegistry {
    let root = StoreNamespace::Ns.root(config);
    DeviceRegistry::new(ProtoStore::new(backend, &config.mutex), root)
}

pub(crate) fn migrator(backend: SharedBackend, config: &Config, namespace: StoreNamespace) -> Migrator {
    let root = namespace.root(config);
    match namespace {
        StoreNamespace::Ns => registry(backend, config).migrator(config.cleanup.page_size),
        StoreNamespace::As => Migrator::new(SchemaGate::new(
            backend,
            &root,
            APPLICATION_SERVER_SCHEMA_VERSION,
        )),
        StoreNamespace::Js => {
            Migrator::new(SchemaGate::new(backend, &root, JOIN_SERVER_SCHEMA_VERSION))
        }
    }
}

async fn cleanup(
    ctx: &Context,
    backend: SharedBackend,
    config: &Config,
    namespace: StoreNamespace,
    source: FileIdentitySource,
    dry_run: bool,
    pagination_delay: Option<Duration>,
) -> Result<CleanupReport> {
    let root = namespace.root(config);
    let mut cleaner = Cleaner::new(backend.clone(), root.clone(), &config.cleanup).dry_run(dry_run);
    if let Some(delay) = pagination_delay {
        cleaner = cleaner.with_pagination_delay(delay);
    }
    let purge: Box<dyn Purge> = match namespace {
        StoreNamespace::Ns => Box::new(registry(backend, config)),
        StoreNamespace::As | StoreNamespace::Js => {
            Box::new(KeyPurge::new(backend, root, config.cleanup.page_size))
        }
    };
    Ok(cleaner.run(ctx, &source, purge.as_ref()).await?)
}

fn print_migration(namespace: StoreNamespace, report: &MigrationReport) {
    let from = report
        .from
        .map_or_else(|| "unset".to_string(), |v| v.to_string());
    println!("{namespace:?}: schema version {from} -> {}", report.to);
    for step in &report.steps {
        println!("  {step}");
    }
}

fn print_cleanup(namespace: StoreNamespace, dry_run: bool, report: &CleanupReport) {
    println!(
        "{namespace:?}: {} local, {} orphaned",
        report.local,
        report.orphaned.len()
    );
    for id in &report.orphaned {
        println!("  {id}");
    }
    if !dry_run {
        println!("  purged {}", report.purged);
    }
}
