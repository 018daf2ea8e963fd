//! Schema version gate and migrations.
//!
//! Each namespace stores its schema version at `<root>:schema-version`.
//! Services refuse to start unless the stored version equals the version
//! their code expects; `db migrate` brings a store up to date.
//!
//! ```text
//!   stored < breakpoint      upgrade with an older release first
//!   breakpoint <= stored     apply migrations (stored, code]
//!   stored > code            refuse, the store is newer
//! ```

use super::{Namespace, Pipeline, Read, SharedBackend, StoreFuture};
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};

/// Oldest stored version the current code can upgrade.
pub const BREAKPOINT: u32 = 1;

pub const APPLICATION_SERVER_SCHEMA_VERSION: u32 = 1;

pub const JOIN_SERVER_SCHEMA_VERSION: u32 = 1;

/// A single schema upgrade to [`Migration::version`] from the version
/// before it.
pub trait Migration: Send + Sync {
    fn name(&self) -> &'static str;

    /// Version the store is at after applying.
    fn version(&self) -> u32;

    /// Apply the upgrade. Must be safe to re-run.
    fn apply<'a>(&'a self, ctx: &'a Context) -> StoreFuture<'a, ()>;

    /// Undo the upgrade.
    fn rollback<'a>(&'a self, ctx: &'a Context) -> StoreFuture<'a, ()>;
}

/// Stored schema version of a namespace, compared against the version the
/// code expects.
#[derive(Debug, Clone)]
pub struct SchemaGate {
    backend: SharedBackend,
    key: String,
    version: u32,
}

impl SchemaGate {
    pub fn new(backend: SharedBackend, root: &Namespace, version: u32) -> Self {
        Self {
            backend,
            key: root.key(&["schema-version"]),
            version,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Version the code expects.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The stored version, `None` if the store was never migrated.
    pub async fn stored(&self, ctx: &Context) -> StoreResult<Option<u32>> {
        let reply = ctx
            .run(super::read_one(self.backend.as_ref(), Read::get(&self.key)))
            .await?
            .into_value()?;
        let Some(raw) = reply else {
            return Ok(None);
        };
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| StoreError::corruption(format!("invalid schema version at {}", self.key)))
    }

    pub async fn set(&self, ctx: &Context, version: u32) -> StoreResult<()> {
        let mut pipe = Pipeline::new();
        pipe.set(self.key.clone(), version.to_string());
        ctx.run(self.backend.exec(pipe.into_ops())).await?;
        Ok(())
    }

    /// Fail with `FailedPrecondition` unless the store is at the expected
    /// version.
    pub async fn check(&self, ctx: &Context) -> StoreResult<()> {
        match self.stored(ctx).await? {
            Some(v) if v == self.version => Ok(()),
            Some(v) => Err(StoreError::failed_precondition(format!(
                "schema version {v} at {} does not match {}; run `db migrate`",
                self.key, self.version
            ))),
            None => Err(StoreError::failed_precondition(format!(
                "no schema version at {}; run `db migrate`",
                self.key
            ))),
        }
    }
}

/// What a [`Migrator`] run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: Option<u32>,
    pub to: u32,
    /// Names of the migrations applied or rolled back, in order.
    pub steps: Vec<&'static str>,
}

/// Applies the migrations of one namespace.
pub struct Migrator {
    gate: SchemaGate,
    breakpoint: u32,
    migrations: Vec<Box<dyn Migration>>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("gate", &self.gate)
            .field("breakpoint", &self.breakpoint)
            .field(
                "migrations",
                &self.migrations.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Migrator {
    /// A migrator for a namespace without migrations.
    pub fn new(gate: SchemaGate) -> Self {
        Self {
            gate,
            breakpoint: BREAKPOINT,
            migrations: Vec::new(),
        }
    }

    pub fn with_breakpoint(mut self, breakpoint: u32) -> Self {
        self.breakpoint = breakpoint;
        self
    }

    /// Register a migration. Migrations run in version order.
    pub fn register(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version());
        self
    }

    pub fn gate(&self) -> &SchemaGate {
        &self.gate
    }

    /// Upgrade the store to the code's version.
    ///
    /// A store that was never migrated starts at the breakpoint. `force`
    /// re-runs every migration after the breakpoint; `rollback` instead
    /// undoes the newest applied migration.
    pub async fn migrate(&self, ctx: &Context, force: bool, rollback: bool) -> StoreResult<MigrationReport> {
        let stored = self.gate.stored(ctx).await?;
        let current = stored.unwrap_or(self.breakpoint);
        let target = self.gate.version();
        if current > target {
            return Err(StoreError::failed_precondition(format!(
                "schema version {current} is newer than {target}"
            )));
        }
        if current < self.breakpoint {
            return Err(StoreError::failed_precondition(format!(
                "schema version {current} is older than {}; upgrade with an older release first",
                self.breakpoint
            )));
        }
        if rollback {
            return self.rollback(ctx, stored, current).await;
        }

        let start = if force { self.breakpoint } else { current };
        let mut steps = Vec::new();
        for migration in self
            .migrations
            .iter()
            .filter(|m| m.version() > start && m.version() <= target)
        {
            tracing::info!(
                key = %self.gate.key(),
                migration = migration.name(),
                version = migration.version(),
                "applying migration"
            );
            ctx.run(migration.apply(ctx)).await?;
            self.gate.set(ctx, migration.version()).await?;
            steps.push(migration.name());
        }
        if stored != Some(target) {
            self.gate.set(ctx, target).await?;
        }
        Ok(MigrationReport {
            from: stored,
            to: target,
            steps,
        })
    }

    async fn rollback(&self, ctx: &Context, stored: Option<u32>, current: u32) -> StoreResult<MigrationReport> {
        let migration = self
            .migrations
            .iter()
            .find(|m| m.version() == current)
            .filter(|_| current > self.breakpoint)
            .ok_or_else(|| {
                StoreError::failed_precondition(format!("no migration to roll back at version {current}"))
            })?;
        tracing::info!(
            key = %self.gate.key(),
            migration = migration.name(),
            version = current,
            "rolling back migration"
        );
        ctx.run(migration.rollback(ctx)).await?;
        self.gate.set(ctx, current - 1).await?;
        Ok(MigrationReport {
            from: stored,
            to: current - 1,
            steps: vec![migration.name()],
        })
    }
}
