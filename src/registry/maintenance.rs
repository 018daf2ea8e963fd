//! Schema migrations and cleanup of the device registry.

use super::device::DeviceRegistry;
use crate::core::context::Context;
use crate::ids::parse_device_uid;
use crate::store::cleanup::Purge;
use crate::store::schema::{Migration, Migrator, SchemaGate};
use crate::store::StoreFuture;
use std::collections::BTreeMap;

/// Version 2 adds the `:fields` projections of the DevAddr indices.
pub const NETWORK_SERVER_SCHEMA_VERSION: u32 = 2;

/// Builds the `:fields` projections of every indexed session.
#[derive(Debug, Clone)]
pub struct SessionFieldsMigration {
    registry: DeviceRegistry,
    page_size: usize,
}

impl SessionFieldsMigration {
    pub fn new(registry: DeviceRegistry, page_size: usize) -> Self {
        Self {
            registry,
            page_size,
        }
    }
}

impl Migration for SessionFieldsMigration {
    fn name(&self) -> &'static str {
        "session-index-fields"
    }

    fn version(&self) -> u32 {
        2
    }

    fn apply<'a>(&'a self, ctx: &'a Context) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let count = self
                .registry
                .rebuild_session_fields(ctx, self.page_size)
                .await?;
            tracing::info!(devices = count, "rebuilt session index fields");
            Ok(())
        })
    }

    fn rollback<'a>(&'a self, ctx: &'a Context) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let count = self
                .registry
                .drop_session_fields(ctx, self.page_size)
                .await?;
            tracing::info!(keys = count, "removed session index fields");
            Ok(())
        })
    }
}

impl DeviceRegistry {
    /// The schema gate of this registry.
    pub fn schema_gate(&self) -> SchemaGate {
        SchemaGate::new(
            self.backend().clone(),
            self.keys().root(),
            NETWORK_SERVER_SCHEMA_VERSION,
        )
    }

    pub fn migrator(&self, page_size: usize) -> Migrator {
        Migrator::new(self.schema_gate())
            .register(Box::new(SessionFieldsMigration::new(self.clone(), page_size)))
    }
}

/// Orphaned devices are deleted with their index entries.
impl Purge for DeviceRegistry {
    fn purge<'a>(&'a self, ctx: &'a Context, ids: Vec<String>) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut by_app = BTreeMap::new();
            for uid in ids {
                match parse_device_uid(&uid) {
                    Ok(ids) => by_app
                        .entry(ids.application_ids)
                        .or_insert_with(Vec::new)
                        .push(ids.device_id),
                    Err(e) => tracing::warn!(uid = %uid, error = %e, "skipping invalid device UID"),
                }
            }
            let mut count = 0;
            for (app, dev_ids) in by_app {
                count += self.batch_delete(ctx, &app, &dev_ids).await?.len();
            }
            Ok(count)
        })
    }
}
