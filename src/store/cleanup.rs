//! Removal of entries whose owner no longer exists.
//!
//! The authoritative set of identifiers comes from outside the store (the
//! identity registry). A [`Cleaner`] pages the identifiers present locally,
//! computes `local \ authoritative`, and purges only that complement.

use super::{Namespace, Pipeline, SharedBackend, StoreFuture};
use crate::core::config::CleanupConfig;
use crate::core::context::Context;
use crate::core::error::{StoreError, StoreResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifiers present in `local` but not in `authoritative`.
pub fn complement<'a, I>(authoritative: &BTreeSet<String>, local: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    local
        .into_iter()
        .filter(|id| !authoritative.contains(*id))
        .cloned()
        .collect()
}

/// Source of the identifiers that must be kept.
pub trait IdentitySource: Send + Sync {
    fn identifiers(&self) -> StoreResult<BTreeSet<String>>;
}

impl IdentitySource for BTreeSet<String> {
    fn identifiers(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.clone())
    }
}

/// Identifiers listed one per line in a file; blank lines and `#`
/// comments are ignored.
#[derive(Debug, Clone)]
pub struct FileIdentitySource {
    path: PathBuf,
}

impl FileIdentitySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentitySource for FileIdentitySource {
    fn identifiers(&self) -> StoreResult<BTreeSet<String>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            StoreError::invalid_argument(format!("failed to read {}: {e}", self.path.display()))
        })?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

/// Deletes everything stored for a set of identifiers.
pub trait Purge: Send + Sync {
    /// Returns the number of identifiers that had data.
    fn purge<'a>(&'a self, ctx: &'a Context, ids: Vec<String>) -> StoreFuture<'a, usize>;
}

/// Purges by deleting `<root>:uid:<id>` and every key below it.
#[derive(Debug, Clone)]
pub struct KeyPurge {
    backend: SharedBackend,
    root: Namespace,
    page_size: usize,
}

impl KeyPurge {
    pub fn new(backend: SharedBackend, root: Namespace, page_size: usize) -> Self {
        Self {
            backend,
            root,
            page_size: page_size.max(1),
        }
    }

    async fn purge_one(&self, ctx: &Context, id: &str) -> StoreResult<bool> {
        let record = self.root.key(&["uid", id]);
        let below = format!("{}:*", super::keys::escape_glob(&record));
        let mut pipe = Pipeline::new();
        pipe.del(record);
        let mut cursor = 0;
        loop {
            let page = ctx
                .run(self.backend.scan(cursor, below.clone(), self.page_size))
                .await?;
            for key in page.keys {
                pipe.del(key);
            }
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        let replies = ctx.run(self.backend.exec(pipe.into_ops())).await?;
        let mut deleted = 0;
        for reply in replies {
            deleted += reply.into_int()?;
        }
        Ok(deleted > 0)
    }
}

impl Purge for KeyPurge {
    fn purge<'a>(&'a self, ctx: &'a Context, ids: Vec<String>) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut count = 0;
            for id in &ids {
                if self.purge_one(ctx, id).await? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }
}

/// What a [`Cleaner`] run found and removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Identifiers found locally.
    pub local: usize,
    /// Local identifiers missing from the authoritative set.
    pub orphaned: BTreeSet<String>,
    /// Orphaned identifiers actually purged; 0 in dry-run mode.
    pub purged: usize,
}

/// Pages the identifiers stored under a namespace and purges the orphans.
#[derive(Debug, Clone)]
pub struct Cleaner {
    backend: SharedBackend,
    root: Namespace,
    page_size: usize,
    pagination_delay: Duration,
    dry_run: bool,
}

impl Cleaner {
    pub fn new(backend: SharedBackend, root: Namespace, config: &CleanupConfig) -> Self {
        Self {
            backend,
            root,
            page_size: config.page_size.max(1),
            pagination_delay: Duration::from_millis(config.pagination_delay_ms),
            dry_run: false,
        }
    }

    pub fn with_pagination_delay(mut self, delay: Duration) -> Self {
        self.pagination_delay = delay;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Identifiers with keys under `<root>:uid:`.
    pub async fn local_identifiers(&self, ctx: &Context) -> StoreResult<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        let mut cursor = 0;
        loop {
            let page = ctx
                .run(self.backend.scan(cursor, self.root.pattern("uid:*"), self.page_size))
                .await?;
            ids.extend(page.keys.iter().filter_map(|key| {
                let rest = self.root.strip(key)?.strip_prefix("uid:")?;
                let id = rest.split(':').next()?;
                (!id.is_empty()).then(|| id.to_string())
            }));
            cursor = page.cursor;
            if cursor == 0 {
                return Ok(ids);
            }
            if !self.pagination_delay.is_zero() {
                ctx.sleep(self.pagination_delay).await?;
            }
        }
    }

    pub async fn run(
        &self,
        ctx: &Context,
        source: &dyn IdentitySource,
        purge: &dyn Purge,
    ) -> StoreResult<CleanupReport> {
        let authoritative = source.identifiers()?;
        let local = self.local_identifiers(ctx).await?;
        let orphaned = complement(&authoritative, &local);
        for id in &orphaned {
            tracing::info!(root = %self.root.root(), id = %id, dry_run = self.dry_run, "orphaned entry");
        }
        let purged = if self.dry_run || orphaned.is_empty() {
            0
        } else {
            purge
                .purge(ctx, orphaned.iter().cloned().collect())
                .await?
        };
        tracing::info!(
            root = %self.root.root(),
            local = local.len(),
            orphaned = orphaned.len(),
            purged,
            "cleanup finished"
        );
        Ok(CleanupReport {
            local: local.len(),
            orphaned,
            purged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Backend, MemoryBackend};
    use std::io::Write;
    use std::sync::Arc;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_complement() {
        let local = set(&["a.x", "a.y", "b.z"]);
        assert_eq!(complement(&set(&["a.x", "c.q"]), &local), set(&["a.y", "b.z"]));
        assert!(complement(&local, &local).is_empty());
    }

    #[test]
    fn test_file_source_skips_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# devices\napp.dev-1\n\n  app.dev-2  ").unwrap();
        let ids = FileIdentitySource::new(file.path()).identifiers().unwrap();
        assert_eq!(ids, set(&["app.dev-1", "app.dev-2"]));
        assert!(FileIdentitySource::new("/nonexistent/ids").identifiers().is_err());
    }

    #[tokio::test]
    async fn test_cleaner_purges_only_orphans() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let ctx = Context::background();
        let mut pipe = Pipeline::new();
        pipe.set("as:uid:app-1", "x")
            .set("as:uid:app-1:uplinks", "x")
            .set("as:uid:app-2", "x")
            .set("as:uid:app-2:uplinks:join-accept", "x")
            .set("other:uid:app-2", "x");
        backend.exec(pipe.into_ops()).await.unwrap();

        let root = Namespace::new("as");
        let config = CleanupConfig {
            page_size: 1,
            pagination_delay_ms: 0,
        };
        let purge = KeyPurge::new(backend.clone(), root.clone(), 1);
        let authoritative = set(&["app-1"]);

        let dry = Cleaner::new(backend.clone(), root.clone(), &config)
            .dry_run(true)
            .run(&ctx, &authoritative, &purge)
            .await
            .unwrap();
        assert_eq!(dry.local, 2);
        assert_eq!(dry.orphaned, set(&["app-2"]));
        assert_eq!(dry.purged, 0);

        let report = Cleaner::new(backend.clone(), root, &config)
            .run(&ctx, &authoritative, &purge)
            .await
            .unwrap();
        assert_eq!(report.purged, 1);

        let page = backend.scan(0, "*".into(), 100).await.unwrap();
        let mut keys = page.keys;
        keys.sort();
        assert_eq!(keys, vec!["as:uid:app-1", "as:uid:app-1:uplinks", "other:uid:app-2"]);
    }
}
