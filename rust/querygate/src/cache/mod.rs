//! Mirrors container records into Valkey.
//!
//! Layout: a JSON blob per container at `containers:data:{id}` (no expiry) and one
//! sorted-set member `"{CODE}:{id}"` with score 0 under `containers:index`. A run loads
//! the full source snapshot, diffs its ids against the ids parsed from the index, drops
//! stale entries (including members left behind by a code change) and rewrites every
//! source record, so each cached id has exactly one index member. Runs are not
//! transactional: a failure part way leaves whatever was already written, and the next
//! run converges.
//!
//! Removing stale index members needs a second full scan of the index, so removal cost
//! grows with the index size rather than with the number of stale ids.

pub mod memory;
pub mod scheduler;
pub mod source;
pub mod store;

pub use memory::InMemoryCacheStore;
pub use scheduler::SyncScheduler;
pub use source::{ContainerSource, SourceError, SqlContainerSource};
pub use store::{CacheError, CacheStore, RedisCacheStore};

use crate::models::ContainerRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, info};

pub const INDEX_KEY: &str = "containers:index";
pub const DATA_KEY_PREFIX: &str = "containers:data:";

pub fn data_key(id: i64) -> String {
    format!("{DATA_KEY_PREFIX}{id}")
}

/// Id suffix of an index member (`"CODE:42"` → 42). Codes may themselves contain colons.
pub fn member_id(member: &str) -> Option<i64> {
    let (_, id) = member.rsplit_once(':')?;
    id.parse().ok()
}

/// A member whose id is still in the source but whose text no longer matches the record.
fn is_renamed(member: &str, expected: &HashMap<i64, String>) -> bool {
    member_id(member)
        .and_then(|id| expected.get(&id))
        .is_some_and(|current| current != member)
}

#[derive(Debug, Error)]
pub enum CacheSyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] CacheError),

    #[error("failed to encode container {id}: {source}")]
    Encode {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSyncResult {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Loading,
    Diffing,
    Removing,
    Adding,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPhase::Loading => "loading",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Removing => "removing",
            SyncPhase::Adding => "adding",
        })
    }
}

/// Something the scheduler can fire.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn run_sync(&self) -> Result<CacheSyncResult, CacheSyncError>;
}

#[derive(Clone)]
pub struct CacheReconciler {
    source: Arc<dyn ContainerSource>,
    store: Arc<dyn CacheStore>,
    scan_page_size: usize,
}

impl CacheReconciler {
    pub fn new(
        source: Arc<dyn ContainerSource>,
        store: Arc<dyn CacheStore>,
        scan_page_size: usize,
    ) -> Self {
        Self {
            source,
            store,
            scan_page_size: scan_page_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub async fn reconcile(&self) -> Result<CacheSyncResult, CacheSyncError> {
        let started = Instant::now();
        info!("starting container cache sync");

        let result = self.run().await.map(|(added, removed, total)| CacheSyncResult {
            added,
            removed,
            total,
            execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });

        match &result {
            Ok(summary) => info!(
                added = summary.added,
                removed = summary.removed,
                total = summary.total,
                execution_time_ms = summary.execution_time_ms,
                "container cache sync completed"
            ),
            Err(err) => error!(error = %err, "container cache sync failed"),
        }
        result
    }

    async fn run(&self) -> Result<(usize, usize, usize), CacheSyncError> {
        let records = self.source.load_all().await?;
        debug!(phase = %SyncPhase::Loading, records = records.len(), "loaded source snapshot");

        let expected: HashMap<i64, String> = records
            .iter()
            .map(|record| (record.id, record.index_member()))
            .collect();
        let members = self.store.scan_index(INDEX_KEY, self.scan_page_size).await?;
        let cached_ids: HashSet<i64> = members
            .iter()
            .filter_map(|member| member_id(member))
            .collect();
        let to_remove: HashSet<i64> = cached_ids
            .iter()
            .filter(|id| !expected.contains_key(*id))
            .copied()
            .collect();
        let to_add = expected.keys().filter(|id| !cached_ids.contains(*id)).count();
        let renamed = members
            .iter()
            .filter(|member| is_renamed(member, &expected))
            .count();
        debug!(
            phase = %SyncPhase::Diffing,
            cached = cached_ids.len(),
            to_remove = to_remove.len(),
            to_add,
            renamed,
            "computed cache diff"
        );

        if !to_remove.is_empty() || renamed > 0 {
            self.remove(&to_remove, &expected).await?;
            debug!(
                phase = %SyncPhase::Removing,
                removed = to_remove.len(),
                renamed,
                "dropped stale containers"
            );
        }

        for record in &records {
            self.write(record).await?;
        }
        debug!(
            phase = %SyncPhase::Adding,
            written = records.len(),
            added = to_add,
            "wrote containers"
        );

        Ok((to_add, to_remove.len(), records.len()))
    }

    /// Deletes the blobs of `ids` and every index member that is either for one of `ids`
    /// or for a live id under an outdated code.
    async fn remove(
        &self,
        ids: &HashSet<i64>,
        expected: &HashMap<i64, String>,
    ) -> Result<(), CacheSyncError> {
        let keys: Vec<String> = ids.iter().map(|id| data_key(*id)).collect();
        self.store.delete_keys(&keys).await?;

        let stale: Vec<String> = self
            .store
            .scan_index(INDEX_KEY, self.scan_page_size)
            .await?
            .into_iter()
            .filter(|member| {
                member_id(member).is_some_and(|id| ids.contains(&id))
                    || is_renamed(member, expected)
            })
            .collect();
        self.store.remove_members(INDEX_KEY, &stale).await?;
        Ok(())
    }

    async fn write(&self, record: &ContainerRecord) -> Result<(), CacheSyncError> {
        let json = serde_json::to_string(record).map_err(|source| CacheSyncError::Encode {
            id: record.id,
            source,
        })?;
        self.store
            .upsert_entry(&data_key(record.id), &json, INDEX_KEY, &record.index_member())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncTrigger for CacheReconciler {
    async fn run_sync(&self) -> Result<CacheSyncResult, CacheSyncError> {
        self.reconcile().await
    }
}
