use crate::{AttributeUpdate, FileAttributes, PnfsId, PoolError, PoolResult};
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Port to the namespace service. Every call may fail with
/// `PoolError::FileNotFound` when the file was deleted from the namespace.
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    async fn add_cache_location(&self, pnfs_id: &PnfsId, pool: &str) -> PoolResult<()>;

    async fn clear_cache_location(
        &self,
        pnfs_id: &PnfsId,
        pool: &str,
        remove_if_last: bool,
    ) -> PoolResult<()>;

    async fn set_file_attributes(&self, pnfs_id: &PnfsId, update: AttributeUpdate)
        -> PoolResult<()>;

    async fn get_file_attributes(&self, pnfs_id: &PnfsId) -> PoolResult<FileAttributes>;
}

struct NamespaceEntry {
    attrs: FileAttributes,
    locations: HashSet<String>,
}

/// In-process namespace for a standalone pool.
pub struct LocalNamespace {
    entries: Mutex<HashMap<PnfsId, NamespaceEntry>>,
}

impl LocalNamespace {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> PoolResult<std::sync::MutexGuard<'_, HashMap<PnfsId, NamespaceEntry>>> {
        self.entries
            .lock()
            .map_err(|_| PoolError::Internal("namespace lock poisoned".to_string()))
    }

    pub fn create_file(&self, attrs: FileAttributes) -> PoolResult<()> {
        let mut entries = self.lock()?;
        entries.insert(
            attrs.pnfs_id.clone(),
            NamespaceEntry {
                attrs,
                locations: HashSet::new(),
            },
        );
        Ok(())
    }

    pub fn delete_file(&self, pnfs_id: &PnfsId) -> PoolResult<()> {
        let mut entries = self.lock()?;
        entries
            .remove(pnfs_id)
            .map(|_| ())
            .ok_or_else(|| PoolError::FileNotFound(pnfs_id.to_string()))
    }

    pub fn locations(&self, pnfs_id: &PnfsId) -> Vec<String> {
        match self.lock() {
            Ok(entries) => {
                let mut locations: Vec<String> = entries
                    .get(pnfs_id)
                    .map(|e| e.locations.iter().cloned().collect())
                    .unwrap_or_default();
                locations.sort();
                locations
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn exists(&self, pnfs_id: &PnfsId) -> bool {
        self.lock()
            .map(|entries| entries.contains_key(pnfs_id))
            .unwrap_or(false)
    }
}

impl Default for LocalNamespace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NamespaceClient for LocalNamespace {
    async fn add_cache_location(&self, pnfs_id: &PnfsId, pool: &str) -> PoolResult<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(pnfs_id)
            .ok_or_else(|| PoolError::FileNotFound(pnfs_id.to_string()))?;
        entry.locations.insert(pool.to_string());
        debug!("namespace: {} located on {}", pnfs_id, pool);
        Ok(())
    }

    async fn clear_cache_location(
        &self,
        pnfs_id: &PnfsId,
        pool: &str,
        remove_if_last: bool,
    ) -> PoolResult<()> {
        let mut entries = self.lock()?;
        let now_empty = match entries.get_mut(pnfs_id) {
            Some(entry) => {
                entry.locations.remove(pool);
                entry.locations.is_empty()
            }
            None => return Ok(()),
        };
        if remove_if_last && now_empty {
            entries.remove(pnfs_id);
            debug!("namespace: {} removed with its last location", pnfs_id);
        }
        Ok(())
    }

    async fn set_file_attributes(
        &self,
        pnfs_id: &PnfsId,
        update: AttributeUpdate,
    ) -> PoolResult<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(pnfs_id)
            .ok_or_else(|| PoolError::FileNotFound(pnfs_id.to_string()))?;
        if let Some(size) = update.size {
            entry.attrs.size = Some(size);
        }
        entry.attrs.merge_checksums(&update.checksums);
        if update.access_latency.is_some() {
            entry.attrs.access_latency = update.access_latency;
        }
        if update.retention_policy.is_some() {
            entry.attrs.retention_policy = update.retention_policy;
        }
        if let Some(location) = update.location {
            entry.locations.insert(location);
        }
        Ok(())
    }

    async fn get_file_attributes(&self, pnfs_id: &PnfsId) -> PoolResult<FileAttributes> {
        let entries = self.lock()?;
        entries
            .get(pnfs_id)
            .map(|e| e.attrs.clone())
            .ok_or_else(|| PoolError::FileNotFound(pnfs_id.to_string()))
    }
}
