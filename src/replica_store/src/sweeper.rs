use crate::record::CacheEntry;
use pool_lib::{unix_millis, EntryState, PnfsId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Decides which replicas may be evicted.
pub trait SweeperPolicy: Send + Sync {
    fn is_removable(&self, entry: &CacheEntry) -> bool;
}

/// Cached replicas without a valid pin.
pub struct DefaultSweeperPolicy;

impl SweeperPolicy for DefaultSweeperPolicy {
    fn is_removable(&self, entry: &CacheEntry) -> bool {
        entry.state == EntryState::Cached && !entry.is_sticky()
    }
}

#[derive(Default)]
struct RemovableSet {
    entries: HashMap<PnfsId, (u64, i64)>,
    bytes: u64,
}

/// Tracks the removable replicas and their space.
pub struct Sweeper {
    policy: Box<dyn SweeperPolicy>,
    removable: Mutex<RemovableSet>,
}

impl Sweeper {
    pub fn new(policy: Box<dyn SweeperPolicy>) -> Self {
        Self {
            policy,
            removable: Mutex::new(RemovableSet::default()),
        }
    }

    fn set(&self) -> MutexGuard<'_, RemovableSet> {
        self.removable.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-evaluates `entry` after any change to its state, pins or access time.
    pub fn update(&self, entry: &CacheEntry) {
        let removable = self.policy.is_removable(entry);
        let mut set = self.set();
        if let Some((size, _)) = set.entries.remove(&entry.pnfs_id) {
            set.bytes -= size;
        }
        if removable {
            set.entries
                .insert(entry.pnfs_id.clone(), (entry.size, entry.last_access_time));
            set.bytes += entry.size;
        }
    }

    pub fn remove(&self, pnfs_id: &PnfsId) {
        let mut set = self.set();
        if let Some((size, _)) = set.entries.remove(pnfs_id) {
            set.bytes -= size;
        }
    }

    pub fn removable_space(&self) -> u64 {
        self.set().bytes
    }

    /// Age in seconds of the least recently used removable replica.
    pub fn lru_seconds(&self) -> u64 {
        let set = self.set();
        match set.entries.values().map(|(_, atime)| *atime).min() {
            Some(oldest) => ((unix_millis() - oldest).max(0) / 1000) as u64,
            None => 0,
        }
    }

    /// Removable replicas, least recently used first.
    pub fn eviction_candidates(&self) -> Vec<PnfsId> {
        let set = self.set();
        let mut candidates: Vec<(&PnfsId, i64)> =
            set.entries.iter().map(|(id, (_, atime))| (id, *atime)).collect();
        candidates.sort_by_key(|(_, atime)| *atime);
        candidates.into_iter().map(|(id, _)| id.clone()).collect()
    }
}
