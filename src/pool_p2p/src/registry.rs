use crate::companion::*;
use log::{debug, info};
use pool_lib::{NamespaceClient, PoolError, PoolResult};
use replica_store::Repository;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Active companions of a pool, addressed by companion id.
pub struct CompanionRegistry {
    repository: Arc<Repository>,
    namespace: Arc<dyn NamespaceClient>,
    config: CompanionConfig,
    companions: Arc<Mutex<HashMap<u64, Arc<Companion>>>>,
}

impl CompanionRegistry {
    pub fn new(
        repository: Arc<Repository>,
        namespace: Arc<dyn NamespaceClient>,
        config: CompanionConfig,
    ) -> Self {
        Self {
            repository,
            namespace,
            config,
            companions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn companions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Companion>>> {
        self.companions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start_companion(
        &self,
        source: Arc<dyn SourcePool>,
        request: CompanionRequest,
        callback: Option<Arc<dyn CacheFileAvailable>>,
    ) -> Arc<Companion> {
        let companion = Companion::start(
            self.repository.clone(),
            self.namespace.clone(),
            source,
            request,
            self.config.clone(),
            callback,
        );
        info!(
            "CompanionRegistry: started companion {} for {} from {}",
            companion.id(),
            companion.pnfs_id(),
            companion.source_name()
        );
        self.companions().insert(companion.id(), companion.clone());

        let companions = self.companions.clone();
        let finished = companion.clone();
        tokio::spawn(async move {
            let _ = finished.wait().await;
            companions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&finished.id());
            debug!("CompanionRegistry: companion {} removed", finished.id());
        });
        companion
    }

    pub fn get(&self, id: u64) -> Option<Arc<Companion>> {
        self.companions().get(&id).cloned()
    }

    fn lookup(&self, id: u64) -> PoolResult<Arc<Companion>> {
        self.get(id)
            .ok_or_else(|| PoolError::InvalidParam(format!("no such companion: {}", id)))
    }

    pub fn door_url_arrived(&self, id: u64, uri: &str) -> PoolResult<()> {
        self.lookup(id)?.door_url_arrived(uri);
        Ok(())
    }

    pub fn door_transfer_finished(&self, id: u64, result: PoolResult<()>) -> PoolResult<()> {
        self.lookup(id)?.door_transfer_finished(result);
        Ok(())
    }

    pub fn cancel(&self, id: u64, cause: &str) -> PoolResult<bool> {
        Ok(self.lookup(id)?.cancel(cause))
    }

    pub fn cancel_all(&self, cause: &str) {
        for companion in self.list() {
            companion.cancel(cause);
        }
    }

    /// Companions ordered by id.
    pub fn list(&self) -> Vec<Arc<Companion>> {
        let mut list: Vec<_> = self.companions().values().cloned().collect();
        list.sort_by_key(|c| c.id());
        list
    }

    pub fn len(&self) -> usize {
        self.companions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One line per companion, as shown by `p2p ls`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for companion in self.list() {
            out.push_str(&companion.to_string());
            out.push('\n');
        }
        out
    }
}
