use crate::allocator::Allocator;
use crate::file_store::FileStore;
use crate::listeners::{
    EntryChangeEvent, StateChangeEvent, StateChangeListener, StateChangeListeners,
    StickyChangeEvent,
};
use crate::meta_store::{MetaDataStore, MetaRecord};
use crate::read_handle::ReadHandle;
use crate::record::{CacheEntry, RecordState, ReplicaRecord};
use crate::space::{default_gap, SpaceRecord};
use crate::sweeper::{DefaultSweeperPolicy, Sweeper, SweeperPolicy};
use crate::write_handle::WriteHandle;
use log::{debug, error, info, warn};
use pool_lib::{
    unix_millis, EntryState, FileAttributes, NamespaceClient, PnfsId, PoolError, PoolResult,
    StickyRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Owner name of the pin placed on freshly written cached replicas.
pub const SELF_STICKY_OWNER: &str = "self";

const MAX_EXPIRATION_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub pool_name: String,
    /// Volatile pools ask the namespace to drop a file with its last location.
    pub volatile: bool,
    pub max_disk_space: Option<u64>,
    pub gap: Option<u64>,
    pub sticky_hold_time_secs: u64,
    pub expiration_clock_shift_ms: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            pool_name: "pool".to_string(),
            volatile: false,
            max_disk_space: None,
            gap: None,
            sticky_hold_time_secs: 300,
            expiration_clock_shift_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryState {
    Uninitialized,
    Initializing,
    Initialized,
    Loading,
    Open,
    Failed,
    Closed,
}

impl fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepositoryState::Uninitialized => "UNINITIALIZED",
            RepositoryState::Initializing => "INITIALIZING",
            RepositoryState::Initialized => "INITIALIZED",
            RepositoryState::Loading => "LOADING",
            RepositoryState::Open => "OPEN",
            RepositoryState::Failed => "FAILED",
            RepositoryState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// Do not touch the access time.
    NoAtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    ReadOnly,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub source: String,
    pub action: FaultAction,
    pub message: String,
}

pub trait FaultListener: Send + Sync {
    fn fault_occurred(&self, event: &FaultEvent);
}

#[derive(Default)]
struct SpaceSettings {
    max_disk_space: Option<u64>,
    runtime_max_disk_space: Option<u64>,
    gap: Option<u64>,
}

struct ExpirationTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// The replica repository of one pool.
///
/// The id map sits behind an async read-write lock that is only held for
/// lookups and inserts. Everything about a single replica is guarded by the
/// record's own mutex, which is never held across an await.
pub struct Repository {
    weak_self: Weak<Repository>,
    config: RepositoryConfig,
    state: Mutex<RepositoryState>,
    entries: tokio::sync::RwLock<HashMap<PnfsId, Arc<ReplicaRecord>>>,
    allocator: Allocator,
    sweeper: Sweeper,
    meta: Arc<dyn MetaDataStore>,
    files: FileStore,
    namespace: Arc<dyn NamespaceClient>,
    listeners: StateChangeListeners,
    fault_listeners: RwLock<Vec<Arc<dyn FaultListener>>>,
    expirations: Mutex<HashMap<PnfsId, ExpirationTask>>,
    expiration_generation: AtomicU64,
    space_settings: Mutex<SpaceSettings>,
}

impl Repository {
    pub fn new(
        config: RepositoryConfig,
        meta: Arc<dyn MetaDataStore>,
        files: FileStore,
        namespace: Arc<dyn NamespaceClient>,
    ) -> Arc<Self> {
        Self::new_with_policy(config, meta, files, namespace, Box::new(DefaultSweeperPolicy))
    }

    pub fn new_with_policy(
        config: RepositoryConfig,
        meta: Arc<dyn MetaDataStore>,
        files: FileStore,
        namespace: Arc<dyn NamespaceClient>,
        policy: Box<dyn SweeperPolicy>,
    ) -> Arc<Self> {
        let space_settings = SpaceSettings {
            max_disk_space: config.max_disk_space,
            runtime_max_disk_space: None,
            gap: config.gap,
        };
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            state: Mutex::new(RepositoryState::Uninitialized),
            entries: tokio::sync::RwLock::new(HashMap::new()),
            allocator: Allocator::new(0),
            sweeper: Sweeper::new(policy),
            meta,
            files,
            namespace,
            listeners: StateChangeListeners::new(),
            fault_listeners: RwLock::new(Vec::new()),
            expirations: Mutex::new(HashMap::new()),
            expiration_generation: AtomicU64::new(0),
            space_settings: Mutex::new(space_settings),
        })
    }

    fn arc(&self) -> PoolResult<Arc<Repository>> {
        self.weak_self
            .upgrade()
            .ok_or_else(|| PoolError::Internal("repository dropped".to_string()))
    }

    pub fn pool_name(&self) -> &str {
        &self.config.pool_name
    }

    pub(crate) fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub(crate) fn namespace(&self) -> &Arc<dyn NamespaceClient> {
        &self.namespace
    }

    // ---------- lifecycle ----------

    fn repo_state(&self) -> MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> RepositoryState {
        *self.repo_state()
    }

    fn set_repo_state(&self, state: RepositoryState) {
        *self.repo_state() = state;
    }

    fn check_open(&self) -> PoolResult<()> {
        let state = self.state();
        if state != RepositoryState::Open {
            return Err(PoolError::IllegalState(format!(
                "repository is not open ({})",
                state
            )));
        }
        Ok(())
    }

    fn check_initialized(&self) -> PoolResult<()> {
        match self.state() {
            RepositoryState::Initialized | RepositoryState::Loading | RepositoryState::Open => {
                Ok(())
            }
            state => Err(PoolError::IllegalState(format!(
                "repository is not initialized ({})",
                state
            ))),
        }
    }

    /// Sizes the pool. Must be called exactly once, before `load`.
    pub fn init(&self) -> PoolResult<()> {
        {
            let mut state = self.repo_state();
            if *state != RepositoryState::Uninitialized {
                return Err(PoolError::IllegalState(
                    "can only initialize an uninitialized repository".to_string(),
                ));
            }
            *state = RepositoryState::Initializing;
        }

        match self.update_total_size() {
            Ok(()) => {
                self.set_repo_state(RepositoryState::Initialized);
                info!(
                    "Repository {}: initialized, total space {}",
                    self.config.pool_name,
                    self.allocator.total()
                );
                Ok(())
            }
            Err(e) => {
                self.set_repo_state(RepositoryState::Failed);
                error!("Repository {}: init failed: {}", self.config.pool_name, e);
                Err(e)
            }
        }
    }

    /// Rebuilds the replica map from the metadata store and opens the repository.
    pub async fn load(&self) -> PoolResult<()> {
        {
            let mut state = self.repo_state();
            if *state != RepositoryState::Initialized {
                return Err(PoolError::IllegalState(
                    "can only load an initialized repository".to_string(),
                ));
            }
            *state = RepositoryState::Loading;
        }

        match self.run_inventory().await {
            Ok(count) => {
                self.set_repo_state(RepositoryState::Open);
                info!(
                    "Repository {}: loaded {} replicas",
                    self.config.pool_name, count
                );
                Ok(())
            }
            Err(e) => {
                self.set_repo_state(RepositoryState::Failed);
                error!("Repository {}: load failed: {}", self.config.pool_name, e);
                Err(e)
            }
        }
    }

    async fn run_inventory(&self) -> PoolResult<usize> {
        let ids = self.meta.index()?;
        let mut loaded = Vec::with_capacity(ids.len());
        let mut known = HashSet::with_capacity(ids.len());

        for id in ids {
            let Some(stored) = self.meta.get(&id)? else {
                continue;
            };
            let length = self.files.length(&id)?;
            let mut state = stored.into_state();
            // nobody holds the reservation of an interrupted transfer any longer
            if state.state.is_mutable() {
                state.size = length.unwrap_or(0);
            }
            self.allocator.add_used(state.size);
            if state.state == EntryState::Precious {
                self.allocator.adjust_precious(state.size as i64);
            }

            let record = Arc::new(ReplicaRecord::from_state(state));
            self.entries.write().await.insert(id.clone(), record.clone());
            known.insert(id);
            loaded.push((record, length));
        }

        self.update_total_size()?;

        for id in self.files.list()? {
            if !known.contains(&id) {
                warn!(
                    "Repository {}: deleting data file {} without metadata",
                    self.config.pool_name, id
                );
                self.files.remove(&id)?;
            }
        }

        let count = loaded.len();
        for (record, length) in loaded {
            self.reconcile_loaded(&record, length).await?;
        }
        Ok(count)
    }

    async fn reconcile_loaded(
        &self,
        record: &Arc<ReplicaRecord>,
        length: Option<u64>,
    ) -> PoolResult<()> {
        let id = record.pnfs_id();
        let removed = {
            let mut st = record.lock()?;
            let target = match st.state {
                EntryState::New
                | EntryState::FromStore
                | EntryState::FromPool
                | EntryState::Removed
                | EntryState::Destroyed => Some(EntryState::Removed),
                EntryState::FromClient => Some(EntryState::Broken),
                EntryState::Cached | EntryState::Precious if length != Some(st.size) => {
                    Some(EntryState::Broken)
                }
                _ => None,
            };
            match target {
                Some(EntryState::Removed) => {
                    info!("Repository: removing incomplete replica {} ({})", id, st.state);
                    self.apply_state(record, &mut st, EntryState::Removed)?;
                    true
                }
                Some(target) => {
                    warn!(
                        "Repository: marking {} BROKEN, state {} size {} file length {:?}",
                        id, st.state, st.size, length
                    );
                    self.apply_state(record, &mut st, target)?;
                    false
                }
                None => {
                    self.sweeper.update(&CacheEntry::from_record(id, &st));
                    false
                }
            }
        };

        if removed {
            self.after_removed(record).await
        } else {
            self.schedule_expiration(record);
            Ok(())
        }
    }

    /// Closes the repository; queued notifications are still delivered.
    pub async fn shutdown(&self) -> PoolResult<()> {
        self.set_repo_state(RepositoryState::Closed);
        {
            let mut tasks = self.expirations.lock().unwrap_or_else(|e| e.into_inner());
            for (_, task) in tasks.drain() {
                task.handle.abort();
            }
        }
        self.listeners.stop().await;
        self.meta.close()?;
        info!("Repository {}: closed", self.config.pool_name);
        Ok(())
    }

    // ---------- structural operations ----------

    async fn get_record(&self, pnfs_id: &PnfsId) -> Option<Arc<ReplicaRecord>> {
        self.entries.read().await.get(pnfs_id).cloned()
    }

    async fn forget(&self, record: &Arc<ReplicaRecord>) {
        let mut entries = self.entries.write().await;
        if let Some(current) = entries.get(record.pnfs_id()) {
            if Arc::ptr_eq(current, record) {
                entries.remove(record.pnfs_id());
            }
        }
    }

    /// Creates a replica in `initial_state` and returns its exclusive writer.
    ///
    /// If the id is already present the namespace location is re-registered
    /// and `PoolError::FileInCache` is returned.
    pub async fn create_entry(
        &self,
        attributes: FileAttributes,
        initial_state: EntryState,
        target_state: EntryState,
        sticky_records: Vec<StickyRecord>,
    ) -> PoolResult<WriteHandle> {
        self.check_open()?;
        if !initial_state.is_initial() {
            return Err(PoolError::InvalidParam(format!(
                "invalid initial state: {}",
                initial_state
            )));
        }
        if !matches!(target_state, EntryState::Precious | EntryState::Cached) {
            return Err(PoolError::InvalidParam(format!(
                "invalid target state: {}",
                target_state
            )));
        }
        if let Some(bad) = sticky_records.iter().find(|s| s.expire < -1) {
            return Err(PoolError::InvalidParam(format!(
                "invalid sticky expiration {} for {}",
                bad.expire, bad.owner
            )));
        }

        let id = attributes.pnfs_id.clone();
        let record = {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&id) {
                None
            } else {
                let record = Arc::new(ReplicaRecord::new(attributes));
                entries.insert(id.clone(), record.clone());
                Some(record)
            }
        };
        let Some(record) = record else {
            self.register_location(&id).await;
            return Err(PoolError::FileInCache(id.to_string()));
        };

        let path = match self.files.create(&id) {
            Ok(path) => path,
            Err(e) => {
                self.forget(&record).await;
                return Err(e);
            }
        };

        let applied = record.lock().and_then(|mut st| {
            st.link_count += 1;
            self.apply_state(&record, &mut st, initial_state)
        });
        if let Err(e) = applied {
            let _ = self.files.remove(&id);
            self.forget(&record).await;
            return Err(e);
        }

        info!(
            "Repository: created entry {} state {} target {}",
            id, initial_state, target_state
        );
        Ok(WriteHandle::new(
            self.arc()?,
            record,
            path,
            initial_state,
            target_state,
            sticky_records,
        ))
    }

    /// Opens a complete replica for reading.
    pub async fn open_entry(&self, pnfs_id: &PnfsId, flags: &[OpenFlag]) -> PoolResult<ReadHandle> {
        self.check_initialized()?;
        let Some(record) = self.get_record(pnfs_id).await else {
            self.spawn_clear_location(pnfs_id);
            return Err(PoolError::FileNotInCache(pnfs_id.to_string()));
        };

        {
            let mut st = record.lock()?;
            match st.state {
                EntryState::New | EntryState::Removed | EntryState::Destroyed => {
                    return Err(PoolError::FileNotInCache(pnfs_id.to_string()));
                }
                EntryState::FromClient | EntryState::FromStore | EntryState::FromPool => {
                    return Err(PoolError::Locked(format!("{}: file is incomplete", pnfs_id)));
                }
                EntryState::Broken => {
                    return Err(PoolError::Locked(format!("{}: file is broken", pnfs_id)));
                }
                EntryState::Cached | EntryState::Precious => {}
            }

            st.link_count += 1;
            if !flags.contains(&OpenFlag::NoAtime) {
                if let Err(e) = self.touch(&record, &mut st, unix_millis()) {
                    st.link_count -= 1;
                    return Err(e);
                }
            }
        }

        Ok(ReadHandle::new(self.arc()?, record, self.files.path(pnfs_id)))
    }

    pub async fn get_entry(&self, pnfs_id: &PnfsId) -> PoolResult<CacheEntry> {
        self.check_initialized()?;
        let record = self
            .get_record(pnfs_id)
            .await
            .ok_or_else(|| PoolError::FileNotInCache(pnfs_id.to_string()))?;
        let entry = record.snapshot()?;
        if entry.state == EntryState::New {
            return Err(PoolError::FileNotInCache(pnfs_id.to_string()));
        }
        Ok(entry)
    }

    /// State of `pnfs_id`, `NEW` if the repository does not know it.
    pub async fn get_state(&self, pnfs_id: &PnfsId) -> PoolResult<EntryState> {
        self.check_initialized()?;
        match self.get_record(pnfs_id).await {
            Some(record) => Ok(record.lock()?.state),
            None => Ok(EntryState::New),
        }
    }

    /// Ids of all replicas, sorted.
    pub async fn list(&self) -> Vec<PnfsId> {
        let mut ids: Vec<PnfsId> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Changes the state of a complete replica.
    ///
    /// Removing an unknown, new or already removed replica is a no-op.
    /// Transitions out of the transfer states belong to the write handle.
    pub async fn set_state(&self, pnfs_id: &PnfsId, state: EntryState) -> PoolResult<()> {
        self.check_open()?;
        let Some(record) = self.get_record(pnfs_id).await else {
            if state == EntryState::Removed {
                return Ok(());
            }
            return Err(PoolError::IllegalTransition {
                id: pnfs_id.to_string(),
                from: EntryState::New,
                to: state,
            });
        };

        {
            let mut st = record.lock()?;
            let from = st.state;
            match (from, state) {
                (
                    EntryState::New | EntryState::Removed | EntryState::Destroyed,
                    EntryState::Removed,
                ) => return Ok(()),
                (
                    EntryState::Cached | EntryState::Precious | EntryState::Broken,
                    EntryState::Removed
                    | EntryState::Cached
                    | EntryState::Precious
                    | EntryState::Broken,
                ) => {}
                _ => {
                    return Err(PoolError::IllegalTransition {
                        id: pnfs_id.to_string(),
                        from,
                        to: state,
                    })
                }
            }
            self.apply_state(&record, &mut st, state)?;
        }

        if state == EntryState::Removed {
            info!("Repository: removed {}", pnfs_id);
            self.after_removed(&record).await?;
        }
        Ok(())
    }

    /// Pins a complete replica. `expire == 0` drops the pin of `owner`,
    /// `expire == -1` pins it forever.
    pub async fn set_sticky(
        &self,
        pnfs_id: &PnfsId,
        owner: &str,
        expire: i64,
        overwrite: bool,
    ) -> PoolResult<()> {
        self.check_initialized()?;
        if expire < -1 {
            return Err(PoolError::InvalidParam(format!(
                "invalid sticky expiration: {}",
                expire
            )));
        }
        let record = self
            .get_record(pnfs_id)
            .await
            .ok_or_else(|| PoolError::FileNotInCache(pnfs_id.to_string()))?;

        {
            let mut st = record.lock()?;
            if st.state.is_mutable() {
                return Err(PoolError::FileNotInCache(format!(
                    "{}: file is incomplete",
                    pnfs_id
                )));
            }
            if st.state.is_gone() {
                return Err(PoolError::FileNotInCache(format!(
                    "{}: file has been removed",
                    pnfs_id
                )));
            }
            self.apply_sticky(&record, &mut st, owner, expire, overwrite)?;
        }
        self.schedule_expiration(&record);
        Ok(())
    }

    // ---------- space ----------

    /// Space usage. The fields are sampled one by one without a common lock.
    pub fn get_space_record(&self) -> SpaceRecord {
        let total = self.allocator.total();
        let free = self.allocator.free_space();
        let precious = self.allocator.precious();
        let removable = self.sweeper.removable_space();
        let lru_seconds = self.sweeper.lru_seconds();
        SpaceRecord {
            total,
            free,
            precious,
            removable,
            lru_seconds,
            gap: self.gap_for(total),
        }
    }

    fn settings(&self) -> MutexGuard<'_, SpaceSettings> {
        self.space_settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_total_size(&self) -> PoolResult<()> {
        let configured = {
            let settings = self.settings();
            settings.runtime_max_disk_space.or(settings.max_disk_space)
        };
        let used = self.allocator.used();
        let fs_bound = self.files.free_space()?.saturating_add(used);
        let limit = match configured {
            Some(configured) => configured.min(fs_bound),
            None => fs_bound,
        };
        let total = used.max(limit);
        if configured.map_or(false, |c| c < used) {
            warn!(
                "Repository {}: configured size {} is below the used space {}",
                self.config.pool_name,
                configured.unwrap_or(0),
                used
            );
        }
        self.allocator.set_total(total);
        debug!("Repository {}: total space {}", self.config.pool_name, total);
        Ok(())
    }

    fn resize_if_initialized(&self) -> PoolResult<()> {
        match self.state() {
            RepositoryState::Uninitialized | RepositoryState::Initializing => Ok(()),
            _ => self.update_total_size(),
        }
    }

    /// Static pool size, as configured.
    pub fn set_max_disk_space(&self, bytes: u64) -> PoolResult<()> {
        self.settings().max_disk_space = Some(bytes);
        self.resize_if_initialized()
    }

    /// Overrides the static size until reset with `None`.
    pub fn set_runtime_max_disk_space(&self, bytes: Option<u64>) -> PoolResult<()> {
        self.settings().runtime_max_disk_space = bytes;
        self.resize_if_initialized()
    }

    pub fn set_gap(&self, gap: Option<u64>) {
        self.settings().gap = gap;
    }

    fn gap_for(&self, total: u64) -> u64 {
        self.settings().gap.unwrap_or_else(|| default_gap(total))
    }

    // ---------- listeners ----------

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StateChangeListener>) {
        self.listeners.remove(listener);
    }

    /// Waits until every notification queued so far has been delivered.
    pub async fn flush_listeners(&self) {
        self.listeners.flush().await;
    }

    pub fn add_fault_listener(&self, listener: Arc<dyn FaultListener>) {
        let mut listeners = self.fault_listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    fn fatal(&self, pnfs_id: &PnfsId, err: PoolError) -> PoolError {
        let message = format!("internal repository error for {}: {}", pnfs_id, err);
        error!("Repository {}: {}", self.config.pool_name, message);
        let event = FaultEvent {
            source: "repository".to_string(),
            action: FaultAction::Disabled,
            message: message.clone(),
        };
        let listeners = self
            .fault_listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener.fault_occurred(&event);
        }
        PoolError::Internal(message)
    }

    pub async fn get_info(&self) -> String {
        let count = self.entries.read().await.len();
        format!(
            "State : {}\nFiles : {}\n{}",
            self.state(),
            count,
            self.get_space_record()
        )
    }

    // ---------- record mutation, record lock held ----------

    fn persist(&self, record: &ReplicaRecord, st: &RecordState) -> PoolResult<()> {
        self.meta
            .put(&MetaRecord::from_state(st))
            .map_err(|e| self.fatal(record.pnfs_id(), e))
    }

    /// Moves `record` to `new_state`: persists, accounts and queues the
    /// notification. Re-applying the current state changes nothing.
    fn apply_state(
        &self,
        record: &ReplicaRecord,
        st: &mut RecordState,
        new_state: EntryState,
    ) -> PoolResult<()> {
        let old_state = st.state;
        if old_state == new_state {
            return Ok(());
        }

        st.state = new_state;
        let persisted = if new_state == EntryState::Destroyed {
            self.meta.remove(record.pnfs_id())
        } else {
            self.meta.put(&MetaRecord::from_state(st))
        };
        if let Err(e) = persisted {
            st.state = old_state;
            return Err(self.fatal(record.pnfs_id(), e));
        }

        if old_state == EntryState::Precious {
            self.allocator.adjust_precious(-(st.size as i64));
        }
        if new_state == EntryState::Precious {
            self.allocator.adjust_precious(st.size as i64);
        }

        let entry = CacheEntry::from_record(record.pnfs_id(), st);
        if new_state == EntryState::Destroyed {
            self.sweeper.remove(record.pnfs_id());
        } else {
            self.sweeper.update(&entry);
        }

        if !(old_state == EntryState::New && new_state == EntryState::Removed) {
            self.listeners.state_changed(StateChangeEvent {
                pnfs_id: record.pnfs_id().clone(),
                old_state,
                new_state,
                entry,
            });
        }
        debug!(
            "Repository: {} {} -> {}",
            record.pnfs_id(),
            old_state,
            new_state
        );
        Ok(())
    }

    fn apply_sticky(
        &self,
        record: &ReplicaRecord,
        st: &mut RecordState,
        owner: &str,
        expire: i64,
        overwrite: bool,
    ) -> PoolResult<bool> {
        let old_entry = CacheEntry::from_record(record.pnfs_id(), st);
        if !st.set_sticky(owner, expire, overwrite) {
            return Ok(false);
        }
        self.persist(record, st)?;
        let new_entry = CacheEntry::from_record(record.pnfs_id(), st);
        self.sweeper.update(&new_entry);
        self.listeners.sticky_changed(StickyChangeEvent {
            old_entry,
            new_entry,
            sticky: StickyRecord::new(owner, expire),
        });
        Ok(true)
    }

    fn touch(&self, record: &ReplicaRecord, st: &mut RecordState, now_ms: i64) -> PoolResult<()> {
        let old_entry = CacheEntry::from_record(record.pnfs_id(), st);
        st.last_access_time = now_ms;
        self.persist(record, st)?;
        let new_entry = CacheEntry::from_record(record.pnfs_id(), st);
        self.sweeper.update(&new_entry);
        self.listeners.access_time_changed(EntryChangeEvent {
            old_entry,
            new_entry,
        });
        Ok(())
    }

    // ---------- handle support ----------

    /// Runs `f` on the record state and persists the result.
    pub(crate) fn modify_record<F>(&self, record: &ReplicaRecord, f: F) -> PoolResult<()>
    where
        F: FnOnce(&mut RecordState) -> PoolResult<()>,
    {
        let mut st = record.lock()?;
        f(&mut st)?;
        self.persist(record, &st)
    }

    pub(crate) fn set_access_time(&self, record: &ReplicaRecord, now_ms: i64) -> PoolResult<()> {
        let mut st = record.lock()?;
        self.touch(record, &mut st, now_ms)
    }

    /// Final step of a successful write: pins, then moves to `target`.
    pub(crate) async fn commit_replica(
        &self,
        record: &Arc<ReplicaRecord>,
        target: EntryState,
        sticky_records: &[StickyRecord],
    ) -> PoolResult<()> {
        {
            let mut st = record.lock()?;
            if target == EntryState::Cached && sticky_records.is_empty() {
                let hold_ms = i64::try_from(self.config.sticky_hold_time_secs.saturating_mul(1000))
                    .unwrap_or(i64::MAX);
                self.apply_sticky(
                    record,
                    &mut st,
                    SELF_STICKY_OWNER,
                    unix_millis().saturating_add(hold_ms),
                    false,
                )?;
            }
            for sticky in sticky_records {
                self.apply_sticky(record, &mut st, &sticky.owner, sticky.expire, false)?;
            }
            self.apply_state(record, &mut st, target)?;
        }

        if target == EntryState::Removed {
            self.after_removed(record).await
        } else {
            self.schedule_expiration(record);
            Ok(())
        }
    }

    /// Moves a failed write to `REMOVED` or `BROKEN`.
    pub(crate) async fn fail_replica(
        &self,
        record: &Arc<ReplicaRecord>,
        target: EntryState,
    ) -> PoolResult<()> {
        {
            let mut st = record.lock()?;
            self.apply_state(record, &mut st, target)?;
        }
        if target == EntryState::Removed {
            self.after_removed(record).await?;
        }
        Ok(())
    }

    /// Drops one link and destroys the replica if it was the last one of a
    /// removed replica.
    pub(crate) async fn release_link(&self, record: &Arc<ReplicaRecord>) -> PoolResult<()> {
        {
            let mut st = record.lock()?;
            if st.link_count == 0 {
                return Err(PoolError::IllegalState(format!(
                    "{}: link count already zero",
                    record.pnfs_id()
                )));
            }
            st.link_count -= 1;
        }
        self.destroy_when_removed_and_unused(record).await
    }

    async fn after_removed(&self, record: &Arc<ReplicaRecord>) -> PoolResult<()> {
        self.cancel_expiration(record.pnfs_id());
        let pool = &self.config.pool_name;
        if let Err(e) = self
            .namespace
            .clear_cache_location(record.pnfs_id(), pool, self.config.volatile)
            .await
        {
            warn!(
                "Repository: failed to clear location of {}: {}",
                record.pnfs_id(),
                e
            );
        }
        self.destroy_when_removed_and_unused(record).await
    }

    pub(crate) async fn destroy_when_removed_and_unused(
        &self,
        record: &Arc<ReplicaRecord>,
    ) -> PoolResult<()> {
        let id = record.pnfs_id();
        {
            let mut st = record.lock()?;
            if st.state != EntryState::Removed || st.link_count > 0 {
                return Ok(());
            }
            if let Err(e) = self.files.remove(id) {
                error!("Repository: failed to delete data file of {}: {}", id, e);
                return Ok(());
            }
            self.allocator.free(st.size);
            self.apply_state(record, &mut st, EntryState::Destroyed)?;
        }
        self.forget(record).await;
        info!("Repository: destroyed {}", id);
        Ok(())
    }

    async fn register_location(&self, pnfs_id: &PnfsId) {
        if let Err(e) = self
            .namespace
            .add_cache_location(pnfs_id, &self.config.pool_name)
            .await
        {
            warn!("Repository: failed to register location of {}: {}", pnfs_id, e);
        }
    }

    fn spawn_clear_location(&self, pnfs_id: &PnfsId) {
        let namespace = self.namespace.clone();
        let pool = self.config.pool_name.clone();
        let pnfs_id = pnfs_id.clone();
        tokio::spawn(async move {
            if let Err(e) = namespace.clear_cache_location(&pnfs_id, &pool, false).await {
                debug!("Repository: clearing stray location {} failed: {}", pnfs_id, e);
            }
        });
    }

    // ---------- sticky expiration ----------

    fn expiration_tasks(&self) -> MutexGuard<'_, HashMap<PnfsId, ExpirationTask>> {
        self.expirations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_expiration(&self, pnfs_id: &PnfsId) {
        if let Some(task) = self.expiration_tasks().remove(pnfs_id) {
            task.handle.abort();
        }
    }

    /// Time until `expire` plus the clock shift, capped so far pins are
    /// rechecked once a day. `None` when the deadline is not representable.
    pub(crate) fn expiration_delay(&self, expire: i64, now_ms: i64) -> Option<Duration> {
        let shift = i64::try_from(self.config.expiration_clock_shift_ms).unwrap_or(i64::MAX);
        let deadline = expire.checked_add(shift)?;
        let delay = u64::try_from(deadline.saturating_sub(now_ms)).unwrap_or(0);
        Some(Duration::from_millis(delay).min(MAX_EXPIRATION_DELAY))
    }

    /// (Re)arms the timer of `record` for its earliest finite pin.
    fn schedule_expiration(&self, record: &Arc<ReplicaRecord>) {
        let next = match record.lock() {
            Ok(st) if !st.state.is_gone() => st.next_expiration(),
            _ => None,
        };

        let mut tasks = self.expiration_tasks();
        if let Some(task) = tasks.remove(record.pnfs_id()) {
            task.handle.abort();
        }
        let Some(expire) = next else {
            return;
        };

        let Some(delay) = self.expiration_delay(expire, unix_millis()) else {
            return;
        };
        let generation = self.expiration_generation.fetch_add(1, Ordering::Relaxed);
        let weak_self = self.weak_self.clone();
        let target = record.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(repository) = weak_self.upgrade() {
                repository.expire_stickies(&target, generation);
            }
        });
        tasks.insert(record.pnfs_id().clone(), ExpirationTask { generation, handle });
    }

    fn expire_stickies(&self, record: &Arc<ReplicaRecord>, generation: u64) {
        {
            let mut tasks = self.expiration_tasks();
            match tasks.get(record.pnfs_id()) {
                Some(task) if task.generation == generation => {
                    tasks.remove(record.pnfs_id());
                }
                _ => return,
            }
        }

        let result = record.lock().and_then(|mut st| {
            if st.state.is_gone() {
                return Ok(());
            }
            let old_entry = CacheEntry::from_record(record.pnfs_id(), &st);
            let expired = st.remove_expired_stickies(unix_millis());
            if expired.is_empty() {
                return Ok(());
            }
            self.persist(record, &st)?;
            let new_entry = CacheEntry::from_record(record.pnfs_id(), &st);
            self.sweeper.update(&new_entry);
            for sticky in expired {
                debug!(
                    "Repository: sticky of {} for {} expired",
                    record.pnfs_id(),
                    sticky.owner
                );
                self.listeners.sticky_changed(StickyChangeEvent {
                    old_entry: old_entry.clone(),
                    new_entry: new_entry.clone(),
                    sticky,
                });
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(
                "Repository: sticky expiration of {} failed: {}",
                record.pnfs_id(),
                e
            );
        }
        self.schedule_expiration(record);
    }
}
