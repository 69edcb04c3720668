use crate::record::ReplicaRecord;
use crate::repository::Repository;
use log::{debug, error, info, warn};
use pool_lib::{
    unix_millis, verify_checksum, AttributeUpdate, Checksum, EntryState, FileAttributes, PnfsId,
    PoolError, PoolResult, StickyRecord,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Committed,
    Closed,
}

struct WriteHandleInner {
    repository: Arc<Repository>,
    record: Arc<ReplicaRecord>,
    path: PathBuf,
    initial_state: EntryState,
    target_state: EntryState,
    sticky_records: Vec<StickyRecord>,
    state: tokio::sync::Mutex<HandleState>,
    /// Set once the handle is closed or closing; allocations refuse to start.
    closed: AtomicBool,
    committed: AtomicBool,
    /// Single allocation slot; holders may update `allocated`.
    allocation_slot: tokio::sync::Mutex<()>,
    allocated: AtomicU64,
    cancel: CancellationToken,
    access_time: Mutex<Option<i64>>,
}

/// Exclusive writer of a replica being received.
///
/// Every byte must be allocated before it is written. The handle is finished
/// with `commit` followed by `close`; `close` without `commit` fails the
/// replica. A handle dropped while open is closed in the background.
pub struct WriteHandle {
    inner: Arc<WriteHandleInner>,
}

impl WriteHandle {
    pub(crate) fn new(
        repository: Arc<Repository>,
        record: Arc<ReplicaRecord>,
        path: PathBuf,
        initial_state: EntryState,
        target_state: EntryState,
        sticky_records: Vec<StickyRecord>,
    ) -> Self {
        Self {
            inner: Arc::new(WriteHandleInner {
                repository,
                record,
                path,
                initial_state,
                target_state,
                sticky_records,
                state: tokio::sync::Mutex::new(HandleState::Open),
                closed: AtomicBool::new(false),
                committed: AtomicBool::new(false),
                allocation_slot: tokio::sync::Mutex::new(()),
                allocated: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                access_time: Mutex::new(None),
            }),
        }
    }

    pub fn pnfs_id(&self) -> &PnfsId {
        self.inner.record.pnfs_id()
    }

    pub fn get_file(&self) -> &Path {
        &self.inner.path
    }

    pub fn initial_state(&self) -> EntryState {
        self.inner.initial_state
    }

    pub fn target_state(&self) -> EntryState {
        self.inner.target_state
    }

    /// Bytes reserved through this handle so far.
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::SeqCst)
    }

    pub fn get_file_attributes(&self) -> PoolResult<FileAttributes> {
        Ok(self.inner.record.lock()?.attributes.clone())
    }

    pub fn get_checksums(&self) -> PoolResult<Vec<Checksum>> {
        Ok(self.inner.record.lock()?.attributes.checksums.clone())
    }

    /// Access time applied at commit instead of the commit time.
    pub fn set_last_access_time(&self, time_ms: i64) -> PoolResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.committed.load(Ordering::SeqCst) {
            return Err(PoolError::IllegalState("handle is no longer open".to_string()));
        }
        if let Ok(mut access_time) = self.inner.access_time.lock() {
            *access_time = Some(time_ms);
        }
        Ok(())
    }

    /// Reserves `size` more bytes, waiting for space if needed.
    pub async fn allocate(&self, size: u64) -> PoolResult<()> {
        self.inner.allocate(size).await
    }

    /// Write handles only ever grow their reservation.
    pub fn free(&self, _size: u64) -> PoolResult<()> {
        Err(PoolError::Unsupported(
            "space cannot be freed through a write handle".to_string(),
        ))
    }

    pub async fn commit(&self, checksum: Option<Checksum>) -> PoolResult<()> {
        self.inner.commit(checksum).await
    }

    pub async fn close(&self) -> PoolResult<()> {
        self.inner.close().await
    }

    pub async fn state(&self) -> HandleState {
        *self.inner.state.lock().await
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!(
            "WriteHandle: {} dropped without close, closing it",
            self.inner.record.pnfs_id()
        );
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = inner.close().await {
                        error!("WriteHandle: background close failed: {}", e);
                    }
                });
            }
            Err(_) => error!("WriteHandle: no runtime to close dropped handle"),
        }
    }
}

impl WriteHandleInner {
    async fn allocate(&self, size: u64) -> PoolResult<()> {
        if self.committed.load(Ordering::SeqCst) {
            return Err(PoolError::IllegalState("handle is committed".to_string()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::HandleClosed(self.record.pnfs_id().to_string()));
        }

        let _slot = tokio::select! {
            slot = self.allocation_slot.lock() => slot,
            _ = self.cancel.cancelled() => {
                return Err(PoolError::HandleClosed(self.record.pnfs_id().to_string()));
            }
        };
        if self.committed.load(Ordering::SeqCst) {
            return Err(PoolError::IllegalState("handle is committed".to_string()));
        }

        match self
            .repository
            .allocator()
            .allocate(size, &self.cancel)
            .await
        {
            Ok(()) => {
                let total = self.allocated.fetch_add(size, Ordering::SeqCst) + size;
                self.record.lock()?.size = total;
                Ok(())
            }
            Err(PoolError::Interrupted(_)) if self.closed.load(Ordering::SeqCst) => {
                Err(PoolError::HandleClosed(self.record.pnfs_id().to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Brings the reservation in line with `length`.
    ///
    /// A shortfall means a writer skipped `allocate`. While the handle is
    /// open the missing space is waited for; when failing it is taken only
    /// if immediately available.
    async fn adjust_reservation(&self, length: u64, may_wait: bool) -> PoolResult<()> {
        let allocated = self.allocated.load(Ordering::SeqCst);
        let allocator = self.repository.allocator();
        if length > allocated {
            let missing = length - allocated;
            warn!(
                "WriteHandle: bug: {} has {} bytes on disk but only {} allocated",
                self.record.pnfs_id(),
                length,
                allocated
            );
            if may_wait {
                allocator.allocate(missing, &self.cancel).await?;
            } else if !allocator.try_allocate(missing) {
                return Err(PoolError::Interrupted(format!(
                    "no space to account {} bytes of {}",
                    missing,
                    self.record.pnfs_id()
                )));
            }
        } else if length < allocated {
            allocator.free(allocated - length);
        }
        self.allocated.store(length, Ordering::SeqCst);
        self.record.lock()?.size = length;
        Ok(())
    }

    async fn file_length(&self) -> PoolResult<u64> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(PoolError::DiskError(e.to_string())),
        }
    }

    async fn commit(&self, checksum: Option<Checksum>) -> PoolResult<()> {
        let mut state = self.state.lock().await;
        if *state != HandleState::Open || self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::IllegalState(format!(
                "cannot commit {} in state {:?}",
                self.record.pnfs_id(),
                *state
            )));
        }

        let _slot = self.allocation_slot.lock().await;
        self.do_commit(checksum).await?;
        self.committed.store(true, Ordering::SeqCst);
        *state = HandleState::Committed;
        Ok(())
    }

    async fn do_commit(&self, checksum: Option<Checksum>) -> PoolResult<()> {
        let repository = &self.repository;
        let id = self.record.pnfs_id();

        let access_time = self
            .access_time
            .lock()
            .ok()
            .and_then(|t| *t)
            .unwrap_or_else(unix_millis);
        repository.set_access_time(&self.record, access_time)?;

        let length = self.file_length().await?;
        self.adjust_reservation(length, true).await?;

        let initial_state = self.initial_state;
        let mut new_checksums = Vec::new();
        let attributes = {
            let mut st = self.record.lock()?;
            match initial_state {
                EntryState::FromClient => st.attributes.size = Some(length),
                _ => match st.attributes.size {
                    Some(expected) if expected != length => {
                        return Err(PoolError::SizeMismatch(format!(
                            "{}: expected {} bytes, got {}",
                            id, expected, length
                        )));
                    }
                    Some(_) => {}
                    None => st.attributes.size = Some(length),
                },
            }
            if let Some(checksum) = &checksum {
                verify_checksum(&st.attributes.checksums, checksum)?;
                if !st.attributes.checksums.contains(checksum) {
                    new_checksums.push(checksum.clone());
                }
            }
            st.attributes.clone()
        };
        repository.modify_record(&self.record, |st| {
            st.attributes.merge_checksums(&new_checksums);
            Ok(())
        })?;

        let from_client = initial_state == EntryState::FromClient;
        let update = AttributeUpdate {
            size: if from_client { Some(length) } else { None },
            checksums: new_checksums,
            access_latency: if from_client {
                attributes.access_latency
            } else {
                None
            },
            retention_policy: if from_client {
                attributes.retention_policy
            } else {
                None
            },
            location: Some(repository.pool_name().to_string()),
        };

        let mut target = self.target_state;
        match repository.namespace().set_file_attributes(id, update).await {
            Ok(()) => {}
            Err(e) if e.is_file_not_found() => {
                info!(
                    "WriteHandle: {} was deleted from the namespace, removing replica",
                    id
                );
                target = EntryState::Removed;
            }
            Err(e) => return Err(e),
        }

        repository
            .commit_replica(&self.record, target, &self.sticky_records)
            .await?;
        debug!("WriteHandle: committed {} as {}", id, target);
        Ok(())
    }

    async fn close(&self) -> PoolResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            if *self.state.lock().await == HandleState::Closed {
                return Err(PoolError::IllegalState(format!(
                    "{}: handle already closed",
                    self.record.pnfs_id()
                )));
            }
            return Err(PoolError::IllegalState(format!(
                "{}: handle is being closed",
                self.record.pnfs_id()
            )));
        }
        self.cancel.cancel();

        let mut state = self.state.lock().await;
        let result = match *state {
            HandleState::Open => {
                let _slot = self.allocation_slot.lock().await;
                self.fail().await
            }
            _ => Ok(()),
        };
        let released = self.repository.release_link(&self.record).await;
        *state = HandleState::Closed;
        result.and(released)
    }

    async fn fail(&self) -> PoolResult<()> {
        let repository = &self.repository;
        let id = self.record.pnfs_id();

        match self.file_length().await {
            Ok(length) => {
                if let Err(e) = self.adjust_reservation(length, false).await {
                    warn!("WriteHandle: failed to adjust reservation of {}: {}", id, e);
                }
            }
            Err(e) => warn!("WriteHandle: cannot stat {}: {}", id, e),
        }

        let mut target = match self.initial_state {
            EntryState::FromStore | EntryState::FromPool => EntryState::Removed,
            _ => self.target_state,
        };

        if target != EntryState::Removed {
            match repository
                .namespace()
                .add_cache_location(id, repository.pool_name())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_file_not_found() => target = EntryState::Removed,
                Err(e) => warn!("WriteHandle: failed to register {}: {}", id, e),
            }
        }

        if target == EntryState::Removed {
            info!("WriteHandle: transfer of {} failed, removing replica", id);
            repository.fail_replica(&self.record, EntryState::Removed).await
        } else {
            warn!("WriteHandle: transfer of {} failed, marking replica BROKEN", id);
            repository.fail_replica(&self.record, EntryState::Broken).await
        }
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle").field("path", &self.inner.path).finish_non_exhaustive()
    }
}
