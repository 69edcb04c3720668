use crate::record::{CacheEntry, ReplicaRecord};
use crate::repository::Repository;
use log::{error, warn};
use pool_lib::{FileAttributes, PnfsId, PoolError, PoolResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared reader of a complete replica. Holds one link on the replica
/// until `close`.
pub struct ReadHandle {
    repository: Arc<Repository>,
    record: Arc<ReplicaRecord>,
    path: PathBuf,
    attributes: FileAttributes,
    closed: AtomicBool,
}

impl ReadHandle {
    pub(crate) fn new(repository: Arc<Repository>, record: Arc<ReplicaRecord>, path: PathBuf) -> Self {
        let attributes = match record.lock() {
            Ok(st) => st.attributes.clone(),
            Err(_) => FileAttributes::new(record.pnfs_id().clone()),
        };
        Self {
            repository,
            record,
            path,
            attributes,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> PoolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::IllegalState(format!(
                "{}: read handle is closed",
                self.record.pnfs_id()
            )));
        }
        Ok(())
    }

    pub fn pnfs_id(&self) -> &PnfsId {
        self.record.pnfs_id()
    }

    pub fn get_file(&self) -> PoolResult<&Path> {
        self.check_open()?;
        Ok(&self.path)
    }

    pub fn get_entry(&self) -> PoolResult<CacheEntry> {
        self.check_open()?;
        self.record.snapshot()
    }

    /// Attributes as of opening; still available after close.
    pub fn get_file_attributes(&self) -> &FileAttributes {
        &self.attributes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases the link. Closing twice is an error.
    pub async fn close(&self) -> PoolResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PoolError::IllegalState(format!(
                "{}: read handle already closed",
                self.record.pnfs_id()
            )));
        }
        self.repository.release_link(&self.record).await
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            "ReadHandle: {} dropped without close, releasing it",
            self.record.pnfs_id()
        );
        let repository = self.repository.clone();
        let record = self.record.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = repository.release_link(&record).await {
                        error!("ReadHandle: background release failed: {}", e);
                    }
                });
            }
            Err(_) => error!("ReadHandle: no runtime to release dropped handle"),
        }
    }
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle").field("path", &self.path).finish_non_exhaustive()
    }
}
