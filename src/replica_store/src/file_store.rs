use log::{info, warn};
use pool_lib::{PnfsId, PoolError, PoolResult};
use std::path::{Path, PathBuf};

/// Data files of the pool, one file per replica named by its id.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: &Path) -> PoolResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            warn!("FileStore: create dir {} failed: {}", data_dir.display(), e);
            PoolError::DiskError(e.to_string())
        })?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, pnfs_id: &PnfsId) -> PathBuf {
        self.data_dir.join(pnfs_id.as_str())
    }

    /// Creates an empty data file, truncating a stale one.
    pub fn create(&self, pnfs_id: &PnfsId) -> PoolResult<PathBuf> {
        let path = self.path(pnfs_id);
        std::fs::File::create(&path).map_err(|e| {
            warn!("FileStore: create {} failed: {}", path.display(), e);
            PoolError::DiskError(e.to_string())
        })?;
        Ok(path)
    }

    /// Length of the data file, `None` if it does not exist.
    pub fn length(&self, pnfs_id: &PnfsId) -> PoolResult<Option<u64>> {
        match std::fs::metadata(self.path(pnfs_id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PoolError::DiskError(e.to_string())),
        }
    }

    pub fn remove(&self, pnfs_id: &PnfsId) -> PoolResult<()> {
        let path = self.path(pnfs_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("FileStore: removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::DiskError(e.to_string())),
        }
    }

    /// Ids of all data files; names that are not ids are skipped.
    pub fn list(&self) -> PoolResult<Vec<PnfsId>> {
        let mut ids = Vec::new();
        for item in std::fs::read_dir(&self.data_dir)? {
            let item = item?;
            if !item.file_type()?.is_file() {
                continue;
            }
            let name = item.file_name();
            match name.to_str().map(PnfsId::new) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!("FileStore: ignoring stray file {:?}", name),
            }
        }
        Ok(ids)
    }

    /// Space available to unprivileged writers on the data file system.
    pub fn free_space(&self) -> PoolResult<u64> {
        fs2::available_space(&self.data_dir).map_err(|e| PoolError::DiskError(e.to_string()))
    }

    pub fn total_space(&self) -> PoolResult<u64> {
        fs2::total_space(&self.data_dir).map_err(|e| PoolError::DiskError(e.to_string()))
    }
}
