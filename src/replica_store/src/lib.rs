mod allocator;
mod file_store;
mod listeners;
mod meta_store;
mod read_handle;
mod record;
mod repository;
mod space;
mod sweeper;
mod write_handle;

pub use allocator::Allocator;
pub use file_store::FileStore;
pub use listeners::*;
pub use meta_store::{MetaDataStore, MetaRecord, SqliteMetaStore};
pub use read_handle::ReadHandle;
pub use record::{CacheEntry, RecordState, ReplicaRecord};
pub use repository::*;
pub use space::*;
pub use sweeper::*;
pub use write_handle::{HandleState, WriteHandle};

#[cfg(test)]
mod test_repository;
