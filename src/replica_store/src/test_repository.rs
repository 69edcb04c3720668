use crate::*;
use async_trait::async_trait;
use pool_lib::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct ScriptedNamespace {
    inner: LocalNamespace,
    set_attributes_error: Mutex<Option<PoolError>>,
}

impl ScriptedNamespace {
    fn new() -> Self {
        Self {
            inner: LocalNamespace::new(),
            set_attributes_error: Mutex::new(None),
        }
    }

    fn fail_set_attributes(&self, err: PoolError) {
        *self.set_attributes_error.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl NamespaceClient for ScriptedNamespace {
    async fn add_cache_location(&self, pnfs_id: &PnfsId, pool: &str) -> PoolResult<()> {
        self.inner.add_cache_location(pnfs_id, pool).await
    }

    async fn clear_cache_location(
        &self,
        pnfs_id: &PnfsId,
        pool: &str,
        remove_if_last: bool,
    ) -> PoolResult<()> {
        self.inner
            .clear_cache_location(pnfs_id, pool, remove_if_last)
            .await
    }

    async fn set_file_attributes(
        &self,
        pnfs_id: &PnfsId,
        update: AttributeUpdate,
    ) -> PoolResult<()> {
        if let Some(err) = self.set_attributes_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.inner.set_file_attributes(pnfs_id, update).await
    }

    async fn get_file_attributes(&self, pnfs_id: &PnfsId) -> PoolResult<FileAttributes> {
        self.inner.get_file_attributes(pnfs_id).await
    }
}

struct FlakyMetaStore {
    inner: SqliteMetaStore,
    fail: AtomicBool,
}

impl MetaDataStore for FlakyMetaStore {
    fn index(&self) -> PoolResult<Vec<PnfsId>> {
        self.inner.index()
    }

    fn get(&self, pnfs_id: &PnfsId) -> PoolResult<Option<MetaRecord>> {
        self.inner.get(pnfs_id)
    }

    fn put(&self, record: &MetaRecord) -> PoolResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PoolError::DbError("disk full".to_string()));
        }
        self.inner.put(record)
    }

    fn remove(&self, pnfs_id: &PnfsId) -> PoolResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PoolError::DbError("disk full".to_string()));
        }
        self.inner.remove(pnfs_id)
    }
}

#[derive(Default)]
struct RecordingListener {
    transitions: Mutex<Vec<(PnfsId, EntryState, EntryState)>>,
    sticky_changes: Mutex<Vec<(PnfsId, StickyRecord)>>,
    access_changes: Mutex<usize>,
}

impl RecordingListener {
    fn transitions(&self) -> Vec<(PnfsId, EntryState, EntryState)> {
        self.transitions.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateChangeListener for RecordingListener {
    async fn state_changed(&self, event: &StateChangeEvent) -> PoolResult<()> {
        self.transitions.lock().unwrap().push((
            event.pnfs_id.clone(),
            event.old_state,
            event.new_state,
        ));
        Ok(())
    }

    async fn access_time_changed(&self, _event: &EntryChangeEvent) -> PoolResult<()> {
        *self.access_changes.lock().unwrap() += 1;
        Ok(())
    }

    async fn sticky_changed(&self, event: &StickyChangeEvent) -> PoolResult<()> {
        self.sticky_changes
            .lock()
            .unwrap()
            .push((event.new_entry.pnfs_id.clone(), event.sticky.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingFaults {
    events: Mutex<Vec<FaultEvent>>,
}

impl FaultListener for RecordingFaults {
    fn fault_occurred(&self, event: &FaultEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct TestPool {
    tmp: TempDir,
    repository: Arc<Repository>,
    namespace: Arc<ScriptedNamespace>,
    meta: Arc<FlakyMetaStore>,
    events: Arc<RecordingListener>,
}

fn test_config(max_disk_space: u64) -> RepositoryConfig {
    RepositoryConfig {
        pool_name: "pool1".to_string(),
        max_disk_space: Some(max_disk_space),
        expiration_clock_shift_ms: 0,
        ..Default::default()
    }
}

fn build_pool(tmp: TempDir, config: RepositoryConfig) -> TestPool {
    let meta = Arc::new(FlakyMetaStore {
        inner: SqliteMetaStore::new(&tmp.path().join("meta.db")).unwrap(),
        fail: AtomicBool::new(false),
    });
    let files = FileStore::new(&tmp.path().join("data")).unwrap();
    let namespace = Arc::new(ScriptedNamespace::new());
    let repository = Repository::new(config, meta.clone(), files, namespace.clone());
    let events = Arc::new(RecordingListener::default());
    repository.add_listener(events.clone());
    TestPool {
        tmp,
        repository,
        namespace,
        meta,
        events,
    }
}

async fn open_pool(config: RepositoryConfig) -> TestPool {
    let pool = build_pool(TempDir::new().unwrap(), config);
    pool.repository.init().unwrap();
    pool.repository.load().await.unwrap();
    pool
}

fn id(s: &str) -> PnfsId {
    PnfsId::new(s).unwrap()
}

impl TestPool {
    fn data_dir(&self) -> PathBuf {
        self.tmp.path().join("data")
    }

    /// Registers a file in the namespace and returns its attributes.
    fn new_file(&self, pnfs_id: &PnfsId, size: Option<u64>) -> FileAttributes {
        let mut attrs = FileAttributes::new(pnfs_id.clone());
        attrs.size = size;
        self.namespace.inner.create_file(attrs.clone()).unwrap();
        attrs
    }

    async fn events(&self) -> Vec<(PnfsId, EntryState, EntryState)> {
        self.repository.flush_listeners().await;
        self.events.transitions()
    }

    /// Writes `data` as a committed replica and closes the handle.
    async fn store(&self, pnfs_id: &PnfsId, data: &[u8], target: EntryState, sticky: Vec<StickyRecord>) {
        let attrs = self.new_file(pnfs_id, None);
        let handle = self
            .repository
            .create_entry(attrs, EntryState::FromClient, target, sticky)
            .await
            .unwrap();
        handle.allocate(data.len() as u64).await.unwrap();
        write_data(handle.get_file(), data).await;
        handle.commit(None).await.unwrap();
        handle.close().await.unwrap();
    }
}

async fn write_data(path: &Path, data: &[u8]) {
    tokio::fs::write(path, data).await.unwrap();
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_lifecycle_order() {
    let pool = build_pool(TempDir::new().unwrap(), test_config(10_000));
    let repository = &pool.repository;
    assert_eq!(repository.state(), RepositoryState::Uninitialized);
    assert!(matches!(repository.load().await, Err(PoolError::IllegalState(_))));
    assert!(repository.get_state(&id("0001")).await.is_err());

    repository.init().unwrap();
    assert!(matches!(repository.init(), Err(PoolError::IllegalState(_))));
    assert_eq!(repository.get_state(&id("0001")).await.unwrap(), EntryState::New);

    let attrs = FileAttributes::new(id("0001"));
    let err = repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Cached, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::IllegalState(_)));

    repository.load().await.unwrap();
    assert_eq!(repository.state(), RepositoryState::Open);
    assert!(repository.load().await.is_err());

    repository.shutdown().await.unwrap();
    assert_eq!(repository.state(), RepositoryState::Closed);
}

#[tokio::test]
async fn test_space_record_after_inventory() {
    let tmp = TempDir::new().unwrap();
    {
        let meta = SqliteMetaStore::new(&tmp.path().join("meta.db")).unwrap();
        let data = tmp.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        for (name, state, sticky) in [
            ("0001", EntryState::Precious, vec![]),
            ("0002", EntryState::Cached, vec![]),
            ("0003", EntryState::Cached, vec![StickyRecord::forever("system")]),
        ] {
            let pnfs_id = id(name);
            std::fs::write(data.join(pnfs_id.as_str()), vec![7u8; 1024]).unwrap();
            meta.put(&MetaRecord {
                pnfs_id: pnfs_id.clone(),
                state,
                size: 1024,
                attributes: FileAttributes::new(pnfs_id).with_size(1024),
                sticky_records: sticky,
                creation_time: 0,
                last_access_time: 0,
            })
            .unwrap();
        }
    }

    let pool = build_pool(tmp, test_config(5120));
    pool.repository.init().unwrap();
    pool.repository.load().await.unwrap();

    let space = pool.repository.get_space_record();
    assert_eq!(space.total, 5120);
    assert_eq!(space.free, 2048);
    assert_eq!(space.precious, 1024);
    assert_eq!(space.removable, 1024);
    assert_eq!(space.gap, 1280);
    assert_eq!(pool.repository.list().await.len(), 3);
}

#[tokio::test]
async fn test_commit_cached_from_client() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000000000A");
    let attrs = pool.new_file(&x, None);
    let before = pool.repository.get_space_record();

    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Cached, vec![])
        .await
        .unwrap();
    handle.allocate(100).await.unwrap();
    write_data(handle.get_file(), &[1u8; 100]).await;
    handle.commit(None).await.unwrap();
    assert_eq!(handle.state().await, HandleState::Committed);
    handle.close().await.unwrap();

    let entry = pool.repository.get_entry(&x).await.unwrap();
    assert_eq!(entry.state, EntryState::Cached);
    assert_eq!(entry.size, 100);
    assert_eq!(entry.link_count, 0);
    assert_eq!(entry.sticky_records.len(), 1);
    let pin = &entry.sticky_records[0];
    assert_eq!(pin.owner, SELF_STICKY_OWNER);
    let remaining = pin.expire - unix_millis();
    assert!(remaining > 290_000 && remaining <= 300_000);

    let after = pool.repository.get_space_record();
    assert_eq!(after.precious, before.precious);
    assert_eq!(after.free, before.free - 100);
    assert_eq!(after.removable, 0);

    let events = pool.events().await;
    assert_eq!(
        events,
        vec![
            (x.clone(), EntryState::New, EntryState::FromClient),
            (x.clone(), EntryState::FromClient, EntryState::Cached),
        ]
    );
    assert_eq!(
        pool.namespace.inner.get_file_attributes(&x).await.unwrap().size,
        Some(100)
    );
    assert_eq!(pool.namespace.inner.locations(&x), vec!["pool1".to_string()]);
}

#[tokio::test]
async fn test_failed_pool_transfer_is_removed() {
    let pool = open_pool(test_config(10_000)).await;
    let y = id("00000000000B");
    let attrs = pool.new_file(&y, Some(50));

    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromPool, EntryState::Cached, vec![])
        .await
        .unwrap();
    handle.allocate(50).await.unwrap();
    write_data(handle.get_file(), &[2u8; 20]).await;
    let path = handle.get_file().to_path_buf();
    handle.close().await.unwrap();

    assert_eq!(pool.repository.get_state(&y).await.unwrap(), EntryState::New);
    assert_eq!(pool.repository.get_space_record().free, 10_000);
    assert!(!path.exists());
    assert_eq!(
        pool.events().await,
        vec![
            (y.clone(), EntryState::New, EntryState::FromPool),
            (y.clone(), EntryState::FromPool, EntryState::Removed),
            (y.clone(), EntryState::Removed, EntryState::Destroyed),
        ]
    );
}

#[tokio::test]
async fn test_open_missing_entry() {
    let pool = open_pool(test_config(10_000)).await;
    let err = pool
        .repository
        .open_entry(&id("0000DEAD"), &[])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(pool.repository.list().await.is_empty());
    assert!(pool.events().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_create_is_rejected() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000000000C");
    let attrs = pool.new_file(&x, None);
    let handle = pool
        .repository
        .create_entry(attrs.clone(), EntryState::FromClient, EntryState::Precious, vec![])
        .await
        .unwrap();

    let err = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Precious, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::FileInCache(_)));
    assert_eq!(pool.namespace.inner.locations(&x), vec!["pool1".to_string()]);

    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_create_rejects_bad_states() {
    let pool = open_pool(test_config(10_000)).await;
    let attrs = pool.new_file(&id("0000000D"), None);
    let err = pool
        .repository
        .create_entry(attrs.clone(), EntryState::Cached, EntryState::Cached, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidParam(_)));
    let err = pool
        .repository
        .create_entry(attrs.clone(), EntryState::FromClient, EntryState::Broken, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidParam(_)));
    let err = pool
        .repository
        .create_entry(
            attrs,
            EntryState::FromClient,
            EntryState::Cached,
            vec![StickyRecord::new("alice", -5)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidParam(_)));
}

#[tokio::test]
async fn test_readers_defer_destruction() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000000000E");
    pool.store(&x, &[3u8; 64], EntryState::Precious, vec![]).await;
    assert_eq!(pool.repository.get_space_record().precious, 64);

    let r1 = pool.repository.open_entry(&x, &[]).await.unwrap();
    let r2 = pool
        .repository
        .open_entry(&x, &[OpenFlag::NoAtime])
        .await
        .unwrap();
    assert_eq!(pool.repository.get_entry(&x).await.unwrap().link_count, 2);
    assert!(r1.get_file().unwrap().exists());

    pool.repository.set_state(&x, EntryState::Removed).await.unwrap();
    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::Removed);
    assert_eq!(pool.repository.get_space_record().precious, 0);
    assert!(pool.repository.open_entry(&x, &[]).await.unwrap_err().is_not_found());

    r1.close().await.unwrap();
    assert!(matches!(r1.close().await, Err(PoolError::IllegalState(_))));
    assert!(r1.get_file().is_err());
    assert!(r1.get_entry().is_err());
    assert_eq!(r1.get_file_attributes().pnfs_id, x);
    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::Removed);

    r2.close().await.unwrap();
    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::New);
    assert_eq!(pool.repository.get_space_record().free, 10_000);

    let events = pool.events().await;
    assert_eq!(
        &events[events.len() - 2..],
        &[
            (x.clone(), EntryState::Precious, EntryState::Removed),
            (x.clone(), EntryState::Removed, EntryState::Destroyed),
        ]
    );
    assert_eq!(*pool.events.access_changes.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_set_state_transitions() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000000000F");
    let missing = id("000000000010");

    pool.repository.set_state(&missing, EntryState::Removed).await.unwrap();
    let err = pool
        .repository
        .set_state(&missing, EntryState::Cached)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::IllegalTransition {
            from: EntryState::New,
            to: EntryState::Cached,
            ..
        }
    ));

    pool.store(&x, &[4u8; 32], EntryState::Cached, vec![]).await;
    for state in [EntryState::New, EntryState::Destroyed, EntryState::FromClient] {
        let err = pool.repository.set_state(&x, state).await.unwrap_err();
        assert!(matches!(err, PoolError::IllegalTransition { .. }));
    }

    pool.repository.set_state(&x, EntryState::Precious).await.unwrap();
    pool.repository.set_state(&x, EntryState::Precious).await.unwrap();
    assert_eq!(pool.repository.get_space_record().precious, 32);
    pool.repository.set_state(&x, EntryState::Broken).await.unwrap();
    assert_eq!(pool.repository.get_space_record().precious, 0);
    pool.repository.set_state(&x, EntryState::Cached).await.unwrap();
    assert_eq!(pool.repository.get_entry(&x).await.unwrap().state, EntryState::Cached);
}

#[tokio::test]
async fn test_write_handle_double_close() {
    let pool = open_pool(test_config(10_000)).await;
    let attrs = pool.new_file(&id("00000011"), None);
    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Cached, vec![])
        .await
        .unwrap();
    assert!(matches!(handle.free(10), Err(PoolError::Unsupported(_))));
    handle.close().await.unwrap();
    assert_eq!(handle.state().await, HandleState::Closed);
    assert!(matches!(handle.close().await, Err(PoolError::IllegalState(_))));
    assert!(matches!(handle.allocate(1).await, Err(PoolError::HandleClosed(_))));
    assert!(matches!(handle.commit(None).await, Err(PoolError::IllegalState(_))));
}

#[tokio::test]
async fn test_committed_handle_double_close() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("0000009B");
    let attrs = pool.new_file(&x, None);
    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Precious, vec![])
        .await
        .unwrap();
    handle.allocate(10).await.unwrap();
    write_data(handle.get_file(), &[5u8; 10]).await;
    handle.commit(None).await.unwrap();
    handle.close().await.unwrap();
    assert!(matches!(handle.close().await, Err(PoolError::IllegalState(_))));

    let entry = pool.repository.get_entry(&x).await.unwrap();
    assert_eq!(entry.state, EntryState::Precious);
    assert_eq!(entry.link_count, 0);
    let space = pool.repository.get_space_record();
    assert_eq!(space.free, 9990);
    assert_eq!(space.precious, 10);
}

#[tokio::test]
async fn test_concurrent_create_same_id() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("0000009C");
    let attrs = pool.new_file(&x, None);
    let (first, second) = tokio::join!(
        pool.repository
            .create_entry(attrs.clone(), EntryState::FromClient, EntryState::Cached, vec![]),
        pool.repository
            .create_entry(attrs.clone(), EntryState::FromClient, EntryState::Cached, vec![]),
    );

    let (handle, err) = match (first, second) {
        (Ok(handle), Err(err)) | (Err(err), Ok(handle)) => (handle, err),
        (Ok(_), Ok(_)) => panic!("both creates succeeded"),
        (Err(a), Err(b)) => panic!("both creates failed: {} / {}", a, b),
    };
    assert!(matches!(err, PoolError::FileInCache(_)));
    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::FromClient);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_client_transfer_is_broken() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000012");
    let attrs = pool.new_file(&x, None);
    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Precious, vec![])
        .await
        .unwrap();
    handle.allocate(100).await.unwrap();
    write_data(handle.get_file(), &[5u8; 40]).await;
    handle.close().await.unwrap();

    let entry = pool.repository.get_entry(&x).await.unwrap();
    assert_eq!(entry.state, EntryState::Broken);
    assert_eq!(entry.size, 40);
    assert_eq!(pool.repository.get_space_record().free, 10_000 - 40);
    assert_eq!(pool.namespace.inner.locations(&x), vec!["pool1".to_string()]);
    assert!(pool.repository.open_entry(&x, &[]).await.is_err());
}

#[tokio::test]
async fn test_namespace_failure_on_commit_breaks_replica() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000013");
    let attrs = pool.new_file(&x, None);
    pool.namespace
        .fail_set_attributes(PoolError::Namespace("unavailable".to_string()));

    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Cached, vec![])
        .await
        .unwrap();
    handle.allocate(200).await.unwrap();
    write_data(handle.get_file(), &[6u8; 100]).await;
    let err = handle.commit(None).await.unwrap_err();
    assert!(matches!(err, PoolError::Namespace(_)));
    assert_eq!(handle.state().await, HandleState::Open);
    handle.close().await.unwrap();

    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::Broken);
    assert_eq!(pool.repository.get_space_record().free, 10_000 - 100);
}

#[tokio::test]
async fn test_file_deleted_from_namespace_during_commit() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000014");
    // never registered in the namespace
    let attrs = FileAttributes::new(x.clone());
    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Cached, vec![])
        .await
        .unwrap();
    handle.allocate(10).await.unwrap();
    write_data(handle.get_file(), &[7u8; 10]).await;
    handle.commit(None).await.unwrap();
    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::Removed);
    handle.close().await.unwrap();

    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::New);
    assert_eq!(pool.repository.get_space_record().free, 10_000);
}

#[tokio::test]
async fn test_size_and_checksum_mismatch() {
    let pool = open_pool(test_config(10_000)).await;

    let a = id("00000015");
    let attrs = pool.new_file(&a, Some(10));
    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromPool, EntryState::Cached, vec![])
        .await
        .unwrap();
    handle.allocate(5).await.unwrap();
    write_data(handle.get_file(), &[1u8; 5]).await;
    let err = handle.commit(None).await.unwrap_err();
    assert!(matches!(err, PoolError::SizeMismatch(_)));
    handle.close().await.unwrap();
    assert_eq!(pool.repository.get_state(&a).await.unwrap(), EntryState::New);

    let b = id("00000016");
    let mut attrs = pool.new_file(&b, Some(3));
    attrs.checksums = vec![Checksum::calculate(ChecksumType::Sha256, b"abc")];
    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromStore, EntryState::Precious, vec![])
        .await
        .unwrap();
    handle.allocate(3).await.unwrap();
    write_data(handle.get_file(), b"abd").await;
    let actual = Checksum::calculate(ChecksumType::Sha256, b"abd");
    let err = handle.commit(Some(actual)).await.unwrap_err();
    assert!(matches!(err, PoolError::ChecksumMismatch(_)));
    handle.close().await.unwrap();
    assert_eq!(pool.repository.get_state(&b).await.unwrap(), EntryState::New);
    assert_eq!(pool.repository.get_space_record().free, 10_000);
}

#[tokio::test]
async fn test_commit_grabs_missing_allocation() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000017");
    let attrs = pool.new_file(&x, None);
    let handle = pool
        .repository
        .create_entry(attrs, EntryState::FromClient, EntryState::Precious, vec![])
        .await
        .unwrap();
    handle.allocate(10).await.unwrap();
    write_data(handle.get_file(), &[8u8; 100]).await;
    let checksum = Checksum::calculate(ChecksumType::Sha256, &[8u8; 100]);
    handle.commit(Some(checksum.clone())).await.unwrap();
    assert_eq!(handle.allocated(), 100);
    assert_eq!(handle.get_checksums().unwrap(), vec![checksum]);
    handle.close().await.unwrap();

    let space = pool.repository.get_space_record();
    assert_eq!(space.free, 10_000 - 100);
    assert_eq!(space.precious, 100);
}

#[tokio::test]
async fn test_close_interrupts_blocked_allocation() {
    let pool = open_pool(test_config(1000)).await;
    let attrs = pool.new_file(&id("00000018"), None);
    let handle = Arc::new(
        pool.repository
            .create_entry(attrs, EntryState::FromClient, EntryState::Cached, vec![])
            .await
            .unwrap(),
    );
    handle.allocate(800).await.unwrap();

    let blocked = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.allocate(500).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    handle.close().await.unwrap();
    let err = blocked.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::HandleClosed(_)));
    assert_eq!(pool.repository.get_space_record().free, 1000);
}

#[tokio::test]
async fn test_sticky_expiration() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("00000019");
    let expire = unix_millis() + 100;
    pool.store(&x, &[9u8; 50], EntryState::Cached, vec![StickyRecord::new("alice", expire)])
        .await;

    let entry = pool.repository.get_entry(&x).await.unwrap();
    assert_eq!(entry.sticky_records, vec![StickyRecord::new("alice", expire)]);
    assert_eq!(pool.repository.get_space_record().removable, 0);

    let repository = pool.repository.clone();
    wait_until(|| repository.get_space_record().removable == 50).await;
    assert!(pool.repository.get_entry(&x).await.unwrap().sticky_records.is_empty());

    pool.repository.flush_listeners().await;
    let changes = pool.events.sticky_changes.lock().unwrap().clone();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].1.owner, "alice");
}

#[tokio::test]
async fn test_set_sticky() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("0000001A");
    pool.store(&x, &[1u8; 10], EntryState::Cached, vec![StickyRecord::new("alice", -1)])
        .await;
    assert_eq!(pool.repository.get_space_record().removable, 0);

    let err = pool.repository.set_sticky(&x, "bob", -2, true).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidParam(_)));

    pool.repository.set_sticky(&x, "alice", 0, true).await.unwrap();
    assert_eq!(pool.repository.get_space_record().removable, 10);
    pool.repository.set_sticky(&x, "bob", -1, false).await.unwrap();
    assert_eq!(pool.repository.get_space_record().removable, 0);

    let pending = pool.new_file(&id("0000001B"), None);
    let handle = pool
        .repository
        .create_entry(pending, EntryState::FromClient, EntryState::Cached, vec![])
        .await
        .unwrap();
    let err = pool
        .repository
        .set_sticky(&id("0000001B"), "bob", -1, false)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(
        pool.repository.open_entry(&id("0000001B"), &[]).await,
        Err(PoolError::Locked(_))
    ));
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_far_future_sticky_with_clock_shift() {
    let config = RepositoryConfig {
        expiration_clock_shift_ms: 1000,
        ..test_config(10_000)
    };
    let pool = open_pool(config).await;
    let x = id("0000001C");
    pool.store(&x, &[3u8; 10], EntryState::Precious, vec![]).await;
    pool.repository.flush_listeners().await;
    let before = pool.events.sticky_changes.lock().unwrap().len();

    pool.repository.set_sticky(&x, "bob", i64::MAX, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entry = pool.repository.get_entry(&x).await.unwrap();
    assert_eq!(entry.sticky_records, vec![StickyRecord::new("bob", i64::MAX)]);
    pool.repository.flush_listeners().await;
    assert_eq!(pool.events.sticky_changes.lock().unwrap().len(), before + 1);

    let now = unix_millis();
    let repository = &pool.repository;
    assert_eq!(repository.expiration_delay(i64::MAX, now), None);
    assert_eq!(
        repository.expiration_delay(now + 500, now),
        Some(Duration::from_millis(1500))
    );
    assert_eq!(repository.expiration_delay(now - 5000, now), Some(Duration::ZERO));
    assert_eq!(
        repository.expiration_delay(i64::MAX - 1000, now),
        Some(Duration::from_secs(24 * 60 * 60))
    );
}

#[tokio::test]
async fn test_huge_sticky_hold_time() {
    let config = RepositoryConfig {
        sticky_hold_time_secs: u64::MAX,
        ..test_config(10_000)
    };
    let pool = open_pool(config).await;
    let x = id("0000001D");
    pool.store(&x, &[3u8; 10], EntryState::Cached, vec![]).await;
    let entry = pool.repository.get_entry(&x).await.unwrap();
    assert_eq!(
        entry.sticky_records,
        vec![StickyRecord::new(SELF_STICKY_OWNER, i64::MAX)]
    );
    assert_eq!(pool.repository.get_space_record().removable, 0);
}

#[tokio::test]
async fn test_load_reconciles_interrupted_transfers() {
    let tmp = TempDir::new().unwrap();
    {
        let meta = SqliteMetaStore::new(&tmp.path().join("meta.db")).unwrap();
        let data = tmp.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        for (name, state, stored, on_disk) in [
            ("0001", EntryState::FromClient, 0, 300),
            ("0002", EntryState::FromPool, 0, 200),
            ("0003", EntryState::Cached, 100, 60),
            ("0004", EntryState::Precious, 100, 100),
        ] {
            let pnfs_id = id(name);
            std::fs::write(data.join(pnfs_id.as_str()), vec![1u8; on_disk]).unwrap();
            meta.put(&MetaRecord {
                pnfs_id: pnfs_id.clone(),
                state,
                size: stored,
                attributes: FileAttributes::new(pnfs_id),
                sticky_records: vec![],
                creation_time: 0,
                last_access_time: 0,
            })
            .unwrap();
        }
        std::fs::write(data.join("00000000FFFF"), b"orphan").unwrap();
    }

    let pool = build_pool(tmp, test_config(10_000));
    pool.repository.init().unwrap();
    pool.repository.load().await.unwrap();
    let repository = &pool.repository;

    assert_eq!(repository.get_state(&id("0001")).await.unwrap(), EntryState::Broken);
    assert_eq!(repository.get_entry(&id("0001")).await.unwrap().size, 300);
    assert_eq!(repository.get_state(&id("0002")).await.unwrap(), EntryState::New);
    assert_eq!(repository.get_state(&id("0003")).await.unwrap(), EntryState::Broken);
    assert_eq!(repository.get_state(&id("0004")).await.unwrap(), EntryState::Precious);
    assert!(!pool.data_dir().join("00000000FFFF").exists());
    assert!(!pool.data_dir().join("0002").exists());

    let space = repository.get_space_record();
    assert_eq!(space.free, 10_000 - 300 - 100 - 100);
    assert_eq!(space.precious, 100);
}

#[tokio::test]
async fn test_metadata_failure_is_fatal() {
    let pool = open_pool(test_config(10_000)).await;
    let faults = Arc::new(RecordingFaults::default());
    pool.repository.add_fault_listener(faults.clone());

    let x = id("0000001C");
    pool.store(&x, &[1u8; 10], EntryState::Cached, vec![]).await;

    pool.meta.fail.store(true, Ordering::SeqCst);
    let err = pool
        .repository
        .set_state(&x, EntryState::Precious)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Internal(_)));
    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::Cached);
    assert_eq!(pool.repository.get_space_record().precious, 0);

    let events = faults.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, FaultAction::Disabled);
    pool.meta.fail.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_volatile_pool_drops_namespace_entry() {
    let config = RepositoryConfig {
        volatile: true,
        ..test_config(10_000)
    };
    let pool = open_pool(config).await;
    let x = id("0000001D");
    pool.store(&x, &[1u8; 10], EntryState::Cached, vec![]).await;
    assert!(pool.namespace.inner.exists(&x));

    pool.repository.set_state(&x, EntryState::Removed).await.unwrap();
    assert!(!pool.namespace.inner.exists(&x));
    assert_eq!(pool.repository.get_state(&x).await.unwrap(), EntryState::New);
}

#[tokio::test]
async fn test_pool_size_changes() {
    let pool = open_pool(test_config(10_000)).await;
    pool.store(&id("0000001E"), &[1u8; 600], EntryState::Precious, vec![]).await;

    pool.repository.set_max_disk_space(2000).unwrap();
    assert_eq!(pool.repository.get_space_record().total, 2000);

    pool.repository.set_runtime_max_disk_space(Some(100)).unwrap();
    let space = pool.repository.get_space_record();
    assert_eq!(space.total, 600);
    assert_eq!(space.free, 0);

    pool.repository.set_runtime_max_disk_space(None).unwrap();
    pool.repository.set_gap(Some(42));
    let space = pool.repository.get_space_record();
    assert_eq!(space.total, 2000);
    assert_eq!(space.gap, 42);

    let info = pool.repository.get_info().await;
    assert!(info.contains("State : OPEN"));
    assert!(info.contains("Files : 1"));
}

#[tokio::test]
async fn test_dropped_write_handle_is_closed() {
    let pool = open_pool(test_config(10_000)).await;
    let x = id("0000001F");
    let attrs = pool.new_file(&x, None);
    {
        let handle = pool
            .repository
            .create_entry(attrs, EntryState::FromClient, EntryState::Cached, vec![])
            .await
            .unwrap();
        handle.allocate(10).await.unwrap();
    }
    let repository = pool.repository.clone();
    for _ in 0..100 {
        let entry = repository.get_entry(&x).await.unwrap();
        if entry.state == EntryState::Broken && entry.link_count == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let entry = repository.get_entry(&x).await.unwrap();
    assert_eq!(entry.state, EntryState::Broken);
    assert_eq!(entry.link_count, 0);
}
