use pool_lib::{unix_millis, EntryState, FileAttributes, PnfsId, PoolError, PoolResult, StickyRecord};
use std::sync::{Mutex, MutexGuard};

/// Mutable part of a replica, guarded by the record's own lock.
#[derive(Debug, Clone)]
pub struct RecordState {
    pub state: EntryState,
    /// Bytes charged to the allocator for this replica.
    pub size: u64,
    pub attributes: FileAttributes,
    pub sticky_records: Vec<StickyRecord>,
    pub link_count: u32,
    pub creation_time: i64,
    pub last_access_time: i64,
}

impl RecordState {
    pub fn is_sticky_at(&self, now_ms: i64) -> bool {
        self.sticky_records.iter().any(|s| s.is_valid_at(now_ms))
    }

    /// Adds, replaces or (with `expire == 0`) drops the pin of `owner`.
    /// Returns whether the pin set changed.
    pub fn set_sticky(&mut self, owner: &str, expire: i64, overwrite: bool) -> bool {
        let pos = self.sticky_records.iter().position(|s| s.owner == owner);
        if expire == 0 {
            return match pos {
                Some(idx) => {
                    self.sticky_records.remove(idx);
                    true
                }
                None => false,
            };
        }

        match pos {
            Some(idx) => {
                let existing = &self.sticky_records[idx];
                if existing.expire == expire {
                    return false;
                }
                // without overwrite a pin is only ever extended
                let covers = existing.is_non_expiring()
                    || (expire != pool_lib::STICKY_NEVER_EXPIRES && existing.expire >= expire);
                if !overwrite && covers {
                    return false;
                }
                self.sticky_records[idx].expire = expire;
                true
            }
            None => {
                self.sticky_records.push(StickyRecord::new(owner, expire));
                true
            }
        }
    }

    /// Drops pins that are no longer valid and returns them.
    pub fn remove_expired_stickies(&mut self, now_ms: i64) -> Vec<StickyRecord> {
        let (valid, expired): (Vec<StickyRecord>, Vec<StickyRecord>) = self
            .sticky_records
            .drain(..)
            .partition(|s| s.is_valid_at(now_ms));
        self.sticky_records = valid;
        expired
    }

    /// Earliest finite expiration among the pins.
    pub fn next_expiration(&self) -> Option<i64> {
        self.sticky_records
            .iter()
            .filter(|s| !s.is_non_expiring())
            .map(|s| s.expire)
            .min()
    }
}

pub struct ReplicaRecord {
    pnfs_id: PnfsId,
    inner: Mutex<RecordState>,
}

impl ReplicaRecord {
    pub fn new(attributes: FileAttributes) -> Self {
        let now = unix_millis();
        Self {
            pnfs_id: attributes.pnfs_id.clone(),
            inner: Mutex::new(RecordState {
                state: EntryState::New,
                size: 0,
                attributes,
                sticky_records: Vec::new(),
                link_count: 0,
                creation_time: now,
                last_access_time: now,
            }),
        }
    }

    pub fn from_state(state: RecordState) -> Self {
        Self {
            pnfs_id: state.attributes.pnfs_id.clone(),
            inner: Mutex::new(state),
        }
    }

    pub fn pnfs_id(&self) -> &PnfsId {
        &self.pnfs_id
    }

    pub fn lock(&self) -> PoolResult<MutexGuard<'_, RecordState>> {
        self.inner
            .lock()
            .map_err(|_| PoolError::Internal(format!("record lock poisoned: {}", self.pnfs_id)))
    }

    pub fn snapshot(&self) -> PoolResult<CacheEntry> {
        let state = self.lock()?;
        Ok(CacheEntry::from_record(&self.pnfs_id, &state))
    }
}

/// Point in time view of a replica handed out to callers and listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub pnfs_id: PnfsId,
    pub size: u64,
    pub state: EntryState,
    pub attributes: FileAttributes,
    pub sticky_records: Vec<StickyRecord>,
    pub link_count: u32,
    pub creation_time: i64,
    pub last_access_time: i64,
}

impl CacheEntry {
    pub fn from_record(pnfs_id: &PnfsId, state: &RecordState) -> Self {
        Self {
            pnfs_id: pnfs_id.clone(),
            size: state.size,
            state: state.state,
            attributes: state.attributes.clone(),
            sticky_records: state.sticky_records.clone(),
            link_count: state.link_count,
            creation_time: state.creation_time,
            last_access_time: state.last_access_time,
        }
    }

    pub fn is_sticky(&self) -> bool {
        let now = unix_millis();
        self.sticky_records.iter().any(|s| s.is_valid_at(now))
    }
}
