use crate::record::RecordState;
use log::{debug, warn};
use pool_lib::{EntryState, FileAttributes, PnfsId, PoolError, PoolResult, StickyRecord};
use rusqlite::types::{FromSql, FromSqlError, ToSql, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Persistent form of a replica.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRecord {
    pub pnfs_id: PnfsId,
    pub state: EntryState,
    pub size: u64,
    pub attributes: FileAttributes,
    pub sticky_records: Vec<StickyRecord>,
    pub creation_time: i64,
    pub last_access_time: i64,
}

impl MetaRecord {
    pub fn from_state(state: &RecordState) -> Self {
        Self {
            pnfs_id: state.attributes.pnfs_id.clone(),
            state: state.state,
            size: state.size,
            attributes: state.attributes.clone(),
            sticky_records: state.sticky_records.clone(),
            creation_time: state.creation_time,
            last_access_time: state.last_access_time,
        }
    }

    pub fn into_state(self) -> RecordState {
        RecordState {
            state: self.state,
            size: self.size,
            attributes: self.attributes,
            sticky_records: self.sticky_records,
            link_count: 0,
            creation_time: self.creation_time,
            last_access_time: self.last_access_time,
        }
    }
}

/// Port to the replica metadata journal. Calls are synchronous and are made
/// while the record lock is held.
pub trait MetaDataStore: Send + Sync {
    /// Ids of every replica known to the store.
    fn index(&self) -> PoolResult<Vec<PnfsId>>;
    fn get(&self, pnfs_id: &PnfsId) -> PoolResult<Option<MetaRecord>>;
    fn put(&self, record: &MetaRecord) -> PoolResult<()>;
    fn remove(&self, pnfs_id: &PnfsId) -> PoolResult<()>;
    fn close(&self) -> PoolResult<()> {
        Ok(())
    }
}

struct SqlEntryState(EntryState);

impl ToSql for SqlEntryState {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.0.as_str().into())
    }
}

impl FromSql for SqlEntryState {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        EntryState::from_str(s)
            .map(SqlEntryState)
            .ok_or_else(|| FromSqlError::Other(format!("unknown entry state: {}", s).into()))
    }
}

pub struct SqliteMetaStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> PoolError {
    warn!("SqliteMetaStore: database error: {}", e);
    PoolError::DbError(e.to_string())
}

impl SqliteMetaStore {
    pub fn new(db_path: &Path) -> PoolResult<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn new_in_memory() -> PoolResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> PoolResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS replicas (
                pnfs_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                size INTEGER NOT NULL,
                attributes TEXT NOT NULL,
                sticky TEXT NOT NULL,
                creation_time INTEGER NOT NULL,
                access_time INTEGER NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> PoolResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PoolError::DbError("sqlite connection lock poisoned".to_string()))
    }
}

impl MetaDataStore for SqliteMetaStore {
    fn index(&self) -> PoolResult<Vec<PnfsId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT pnfs_id FROM replicas ORDER BY pnfs_id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut ids = Vec::new();
        for row in rows {
            let id = row.map_err(db_err)?;
            match PnfsId::new(&id) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("SqliteMetaStore: skipping bad id {}: {}", id, e),
            }
        }
        Ok(ids)
    }

    fn get(&self, pnfs_id: &PnfsId) -> PoolResult<Option<MetaRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT state, size, attributes, sticky, creation_time, access_time
                 FROM replicas WHERE pnfs_id = ?1",
                params![pnfs_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, SqlEntryState>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((state, size, attributes, sticky, creation_time, access_time)) = row else {
            return Ok(None);
        };
        let attributes: FileAttributes = serde_json::from_str(&attributes).map_err(db_err)?;
        let sticky_records: Vec<StickyRecord> = serde_json::from_str(&sticky).map_err(db_err)?;
        Ok(Some(MetaRecord {
            pnfs_id: pnfs_id.clone(),
            state: state.0,
            size: size.max(0) as u64,
            attributes,
            sticky_records,
            creation_time,
            last_access_time: access_time,
        }))
    }

    fn put(&self, record: &MetaRecord) -> PoolResult<()> {
        let attributes = serde_json::to_string(&record.attributes).map_err(db_err)?;
        let sticky = serde_json::to_string(&record.sticky_records).map_err(db_err)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO replicas
                (pnfs_id, state, size, attributes, sticky, creation_time, access_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.pnfs_id.as_str(),
                SqlEntryState(record.state),
                record.size as i64,
                attributes,
                sticky,
                record.creation_time,
                record.last_access_time,
            ],
        )
        .map_err(db_err)?;
        debug!(
            "SqliteMetaStore: put {} state {}",
            record.pnfs_id, record.state
        );
        Ok(())
    }

    fn remove(&self, pnfs_id: &PnfsId) -> PoolResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM replicas WHERE pnfs_id = ?1",
            params![pnfs_id.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }
}
