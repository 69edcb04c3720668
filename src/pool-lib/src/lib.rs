mod attributes;
mod checksum;
mod entry_state;
mod namespace;
mod pnfs_id;
mod sticky;

pub use attributes::*;
pub use checksum::*;
pub use entry_state::*;
pub use namespace::*;
pub use pnfs_id::*;
pub use sticky::*;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("entry already exists: {0}")]
    FileInCache(String),
    #[error("entry not in repository: {0}")]
    FileNotInCache(String),
    #[error("entry is locked: {0}")]
    Locked(String),
    #[error("illegal state transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: EntryState,
        to: EntryState,
    },
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error("handle closed: {0}")]
    HandleClosed(String),
    #[error("size mismatch: {0}")]
    SizeMismatch(String),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("namespace error: {0}")]
    Namespace(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("no route: {0}")]
    NoRoute(String),
    #[error("disk error: {0}")]
    DiskError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl PoolError {
    /// Repository level "not found", not to be confused with the namespace one.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::FileNotInCache(_))
    }

    /// The namespace reported that the file no longer exists.
    pub fn is_file_not_found(&self) -> bool {
        matches!(self, PoolError::FileNotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Timeout(_) | PoolError::NoRoute(_) | PoolError::Interrupted(_)
        )
    }
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::IoError(err.to_string())
    }
}

/// Wall clock in milliseconds, the unit used by sticky expirations and access times.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

/// Parses sizes such as `5120`, `100k`, `4g` or `Infinity` (returned as `u64::MAX`).
pub fn parse_unit_size(s: &str) -> PoolResult<u64> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("infinity") || s.eq_ignore_ascii_case("inf") {
        return Ok(u64::MAX);
    }
    if s.is_empty() {
        return Err(PoolError::InvalidParam("empty size".to_string()));
    }

    let (digits, unit) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], Some(c.to_ascii_lowercase())),
        _ => (s, None),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| PoolError::InvalidParam(format!("invalid size: {}", s)))?;
    let factor = match unit {
        None => 1,
        Some('k') => KIB,
        Some('m') => MIB,
        Some('g') => GIB,
        Some('t') => TIB,
        Some(other) => {
            return Err(PoolError::InvalidParam(format!(
                "unknown size unit '{}' in {}",
                other, s
            )))
        }
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| PoolError::InvalidParam(format!("size overflow: {}", s)))
}

pub fn format_unit_size(size: u64) -> String {
    if size == u64::MAX {
        return "Infinity".to_string();
    }
    for (factor, unit) in [(TIB, "T"), (GIB, "G"), (MIB, "M"), (KIB, "K")] {
        if size >= factor && size % factor == 0 {
            return format!("{}{}", size / factor, unit);
        }
    }
    size.to_string()
}
