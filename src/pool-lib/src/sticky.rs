use serde::{Deserialize, Serialize};
use std::fmt;

/// A retention pin. `expire` is in unix milliseconds, `-1` means the pin never expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    pub expire: i64,
}

pub const STICKY_NEVER_EXPIRES: i64 = -1;

impl StickyRecord {
    pub fn new(owner: &str, expire: i64) -> Self {
        Self {
            owner: owner.to_string(),
            expire,
        }
    }

    pub fn forever(owner: &str) -> Self {
        Self::new(owner, STICKY_NEVER_EXPIRES)
    }

    pub fn is_non_expiring(&self) -> bool {
        self.expire == STICKY_NEVER_EXPIRES
    }

    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.is_non_expiring() || self.expire > now_ms
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(crate::unix_millis())
    }
}

impl fmt::Display for StickyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_non_expiring() {
            write!(f, "{} : never", self.owner)
        } else {
            write!(f, "{} : {}", self.owner, self.expire)
        }
    }
}
