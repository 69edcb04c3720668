use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    New,
    FromClient,
    FromStore,
    FromPool,
    Cached,
    Precious,
    Broken,
    Removed,
    Destroyed,
}

impl EntryState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(EntryState::New),
            "FROM_CLIENT" => Some(EntryState::FromClient),
            "FROM_STORE" => Some(EntryState::FromStore),
            "FROM_POOL" => Some(EntryState::FromPool),
            "CACHED" => Some(EntryState::Cached),
            "PRECIOUS" => Some(EntryState::Precious),
            "BROKEN" => Some(EntryState::Broken),
            "REMOVED" => Some(EntryState::Removed),
            "DESTROYED" => Some(EntryState::Destroyed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::New => "NEW",
            EntryState::FromClient => "FROM_CLIENT",
            EntryState::FromStore => "FROM_STORE",
            EntryState::FromPool => "FROM_POOL",
            EntryState::Cached => "CACHED",
            EntryState::Precious => "PRECIOUS",
            EntryState::Broken => "BROKEN",
            EntryState::Removed => "REMOVED",
            EntryState::Destroyed => "DESTROYED",
        }
    }

    /// The replica is still being received.
    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            EntryState::New | EntryState::FromClient | EntryState::FromStore | EntryState::FromPool
        )
    }

    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            EntryState::FromClient | EntryState::FromStore | EntryState::FromPool
        )
    }

    /// The file is fully present.
    pub fn is_complete(&self) -> bool {
        matches!(self, EntryState::Cached | EntryState::Precious)
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, EntryState::Removed | EntryState::Destroyed)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
