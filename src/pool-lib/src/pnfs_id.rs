use crate::{PoolError, PoolResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Globally unique file identifier, carried as an upper case hex string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PnfsId(String);

const MIN_ID_LEN: usize = 4;
const MAX_ID_LEN: usize = 64;

impl PnfsId {
    pub fn new(id: &str) -> PoolResult<Self> {
        let id = id.trim();
        if id.len() < MIN_ID_LEN || id.len() > MAX_ID_LEN {
            return Err(PoolError::InvalidParam(format!(
                "invalid pnfs id length: {}",
                id
            )));
        }
        if !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PoolError::InvalidParam(format!("invalid pnfs id: {}", id)));
        }
        Ok(PnfsId(id.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PnfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PnfsId {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PnfsId::new(s)
    }
}

impl Serialize for PnfsId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PnfsId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PnfsId::new(&s).map_err(serde::de::Error::custom)
    }
}
