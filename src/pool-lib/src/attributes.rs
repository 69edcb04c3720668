use crate::{Checksum, PnfsId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLatency {
    Online,
    Nearline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    Replica,
    Output,
    Custodial,
}

/// Namespace supplied storage metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageInfo {
    pub storage_class: String,
    pub hsm: String,
    /// Tape locations known to hold the file.
    pub locations: Vec<String>,
    pub stored: bool,
    pub keys: HashMap<String, String>,
}

impl Default for StorageInfo {
    fn default() -> Self {
        Self {
            storage_class: "<unknown>".to_string(),
            hsm: "osm".to_string(),
            locations: Vec::new(),
            stored: false,
            keys: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub pnfs_id: PnfsId,
    /// Declared size, `None` until known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub storage_info: StorageInfo,
    #[serde(default)]
    pub checksums: Vec<Checksum>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub access_latency: Option<AccessLatency>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache_class: Option<String>,
}

impl FileAttributes {
    pub fn new(pnfs_id: PnfsId) -> Self {
        Self {
            pnfs_id,
            size: None,
            storage_info: StorageInfo::default(),
            checksums: Vec::new(),
            access_latency: None,
            retention_policy: None,
            cache_class: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Adds checksums of types not yet present.
    pub fn merge_checksums(&mut self, checksums: &[Checksum]) {
        for checksum in checksums {
            if !self.checksums.iter().any(|c| c.kind == checksum.kind) {
                self.checksums.push(checksum.clone());
            }
        }
    }
}

/// Attribute update sent to the namespace after a replica is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeUpdate {
    pub size: Option<u64>,
    pub checksums: Vec<Checksum>,
    pub access_latency: Option<AccessLatency>,
    pub retention_policy: Option<RetentionPolicy>,
    pub location: Option<String>,
}
