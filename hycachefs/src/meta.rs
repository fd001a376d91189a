//! Contract of the metadata index that records where each file lives.
//!
//! The tiering core only publishes to the index; it never reads it back to
//! decide anything, so a missing or failing index cannot break a mount.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::path::Tier;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("index backend: {0}")]
    Backend(String),
}

/// Key/value store keyed by virtual path.
pub trait MetadataIndex: Send + Sync {
    fn insert(&self, key: &str, value: &[u8]) -> Result<(), IndexError>;

    fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError>;

    fn remove(&self, key: &str) -> Result<(), IndexError>;
}

/// Value stored under a virtual path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRecord {
    pub tier: Tier,
    pub size: u64,
    /// Seconds since the epoch.
    pub updated: u64,
}

impl TierRecord {
    pub fn now(tier: Tier, size: u64) -> Self {
        let updated = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            tier,
            size,
            updated,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, IndexError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Process-local index.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataIndex for InMemoryIndex {
    fn insert(&self, key: &str, value: &[u8]) -> Result<(), IndexError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> Result<(), IndexError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
