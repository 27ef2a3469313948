use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::event::HandlerError;

/// Get/set over opaque serializable blobs.
#[cfg_attr(test, mockall::automock)]
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> StorageResult<()>;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt entry at {key}: {message}")]
    Corrupt { key: String, message: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        HandlerError::new("storage", err.to_string())
    }
}

/// In-process storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, key: &str, value: Value) -> Self {
        self.entries.insert(key.to_string(), value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new().with_entry("a", json!(1));
        assert_eq!(storage.get("a").unwrap(), Some(json!(1)));
        assert_eq!(storage.get("b").unwrap(), None);

        storage.set("a", json!({ "x": true })).unwrap();
        assert_eq!(storage.get("a").unwrap(), Some(json!({ "x": true })));
        assert_eq!(storage.len(), 1);
    }
}
