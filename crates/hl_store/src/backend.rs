//! Persistent key-value capability the vault writes its records through.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::VaultError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), VaultError>;

    /// Returns true if a record was removed.
    async fn delete(&self, key: &str) -> Result<bool, VaultError>;

    /// Keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VaultError>;

    /// Remove every record.
    async fn clear(&self) -> Result<(), VaultError>;
}

/// Process-local store. Used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Raw record access, bypassing the vault (inspection in tests).
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.records.read().get(key).cloned()
    }

    /// Overwrite a raw record, bypassing the vault (corruption in tests).
    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        self.records.write().insert(key.to_string(), value);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), VaultError> {
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, VaultError> {
        Ok(self.records.write().remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VaultError> {
        Ok(self
            .records
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<(), VaultError> {
        self.records.write().clear();
        Ok(())
    }
}
