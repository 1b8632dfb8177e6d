//! In-process remote store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use kvsync_core::{Document, KvResult, StoreError};

use super::{RemoteConnector, RemoteStore};

/// Remote document store kept in memory.
///
/// Clones share the same documents, so one instance can act as the
/// "server" seen by several engines. It is also its own connector.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteStore {
    documents: Arc<RwLock<HashMap<String, Document>>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document directly, bypassing the async API.
    pub fn insert(&self, key: &str, document: Document) {
        if let Ok(mut documents) = self.documents.write() {
            documents.insert(key.to_string(), document);
        }
    }

    /// Read a document directly, bypassing the async API.
    pub fn document(&self, key: &str) -> Option<Document> {
        self.documents
            .read()
            .ok()
            .and_then(|documents| documents.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, key: &str) -> KvResult<Option<Document>> {
        let documents = self.documents.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(documents.get(key).cloned())
    }

    async fn set(&self, key: &str, document: &Document) -> KvResult<()> {
        let mut documents = self.documents.write().map_err(|_| StoreError::LockPoisoned)?;
        documents.insert(key.to_string(), document.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut documents = self.documents.write().map_err(|_| StoreError::LockPoisoned)?;
        documents.remove(key);
        Ok(())
    }
}

#[async_trait]
impl RemoteConnector for MemoryRemoteStore {
    async fn connect(&self) -> KvResult<Arc<dyn RemoteStore>> {
        Ok(Arc::new(self.clone()))
    }
}
