//! Persistence seam for document state.
//!
//! The engine never talks to a database directly; it calls through
//! [`DocumentStore`] so the server can plug in its diesel-backed
//! implementation while tests run against [`MemoryStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document store backend error: {0}")]
    Backend(String),
}

/// Fetch/store of full document state, keyed by document name.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the latest persisted state blob, or `None` for a new document.
    async fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Upsert the full state blob. `owner` is the authenticated user the
    /// save is attributed to, when one is known; a `None` owner must not
    /// clear an owner recorded earlier.
    async fn store(&self, name: &str, state: &[u8], owner: Option<Uuid>) -> Result<(), StoreError>;
}

/// In-memory store used by tests.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, (Vec<u8>, Option<Uuid>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn owner(&self, name: &str) -> Option<Uuid> {
        self.docs.read().await.get(name).and_then(|(_, o)| *o)
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.docs.read().await.get(name).map(|(d, _)| d.clone()))
    }

    async fn store(&self, name: &str, state: &[u8], owner: Option<Uuid>) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let entry = docs.entry(name.to_string()).or_insert((Vec::new(), None));
        entry.0 = state.to_vec();
        if owner.is_some() {
            entry.1 = owner;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_upserts() {
        let store = MemoryStore::new();
        assert!(store.fetch("doc").await.unwrap().is_none());

        store.store("doc", &[1, 2], None).await.unwrap();
        assert_eq!(store.fetch("doc").await.unwrap(), Some(vec![1, 2]));

        store.store("doc", &[3], None).await.unwrap();
        assert_eq!(store.fetch("doc").await.unwrap(), Some(vec![3]));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn anonymous_save_keeps_known_owner() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();

        store.store("doc", &[1], Some(owner)).await.unwrap();
        store.store("doc", &[2], None).await.unwrap();

        assert_eq!(store.owner("doc").await, Some(owner));
        assert_eq!(store.fetch("doc").await.unwrap(), Some(vec![2]));
    }
}
