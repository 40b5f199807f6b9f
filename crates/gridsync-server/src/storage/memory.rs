#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{Document, DocumentStore, StoreError};

/// In-memory document store for testing and `--in-memory` runs
///
/// All state is wrapped in Arc<Mutex<>> to allow Clone and concurrent access.
/// Uses `lock().expect()`, which panics if the mutex is poisoned.
#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<Mutex<HashMap<String, Document>>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn document_count(&self) -> usize {
        self.documents.lock().expect("Mutex poisoned").len()
    }
}

impl DocumentStore for MemoryStore {
    #[allow(clippy::expect_used)]
    fn create(&self, name: &str, password: &str) -> Result<Document, StoreError> {
        let mut documents = self.documents.lock().expect("Mutex poisoned");
        if documents.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let document = Document::new(name, password);
        documents.insert(name.to_string(), document.clone());
        Ok(document)
    }

    #[allow(clippy::expect_used)]
    fn load(&self, name: &str) -> Result<Document, StoreError> {
        let documents = self.documents.lock().expect("Mutex poisoned");
        documents.get(name).cloned().ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    #[allow(clippy::expect_used)]
    fn save(&self, document: &Document) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().expect("Mutex poisoned");
        documents.insert(document.name().to_string(), document.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let documents = self.documents.lock().expect("Mutex poisoned");
        Ok(documents.keys().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn create_then_load() {
        let store = MemoryStore::new();
        store.create("budget", "pw").unwrap();

        let doc = store.load("budget").unwrap();
        assert_eq!(doc.name(), "budget");
        assert_eq!(doc.password(), "pw");
    }

    #[test]
    fn duplicate_create_fails() {
        let store = MemoryStore::new();
        store.create("budget", "pw").unwrap();

        let result = store.create("budget", "other");
        assert_eq!(result, Err(StoreError::AlreadyExists("budget".to_string())));
        assert_eq!(store.load("budget").unwrap().password(), "pw");
    }

    #[test]
    fn load_missing_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(store.load("nope"), Err(StoreError::NotFound("nope".to_string())));
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();

        let mut doc = store.create("s", "pw").unwrap();
        doc.set_cell("A1", "1");
        clone.save(&doc).unwrap();

        assert_eq!(store.load("s").unwrap().cell("A1"), "1");
        assert_eq!(store.document_count(), 1);
    }
}
