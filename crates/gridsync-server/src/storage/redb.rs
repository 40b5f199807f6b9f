//! Redb-backed durable document store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Documents survive server restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{Document, DocumentStore, StoreError};

/// Table: documents
/// Key: document name
/// Value: CBOR-encoded Document
const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Durable store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(|e| StoreError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(DOCUMENTS).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn encode_document(document: &Document) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(document, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_document(bytes: &[u8]) -> Result<Document, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl DocumentStore for RedbStore {
    fn create(&self, name: &str, password: &str) -> Result<Document, StoreError> {
        let document = Document::new(name, password);
        let bytes = encode_document(&document)?;

        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(DOCUMENTS).map_err(|e| StoreError::Io(e.to_string()))?;

            if table.get(name).map_err(|e| StoreError::Io(e.to_string()))?.is_some() {
                return Err(StoreError::AlreadyExists(name.to_string()));
            }

            table.insert(name, bytes.as_slice()).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(document)
    }

    fn load(&self, name: &str) -> Result<Document, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(DOCUMENTS).map_err(|e| StoreError::Io(e.to_string()))?;

        match table.get(name).map_err(|e| StoreError::Io(e.to_string()))? {
            Some(value) => decode_document(value.value()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    fn save(&self, document: &Document) -> Result<(), StoreError> {
        let bytes = encode_document(document)?;

        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(DOCUMENTS).map_err(|e| StoreError::Io(e.to_string()))?;
            table
                .insert(document.name(), bytes.as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(DOCUMENTS).map_err(|e| StoreError::Io(e.to_string()))?;

        let mut names = Vec::new();
        for result in table.iter().map_err(|e| StoreError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StoreError::Io(e.to_string()))?;
            names.push(key.value().to_string());
        }

        Ok(names)
    }
}
