//! Persistence port.
//!
//! A store is a keyed set of collections, each a flat list of JSON records
//! replaced wholesale on save.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StoreError;

pub const CLUSTERS: &str = "clusters";
pub const DECISIONS: &str = "decisions";
pub const PURCHASES: &str = "purchases";
pub const DISTRIBUTIONS: &str = "distributions";

/// Whole-collection load/save persistence
#[cfg_attr(test, mockall::automock)]
pub trait Store: Send + Sync {
    /// Every record in `collection`; empty when it was never saved
    fn load(&self, collection: &str) -> Result<Vec<Value>, StoreError>;

    /// Replace `collection` with `records`
    fn save(&self, collection: &str, records: Vec<Value>) -> Result<(), StoreError>;
}

/// Load and decode a collection
pub fn load_typed<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
) -> Result<Vec<T>, StoreError> {
    store
        .load(collection)?
        .into_iter()
        .map(|record| serde_json::from_value(record).map_err(StoreError::from))
        .collect()
}

/// Encode records for saving
pub fn to_records<T: Serialize>(items: &[T]) -> Result<Vec<Value>, StoreError> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).map_err(StoreError::from))
        .collect()
}

/// In-process store, used by tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    fn save(&self, collection: &str, records: Vec<Value>) -> Result<(), StoreError> {
        self.collections
            .write()
            .insert(collection.to_string(), records);
        Ok(())
    }
}

/// One pretty-printed JSON array per collection under a directory
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", collection))
    }
}

impl Store for JsonFileStore {
    fn load(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let path = self.path_for(collection);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)?;
        match serde_json::from_str::<Value>(&data)? {
            Value::Array(records) => Ok(records),
            _ => Err(StoreError::Corrupt {
                collection: collection.to_string(),
                reason: "expected a JSON array".into(),
            }),
        }
    }

    fn save(&self, collection: &str, records: Vec<Value>) -> Result<(), StoreError> {
        let path = self.path_for(collection);
        let tmp = path.with_extension("json.tmp");
        let count = records.len();
        let data = serde_json::to_string_pretty(&Value::Array(records))?;
        // rename keeps readers from ever seeing a half-written file
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        debug!(collection, records = count, "collection saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_replace() {
        let store = MemoryStore::new();
        assert!(store.load(CLUSTERS).unwrap().is_empty());

        store.save(CLUSTERS, vec![json!({"id": "a"}), json!({"id": "b"})]).unwrap();
        assert_eq!(store.load(CLUSTERS).unwrap().len(), 2);

        store.save(CLUSTERS, vec![json!({"id": "c"})]).unwrap();
        let records = store.load(CLUSTERS).unwrap();
        assert_eq!(records, vec![json!({"id": "c"})]);
        assert!(store.load(DECISIONS).unwrap().is_empty());
    }

    #[test]
    fn test_json_file_store_persists() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.save(PURCHASES, vec![json!({"id": "p1"})]).unwrap();

        // Reopen
        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load(PURCHASES).unwrap(), vec![json!({"id": "p1"})]);
        assert!(reopened.load(DISTRIBUTIONS).unwrap().is_empty());
        assert!(!dir.path().join("purchases.json.tmp").exists());
    }

    #[test]
    fn test_json_file_store_rejects_non_array() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("clusters.json"), "{\"id\": 1}").unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load(CLUSTERS),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Row {
            id: String,
        }

        let store = MemoryStore::new();
        let rows = vec![Row { id: "x".into() }];
        store.save(CLUSTERS, to_records(&rows).unwrap()).unwrap();
        let loaded: Vec<Row> = load_typed(&store, CLUSTERS).unwrap();
        assert_eq!(loaded, rows);
    }
}
