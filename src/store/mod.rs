//! Durable JSON document storage
//!
//! Each document is a whole JSON value stored under a string key. There are no
//! partial updates: every mutation loads the document, changes it in memory and
//! replaces it. [`Documents`] serializes those cycles per key so concurrent
//! writers in this process never lose updates.

pub mod file;
pub mod memory;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::Result;

/// Backend holding raw JSON documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document
    ///
    /// Returns `None` when the key was never written or the stored content
    /// is empty or unparseable.
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unavailable
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace a document atomically
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unavailable
    async fn put(&self, key: &str, value: &Value) -> Result<()>;
}

/// Per-key locking front end over a [`DocumentStore`]
#[derive(Clone)]
pub struct Documents {
    backend: Arc<dyn DocumentStore>,
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl std::fmt::Debug for Documents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Documents").finish_non_exhaustive()
    }
}

impl Documents {
    /// Wrap a backend
    #[must_use]
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Documents kept in process memory only
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Documents stored as JSON files under `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(Arc::new(FileStore::open(dir)?)))
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Read a raw document, falling back to `default`
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unavailable
    pub async fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        let lock = self.lock_for(key);
        let _read = lock.read().await;
        Ok(self.backend.get(key).await?.unwrap_or(default))
    }

    /// Replace a raw document
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unavailable
    pub async fn put(&self, key: &str, value: &Value) -> Result<()> {
        let lock = self.lock_for(key);
        let _write = lock.write().await;
        self.backend.put(key, value).await
    }

    /// Load a list document
    ///
    /// Documents stored as an object keyed by id are read as the list of their
    /// values. Entries that do not decode as `T` are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unavailable
    pub async fn load_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        let lock = self.lock_for(key);
        let _read = lock.read().await;
        let raw = self.backend.get(key).await?;
        Ok(ListDocument::decode(key, raw).items)
    }

    /// Read-modify-write a list document, always persisting the result
    ///
    /// `mutate` sees only the entries that decode as `T`. The others are
    /// written back unchanged at their original positions.
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unavailable
    pub async fn update_list<T, R, F>(&self, key: &str, mutate: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> R,
    {
        let lock = self.lock_for(key);
        let _write = lock.write().await;
        let mut doc = ListDocument::decode(key, self.backend.get(key).await?);
        let out = mutate(&mut doc.items);
        self.backend.put(key, &doc.encode()?).await?;
        Ok(out)
    }

    /// Read-modify-write a list document, persisting only when `mutate` returns `Some`
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unavailable
    pub async fn try_update_list<T, R, F>(&self, key: &str, mutate: F) -> Result<Option<R>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> Option<R>,
    {
        let lock = self.lock_for(key);
        let _write = lock.write().await;
        let mut doc = ListDocument::decode(key, self.backend.get(key).await?);
        let Some(out) = mutate(&mut doc.items) else {
            return Ok(None);
        };
        self.backend.put(key, &doc.encode()?).await?;
        Ok(Some(out))
    }
}

/// A list document split into typed entries and entries left as raw JSON
struct ListDocument<T> {
    items: Vec<T>,
    foreign: Vec<(usize, Value)>,
}

impl<T: DeserializeOwned> ListDocument<T> {
    fn decode(key: &str, raw: Option<Value>) -> Self {
        let entries = match raw {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(Value::Object(map)) => map.into_iter().map(|(_, v)| v).collect(),
            Some(other) => {
                tracing::warn!(key, kind = %json_kind(&other), "unexpected document shape, using empty list");
                Vec::new()
            }
        };

        let mut items = Vec::with_capacity(entries.len());
        let mut foreign = Vec::new();
        for (idx, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value(entry.clone()) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(key, index = idx, error = %e, "keeping undecodable document entry as-is");
                    foreign.push((idx, entry));
                }
            }
        }
        Self { items, foreign }
    }
}

impl<T: Serialize> ListDocument<T> {
    fn encode(self) -> Result<Value> {
        let mut out = self
            .items
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        // Ascending order puts each raw entry back where it was read
        for (idx, entry) in self.foreign {
            let at = idx.min(out.len());
            out.insert(at, entry);
        }
        Ok(Value::Array(out))
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        id: String,
        n: u32,
    }

    #[tokio::test]
    async fn missing_document_loads_empty() {
        let docs = Documents::in_memory();
        let list: Vec<Entry> = docs.load_list("nothing.json").await.unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn object_documents_load_as_values() {
        let docs = Documents::in_memory();
        docs.put(
            "legacy.json",
            &json!({"a": {"id": "a", "n": 1}, "b": {"id": "b", "n": 2}}),
        )
        .await
        .unwrap();

        let list: Vec<Entry> = docs.load_list("legacy.json").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "a");
    }

    #[tokio::test]
    async fn wrong_shape_degrades_to_empty() {
        let docs = Documents::in_memory();
        docs.put("weird.json", &json!("not a list")).await.unwrap();

        let list: Vec<Entry> = docs.load_list("weird.json").await.unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped_on_load() {
        let docs = Documents::in_memory();
        docs.put("mixed.json", &json!([{"id": "a", "n": 1}, {"bogus": true}]))
            .await
            .unwrap();

        let list: Vec<Entry> = docs.load_list("mixed.json").await.unwrap();
        assert_eq!(list, vec![Entry { id: "a".into(), n: 1 }]);
    }

    #[tokio::test]
    async fn undecodable_entries_survive_updates() {
        let docs = Documents::in_memory();
        docs.put(
            "mixed.json",
            &json!([{"id": 7, "n": 1}, {"id": "a", "n": 1}, {"bogus": true}]),
        )
        .await
        .unwrap();

        docs.update_list("mixed.json", |list: &mut Vec<Entry>| {
            list[0].n = 2;
            list.push(Entry {
                id: "b".into(),
                n: 3,
            });
        })
        .await
        .unwrap();

        let raw = docs.get_or("mixed.json", Value::Null).await.unwrap();
        assert_eq!(
            raw,
            json!([
                {"id": 7, "n": 1},
                {"id": "a", "n": 2},
                {"bogus": true},
                {"id": "b", "n": 3}
            ])
        );
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let docs = Documents::in_memory();
        let mut tasks = Vec::new();
        for n in 0..32 {
            let docs = docs.clone();
            tasks.push(tokio::spawn(async move {
                docs.update_list("counter.json", |list: &mut Vec<Entry>| {
                    list.push(Entry {
                        id: format!("e{n}"),
                        n,
                    });
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let list: Vec<Entry> = docs.load_list("counter.json").await.unwrap();
        assert_eq!(list.len(), 32);
    }

    #[tokio::test]
    async fn try_update_skips_write_on_none() {
        let docs = Documents::in_memory();
        let out = docs
            .try_update_list("untouched.json", |list: &mut Vec<Entry>| -> Option<()> {
                list.push(Entry {
                    id: "ghost".into(),
                    n: 0,
                });
                None
            })
            .await
            .unwrap();

        assert!(out.is_none());
        let raw = docs.get_or("untouched.json", json!("default")).await.unwrap();
        assert_eq!(raw, json!("default"));
    }
}
