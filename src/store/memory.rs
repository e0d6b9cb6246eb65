//! In-memory document backend

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::DocumentStore;
use crate::Result;

/// Documents held in a process-local map
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.docs.write().await.insert(key.to_string(), value.clone());
        Ok(())
    }
}
