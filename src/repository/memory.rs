//! In-memory `Repository` for tests and embedding without a database — same role
//! `MemoryStore` plays in the teacher crate (`store_memory.rs`), same
//! `RwLock<Inner>`-guarding-plain-`HashMap`s shape.

use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::Repository;

struct Inner {
    docs: HashMap<String, Json>,
    counters: HashMap<String, i64>,
}

pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                docs: HashMap::new(),
                counters: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_or_update(&self, key: &str, doc: Json) -> anyhow::Result<()> {
        let mut w = self.inner.write().await;
        w.docs.insert(key.to_string(), doc);
        Ok(())
    }

    async fn save(&self, key: &str, doc: Json) -> anyhow::Result<()> {
        let mut w = self.inner.write().await;
        if w.docs.contains_key(key) {
            anyhow::bail!("key already exists: {key}");
        }
        w.docs.insert(key.to_string(), doc);
        Ok(())
    }

    async fn update(&self, key: &str, doc: Json) -> anyhow::Result<()> {
        let mut w = self.inner.write().await;
        if !w.docs.contains_key(key) {
            anyhow::bail!("key does not exist: {key}");
        }
        w.docs.insert(key.to_string(), doc);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut w = self.inner.write().await;
        w.docs.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Json>> {
        let r = self.inner.read().await;
        Ok(r.docs.get(key).cloned())
    }

    async fn get_all(&self, doc_type: &str) -> anyhow::Result<Vec<Json>> {
        let r = self.inner.read().await;
        let prefix = format!("{doc_type}:");
        Ok(r.docs
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get_locked(&self, key: &str) -> anyhow::Result<Json> {
        let r = self.inner.read().await;
        r.docs
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("key not found: {key}"))
    }

    async fn incr_counter(&self, key: &str) -> anyhow::Result<i64> {
        let mut w = self.inner.write().await;
        let c = w.counters.entry(key.to_string()).or_insert(0);
        *c += 1;
        Ok(*c)
    }
}
