//! Document-oriented persistence contract (§6 "Repository") — generalized from
//! the teacher's `ProcessStore` trait (`store.rs`) down to the spec's leaner
//! eight-method surface plus the incident/counter extensions the engine needs.

use async_trait::async_trait;
use serde_json::Value as Json;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

/// Opaque, JSON-shaped documents keyed by string. The engine never interprets a
/// document's structure outside `snapshot.rs`/`sla.rs` — this trait is the single
/// seam a host swaps to move from files to a relational store to a KV store.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert or overwrite.
    async fn save_or_update(&self, key: &str, doc: Json) -> anyhow::Result<()>;
    /// Insert; fails if `key` already exists.
    async fn save(&self, key: &str, doc: Json) -> anyhow::Result<()>;
    /// Overwrite; fails if `key` does not exist.
    async fn update(&self, key: &str, doc: Json) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Json>>;
    /// All documents whose key carries the given type prefix.
    async fn get_all(&self, doc_type: &str) -> anyhow::Result<Vec<Json>>;
    /// Reserved for multi-writer deployments (§6); single-writer backends may
    /// implement this identically to `get`.
    async fn get_locked(&self, key: &str) -> anyhow::Result<Json>;
    /// Atomic read-modify-write increment, used for the audit sequence counter.
    async fn incr_counter(&self, key: &str) -> anyhow::Result<i64>;

    /// Fault-history record for a pended path (enrichment, §3 supplement —
    /// carried over from the teacher's `ProcessStore::save_incident`). Default
    /// implementation stores it as an ordinary document under
    /// `"workflow_incident:{case_id}:{incident_id}"` so backends get it for free.
    async fn save_incident(&self, incident: &crate::model::Incident) -> anyhow::Result<()> {
        let key = format!("workflow_incident:{}:{}", incident.case_id, incident.incident_id);
        let doc = serde_json::to_value(incident)?;
        self.save_or_update(&key, doc).await
    }

    /// All incidents recorded for a case, carried over from the teacher's
    /// `ProcessStore::load_incidents`.
    async fn load_incidents(&self, case_id: &str) -> anyhow::Result<Vec<crate::model::Incident>> {
        let docs = self.get_all(&format!("workflow_incident:{case_id}")).await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(anyhow::Error::from))
            .collect()
    }
}
