//! In-memory document store used by the test harness.
//!
//! Behaves like a tiny single-node cluster: documents keyed by id inside
//! named indices, the query subset the coordinator and auditor emit, and
//! scripted fault injection so outage and retry paths can be driven
//! deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use benchrelay_model::parse_timestamp;

use crate::client::{DocumentStore, Health, SearchHit};
use crate::error::StoreError;

/// When a scripted failure fires relative to the write it fails.
#[derive(Debug, Clone)]
enum ScriptedFailure {
    /// Fail before applying; the store is untouched.
    Before(StoreError),
    /// Apply the write, then report failure. Models an ambiguous timeout
    /// where the store indexed the document but the answer was lost.
    After(StoreError),
}

#[derive(Default)]
struct MemoryState {
    indices: BTreeMap<String, BTreeMap<String, Value>>,
    templates: BTreeMap<String, Value>,
    applied: Vec<String>,
    failures: VecDeque<ScriptedFailure>,
    unreachable: bool,
    health_override: Option<Health>,
}

impl MemoryState {
    fn apply(&mut self, index: &str, doc_id: &str, doc: &Value) {
        self.indices
            .entry(index.to_string())
            .or_default()
            .insert(doc_id.to_string(), doc.clone());
        self.applied.push(doc_id.to_string());
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.unreachable {
            return Err(StoreError::Unreachable {
                msg: "scripted outage".to_string(),
            });
        }
        Ok(())
    }
}

fn index_matches(name: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

/// Match the query subset this crate's callers emit: `match_all`, `ids`,
/// and `range` over a timestamp field. Unknown shapes match everything.
fn query_matches(doc_id: &str, doc: &Value, query: &Value) -> bool {
    if query.get("match_all").is_some() {
        return true;
    }
    if let Some(ids) = query.get("ids") {
        return ids["values"]
            .as_array()
            .map(|values| values.iter().any(|v| v.as_str() == Some(doc_id)))
            .unwrap_or(false);
    }
    if let Some(range) = query.get("range") {
        let Some((field, bounds)) = range.as_object().and_then(|m| m.iter().next()) else {
            return false;
        };
        let Some(actual) = doc.get(field).and_then(Value::as_str).and_then(parse_timestamp) else {
            return false;
        };
        if let Some(gte) = bounds.get("gte").and_then(Value::as_str).and_then(parse_timestamp) {
            if actual < gte {
                return false;
            }
        }
        if let Some(lte) = bounds.get("lte").and_then(Value::as_str).and_then(parse_timestamp) {
            if actual > lte {
                return false;
            }
        }
        return true;
    }
    true
}

/// An in-memory [`DocumentStore`].
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unreachable` until cleared.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Override the reported health while the store stays reachable.
    pub async fn set_health(&self, health: Health) {
        self.state.lock().await.health_override = Some(health);
    }

    /// Queue a failure for the next write; the write does not apply.
    pub async fn fail_next(&self, error: StoreError) {
        self.state
            .lock()
            .await
            .failures
            .push_back(ScriptedFailure::Before(error));
    }

    /// Queue a failure for the next write, reported after the write applied.
    pub async fn fail_next_after_apply(&self, error: StoreError) {
        self.state
            .lock()
            .await
            .failures
            .push_back(ScriptedFailure::After(error));
    }

    /// Fetch one stored document.
    pub async fn document(&self, index: &str, doc_id: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .and_then(|docs| docs.get(doc_id))
            .cloned()
    }

    /// Number of documents across indices matching a pattern.
    pub async fn doc_count(&self, pattern: &str) -> usize {
        let state = self.state.lock().await;
        state
            .indices
            .iter()
            .filter(|(name, _)| index_matches(name, pattern))
            .map(|(_, docs)| docs.len())
            .sum()
    }

    /// Document ids in the order writes applied, repeats included.
    pub async fn applied_order(&self) -> Vec<String> {
        self.state.lock().await.applied.clone()
    }

    /// Insert a document directly, bypassing fault injection.
    pub async fn seed(&self, index: &str, doc_id: &str, doc: Value) {
        self.state.lock().await.apply(index, doc_id, &doc);
    }

    /// Remove one document. Returns whether it existed.
    pub async fn remove(&self, index: &str, doc_id: &str) -> bool {
        self.state
            .lock()
            .await
            .indices
            .get_mut(index)
            .map(|docs| docs.remove(doc_id).is_some())
            .unwrap_or(false)
    }

    /// Installed template body, if any.
    pub async fn template(&self, name: &str) -> Option<Value> {
        self.state.lock().await.templates.get(name).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, index: &str, doc_id: &str, doc: &Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.guard()?;
        match state.failures.pop_front() {
            Some(ScriptedFailure::Before(e)) => Err(e),
            Some(ScriptedFailure::After(e)) => {
                state.apply(index, doc_id, doc);
                Err(e)
            }
            None => {
                state.apply(index, doc_id, doc);
                Ok(())
            }
        }
    }

    async fn bulk_put(&self, index: &str, docs: &[(String, Value)]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.guard()?;
        match state.failures.pop_front() {
            Some(ScriptedFailure::Before(e)) => Err(e),
            Some(ScriptedFailure::After(e)) => {
                for (doc_id, doc) in docs {
                    state.apply(index, doc_id, doc);
                }
                Err(e)
            }
            None => {
                for (doc_id, doc) in docs {
                    state.apply(index, doc_id, doc);
                }
                Ok(())
            }
        }
    }

    async fn search(&self, index: &str, query: &Value) -> Result<Vec<SearchHit>, StoreError> {
        let state = self.state.lock().await;
        state.guard()?;
        let mut hits = Vec::new();
        for (name, docs) in &state.indices {
            if !index_matches(name, index) {
                continue;
            }
            for (doc_id, doc) in docs {
                if query_matches(doc_id, doc, query) {
                    hits.push(SearchHit {
                        id: doc_id.clone(),
                        source: doc.clone(),
                    });
                }
            }
        }
        Ok(hits)
    }

    async fn count(&self, index: &str, query: &Value) -> Result<u64, StoreError> {
        Ok(self.search(index, query).await?.len() as u64)
    }

    async fn doc_ids(&self, index: &str, query: &Value) -> Result<Vec<String>, StoreError> {
        Ok(self
            .search(index, query)
            .await?
            .into_iter()
            .map(|hit| hit.id)
            .collect())
    }

    async fn health(&self) -> Health {
        let state = self.state.lock().await;
        if state.unreachable {
            return Health::Unreachable;
        }
        state.health_override.unwrap_or(Health::Healthy)
    }

    async fn put_template(&self, name: &str, template: &Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.guard()?;
        state.templates.insert(name.to_string(), template.clone());
        Ok(())
    }

    async fn refresh(&self, _index: &str) -> Result<(), StoreError> {
        self.state.lock().await.guard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(ts: &str) -> Value {
        json!({"test-execution-timestamp": ts, "name": "throughput"})
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryDocumentStore::new();
        store
            .put("benchmark-results-2026-08", "a/throughput/t", &doc("20260821T101500Z"))
            .await
            .unwrap();
        let stored = store
            .document("benchmark-results-2026-08", "a/throughput/t")
            .await
            .unwrap();
        assert_eq!(stored["name"], "throughput");
        assert_eq!(store.applied_order().await, vec!["a/throughput/t"]);
    }

    #[tokio::test]
    async fn test_reput_overwrites_not_duplicates() {
        let store = MemoryDocumentStore::new();
        let index = "benchmark-results-2026-08";
        store.put(index, "a/x/", &doc("20260801T000000Z")).await.unwrap();
        store.put(index, "a/x/", &doc("20260802T000000Z")).await.unwrap();
        assert_eq!(store.doc_count("benchmark-results-*").await, 1);
        assert_eq!(store.applied_order().await.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_leaves_store_untouched() {
        let store = MemoryDocumentStore::new();
        store
            .fail_next(StoreError::Timeout {
                msg: "scripted".to_string(),
            })
            .await;
        let err = store
            .put("idx", "a", &doc("20260801T000000Z"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.document("idx", "a").await.is_none());

        store.put("idx", "a", &doc("20260801T000000Z")).await.unwrap();
        assert!(store.document("idx", "a").await.is_some());
    }

    #[tokio::test]
    async fn test_fail_after_apply_stores_then_errors() {
        let store = MemoryDocumentStore::new();
        store
            .fail_next_after_apply(StoreError::Timeout {
                msg: "scripted".to_string(),
            })
            .await;
        let err = store
            .put("idx", "a", &doc("20260801T000000Z"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.document("idx", "a").await.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_blocks_all_calls() {
        let store = MemoryDocumentStore::new();
        store.set_unreachable(true).await;
        assert!(store.put("idx", "a", &doc("20260801T000000Z")).await.is_err());
        assert!(store.search("idx", &json!({"match_all": {}})).await.is_err());
        assert_eq!(store.health().await, Health::Unreachable);

        store.set_unreachable(false).await;
        assert_eq!(store.health().await, Health::Healthy);
        store.put("idx", "a", &doc("20260801T000000Z")).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_override() {
        let store = MemoryDocumentStore::new();
        store.set_health(Health::Degraded).await;
        assert_eq!(store.health().await, Health::Degraded);
    }

    #[tokio::test]
    async fn test_search_honors_index_pattern() {
        let store = MemoryDocumentStore::new();
        store
            .put("benchmark-results-2026-07", "a", &doc("20260715T000000Z"))
            .await
            .unwrap();
        store
            .put("benchmark-results-2026-08", "b", &doc("20260815T000000Z"))
            .await
            .unwrap();
        store.put("unrelated", "c", &doc("20260815T000000Z")).await.unwrap();

        let hits = store
            .search("benchmark-results-*", &json!({"match_all": {}}))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store
            .search("benchmark-results-2026-08", &json!({"match_all": {}}))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn test_range_query_filters_by_timestamp() {
        let store = MemoryDocumentStore::new();
        store.put("idx", "old", &doc("20260801T000000Z")).await.unwrap();
        store.put("idx", "new", &doc("20260820T000000Z")).await.unwrap();

        let query = json!({
            "range": {"test-execution-timestamp": {"lte": "20260810T000000Z"}}
        });
        let ids = store.doc_ids("idx", &query).await.unwrap();
        assert_eq!(ids, vec!["old"]);

        let query = json!({
            "range": {"test-execution-timestamp": {"gte": "20260810T000000Z"}}
        });
        let ids = store.doc_ids("idx", &query).await.unwrap();
        assert_eq!(ids, vec!["new"]);
    }

    #[tokio::test]
    async fn test_ids_query() {
        let store = MemoryDocumentStore::new();
        store.put("idx", "a", &doc("20260801T000000Z")).await.unwrap();
        store.put("idx", "b", &doc("20260801T000000Z")).await.unwrap();

        let query = json!({"ids": {"values": ["b"]}});
        let hits = store.search("idx", &query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn test_count_matches_search() {
        let store = MemoryDocumentStore::new();
        for i in 0..5 {
            store
                .put("idx", &format!("doc-{i}"), &doc("20260801T000000Z"))
                .await
                .unwrap();
        }
        assert_eq!(store.count("idx", &json!({"match_all": {}})).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_bulk_put_applies_all() {
        let store = MemoryDocumentStore::new();
        let docs = vec![
            ("a".to_string(), doc("20260801T000000Z")),
            ("b".to_string(), doc("20260801T000000Z")),
        ];
        store.bulk_put("idx", &docs).await.unwrap();
        assert_eq!(store.doc_count("idx").await, 2);
    }

    #[tokio::test]
    async fn test_bulk_put_scripted_failure_applies_nothing() {
        let store = MemoryDocumentStore::new();
        store
            .fail_next(StoreError::Unreachable {
                msg: "scripted".to_string(),
            })
            .await;
        let docs = vec![("a".to_string(), doc("20260801T000000Z"))];
        assert!(store.bulk_put("idx", &docs).await.is_err());
        assert_eq!(store.doc_count("idx").await, 0);
    }

    #[tokio::test]
    async fn test_seed_and_remove_for_drift_setup() {
        let store = MemoryDocumentStore::new();
        store.seed("idx", "a", doc("20260801T000000Z")).await;
        assert!(store.remove("idx", "a").await);
        assert!(!store.remove("idx", "a").await);
    }

    #[tokio::test]
    async fn test_template_install() {
        let store = MemoryDocumentStore::new();
        store
            .put_template("benchmark-results", &json!({"index_patterns": ["benchmark-results-*"]}))
            .await
            .unwrap();
        assert!(store.template("benchmark-results").await.is_some());
    }
}
