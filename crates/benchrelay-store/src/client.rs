//! The document store abstraction shared by leader and follower targets.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

/// Cluster state as seen by one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// The cluster answers and reports green.
    Healthy,
    /// The cluster answers but reports yellow or red.
    Degraded,
    /// The cluster does not answer.
    Unreachable,
}

/// One search hit: document id plus its source body.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Document id.
    pub id: String,
    /// Stored document body.
    pub source: Value,
}

/// Client interface to one results store cluster.
///
/// Writes address documents by explicit id, so re-putting the same id and
/// body after an ambiguous failure converges instead of duplicating.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Index (or overwrite) one document under an explicit id.
    async fn put(&self, index: &str, doc_id: &str, doc: &Value) -> Result<(), StoreError>;

    /// Index a batch of documents in one request.
    async fn bulk_put(&self, index: &str, docs: &[(String, Value)]) -> Result<(), StoreError>;

    /// Run a query and return matching documents.
    async fn search(&self, index: &str, query: &Value) -> Result<Vec<SearchHit>, StoreError>;

    /// Count documents matching a query.
    async fn count(&self, index: &str, query: &Value) -> Result<u64, StoreError>;

    /// Ids of documents matching a query, without their bodies.
    async fn doc_ids(&self, index: &str, query: &Value) -> Result<Vec<String>, StoreError>;

    /// Probe cluster health. Infallible; transport errors map to
    /// [`Health::Unreachable`].
    async fn health(&self) -> Health;

    /// Install (or overwrite) an index template.
    async fn put_template(&self, name: &str, template: &Value) -> Result<(), StoreError>;

    /// Make recent writes visible to search.
    async fn refresh(&self, index: &str) -> Result<(), StoreError>;
}
