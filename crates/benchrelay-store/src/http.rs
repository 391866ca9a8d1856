//! HTTP document store client.
//!
//! Speaks the REST dialect shared by Elasticsearch-compatible stores:
//! `PUT /{index}/_doc/{id}`, `POST /_bulk`, `_search`, `_count`, and
//! `_cluster/health`. Backpressure statuses (429, 502, 503, 504) map to
//! retryable errors; every other non-2xx answer is a rejection.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::client::{DocumentStore, Health, SearchHit};
use crate::error::StoreError;

/// Statuses a loaded cluster sheds requests with; retried, not rejected.
const TRANSIENT_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Upper bound on hits returned by one search request.
const MAX_RESULT_WINDOW: usize = 10_000;

/// Longest response excerpt carried inside an error.
const MAX_REASON_LEN: usize = 512;

/// Write visibility requested from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyPolicy {
    /// Return as soon as the write is durable on the store.
    #[default]
    None,
    /// Block single-document writes until they are visible to search.
    WaitFor,
}

/// Connection settings for one cluster.
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Base URL of the cluster, e.g. `http://leader:9200`.
    pub base_url: String,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Visibility policy applied to single-document writes.
    pub consistency: ConsistencyPolicy,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(60),
            consistency: ConsistencyPolicy::None,
        }
    }
}

/// A [`DocumentStore`] backed by one HTTP cluster endpoint.
pub struct HttpDocumentStore {
    client: reqwest::Client,
    config: HttpStoreConfig,
}

impl HttpDocumentStore {
    /// Build a client for one cluster.
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::InvalidResponse {
                msg: format!("http client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    /// Base URL this client targets.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(user) = &self.config.username {
            req = req.basic_auth(user, self.config.password.as_deref());
        }
        req
    }

    fn transport_error(e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout { msg: e.to_string() }
        } else {
            StoreError::Unreachable { msg: e.to_string() }
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }

    async fn json_body(resp: reqwest::Response) -> Result<Value, StoreError> {
        resp.json()
            .await
            .map_err(|e| StoreError::InvalidResponse { msg: e.to_string() })
    }
}

/// Map a non-2xx status to the matching error variant.
fn classify_status(status: u16, body: &str) -> StoreError {
    let reason = truncate_reason(body);
    if TRANSIENT_STATUSES.contains(&status) {
        StoreError::Unreachable {
            msg: format!("HTTP {status}: {reason}"),
        }
    } else {
        StoreError::Rejected { status, reason }
    }
}

fn truncate_reason(body: &str) -> String {
    if body.len() <= MAX_REASON_LEN {
        body.to_string()
    } else {
        body.chars().take(MAX_REASON_LEN).collect()
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn put(&self, index: &str, doc_id: &str, doc: &Value) -> Result<(), StoreError> {
        let mut url = format!(
            "{}/{}/_doc/{}",
            self.config.base_url,
            index,
            urlencoding::encode(doc_id)
        );
        if self.config.consistency == ConsistencyPolicy::WaitFor {
            url.push_str("?refresh=wait_for");
        }
        let resp = self
            .request(Method::PUT, url)
            .json(doc)
            .send()
            .await
            .map_err(Self::transport_error)?;
        Self::check(resp).await?;
        debug!(index, doc_id, "document indexed");
        Ok(())
    }

    async fn bulk_put(&self, index: &str, docs: &[(String, Value)]) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for (doc_id, doc) in docs {
            body.push_str(&json!({"index": {"_index": index, "_id": doc_id}}).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        let url = format!("{}/_bulk", self.config.base_url);
        let resp = self
            .request(Method::POST, url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let parsed = Self::json_body(Self::check(resp).await?).await?;

        // A 200 bulk answer can still carry per-item failures.
        if parsed["errors"].as_bool().unwrap_or(false) {
            let first_failure = parsed["items"].as_array().and_then(|items| {
                items.iter().find_map(|item| {
                    let entry = item.get("index")?;
                    let status = entry.get("status")?.as_u64()? as u16;
                    if (200..300).contains(&status) {
                        None
                    } else {
                        Some((status, entry["error"].to_string()))
                    }
                })
            });
            let (status, reason) =
                first_failure.unwrap_or((500, "bulk request reported errors".to_string()));
            return Err(StoreError::Rejected {
                status,
                reason: truncate_reason(&reason),
            });
        }
        debug!(index, count = docs.len(), "bulk indexed");
        Ok(())
    }

    async fn search(&self, index: &str, query: &Value) -> Result<Vec<SearchHit>, StoreError> {
        let url = format!("{}/{}/_search", self.config.base_url, index);
        let body = json!({"query": query, "size": MAX_RESULT_WINDOW});
        let resp = self
            .request(Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let parsed = Self::json_body(Self::check(resp).await?).await?;
        let hits = parsed["hits"]["hits"]
            .as_array()
            .ok_or_else(|| StoreError::InvalidResponse {
                msg: "search response missing hits.hits".to_string(),
            })?;
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = hit["_id"]
                .as_str()
                .ok_or_else(|| StoreError::InvalidResponse {
                    msg: "search hit missing _id".to_string(),
                })?
                .to_string();
            let source = hit.get("_source").cloned().unwrap_or(Value::Null);
            out.push(SearchHit { id, source });
        }
        Ok(out)
    }

    async fn count(&self, index: &str, query: &Value) -> Result<u64, StoreError> {
        let url = format!("{}/{}/_count", self.config.base_url, index);
        let body = json!({"query": query});
        let resp = self
            .request(Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let parsed = Self::json_body(Self::check(resp).await?).await?;
        parsed["count"]
            .as_u64()
            .ok_or_else(|| StoreError::InvalidResponse {
                msg: "count response missing count".to_string(),
            })
    }

    async fn doc_ids(&self, index: &str, query: &Value) -> Result<Vec<String>, StoreError> {
        let url = format!("{}/{}/_search", self.config.base_url, index);
        let body = json!({"query": query, "size": MAX_RESULT_WINDOW, "_source": false});
        let resp = self
            .request(Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let parsed = Self::json_body(Self::check(resp).await?).await?;
        let hits = parsed["hits"]["hits"]
            .as_array()
            .ok_or_else(|| StoreError::InvalidResponse {
                msg: "search response missing hits.hits".to_string(),
            })?;
        hits.iter()
            .map(|hit| {
                hit["_id"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| StoreError::InvalidResponse {
                        msg: "search hit missing _id".to_string(),
                    })
            })
            .collect()
    }

    async fn health(&self) -> Health {
        let url = format!("{}/_cluster/health", self.config.base_url);
        let resp = match self.request(Method::GET, url).send().await {
            Ok(resp) => resp,
            Err(_) => return Health::Unreachable,
        };
        if !resp.status().is_success() {
            return Health::Unreachable;
        }
        let parsed: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return Health::Unreachable,
        };
        match parsed["status"].as_str() {
            Some("green") => Health::Healthy,
            Some("yellow") | Some("red") => Health::Degraded,
            _ => Health::Unreachable,
        }
    }

    async fn put_template(&self, name: &str, template: &Value) -> Result<(), StoreError> {
        let url = format!("{}/_template/{}", self.config.base_url, name);
        let resp = self
            .request(Method::PUT, url)
            .json(template)
            .send()
            .await
            .map_err(Self::transport_error)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        let url = format!("{}/{}/_refresh", self.config.base_url, index);
        let resp = self
            .request(Method::POST, url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        Self::check(resp).await?;
        Ok(())
    }
}
