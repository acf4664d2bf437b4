//! JSON-RPC 2.0 over HTTP.
//!
//! [`RpcClient`] talks to one node endpoint. Single calls go through the
//! retry policy; batch calls are a single attempt and degrade per item rather
//! than failing as a whole. Both are bounded by a hard deadline that drops
//! the in-flight request.
//!
//! Everything above this layer talks to the node through the [`Transport`]
//! trait, so the splitter and node client can be exercised against scripted
//! transports.

pub mod batch;
pub mod retry;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub use batch::{send_adaptive, send_bounded, BoundedBatch, FailedSlice};
pub use retry::{retry, RetryPolicy};

const JSONRPC_VERSION: &str = "2.0";

/// Identifier correlating a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::Text(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::Text(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

/// A JSON-RPC request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
    pub id: RequestId,
}

impl RpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

/// The `error` member of a response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A JSON-RPC response envelope, decoded leniently.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// Results of a batch, keyed by request id.
///
/// An id maps to `None` when the node answered that item with an error or
/// without a result. Ids the node never answered are absent. [`get`]
/// collapses both cases, which is how callers are expected to read it.
///
/// [`get`]: BatchResult::get
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    entries: HashMap<RequestId, Option<Value>>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the items of a batch response array.
    ///
    /// Items that are not response objects, or carry no id, are dropped.
    pub fn from_items(items: Vec<Value>) -> Self {
        let mut result = Self::new();
        for item in items {
            let response: RpcResponse = match serde_json::from_value(item) {
                Ok(response) => response,
                Err(e) => {
                    debug!(error = %e, "Dropping undecodable batch item");
                    continue;
                }
            };
            let Some(id) = response.id else {
                debug!("Dropping batch item without id");
                continue;
            };
            if let Some(error) = &response.error {
                debug!(%id, code = error.code, message = %error.message, "Batch item failed");
                result.insert(id, None);
            } else {
                result.insert(id, response.result);
            }
        }
        result
    }

    pub fn insert(&mut self, id: RequestId, value: Option<Value>) {
        self.entries.insert(id, value);
    }

    /// The value for `id`, or `None` if the item failed or never arrived.
    pub fn get(&self, id: &RequestId) -> Option<&Value> {
        self.entries.get(id).and_then(Option::as_ref)
    }

    /// The value for `id` if it is a non-empty string.
    pub fn get_str(&self, id: &RequestId) -> Option<&str> {
        self.get(id)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Whether the node answered `id` at all, successfully or not.
    pub fn answered(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every entry of `other` into `self`; `other` wins on collisions.
    pub fn merge(&mut self, other: BatchResult) {
        self.entries.extend(other.entries);
    }
}

/// Something that can carry JSON-RPC calls to a node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one call and return its `result`.
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// Issue a batch in a single POST.
    async fn call_batch(&self, requests: &[RpcRequest]) -> Result<BatchResult>;
}

/// Deadlines and retries for an [`RpcClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Deadline of each single-call attempt
    pub timeout: Duration,
    /// Deadline of a batch POST
    pub batch_timeout: Duration,
    /// Applied to single calls only
    pub retry: RetryPolicy,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            batch_timeout: Duration::from_secs(180),
            retry: RetryPolicy::default(),
        }
    }
}

/// HTTP JSON-RPC client bound to one endpoint.
///
/// Cheap to clone; clones share the connection pool and id counter.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    options: CallOptions,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>, options: CallOptions) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            options,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    // POST `body` and decode the reply as JSON, all within `timeout`.
    async fn post_json<B>(&self, body: &B, timeout: Duration, context: &str) -> Result<Value>
    where
        B: Serialize + Sync + ?Sized,
    {
        let exchange = async {
            let response = self.http.post(&self.endpoint).json(body).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::HttpStatus {
                    status,
                    context: context.to_string(),
                });
            }
            Ok::<_, Error>(response.json::<Value>().await?)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params.clone());
        trace!(method, id, "RPC call");

        let body = self.post_json(&request, self.options.timeout, method).await?;
        let response: RpcResponse = serde_json::from_value(body)
            .map_err(|e| Error::Protocol(format!("malformed response to {method}: {e}")))?;

        if let Some(error) = response.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Transport for RpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        retry(&self.options.retry, method, || self.call_once(method, &params)).await
    }

    async fn call_batch(&self, requests: &[RpcRequest]) -> Result<BatchResult> {
        debug!(len = requests.len(), "RPC batch");
        let body = self
            .post_json(requests, self.options.batch_timeout, "batch")
            .await?;
        match body {
            Value::Array(items) => Ok(BatchResult::from_items(items)),
            other => Err(Error::Protocol(format!(
                "batch response is not an array: {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
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
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope() {
        let request = RpcRequest::new("12_m", "quai_getMinerDiffNormalized", json!(["0xc"]));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "method": "quai_getMinerDiffNormalized",
                "params": ["0xc"],
                "id": "12_m",
            })
        );
        let numbered = RpcRequest::new(7u64, "quai_blockNumber", json!([]));
        assert_eq!(serde_json::to_value(&numbered).unwrap()["id"], json!(7));
    }

    #[test]
    fn test_batch_items_degrade_individually() {
        let items = vec![
            json!({"jsonrpc": "2.0", "id": "1_m", "result": "0x10"}),
            json!({"jsonrpc": "2.0", "id": "1_b", "error": {"code": -32000, "message": "boom"}}),
            json!({"jsonrpc": "2.0", "id": "1_h"}),
            json!({"jsonrpc": "2.0", "error": {"code": -32600, "message": "no id"}}),
            json!("not an object"),
            json!({"jsonrpc": "2.0", "id": 5, "result": null}),
        ];
        let result = BatchResult::from_items(items);

        assert_eq!(result.get_str(&"1_m".into()), Some("0x10"));
        assert_eq!(result.get(&"1_b".into()), None);
        assert!(result.answered(&"1_b".into()));
        assert_eq!(result.get(&"1_h".into()), None);
        assert!(result.answered(&"1_h".into()));
        assert!(result.answered(&5u64.into()));
        assert_eq!(result.get(&5u64.into()), None);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_absent_and_null_read_the_same() {
        let mut result = BatchResult::new();
        result.insert("a".into(), None);
        assert_eq!(result.get(&"a".into()), result.get(&"missing".into()));
        assert!(!result.answered(&"missing".into()));
    }

    #[test]
    fn test_get_str_ignores_empty_and_non_strings() {
        let mut result = BatchResult::new();
        result.insert("empty".into(), Some(json!("")));
        result.insert("number".into(), Some(json!(16)));
        assert_eq!(result.get_str(&"empty".into()), None);
        assert_eq!(result.get_str(&"number".into()), None);
    }

    #[test]
    fn test_merge_prefers_later() {
        let mut a = BatchResult::new();
        a.insert("x".into(), Some(json!("old")));
        a.insert("y".into(), Some(json!("kept")));
        let mut b = BatchResult::new();
        b.insert("x".into(), Some(json!("new")));
        a.merge(b);
        assert_eq!(a.get_str(&"x".into()), Some("new"));
        assert_eq!(a.get_str(&"y".into()), Some("kept"));
    }
}
