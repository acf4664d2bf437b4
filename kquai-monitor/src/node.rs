//! Quai node client.
//!
//! Wraps a [`Transport`] with the handful of node methods the monitor needs
//! and decodes their loosely-typed answers into [`RawBlock`] and [`Header`]
//! records. Per-block data for a window is fetched as one logical batch of
//! three calls per block, split into bounded POSTs as needed.

use std::sync::Arc;

use async_trait::async_trait;
use ruint::aliases::U256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::rpc::{
    send_adaptive, BatchResult, FailedSlice, RequestId, RpcClient, RpcRequest, Transport,
};
use crate::tracing::prelude::*;
use crate::units::{parse_hex_quantity, parse_hex_u64, to_hex};

pub const METHOD_BLOCK_NUMBER: &str = "quai_blockNumber";
pub const METHOD_MINER_DIFFICULTY: &str = "quai_getMinerDiffNormalized";
pub const METHOD_BEST_DIFFICULTY: &str = "quai_getBestDiffNormalized";
pub const METHOD_HEADER_BY_NUMBER: &str = "quai_getHeaderByNumber";
pub const METHOD_QI_TO_QUAI: &str = "quai_qiToQuai";

/// Calls issued per block by [`ChainSource::fetch_blocks`].
pub const REQUESTS_PER_BLOCK: usize = 3;

/// Default cap on requests per POST.
pub const DEFAULT_MAX_ITEMS_PER_POST: usize = 2000;

/// Work object header, the part of a Quai header carrying the timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkObjectHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Block header as returned by `quai_getHeaderByNumber`.
///
/// Only the fields read downstream are typed; everything else is kept in
/// `extra` and serialized back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wo_header: Option<WorkObjectHeader>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Header {
    /// Unix timestamp in seconds, preferring the work object header.
    pub fn timestamp(&self) -> Option<u64> {
        self.wo_header
            .as_ref()
            .and_then(|wo| wo.timestamp.as_deref())
            .or(self.timestamp.as_deref())
            .and_then(parse_hex_u64)
    }

    fn decode(value: &Value, block: u64) -> Option<Header> {
        if !value.is_object() {
            return None;
        }
        match Header::deserialize(value) {
            Ok(header) => Some(header),
            Err(e) => {
                debug!(block, error = %e, "Undecodable header");
                None
            }
        }
    }
}

/// What the node returned for one block, undecoded beyond the header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBlock {
    pub number: u64,
    pub miner_difficulty: Option<String>,
    pub best_difficulty: Option<String>,
    pub header: Option<Header>,
}

/// Per-block data for a set of block numbers.
///
/// Holds one [`RawBlock`] for every requested number, in request order. Data
/// lost to failed slices shows up as missing fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedBlocks {
    pub blocks: Vec<RawBlock>,
    pub failed_slices: Vec<FailedSlice>,
}

impl FetchedBlocks {
    /// True when no slice failed.
    pub fn is_complete(&self) -> bool {
        self.failed_slices.is_empty()
    }

    /// Numbers of blocks with at least one call in a failed slice, ascending.
    ///
    /// Slice offsets index the request list, [`REQUESTS_PER_BLOCK`] calls
    /// per block in block order.
    pub fn lost_blocks(&self) -> Vec<u64> {
        let mut lost: Vec<u64> = self
            .failed_slices
            .iter()
            .flat_map(|slice| {
                let first = slice.offset / REQUESTS_PER_BLOCK;
                let end = (slice.offset + slice.len)
                    .div_ceil(REQUESTS_PER_BLOCK)
                    .min(self.blocks.len());
                self.blocks.get(first..end).unwrap_or_default()
            })
            .map(|block| block.number)
            .collect();
        lost.sort_unstable();
        lost.dedup();
        lost
    }
}

/// Source of chain data for the poll controller.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Number of the newest block.
    async fn latest_block_number(&self) -> Result<u64>;

    /// Difficulties and headers for `numbers`.
    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<FetchedBlocks>;
}

#[async_trait]
impl<S: ChainSource + ?Sized> ChainSource for Arc<S> {
    async fn latest_block_number(&self) -> Result<u64> {
        (**self).latest_block_number().await
    }

    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<FetchedBlocks> {
        (**self).fetch_blocks(numbers).await
    }
}

fn block_ids(number: u64) -> [RequestId; 3] {
    [
        RequestId::Text(format!("{number}_m")),
        RequestId::Text(format!("{number}_b")),
        RequestId::Text(format!("{number}_h")),
    ]
}

fn block_requests(numbers: &[u64]) -> Vec<RpcRequest> {
    let mut requests = Vec::with_capacity(numbers.len() * REQUESTS_PER_BLOCK);
    for &number in numbers {
        let params = json!([to_hex(number)]);
        let [miner, best, header] = block_ids(number);
        requests.push(RpcRequest::new(miner, METHOD_MINER_DIFFICULTY, params.clone()));
        requests.push(RpcRequest::new(best, METHOD_BEST_DIFFICULTY, params.clone()));
        requests.push(RpcRequest::new(header, METHOD_HEADER_BY_NUMBER, params));
    }
    requests
}

fn raw_block(number: u64, results: &BatchResult) -> RawBlock {
    let [miner, best, header] = block_ids(number);
    RawBlock {
        number,
        miner_difficulty: results.get_str(&miner).map(str::to_string),
        best_difficulty: results.get_str(&best).map(str::to_string),
        header: results
            .get(&header)
            .and_then(|value| Header::decode(value, number)),
    }
}

/// Node client over any [`Transport`].
#[derive(Debug, Clone)]
pub struct NodeClient<T = RpcClient> {
    transport: T,
    max_items_per_post: usize,
}

impl<T: Transport> NodeClient<T> {
    pub fn new(transport: T, max_items_per_post: usize) -> Self {
        Self {
            transport,
            max_items_per_post: max_items_per_post.max(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Header of block `number`, or `None` if the node has none.
    pub async fn header_by_number(&self, number: u64) -> Result<Option<Header>> {
        let value = self
            .transport
            .call(METHOD_HEADER_BY_NUMBER, json!([to_hex(number)]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Header::deserialize(&value)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("malformed header for block {number}: {e}")))
    }

    /// Quote `qits` of Qi in Quai wei at the latest rate.
    ///
    /// A null or zero answer means the node has no rate and gives `None`.
    pub async fn qi_to_quai(&self, qits: u64) -> Result<Option<U256>> {
        let value = self
            .transport
            .call(METHOD_QI_TO_QUAI, json!([to_hex(qits), "latest"]))
            .await?;
        match &value {
            Value::Null => Ok(None),
            Value::String(hex) => parse_hex_quantity(hex)
                .map(|amount| (!amount.is_zero()).then_some(amount))
                .ok_or_else(|| Error::Protocol(format!("malformed quote {hex:?}"))),
            other => Err(Error::Protocol(format!("unexpected quote {other}"))),
        }
    }
}

#[async_trait]
impl<T: Transport> ChainSource for NodeClient<T> {
    async fn latest_block_number(&self) -> Result<u64> {
        let value = self.transport.call(METHOD_BLOCK_NUMBER, json!([])).await?;
        value
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| Error::Protocol(format!("malformed block number {value}")))
    }

    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<FetchedBlocks> {
        if numbers.is_empty() {
            return Ok(FetchedBlocks::default());
        }
        let requests = block_requests(numbers);
        debug!(blocks = numbers.len(), len = requests.len(), "Fetching blocks");

        let batch = send_adaptive(&self.transport, &requests, self.max_items_per_post).await?;
        if batch.results.is_empty() {
            if let Some(first) = batch.failed_slices.first() {
                return Err(Error::BatchFailed {
                    slices: batch.failed_slices.len(),
                    first: first.error.clone(),
                });
            }
        }

        Ok(FetchedBlocks {
            blocks: numbers
                .iter()
                .map(|&number| raw_block(number, &batch.results))
                .collect(),
            failed_slices: batch.failed_slices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory node answering difficulty and header calls per block.
    #[derive(Default)]
    struct FakeNode {
        latest: u64,
        miner: HashMap<u64, &'static str>,
        best: HashMap<u64, &'static str>,
        broken_posts: bool,
        /// Zero-based index of a single POST that times out
        failing_post: Option<usize>,
        posts: AtomicUsize,
    }

    impl FakeNode {
        fn with_blocks(range: std::ops::RangeInclusive<u64>) -> Self {
            let mut node = FakeNode::default();
            for n in range {
                node.miner.insert(n, "0x100");
                node.best.insert(n, "0x200");
                node.latest = n;
            }
            node
        }

        fn answer(&self, method: &str, params: &Value) -> Option<Value> {
            let block = params.get(0).and_then(Value::as_str).and_then(parse_hex_u64)?;
            match method {
                METHOD_MINER_DIFFICULTY => self.miner.get(&block).map(|d| json!(d)),
                METHOD_BEST_DIFFICULTY => self.best.get(&block).map(|d| json!(d)),
                METHOD_HEADER_BY_NUMBER => Some(json!({
                    "number": to_hex(block),
                    "exchangeRate": "0x3e8",
                    "woHeader": {"timestamp": to_hex(1_700_000_000 + block)},
                })),
                _ => None,
            }
        }
    }

    #[async_trait]
    impl Transport for FakeNode {
        async fn call(&self, method: &str, params: Value) -> Result<Value> {
            match method {
                METHOD_BLOCK_NUMBER => Ok(json!(to_hex(self.latest))),
                METHOD_QI_TO_QUAI => Ok(json!("0x6f05b59d3b20000")),
                _ => Ok(self.answer(method, &params).unwrap_or(Value::Null)),
            }
        }

        async fn call_batch(&self, requests: &[RpcRequest]) -> Result<BatchResult> {
            let post = self.posts.fetch_add(1, Ordering::SeqCst);
            if self.broken_posts || self.failing_post == Some(post) {
                return Err(Error::Timeout(Duration::from_secs(180)));
            }
            let mut results = BatchResult::new();
            for request in requests {
                results.insert(request.id.clone(), self.answer(&request.method, &request.params));
            }
            Ok(results)
        }
    }

    #[test]
    fn test_block_requests_layout() {
        let requests = block_requests(&[12]);
        let ids: Vec<String> = requests.iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["12_m", "12_b", "12_h"]);
        assert!(requests.iter().all(|r| r.params == json!(["0xc"])));
        assert_eq!(requests[2].method, METHOD_HEADER_BY_NUMBER);
    }

    #[test]
    fn test_header_timestamp_prefers_work_object() {
        let header: Header = serde_json::from_value(json!({
            "timestamp": "0x10",
            "woHeader": {"timestamp": "0x20", "difficulty": "0x1"},
        }))
        .unwrap();
        assert_eq!(header.timestamp(), Some(0x20));

        let header: Header = serde_json::from_value(json!({"timestamp": "0x10"})).unwrap();
        assert_eq!(header.timestamp(), Some(0x10));
        assert_eq!(Header::default().timestamp(), None);
    }

    #[test]
    fn test_header_passes_unknown_fields_through() {
        let raw = json!({
            "exchangeRate": "0x3e8",
            "parentHash": ["0xab"],
            "woHeader": {"timestamp": "0x20", "nonce": "0x1"},
        });
        let header: Header = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(header.exchange_rate.as_deref(), Some("0x3e8"));
        assert_eq!(serde_json::to_value(&header).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_latest_block_number() {
        let node = NodeClient::new(FakeNode::with_blocks(1..=0x1234), 100);
        assert_eq!(node.latest_block_number().await.unwrap(), 0x1234);
    }

    #[tokio::test]
    async fn test_fetch_blocks_decodes_every_block() {
        let node = NodeClient::new(FakeNode::with_blocks(100..=104), 2000);
        let fetched = node.fetch_blocks(&[100, 101, 102, 103, 104]).await.unwrap();

        assert!(fetched.failed_slices.is_empty());
        let numbers: Vec<u64> = fetched.blocks.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![100, 101, 102, 103, 104]);
        let block = &fetched.blocks[2];
        assert_eq!(block.miner_difficulty.as_deref(), Some("0x100"));
        assert_eq!(block.best_difficulty.as_deref(), Some("0x200"));
        let header = block.header.as_ref().unwrap();
        assert_eq!(header.timestamp(), Some(1_700_000_102));
        assert_eq!(header.exchange_rate.as_deref(), Some("0x3e8"));
    }

    #[tokio::test]
    async fn test_missing_difficulty_is_none() {
        let mut fake = FakeNode::with_blocks(100..=104);
        fake.miner.remove(&102);
        let node = NodeClient::new(fake, 2000);

        let fetched = node.fetch_blocks(&[100, 101, 102, 103, 104]).await.unwrap();
        assert_eq!(fetched.blocks[2].miner_difficulty, None);
        assert_eq!(fetched.blocks[2].best_difficulty.as_deref(), Some("0x200"));
        assert_eq!(fetched.blocks[3].miner_difficulty.as_deref(), Some("0x100"));
    }

    #[tokio::test]
    async fn test_every_slice_failing_is_an_error() {
        let mut fake = FakeNode::with_blocks(1..=10);
        fake.broken_posts = true;
        // 30 requests at 4 per POST goes straight to bounded slicing
        let node = NodeClient::new(fake, 4);

        let err = node.fetch_blocks(&(1..=10).collect::<Vec<_>>()).await.unwrap_err();
        assert!(matches!(err, Error::BatchFailed { slices: 8, .. }), "{err}");
        assert_eq!(node.transport().posts.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_failed_slice_reports_lost_blocks() {
        let mut fake = FakeNode::with_blocks(1..=10);
        // Second POST carries requests 4..8: 2_b, 2_h, 3_m, 3_b
        fake.failing_post = Some(1);
        let node = NodeClient::new(fake, 4);

        let fetched = node.fetch_blocks(&(1..=10).collect::<Vec<_>>()).await.unwrap();
        assert!(!fetched.is_complete());
        assert_eq!(fetched.failed_slices.len(), 1);
        assert_eq!(fetched.failed_slices[0].offset, 4);
        assert_eq!(fetched.lost_blocks(), vec![2, 3]);

        assert_eq!(fetched.blocks.len(), 10);
        assert_eq!(fetched.blocks[1].miner_difficulty.as_deref(), Some("0x100"));
        assert_eq!(fetched.blocks[1].best_difficulty, None);
        assert_eq!(fetched.blocks[2].miner_difficulty, None);
        assert!(fetched.blocks[2].header.is_some());
    }

    #[test]
    fn test_lost_blocks_clamps_to_fetched() {
        let fetched = FetchedBlocks {
            blocks: vec![RawBlock {
                number: 7,
                ..RawBlock::default()
            }],
            failed_slices: vec![
                FailedSlice {
                    offset: 0,
                    len: 3,
                    error: "timed out".into(),
                },
                FailedSlice {
                    offset: 30,
                    len: 3,
                    error: "timed out".into(),
                },
            ],
        };
        assert_eq!(fetched.lost_blocks(), vec![7]);
        assert!(FetchedBlocks::default().lost_blocks().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_nothing() {
        let node = NodeClient::new(FakeNode::default(), 10);
        assert_eq!(node.fetch_blocks(&[]).await.unwrap(), FetchedBlocks::default());
        assert_eq!(node.transport().posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_qi_to_quai_quote() {
        let node = NodeClient::new(FakeNode::default(), 10);
        let wei = node.qi_to_quai(1000).await.unwrap().unwrap();
        assert_eq!(wei, U256::from(500_000_000_000_000_000u64));
    }

    #[tokio::test]
    async fn test_header_by_number() {
        let node = NodeClient::new(FakeNode::with_blocks(5..=5), 10);
        let header = node.header_by_number(5).await.unwrap().unwrap();
        assert_eq!(header.timestamp(), Some(1_700_000_005));
    }
}
