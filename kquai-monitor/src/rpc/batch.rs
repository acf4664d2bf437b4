//! Splitting large batches into bounded POSTs.
//!
//! Nodes cap the payload and run time of a single request, so logical
//! batches of several thousand calls go out as a sequence of smaller POSTs.
//! Slices are sent one after another, never concurrently. A slice that fails
//! at the transport level is skipped and recorded; the ids it carried are
//! simply absent from the merged result.

use super::{BatchResult, RpcRequest, Transport};
use crate::error::Result;
use crate::tracing::prelude::*;

/// A slice of a split batch that failed as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSlice {
    /// Index of the slice's first request in the full list
    pub offset: usize,
    pub len: usize,
    pub error: String,
}

/// Merged results of a split batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundedBatch {
    pub results: BatchResult,
    pub failed_slices: Vec<FailedSlice>,
}

impl BoundedBatch {
    fn single(results: BatchResult) -> Self {
        Self {
            results,
            failed_slices: Vec::new(),
        }
    }

    /// True when no slice failed. Individual items may still be null.
    pub fn is_complete(&self) -> bool {
        self.failed_slices.is_empty()
    }
}

/// Send `requests` in POSTs of at most `max_items_per_post` items.
///
/// A batch that fits in one POST is sent as is and its error propagates.
/// Larger batches are sliced and failing slices are absorbed into
/// [`BoundedBatch::failed_slices`].
pub async fn send_bounded<T>(
    transport: &T,
    requests: &[RpcRequest],
    max_items_per_post: usize,
) -> Result<BoundedBatch>
where
    T: Transport + ?Sized,
{
    if requests.is_empty() {
        return Ok(BoundedBatch::default());
    }
    let max = max_items_per_post.max(1);
    if requests.len() <= max {
        return Ok(BoundedBatch::single(transport.call_batch(requests).await?));
    }

    let mut merged = BoundedBatch::default();
    for (index, slice) in requests.chunks(max).enumerate() {
        let offset = index * max;
        match transport.call_batch(slice).await {
            Ok(results) => merged.results.merge(results),
            Err(e) => {
                warn!(offset, len = slice.len(), error = %e, "Batch slice failed, skipping");
                merged.failed_slices.push(FailedSlice {
                    offset,
                    len: slice.len(),
                    error: e.to_string(),
                });
            }
        }
    }

    if !merged.is_complete() {
        warn!(
            failed = merged.failed_slices.len(),
            total = requests.len().div_ceil(max),
            "Batch completed with failed slices"
        );
    }
    Ok(merged)
}

/// Send `requests`, preferring two halves for moderately oversized batches.
///
/// Up to twice the limit, the batch is first tried as two sequential POSTs
/// (the first half takes the odd item). If either half fails the whole list
/// goes through [`send_bounded`] instead.
pub async fn send_adaptive<T>(
    transport: &T,
    requests: &[RpcRequest],
    max_items_per_post: usize,
) -> Result<BoundedBatch>
where
    T: Transport + ?Sized,
{
    let max = max_items_per_post.max(1);
    if requests.len() <= max || requests.len() > max.saturating_mul(2) {
        return send_bounded(transport, requests, max).await;
    }

    let (first, second) = requests.split_at(requests.len().div_ceil(2));
    match send_halves(transport, first, second).await {
        Ok(results) => Ok(BoundedBatch::single(results)),
        Err(e) => {
            debug!(len = requests.len(), error = %e, "Halved batch failed, falling back to slices");
            send_bounded(transport, requests, max).await
        }
    }
}

async fn send_halves<T>(
    transport: &T,
    first: &[RpcRequest],
    second: &[RpcRequest],
) -> Result<BatchResult>
where
    T: Transport + ?Sized,
{
    let mut results = transport.call_batch(first).await?;
    results.merge(transport.call_batch(second).await?);
    Ok(results)
}
