//! Batch call executor: packs independent read calls into Multicall3
//! `aggregate3` requests and runs them across the worker pool.

use std::sync::Arc;

use alloy_primitives::Bytes;
use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{IngestResult, TransportError},
    handler,
    node::{AggregateOutcome, ConnectionProvider, NodeConnection},
    planner::plan_call_count,
    retry::RetryPolicy,
    types::{BlockTag, CallFailure, CallFailureReason, CallResult, EncodedCall},
};

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub worker_count: usize,
    /// overrides the provider's calls-per-request limit
    pub max_calls_per_request: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_calls_per_request: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl CallOptions {
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_max_calls_per_request(mut self, calls: usize) -> Self {
        self.max_calls_per_request = Some(calls);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

type RawOutcome = Result<AggregateOutcome, CallFailureReason>;

/// Executes `calls` at `block` and returns exactly one [`CallResult`] per
/// call, in input order.
///
/// Only configuration problems fail the whole call. Reverts, empty or
/// malformed returns, exhausted transport retries and cancellation are all
/// recorded on the affected results.
pub async fn execute(
    provider: &dyn ConnectionProvider,
    calls: &[EncodedCall],
    block: BlockTag,
    options: &CallOptions,
    cancel: &CancellationToken,
) -> IngestResult<Vec<CallResult>> {
    // identical calls are sent once; `slots[i]` is the unique index of calls[i]
    let mut unique: IndexSet<&EncodedCall> = IndexSet::with_capacity(calls.len());
    let slots: Vec<usize> = calls
        .iter()
        .map(|call| unique.insert_full(call).0)
        .collect();

    let max_calls = options
        .max_calls_per_request
        .unwrap_or_else(|| provider.limits().max_calls_per_request);
    let chunks = plan_call_count(unique.len(), max_calls)?;

    debug!(
        target: "vault_ingest::multicall",
        calls = calls.len(),
        unique = unique.len(),
        requests = chunks.len(),
        %block,
        "executing batch"
    );

    let jobs: Vec<Vec<EncodedCall>> = chunks
        .iter()
        .map(|chunk| {
            chunk
                .calls
                .clone()
                .filter_map(|i| unique.get_index(i).map(|c| (*c).clone()))
                .collect()
        })
        .collect();

    let retry = options.retry.clone();
    let pool = handler::spawn(provider, jobs, options.worker_count, cancel, move |conn, job| {
        run_chunk(conn, job, block, retry.clone())
    })?;

    let mut outcomes: Vec<RawOutcome> = Vec::with_capacity(unique.len());
    for (chunk, result) in chunks.iter().zip(pool.collect_indexed().await) {
        match result {
            Some(results) => outcomes.extend(results),
            None => outcomes.extend(chunk.calls.clone().map(|_| Err(CallFailureReason::Cancelled))),
        }
    }

    let results: Vec<CallResult> = calls
        .iter()
        .zip(slots)
        .map(|(call, slot)| {
            let outcome = match outcomes.get(slot) {
                Some(Ok(raw)) => settle(call, raw),
                Some(Err(reason)) => Err(reason.clone()),
                None => Err(CallFailureReason::Cancelled),
            };
            CallResult {
                call: call.clone(),
                outcome: outcome.map_err(|reason| CallFailure::new(call, reason)),
            }
        })
        .collect();

    let failed = results.iter().filter(|r| !r.success()).count();
    if failed > 0 {
        debug!(target: "vault_ingest::multicall", failed, total = results.len(), "batch finished with failed calls");
    }

    Ok(results)
}

/// Applies the caller's expectations to one `(success, returnData)` pair.
fn settle(call: &EncodedCall, raw: &AggregateOutcome) -> Result<Bytes, CallFailureReason> {
    if !raw.success {
        return Err(CallFailureReason::Reverted(raw.data.clone()));
    }
    if raw.data.is_empty() {
        return Err(CallFailureReason::EmptyReturn);
    }
    call.shape
        .validate(&raw.data)
        .map_err(CallFailureReason::DecodeMismatch)?;

    Ok(raw.data.clone())
}

/// Sends one chunk, splitting it whenever the aggregate request itself
/// reverts or hits the node's gas cap. Always yields one outcome per call.
async fn run_chunk(
    conn: Arc<dyn NodeConnection>,
    calls: Vec<EncodedCall>,
    block: BlockTag,
    retry: RetryPolicy,
) -> Vec<RawOutcome> {
    let mut outcomes: Vec<Option<RawOutcome>> = vec![None; calls.len()];
    // (offset, len) segments still to send, lowest on top
    let mut pending = vec![(0, calls.len())];

    while let Some((offset, len)) = pending.pop() {
        let segment = &calls[offset..offset + len];
        let sent = retry
            .execute("aggregate3", || conn.aggregate_call(segment, block))
            .await;

        match sent {
            Ok(results) => {
                for (slot, result) in outcomes[offset..offset + len].iter_mut().zip(results) {
                    *slot = Some(Ok(result));
                }
            }
            Err(e @ (TransportError::Reverted(_) | TransportError::CallTooHeavy(_))) if len > 1 => {
                let half = len / 2;
                debug!(
                    target: "vault_ingest::multicall",
                    len,
                    "aggregate request refused ({e}), splitting"
                );
                pending.push((offset + half, len - half));
                pending.push((offset, half));
            }
            Err(TransportError::Reverted(data)) => {
                outcomes[offset] = Some(Err(CallFailureReason::Reverted(data)));
            }
            // one call that alone exceeds the cap fails like a revert
            Err(TransportError::CallTooHeavy(_)) => {
                outcomes[offset] = Some(Err(CallFailureReason::Reverted(Bytes::new())));
            }
            Err(e) => {
                warn!(
                    target: "vault_ingest::multicall",
                    calls = len,
                    %block,
                    "aggregate request failed: {e}"
                );
                let reason = CallFailureReason::Transport(e.to_string());
                for slot in &mut outcomes[offset..offset + len] {
                    *slot = Some(Err(reason.clone()));
                }
            }
        }
    }

    let unanswered = outcomes.iter().filter(|o| o.is_none()).count();
    if unanswered > 0 {
        info!(target: "vault_ingest::multicall", unanswered, "aggregate response shorter than request");
    }

    outcomes
        .into_iter()
        .map(|o| {
            o.unwrap_or_else(|| Err(CallFailureReason::Transport("no result returned".into())))
        })
        .collect()
}
