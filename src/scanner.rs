//! Chunked, concurrent `eth_getLogs` scanning with ordered output.

use std::sync::Arc;

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{IngestError, IngestResult, TransportError},
    handler::{self, Ordered},
    node::{ConnectionProvider, LogFilter, NodeConnection, RawLog},
    planner::{plan_blocks, BlockChunk},
    retry::RetryPolicy,
    types::{BlockRange, BlockTag},
};

/// chunks buffered between the collector and a slow consumer
const CHUNK_BUFFER: usize = 16;

/// Which logs to fetch, independent of the block range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// empty means any emitter
    pub addresses: Vec<Address>,
    pub topics0: Vec<B256>,
}

impl EventFilter {
    pub fn new(topics0: Vec<B256>) -> Self {
        Self {
            addresses: Vec::new(),
            topics0,
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn for_range(&self, range: BlockRange) -> LogFilter {
        LogFilter {
            range,
            addresses: self.addresses.clone(),
            topics0: self.topics0.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub worker_count: usize,
    /// overrides the provider's block span limit
    pub max_block_span: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_block_span: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ScanOptions {
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_max_block_span(mut self, span: u64) -> Self {
        self.max_block_span = Some(span);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// All logs of one planned chunk, sorted by `(block_number, log_index)`, each
/// carrying its block timestamp.
#[derive(Debug, Clone)]
pub struct ChunkLogs {
    pub chunk: BlockChunk,
    pub logs: Vec<RawLog>,
}

#[derive(Debug)]
struct ChunkError {
    failed: BlockRange,
    source: TransportError,
}

/// Block number to timestamp, shared by every worker of one scan.
type TimestampMemo = Arc<DashMap<u64, u64>>;

/// Scans `range` and yields one [`ChunkLogs`] per planned chunk in ascending
/// block order.
///
/// The stream either covers the whole range or ends with a single error
/// (`ScanFailure` or `Cancelled`) naming the first block that was not
/// delivered; nothing after that block is yielded.
pub fn scan_chunks(
    provider: &dyn ConnectionProvider,
    filter: &EventFilter,
    range: BlockRange,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> IngestResult<impl Stream<Item = IngestResult<ChunkLogs>>> {
    let span = options
        .max_block_span
        .unwrap_or_else(|| provider.limits().max_block_span);
    let chunks = plan_blocks(range, span)?;

    info!(
        target: "vault_ingest::scanner",
        %range,
        chunks = chunks.len(),
        span,
        workers = options.worker_count,
        "scanning logs"
    );

    let filter = Arc::new(filter.clone());
    let retry = options.retry.clone();
    let memo: TimestampMemo = Arc::new(DashMap::new());

    let pool = handler::spawn(
        provider,
        chunks.clone(),
        options.worker_count,
        cancel,
        move |conn, chunk| {
            fetch_chunk(conn, filter.clone(), chunk, retry.clone(), memo.clone())
        },
    )?;

    let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
    tokio::spawn(collect(pool.ordered(), chunks, range, tx));

    Ok(ReceiverStream::new(rx))
}

/// Like [`scan_chunks`], flattened to individual logs.
pub fn scan(
    provider: &dyn ConnectionProvider,
    filter: &EventFilter,
    range: BlockRange,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> IngestResult<impl Stream<Item = IngestResult<RawLog>>> {
    Ok(scan_chunks(provider, filter, range, options, cancel)?
        .map(|chunk| {
            stream::iter(match chunk {
                Ok(chunk) => chunk.logs.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            })
        })
        .flatten())
}

/// Single owner of the ordered results: forwards complete chunks until the
/// first gap, then stops the pool, lets in-flight chunks drain and reports
/// what was not scanned.
async fn collect(
    mut ordered: Ordered<Result<ChunkLogs, ChunkError>>,
    chunks: Vec<BlockChunk>,
    range: BlockRange,
    tx: mpsc::Sender<IngestResult<ChunkLogs>>,
) {
    let mut first_gap: Option<usize> = None;
    let mut failed = Vec::new();

    while let Some((index, result)) = ordered.next().await {
        match (result, first_gap) {
            (Some(Ok(chunk)), None) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!(target: "vault_ingest::scanner", "consumer dropped, stopping scan");
                    ordered.cancel();
                    first_gap = Some(index);
                }
            }
            // past the first gap, later chunks are dropped
            (Some(Ok(_)), Some(_)) => {}
            (Some(Err(e)), _) => {
                error!(
                    target: "vault_ingest::scanner",
                    failed = %e.failed,
                    "chunk {index} failed: {}", e.source
                );
                failed.push(e.failed);
                first_gap.get_or_insert(index);
                ordered.cancel();
            }
            (None, _) => {
                first_gap.get_or_insert(index);
            }
        }
    }

    let Some(gap) = first_gap else { return };
    let unscanned = match BlockRange::new(chunks[gap].range.start(), range.end()) {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
    };

    let err = if failed.is_empty() {
        IngestError::Cancelled {
            unscanned: Some(unscanned),
            checkpoint: None,
        }
    } else {
        IngestError::ScanFailure {
            failed,
            unscanned,
            checkpoint: None,
        }
    };
    let _ = tx.send(Err(err)).await;
}

async fn fetch_chunk(
    conn: Arc<dyn NodeConnection>,
    filter: Arc<EventFilter>,
    chunk: BlockChunk,
    retry: RetryPolicy,
    memo: TimestampMemo,
) -> Result<ChunkLogs, ChunkError> {
    let mut logs = Vec::new();
    // stack of sub-ranges still to fetch, lowest on top
    let mut pending = vec![chunk.range];

    while let Some(range) = pending.pop() {
        let query = filter.for_range(range);
        match retry.execute("eth_getLogs", || conn.get_logs(&query)).await {
            Ok(mut found) => logs.append(&mut found),
            Err(TransportError::RangeTooLarge(msg)) => match range.bisect() {
                Some((low, high)) => {
                    debug!(
                        target: "vault_ingest::scanner",
                        %range,
                        "provider refused range ({msg}), splitting"
                    );
                    pending.push(high);
                    pending.push(low);
                }
                None => {
                    return Err(ChunkError {
                        failed: range,
                        source: TransportError::RangeTooLarge(msg),
                    });
                }
            },
            Err(source) => {
                return Err(ChunkError {
                    failed: range,
                    source,
                });
            }
        }
    }

    logs.sort_by_key(|log| (log.block_number, log.log_index));

    if let Err(source) = stamp_timestamps(conn.as_ref(), &mut logs, &memo, &retry).await {
        return Err(ChunkError {
            failed: chunk.range,
            source,
        });
    }

    Ok(ChunkLogs { chunk, logs })
}

/// Fills `block_timestamp` on every log, looking up each distinct block at
/// most once per scan.
async fn stamp_timestamps(
    conn: &dyn NodeConnection,
    logs: &mut [RawLog],
    memo: &DashMap<u64, u64>,
    retry: &RetryPolicy,
) -> Result<(), TransportError> {
    for log in logs.iter() {
        if let Some(ts) = log.block_timestamp {
            memo.entry(log.block_number).or_insert(ts);
        }
    }

    for log in logs.iter_mut() {
        if log.block_timestamp.is_some() {
            continue;
        }
        let known = memo.get(&log.block_number).map(|ts| *ts);
        let ts = match known {
            Some(ts) => ts,
            None => {
                let tag = BlockTag::Number(log.block_number);
                let header = retry
                    .execute("eth_getBlockByNumber", || conn.get_block(tag))
                    .await?;
                memo.insert(log.block_number, header.timestamp);
                header.timestamp
            }
        };
        log.block_timestamp = Some(ts);
    }

    Ok(())
}
