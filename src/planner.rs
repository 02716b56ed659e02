//! Splits block ranges and call lists into chunks that fit one provider request.

use std::{ops::Range, time::Duration};

use url::Url;

use crate::{
    error::{IngestError, IngestResult},
    types::{BlockRange, EncodedCall},
};

pub const DEFAULT_MAX_BLOCK_SPAN: u64 = 10_000;
pub const DEFAULT_MAX_CALLS_PER_REQUEST: usize = 40;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_PREALLOCATED_CHUNKS: usize = 4_096;

/// Per-request caps of one RPC provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLimits {
    /// widest `eth_getLogs` block span the provider accepts
    pub max_block_span: u64,
    /// calls per aggregate-read request before the gas simulation cap bites
    pub max_calls_per_request: usize,
    pub request_timeout: Duration,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_block_span: DEFAULT_MAX_BLOCK_SPAN,
            max_calls_per_request: DEFAULT_MAX_CALLS_PER_REQUEST,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// host substring, max log block span, max calls per aggregate request
const PROVIDER_PROFILES: &[(&str, u64, usize)] = &[
    ("alchemy", 2_000, 40),
    ("infura", 10_000, 40),
    ("quiknode", 10_000, 40),
    ("ankr", 3_000, 30),
    ("llamarpc", 1_000, 20),
    ("drpc", 10_000, 40),
    ("blastapi", 5_000, 40),
    ("1rpc", 1_000, 20),
    ("base.org", 2_000, 30),
    ("binance", 5_000, 30),
    ("publicnode", 5_000, 30),
    ("localhost", 100_000, 200),
    ("127.0.0.1", 100_000, 200),
];

impl ProviderLimits {
    /// Looks up the provider by a recognizable piece of the endpoint host,
    /// falling back to the conservative defaults.
    pub fn for_endpoint(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_lowercase();

        PROVIDER_PROFILES
            .iter()
            .find(|(needle, _, _)| host.contains(needle))
            .map(|&(_, max_block_span, max_calls_per_request)| Self {
                max_block_span,
                max_calls_per_request,
                ..Default::default()
            })
            .unwrap_or_default()
    }

    pub fn with_max_block_span(mut self, span: u64) -> Self {
        self.max_block_span = span;
        self
    }

    pub fn with_max_calls_per_request(mut self, calls: usize) -> Self {
        self.max_calls_per_request = calls;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Contiguous block sub-range sent as one log query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChunk {
    pub index: usize,
    pub range: BlockRange,
}

/// Contiguous slice of a call list sent as one aggregate-read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallChunk {
    pub index: usize,
    pub calls: Range<usize>,
}

impl CallChunk {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Tiles `range` with chunks of at most `max_span` blocks; only the last one
/// may be shorter.
pub fn plan_blocks(range: BlockRange, max_span: u64) -> IngestResult<Vec<BlockChunk>> {
    if max_span == 0 {
        return Err(IngestError::config("block span limit must be positive"));
    }

    // the chunk count of a huge range can exceed the address space
    let count = usize::try_from(range.len().div_ceil(max_span)).unwrap_or(usize::MAX);
    let mut chunks = Vec::with_capacity(count.min(MAX_PREALLOCATED_CHUNKS));
    let mut start = range.start();
    loop {
        let end = start.saturating_add(max_span - 1).min(range.end());
        chunks.push(BlockChunk {
            index: chunks.len(),
            range: BlockRange::new(start, end)?,
        });
        if end == range.end() {
            break;
        }
        start = end + 1;
    }

    Ok(chunks)
}

/// Groups `calls` into the fewest aggregate requests of at most
/// `max_per_request` calls each, preserving order.
pub fn plan_calls(calls: &[EncodedCall], max_per_request: usize) -> IngestResult<Vec<CallChunk>> {
    plan_call_count(calls.len(), max_per_request)
}

pub(crate) fn plan_call_count(
    count: usize,
    max_per_request: usize,
) -> IngestResult<Vec<CallChunk>> {
    if max_per_request == 0 {
        return Err(IngestError::config("calls per request must be positive"));
    }

    Ok((0..count)
        .step_by(max_per_request)
        .enumerate()
        .map(|(index, start)| CallChunk {
            index,
            calls: start..(start + max_per_request).min(count),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(range: BlockRange, limit: u64) {
        let chunks = plan_blocks(range, limit).unwrap();
        let mut next = range.start();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.range.start(), next, "gap or overlap at chunk {i}");
            assert!(chunk.range.len() <= limit);
            next = chunk.range.end() + 1;
        }
        assert_eq!(next, range.end() + 1);
        assert!(chunks[..chunks.len() - 1]
            .iter()
            .all(|c| c.range.len() == limit));
    }

    #[test]
    fn test_block_chunks_tile_range() {
        for (start, end) in [(0, 0), (100, 200), (1, 10_000), (5, 25_003), (7, 8)] {
            for limit in [1, 3, 100, 2_000, 10_000, 50_000] {
                assert_tiles(BlockRange::new(start, end).unwrap(), limit);
            }
        }
    }

    #[test]
    fn test_block_chunks_near_u64_max() {
        let range = BlockRange::new(u64::MAX - 5, u64::MAX).unwrap();
        assert_tiles(range, 4);
    }

    #[test]
    fn test_more_chunks_than_preallocated() {
        let range = BlockRange::new(0, MAX_PREALLOCATED_CHUNKS as u64 * 2).unwrap();
        let chunks = plan_blocks(range, 1).unwrap();
        assert_eq!(chunks.len(), MAX_PREALLOCATED_CHUNKS * 2 + 1);
        assert_tiles(range, 1);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let range = BlockRange::new(1, 2).unwrap();
        assert!(matches!(
            plan_blocks(range, 0),
            Err(IngestError::Configuration(_))
        ));
        assert!(matches!(
            plan_call_count(3, 0),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn test_call_chunks() {
        let chunks = plan_call_count(95, 40).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].calls, 0..40);
        assert_eq!(chunks[2].calls, 80..95);
        assert!(plan_call_count(0, 40).unwrap().is_empty());
    }

    #[test]
    fn test_limits_by_host() {
        let url = Url::parse("https://mainnet.infura.io/v3/abc").unwrap();
        assert_eq!(ProviderLimits::for_endpoint(&url).max_block_span, 10_000);

        let url = Url::parse("https://rpc.example.org").unwrap();
        assert_eq!(ProviderLimits::for_endpoint(&url), ProviderLimits::default());

        let url = Url::parse("https://eth.llamarpc.com").unwrap();
        let limits = ProviderLimits::for_endpoint(&url).with_max_block_span(500);
        assert_eq!(limits.max_block_span, 500);
        assert_eq!(limits.max_calls_per_request, 20);
    }
}
