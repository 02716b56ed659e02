use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy_primitives::{Address, Bytes, B256, U64};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;
use url::Url;

use crate::{
    contracts::{IMulticall3, MULTICALL3_ADDRESS},
    error::{IngestError, IngestResult, TransportError},
    planner::ProviderLimits,
    types::{BlockRange, BlockTag, EncodedCall},
};

/// `eth_getLogs` query: one block range, optional emitter addresses, and a set
/// of accepted first topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub range: BlockRange,
    pub addresses: Vec<Address>,
    pub topics0: Vec<B256>,
}

impl LogFilter {
    pub fn with_range(&self, range: BlockRange) -> Self {
        Self {
            range,
            addresses: self.addresses.clone(),
            topics0: self.topics0.clone(),
        }
    }
}

/// A log as returned by the node, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<B256>,
    /// filled in by nodes that support it, otherwise resolved by the scanner
    pub block_timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
}

/// One `(success, returnData)` pair from an aggregate-read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateOutcome {
    pub success: bool,
    pub data: Bytes,
}

/// A node connection owned by exactly one worker.
#[async_trait]
pub trait NodeConnection: Send + Sync {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, TransportError>;

    async fn call(&self, to: Address, data: Bytes, block: BlockTag)
        -> Result<Bytes, TransportError>;

    async fn get_block(&self, block: BlockTag) -> Result<BlockHeader, TransportError>;

    fn multicall_address(&self) -> Address {
        MULTICALL3_ADDRESS
    }

    /// Bundles `calls` into one Multicall3 `aggregate3` request with every call
    /// allowed to fail on its own.
    async fn aggregate_call(
        &self,
        calls: &[EncodedCall],
        block: BlockTag,
    ) -> Result<Vec<AggregateOutcome>, TransportError> {
        let request = IMulticall3::aggregate3Call {
            calls: calls
                .iter()
                .map(|call| IMulticall3::Call3 {
                    target: call.target,
                    allowFailure: true,
                    callData: call.calldata(),
                })
                .collect(),
        };

        let raw = self
            .call(self.multicall_address(), request.abi_encode().into(), block)
            .await?;

        let decoded = IMulticall3::aggregate3Call::abi_decode_returns(&raw, false)
            .map_err(|e| TransportError::Decode(format!("aggregate3 return: {e}")))?;

        if decoded.returnData.len() != calls.len() {
            return Err(TransportError::Decode(format!(
                "aggregate3 returned {} results for {} calls",
                decoded.returnData.len(),
                calls.len()
            )));
        }

        Ok(decoded
            .returnData
            .into_iter()
            .map(|r| AggregateOutcome {
                success: r.success,
                data: r.returnData,
            })
            .collect())
    }
}

/// Hands out independent connections, one per worker.
pub trait ConnectionProvider: Send + Sync {
    fn new_connection(&self) -> IngestResult<Arc<dyn NodeConnection>>;

    fn limits(&self) -> ProviderLimits;
}

/// Plain JSON-RPC over HTTP.
pub struct HttpNode {
    client: reqwest::Client,
    url: Url,
    multicall: Address,
    ids: AtomicU64,
}

impl HttpNode {
    pub fn new(url: Url, timeout: Duration, multicall: Address) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::config(format!("http client for {url}: {e}")))?;

        Ok(Self {
            client,
            url,
            multicall,
            ids: AtomicU64::new(1),
        })
    }

    pub async fn chain_id(&self) -> Result<u64, TransportError> {
        let id: U64 = self.request("eth_chainId", json!([])).await?;
        Ok(id.to())
    }

    pub async fn block_number(&self) -> Result<u64, TransportError> {
        let number: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(number.to())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, TransportError> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        trace!(target: "vault_ingest::node", %method, id, "sending request");

        let resp = self.client.post(self.url.clone()).json(&payload).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(if status.as_u16() == 429 {
                TransportError::RateLimited
            } else if status.as_u16() == 413 {
                TransportError::CallTooHeavy(format!("{method}: http 413"))
            } else {
                TransportError::Http {
                    status: status.as_u16(),
                }
            });
        }

        let body: RpcResponse = resp.json().await?;
        if let Some(err) = body.error {
            let data = err
                .data
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Bytes>().ok());
            return Err(TransportError::from_rpc(err.code, err.message, data));
        }

        serde_json::from_value(body.result)
            .map_err(|e| TransportError::Decode(format!("{method}: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<U64>,
    log_index: Option<U64>,
    transaction_hash: Option<B256>,
    block_timestamp: Option<U64>,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
struct WireBlock {
    number: U64,
    timestamp: U64,
}

/// Empty topic or address lists are left out rather than sent as `[]`.
fn log_params(filter: &LogFilter) -> Value {
    let mut params = json!({
        "fromBlock": BlockTag::Number(filter.range.start()).to_rpc(),
        "toBlock": BlockTag::Number(filter.range.end()).to_rpc(),
    });
    if !filter.topics0.is_empty() {
        params["topics"] = json!([filter.topics0]);
    }
    if !filter.addresses.is_empty() {
        params["address"] = json!(filter.addresses);
    }
    params
}

#[async_trait]
impl NodeConnection for HttpNode {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, TransportError> {
        let logs: Vec<WireLog> = self
            .request("eth_getLogs", json!([log_params(filter)]))
            .await?;

        logs.into_iter()
            .filter(|log| !log.removed)
            .map(|log| {
                let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index)
                else {
                    return Err(TransportError::Decode("pending log in range query".into()));
                };
                Ok(RawLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                    block_number: block_number.to(),
                    log_index: log_index.to(),
                    transaction_hash: log.transaction_hash,
                    block_timestamp: log.block_timestamp.map(|t| t.to()),
                })
            })
            .collect()
    }

    async fn call(
        &self,
        to: Address,
        data: Bytes,
        block: BlockTag,
    ) -> Result<Bytes, TransportError> {
        self.request(
            "eth_call",
            json!([{ "to": to, "data": data }, block.to_rpc()]),
        )
        .await
    }

    async fn get_block(&self, block: BlockTag) -> Result<BlockHeader, TransportError> {
        let header: Option<WireBlock> = self
            .request("eth_getBlockByNumber", json!([block.to_rpc(), false]))
            .await?;

        let header = header.ok_or_else(|| TransportError::Rpc {
            code: -32000,
            message: format!("header not found for block {block}"),
        })?;

        Ok(BlockHeader {
            number: header.number.to(),
            timestamp: header.timestamp.to(),
        })
    }

    fn multicall_address(&self) -> Address {
        self.multicall
    }
}

/// Builds a fresh [`HttpNode`] (and its own HTTP connection pool) per worker.
#[derive(Debug, Clone)]
pub struct HttpConnectionProvider {
    url: Url,
    limits: ProviderLimits,
    multicall: Address,
}

impl HttpConnectionProvider {
    pub fn new(url: &str) -> IngestResult<Self> {
        let url = Url::parse(url).map_err(|e| IngestError::config(format!("bad rpc url: {e}")))?;
        let limits = ProviderLimits::for_endpoint(&url);
        Ok(Self {
            url,
            limits,
            multicall: MULTICALL3_ADDRESS,
        })
    }

    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_multicall(mut self, multicall: Address) -> Self {
        self.multicall = multicall;
        self
    }

    pub fn connect(&self) -> IngestResult<HttpNode> {
        HttpNode::new(self.url.clone(), self.limits.request_timeout, self.multicall)
    }
}

impl ConnectionProvider for HttpConnectionProvider {
    fn new_connection(&self) -> IngestResult<Arc<dyn NodeConnection>> {
        Ok(Arc::new(self.connect()?))
    }

    fn limits(&self) -> ProviderLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_log_parses_hex_quantities() {
        let raw = json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": ["0xdcbc1c05240f31ff3ad067ef1ee35ce4997762752e3a095284754544f4c709d7"],
            "data": "0x",
            "blockNumber": "0x64",
            "logIndex": "0x2",
            "transactionHash": null,
            "removed": false
        });
        let log: WireLog = serde_json::from_value(raw).unwrap();
        assert_eq!(log.block_number.unwrap().to::<u64>(), 100);
        assert_eq!(log.log_index.unwrap().to::<u64>(), 2);
        assert!(log.block_timestamp.is_none());
    }

    #[test]
    fn test_rpc_error_response_parses() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": 3, "message": "execution reverted", "data": "0x08c379a0" }
        });
        let resp: RpcResponse = serde_json::from_value(raw).unwrap();
        assert!(resp.result.is_null());
        let err = resp.error.unwrap();
        assert_eq!(err.code, 3);
    }

    #[test]
    fn test_log_params_omit_empty_filters() {
        let mut filter = LogFilter {
            range: BlockRange::new(16, 31).unwrap(),
            addresses: vec![],
            topics0: vec![],
        };
        let params = log_params(&filter);
        assert_eq!(params, json!({ "fromBlock": "0x10", "toBlock": "0x1f" }));

        filter.topics0 = vec![B256::repeat_byte(0xab)];
        filter.addresses = vec![Address::repeat_byte(0x11)];
        let params = log_params(&filter);
        assert_eq!(params["topics"], json!([[B256::repeat_byte(0xab)]]));
        assert_eq!(params["address"], json!([Address::repeat_byte(0x11)]));
    }

    #[test]
    fn test_provider_picks_limits_from_host() {
        let provider = HttpConnectionProvider::new("https://eth-mainnet.g.alchemy.com/v2/key")
            .unwrap();
        assert_eq!(provider.limits().max_block_span, 2_000);
        assert!(HttpConnectionProvider::new("not a url").is_err());
    }
}
