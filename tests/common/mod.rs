#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use alloy_primitives::{Address, Bytes, Selector, B256, U256};
use alloy_sol_types::{SolCall, SolEvent, SolValue};
use async_trait::async_trait;
use vault_ingest::{
    contracts::{IMulticall3, IERC4626, MULTICALL3_ADDRESS},
    error::{IngestResult, TransportError},
    node::{BlockHeader, ConnectionProvider, LogFilter, NodeConnection, RawLog},
    planner::ProviderLimits,
    types::BlockTag,
};

pub const TIP: u64 = 1_000;
pub const CHAIN_ID: u64 = 1;

/// Answers one call at one block from its argument bytes; `None` reverts.
pub type Handler = Arc<dyn Fn(u64, &[u8]) -> Option<Bytes> + Send + Sync>;

/// In-memory chain: a fixed log set, `12 * n` timestamps and scripted view
/// functions reached either directly or through Multicall3.
#[derive(Default)]
pub struct MockNode {
    logs: Vec<RawLog>,
    handlers: HashMap<(Address, Selector), Handler>,
    /// aggregates with more sub-calls than this run out of gas
    gas_cap: Option<usize>,
    /// requests answered with a timeout before the node starts behaving
    timeouts_left: AtomicUsize,
    pub log_requests: AtomicUsize,
    pub multicall_requests: AtomicUsize,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: RawLog) -> Self {
        self.logs.push(log);
        self
    }

    pub fn with_gas_cap(mut self, max_calls: usize) -> Self {
        self.gas_cap = Some(max_calls);
        self
    }

    /// Times out the first `n` log and call requests.
    pub fn with_timeouts(self, n: usize) -> Self {
        self.timeouts_left.store(n, Ordering::SeqCst);
        self
    }

    fn flake(&self) -> Result<(), TransportError> {
        match self
            .timeouts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(TransportError::Timeout),
            Err(_) => Ok(()),
        }
    }

    pub fn on<C: SolCall>(
        mut self,
        target: Address,
        handler: impl Fn(u64, &[u8]) -> Option<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .insert((target, Selector::from(C::SELECTOR)), Arc::new(handler));
        self
    }

    /// Always returns `value` as one word.
    pub fn word<C: SolCall, V: SolValue + Clone + Send + Sync + 'static>(
        self,
        target: Address,
        value: V,
    ) -> Self {
        self.on::<C>(target, move |_, _| Some(value.abi_encode().into()))
    }

    pub fn into_provider(self) -> MockProvider {
        MockProvider {
            node: Arc::new(self),
            limits: ProviderLimits::default(),
        }
    }

    fn answer(&self, target: Address, calldata: &[u8], block: u64) -> Option<Bytes> {
        if calldata.len() < 4 {
            return None;
        }
        let selector = Selector::from_slice(&calldata[..4]);
        let handler = self.handlers.get(&(target, selector))?;
        handler(block, &calldata[4..])
    }
}

fn block_number(tag: BlockTag) -> u64 {
    match tag {
        BlockTag::Latest => TIP,
        BlockTag::Number(n) => n,
    }
}

#[async_trait]
impl NodeConnection for MockNode {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, TransportError> {
        self.log_requests.fetch_add(1, Ordering::SeqCst);
        self.flake()?;
        Ok(self
            .logs
            .iter()
            .filter(|log| filter.range.contains(log.block_number))
            .filter(|log| filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            .filter(|log| {
                log.topics
                    .first()
                    .is_some_and(|t| filter.topics0.is_empty() || filter.topics0.contains(t))
            })
            .cloned()
            .collect())
    }

    async fn call(&self, to: Address, data: Bytes, block: BlockTag) -> Result<Bytes, TransportError> {
        self.flake()?;
        let block = block_number(block);
        if to != MULTICALL3_ADDRESS {
            return self
                .answer(to, &data, block)
                .ok_or_else(|| TransportError::Reverted(Bytes::new()));
        }

        self.multicall_requests.fetch_add(1, Ordering::SeqCst);
        let request = IMulticall3::aggregate3Call::abi_decode(&data, true)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        if self.gas_cap.is_some_and(|cap| request.calls.len() > cap) {
            return Err(TransportError::from_rpc(
                -32000,
                "err: out of gas (supplied gas 50000000)".into(),
                None,
            ));
        }
        let results: Vec<IMulticall3::Aggregate3Result> = request
            .calls
            .iter()
            .map(|call| match self.answer(call.target, &call.callData, block) {
                Some(data) => IMulticall3::Aggregate3Result {
                    success: true,
                    returnData: data,
                },
                None => IMulticall3::Aggregate3Result {
                    success: false,
                    returnData: Bytes::new(),
                },
            })
            .collect();

        Ok(IMulticall3::aggregate3Call::abi_encode_returns(&(results,)).into())
    }

    async fn get_block(&self, block: BlockTag) -> Result<BlockHeader, TransportError> {
        let number = block_number(block);
        Ok(BlockHeader {
            number,
            timestamp: number * 12,
        })
    }
}

/// Every worker shares the same [`MockNode`].
pub struct MockProvider {
    pub node: Arc<MockNode>,
    limits: ProviderLimits,
}

impl MockProvider {
    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl ConnectionProvider for MockProvider {
    fn new_connection(&self) -> IngestResult<Arc<dyn NodeConnection>> {
        Ok(self.node.clone())
    }

    fn limits(&self) -> ProviderLimits {
        self.limits
    }
}

pub fn vault(i: u8) -> Address {
    Address::with_last_byte(i)
}

pub fn deposit(emitter: Address, block: u64, log_index: u64) -> RawLog {
    raw_log(emitter, IERC4626::Deposit::SIGNATURE_HASH, block, log_index)
}

pub fn withdraw(emitter: Address, block: u64, log_index: u64) -> RawLog {
    raw_log(emitter, IERC4626::Withdraw::SIGNATURE_HASH, block, log_index)
}

fn raw_log(emitter: Address, topic0: B256, block: u64, log_index: u64) -> RawLog {
    RawLog {
        address: emitter,
        topics: vec![topic0, B256::ZERO, B256::ZERO],
        data: (U256::from(1), U256::from(1)).abi_encode_params().into(),
        block_number: block,
        log_index,
        transaction_hash: None,
        block_timestamp: None,
    }
}
