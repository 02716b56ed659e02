use std::{
    fmt,
    hash::{Hash, Hasher},
};

use alloy_primitives::{Address, Bytes, Selector};
use alloy_sol_types::SolCall;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};

/// Inclusive `[start, end]` block interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    start: u64,
    end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> IngestResult<Self> {
        if start > end {
            return Err(IngestError::config(format!(
                "inverted block range [{start}, {end}]"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of blocks covered, always at least one.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block <= self.end
    }

    /// Splits into two halves; `None` for a single block.
    pub fn bisect(&self) -> Option<(Self, Self)> {
        if self.start == self.end {
            return None;
        }
        let mid = self.start + (self.end - self.start) / 2;
        Some((
            Self {
                start: self.start,
                end: mid,
            },
            Self {
                start: mid + 1,
                end: self.end,
            },
        ))
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Block a read call is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlockTag {
    #[default]
    Latest,
    Number(u64),
}

impl BlockTag {
    pub fn to_rpc(&self) -> String {
        match self {
            Self::Latest => "latest".to_string(),
            Self::Number(n) => format!("0x{n:x}"),
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<u64> for BlockTag {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

/// Expected layout of a call's return data, used to tell a real answer apart
/// from a fallback function that happened to return something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnShape {
    #[default]
    Any,
    /// at least `n` 32-byte words
    Words(usize),
    /// one word holding a non-zero address
    Address,
    /// one word holding 0 or 1
    Bool,
}

impl ReturnShape {
    pub fn validate(&self, data: &[u8]) -> Result<(), String> {
        match self {
            Self::Any => Ok(()),
            Self::Words(n) => {
                if data.len() >= n * 32 {
                    Ok(())
                } else {
                    Err(format!("expected {n} words, got {} bytes", data.len()))
                }
            }
            Self::Address => {
                let word = first_word(data)?;
                if word[..12].iter().any(|b| *b != 0) {
                    return Err("dirty high bytes in address word".to_string());
                }
                if word[12..].iter().all(|b| *b == 0) {
                    return Err("zero address".to_string());
                }
                Ok(())
            }
            Self::Bool => {
                let word = first_word(data)?;
                if word[..31].iter().any(|b| *b != 0) || word[31] > 1 {
                    return Err("not a boolean word".to_string());
                }
                Ok(())
            }
        }
    }
}

fn first_word(data: &[u8]) -> Result<&[u8], String> {
    data.get(..32)
        .ok_or_else(|| format!("expected one word, got {} bytes", data.len()))
}

/// One independent read request.
///
/// Equality and hashing only consider `(target, selector, payload)`; the
/// shape hint and tag are caller bookkeeping.
#[derive(Debug, Clone)]
pub struct EncodedCall {
    pub target: Address,
    pub selector: Selector,
    pub payload: Bytes,
    pub shape: ReturnShape,
    pub tag: String,
}

impl EncodedCall {
    pub fn new<C: SolCall>(target: Address, call: &C) -> Self {
        let encoded = call.abi_encode();
        Self {
            target,
            selector: Selector::from(C::SELECTOR),
            payload: Bytes::copy_from_slice(&encoded[4..]),
            shape: ReturnShape::Any,
            tag: C::SIGNATURE.to_string(),
        }
    }

    pub fn raw(target: Address, selector: Selector, payload: Bytes) -> Self {
        Self {
            target,
            selector,
            payload,
            shape: ReturnShape::Any,
            tag: String::new(),
        }
    }

    pub fn with_shape(mut self, shape: ReturnShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Full calldata: selector followed by the encoded arguments.
    pub fn calldata(&self) -> Bytes {
        let mut data = Vec::with_capacity(4 + self.payload.len());
        data.extend_from_slice(self.selector.as_slice());
        data.extend_from_slice(&self.payload);
        data.into()
    }
}

impl PartialEq for EncodedCall {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
            && self.selector == other.selector
            && self.payload == other.payload
    }
}

impl Eq for EncodedCall {}

impl Hash for EncodedCall {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target.hash(state);
        self.selector.hash(state);
        self.payload.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailureReason {
    Reverted(Bytes),
    EmptyReturn,
    DecodeMismatch(String),
    /// the aggregate request carrying this call could not be delivered
    Transport(String),
    Cancelled,
}

impl fmt::Display for CallFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reverted(data) if data.is_empty() => write!(f, "reverted"),
            Self::Reverted(data) => write!(f, "reverted with {data}"),
            Self::EmptyReturn => write!(f, "empty return data"),
            Self::DecodeMismatch(msg) => write!(f, "unexpected return data: {msg}"),
            Self::Transport(msg) => write!(f, "transport failure: {msg}"),
            Self::Cancelled => write!(f, "cancelled before execution"),
        }
    }
}

/// Diagnostic for a call that did not produce usable data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub target: Address,
    pub selector: Selector,
    pub reason: CallFailureReason,
}

impl CallFailure {
    pub fn new(call: &EncodedCall, reason: CallFailureReason) -> Self {
        Self {
            target: call.target,
            selector: call.selector,
            reason,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self.reason,
            CallFailureReason::Transport(_) | CallFailureReason::Cancelled
        )
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} {}", self.target, self.selector, self.reason)
    }
}

/// Outcome of one [`EncodedCall`].
#[derive(Debug, Clone)]
pub struct CallResult {
    pub call: EncodedCall,
    pub outcome: Result<Bytes, CallFailure>,
}

impl CallResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.outcome.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&CallFailure> {
        self.outcome.as_ref().err()
    }

    /// Decodes the return data with the given call's ABI.
    pub fn decode<C: SolCall>(&self) -> Result<C::Return, String> {
        match &self.outcome {
            Ok(data) => C::abi_decode_returns(data, false).map_err(|e| e.to_string()),
            Err(failure) => Err(failure.reason.to_string()),
        }
    }
}

/// A vault is identified by the chain it lives on and its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultId {
    pub chain_id: u64,
    pub address: Address,
}

impl VaultId {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self { chain_id, address }
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:#x}", self.chain_id, self.address)
    }
}
