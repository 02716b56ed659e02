//! Point-in-time state reconstruction for classified vaults.

mod capability;
mod fields;

use std::{collections::BTreeMap, sync::Arc};

use alloy_primitives::{Address, U256};
use futures::{stream, Stream, StreamExt};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::{
    capability::{
        CapabilityTable, FeeMode, FeeSource, ProtocolCapability, RedemptionStrategy,
        VaultCapability,
    },
    fields::{base_fields, FieldCall, FieldError, FieldName},
};
use crate::{
    aux::execute_on_threadpool,
    classify::FeatureSet,
    contracts::{IERC20, IERC4626},
    error::{IngestError, IngestResult},
    multicall::{self, CallOptions},
    node::ConnectionProvider,
    types::{BlockRange, BlockTag, CallFailureReason, CallResult, EncodedCall, ReturnShape, VaultId},
    utils::pow10,
};

/// sampled blocks processed concurrently
const DEFAULT_BLOCKS_IN_FLIGHT: usize = 2;

/// Block numbers from `start` to `end` spaced by `step`; `end` is always
/// sampled even when it falls off the stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPlan {
    range: BlockRange,
    step: u64,
}

impl SamplingPlan {
    pub fn new(start: u64, end: u64, step: u64) -> IngestResult<Self> {
        if step == 0 {
            return Err(IngestError::config("sampling step must be positive"));
        }
        Ok(Self {
            range: BlockRange::new(start, end)?,
            step,
        })
    }

    pub fn blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = (self.range.start()..=self.range.end())
            .step_by(usize::try_from(self.step).unwrap_or(usize::MAX))
            .collect();
        if blocks.last() != Some(&self.range.end()) {
            blocks.push(self.range.end());
        }
        blocks
    }
}

/// Decoded state of one vault at one block. Fields whose call failed are
/// absent from `fields` and listed in `errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(with = "crate::utils::serde_fields")]
    pub fields: IndexMap<FieldName, U256>,
    pub errors: Vec<FieldError>,
    /// where the vault's fees are published, set once a capability is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_mode: Option<FeeMode>,
}

impl HistoricalPoint {
    pub fn field(&self, name: FieldName) -> Option<U256> {
        self.fields.get(&name).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Static facts about a vault needed to build its sample calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultDescriptor {
    pub id: VaultId,
    pub asset: Address,
    pub share_decimals: u8,
    pub asset_decimals: u8,
    /// one whole share in base units
    pub share_unit: U256,
    /// samples before this block are skipped
    pub first_seen_block: u64,
    pub features: FeatureSet,
}

/// Input to [`describe_vaults`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSeed {
    pub features: FeatureSet,
    pub first_seen_block: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DescribeReport {
    pub vaults: Vec<VaultDescriptor>,
    /// vaults that could not be described, with the reason
    pub failures: BTreeMap<Address, String>,
}

/// Reads `asset()`, `decimals()` and the asset's `decimals()` for every
/// non-broken vault at `block`.
pub async fn describe_vaults(
    provider: &dyn ConnectionProvider,
    chain_id: u64,
    seeds: &[VaultSeed],
    block: BlockTag,
    options: &CallOptions,
    cancel: &CancellationToken,
) -> IngestResult<DescribeReport> {
    let mut report = DescribeReport::default();
    let seeds: Vec<&VaultSeed> = seeds
        .iter()
        .filter(|seed| {
            if seed.features.is_broken() {
                report
                    .failures
                    .insert(seed.features.address, "classified as broken".to_string());
            }
            !seed.features.is_broken()
        })
        .collect();

    let calls: Vec<EncodedCall> = seeds
        .iter()
        .flat_map(|seed| {
            let vault = seed.features.address;
            [
                EncodedCall::new(vault, &IERC4626::assetCall {}).with_shape(ReturnShape::Address),
                EncodedCall::new(vault, &IERC20::decimalsCall {}).with_shape(ReturnShape::Words(1)),
            ]
        })
        .collect();
    let results = multicall::execute(provider, &calls, block, options, cancel).await?;

    let mut assets = Vec::with_capacity(seeds.len());
    for (seed, pair) in seeds.iter().zip(results.chunks(2)) {
        let address = seed.features.address;
        let described = pair[0]
            .decode::<IERC4626::assetCall>()
            .map(|r| r._0)
            .and_then(|asset| {
                let decimals = pair[1].decode::<IERC20::decimalsCall>().map(|r| r._0)?;
                Ok((asset, decimals))
            });
        match described {
            Ok(found) => assets.push((*seed, found)),
            Err(reason) => {
                report.failures.insert(address, reason);
            }
        }
    }

    let asset_calls: Vec<EncodedCall> = assets
        .iter()
        .map(|(_, (asset, _))| {
            EncodedCall::new(*asset, &IERC20::decimalsCall {}).with_shape(ReturnShape::Words(1))
        })
        .collect();
    let asset_results =
        multicall::execute(provider, &asset_calls, block, options, cancel).await?;

    for ((seed, (asset, share_decimals)), result) in assets.into_iter().zip(&asset_results) {
        let address = seed.features.address;
        let asset_decimals = match result.decode::<IERC20::decimalsCall>() {
            Ok(r) => r._0,
            Err(reason) => {
                report.failures.insert(address, format!("asset decimals: {reason}"));
                continue;
            }
        };
        let Some(share_unit) = pow10(share_decimals) else {
            report
                .failures
                .insert(address, format!("share decimals out of range: {share_decimals}"));
            continue;
        };

        report.vaults.push(VaultDescriptor {
            id: VaultId::new(chain_id, address),
            asset,
            share_decimals,
            asset_decimals,
            share_unit,
            first_seen_block: seed.first_seen_block,
            features: seed.features.clone(),
        });
    }

    info!(
        target: "vault_ingest::history",
        described = report.vaults.len(),
        failed = report.failures.len(),
        "described vaults"
    );

    Ok(report)
}

/// A vault together with its resolved capability and per-sample calls.
struct SampledVault {
    descriptor: VaultDescriptor,
    capability: Arc<dyn VaultCapability>,
    fields: Vec<FieldCall>,
}

pub struct Reconstructor {
    capabilities: Arc<CapabilityTable>,
    options: CallOptions,
    blocks_in_flight: usize,
}

impl Reconstructor {
    pub fn new(capabilities: Arc<CapabilityTable>, options: CallOptions) -> Self {
        Self {
            capabilities,
            options,
            blocks_in_flight: DEFAULT_BLOCKS_IN_FLIGHT,
        }
    }

    pub fn with_blocks_in_flight(mut self, blocks: usize) -> Self {
        self.blocks_in_flight = blocks.max(1);
        self
    }

    /// Samples every vault at every planned block.
    ///
    /// Items arrive grouped by block but blocks may complete out of order.
    /// A block whose timestamp cannot be read yields one error item; other
    /// blocks are unaffected. Blocks interrupted by cancellation yield
    /// nothing.
    pub fn reconstruct(
        &self,
        provider: Arc<dyn ConnectionProvider>,
        vaults: Vec<VaultDescriptor>,
        plan: SamplingPlan,
        cancel: CancellationToken,
    ) -> impl Stream<Item = IngestResult<(VaultId, HistoricalPoint)>> {
        let vaults: Arc<Vec<SampledVault>> = Arc::new(
            vaults
                .into_iter()
                .filter_map(|descriptor| {
                    let Some(capability) = self.capabilities.resolve(&descriptor.features) else {
                        warn!(
                            target: "vault_ingest::history",
                            vault = %descriptor.id,
                            "skipping broken vault"
                        );
                        return None;
                    };
                    let mut fields = base_fields(&descriptor);
                    fields.extend(capability.extra_fields(&descriptor));
                    debug!(
                        target: "vault_ingest::history",
                        vault = %descriptor.id,
                        capability = capability.name(),
                        fields = fields.len(),
                        "resolved capability"
                    );
                    Some(SampledVault {
                        descriptor,
                        capability,
                        fields,
                    })
                })
                .collect(),
        );

        let options = self.options.clone();
        let blocks = plan.blocks();
        info!(
            target: "vault_ingest::history",
            vaults = vaults.len(),
            samples = blocks.len(),
            "reconstructing history"
        );

        stream::iter(blocks)
            .map(move |block| {
                sample_block(
                    provider.clone(),
                    vaults.clone(),
                    block,
                    options.clone(),
                    cancel.clone(),
                )
            })
            .buffer_unordered(self.blocks_in_flight)
            .flat_map(|sampled| {
                stream::iter(match sampled {
                    Ok(points) => points.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            })
    }
}

async fn sample_block(
    provider: Arc<dyn ConnectionProvider>,
    vaults: Arc<Vec<SampledVault>>,
    block: u64,
    options: CallOptions,
    cancel: CancellationToken,
) -> IngestResult<Vec<(VaultId, HistoricalPoint)>> {
    if cancel.is_cancelled() {
        return Ok(Vec::new());
    }

    let active: Vec<usize> = vaults
        .iter()
        .enumerate()
        .filter(|(_, v)| v.descriptor.first_seen_block <= block)
        .map(|(i, _)| i)
        .collect();
    if active.is_empty() {
        return Ok(Vec::new());
    }

    // one timestamp per block, shared by every vault sampled at it
    let tag = BlockTag::Number(block);
    let conn = provider.new_connection()?;
    let header = options
        .retry
        .execute("eth_getBlockByNumber", || conn.get_block(tag))
        .await
        .map_err(|e| IngestError::transport(format!("timestamp of block {block}"), e))?;

    let calls: Vec<EncodedCall> = active
        .iter()
        .flat_map(|&i| vaults[i].fields.iter().map(|f| f.call.clone()))
        .collect();
    let results =
        multicall::execute(provider.as_ref(), &calls, tag, &options, &cancel).await?;

    if results
        .iter()
        .any(|r| matches!(r.failure().map(|f| &f.reason), Some(CallFailureReason::Cancelled)))
    {
        debug!(target: "vault_ingest::history", block, "dropping block interrupted by cancellation");
        return Ok(Vec::new());
    }

    let timestamp = header.timestamp;
    let points = tokio::task::spawn_blocking(move || {
        execute_on_threadpool(|| decode_block(&vaults, &active, block, timestamp, &results))
    })
    .await
    .map_err(|e| IngestError::Decode(format!("decoding block {block}: {e}")))?;

    let with_errors = points.iter().filter(|(_, p)| !p.is_complete()).count();
    debug!(
        target: "vault_ingest::history",
        block,
        points = points.len(),
        with_errors,
        "sampled block"
    );

    Ok(points)
}

/// Decodes every active vault's slice of `results` in parallel.
fn decode_block(
    vaults: &[SampledVault],
    active: &[usize],
    block: u64,
    timestamp: u64,
    results: &[CallResult],
) -> Vec<(VaultId, HistoricalPoint)> {
    // slice the flat result list back into per-vault groups
    let mut groups: Vec<(&SampledVault, &[CallResult])> = Vec::with_capacity(active.len());
    let mut rest = results;
    for &i in active {
        let vault = &vaults[i];
        let (mine, others) = rest.split_at(vault.fields.len().min(rest.len()));
        groups.push((vault, mine));
        rest = others;
    }

    groups
        .par_iter()
        .map(|(vault, results)| {
            let mut point = decode_point(block, timestamp, &vault.fields, results);
            vault.capability.annotate(&vault.descriptor, &mut point);
            (vault.descriptor.id, point)
        })
        .collect()
}

/// Builds one point; a failed field never affects its siblings.
fn decode_point(
    block: u64,
    timestamp: u64,
    fields: &[FieldCall],
    results: &[CallResult],
) -> HistoricalPoint {
    let mut point = HistoricalPoint {
        block_number: block,
        timestamp,
        fields: IndexMap::with_capacity(fields.len() + 1),
        errors: Vec::new(),
        fee_mode: None,
    };

    for (field, result) in fields.iter().zip(results) {
        match field.decode(result) {
            Ok(value) => {
                point.fields.insert(field.name, value);
            }
            Err(e) => point.errors.push(e),
        }
    }

    point
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_always_includes_end() {
        assert_eq!(SamplingPlan::new(100, 120, 10).unwrap().blocks(), vec![100, 110, 120]);
        assert_eq!(SamplingPlan::new(100, 125, 10).unwrap().blocks(), vec![100, 110, 120, 125]);
        assert_eq!(SamplingPlan::new(7, 7, 1000).unwrap().blocks(), vec![7]);
        assert_eq!(SamplingPlan::new(0, 5, u64::MAX).unwrap().blocks(), vec![0, 5]);
    }

    #[test]
    fn test_invalid_plans() {
        assert!(matches!(
            SamplingPlan::new(1, 10, 0),
            Err(IngestError::Configuration(_))
        ));
        assert!(SamplingPlan::new(10, 1, 1).is_err());
    }

    #[test]
    fn test_point_keeps_good_fields() {
        use alloy_primitives::{Bytes, Selector};
        use alloy_sol_types::SolValue;

        use crate::types::CallFailure;

        let vault = Address::with_last_byte(1);
        let fields = vec![
            FieldCall::new(FieldName::TotalAssets, vault, &IERC4626::totalAssetsCall {}),
            FieldCall::new(FieldName::TotalSupply, vault, &IERC20::totalSupplyCall {}),
        ];
        let results = vec![
            CallResult {
                call: fields[0].call.clone(),
                outcome: Ok(Bytes::from(U256::from(5).abi_encode())),
            },
            CallResult {
                call: fields[1].call.clone(),
                outcome: Err(CallFailure {
                    target: vault,
                    selector: Selector::ZERO,
                    reason: CallFailureReason::Reverted(Bytes::new()),
                }),
            },
        ];

        let point = decode_point(10, 99, &fields, &results);
        assert_eq!(point.field(FieldName::TotalAssets), Some(U256::from(5)));
        assert_eq!(point.field(FieldName::TotalSupply), None);
        assert_eq!(point.errors.len(), 1);
        assert_eq!(point.errors[0].field, FieldName::TotalSupply);

        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json["fields"]["total_assets"], "5");
        assert!(json.get("fee_mode").is_none());
    }
}
