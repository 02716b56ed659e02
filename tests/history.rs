mod common;

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolValue;
use common::{vault, MockNode, CHAIN_ID};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use vault_ingest::{
    classify::{FeatureSet, FeatureTag},
    contracts::{IERC20, IERC4626},
    history::{describe_vaults, CapabilityTable, FeeMode, FieldName, Reconstructor, SamplingPlan, VaultSeed},
    multicall::CallOptions,
    node::ConnectionProvider,
    retry::RetryPolicy,
    types::BlockTag,
};

const ASSET: u8 = 0xaa;

/// Plain vault whose total assets grow by one per block; `broken_at` makes
/// `totalAssets()` revert at that block.
fn plain_vault(node: MockNode, target: Address, broken_at: Option<u64>) -> MockNode {
    node.word::<IERC4626::assetCall, _>(target, vault(ASSET))
        .word::<IERC20::decimalsCall, _>(target, 18u16)
        .word::<IERC20::totalSupplyCall, _>(target, U256::from(1_000))
        .word::<IERC4626::maxDepositCall, _>(target, U256::MAX)
        .word::<IERC4626::maxRedeemCall, _>(target, U256::from(0))
        .on::<IERC4626::convertToAssetsCall>(target, |_, args| {
            Some(U256::from_be_slice(args).abi_encode().into())
        })
        .on::<IERC4626::totalAssetsCall>(target, move |block, _| {
            (Some(block) != broken_at).then(|| U256::from(block).abi_encode().into())
        })
        .on::<IERC20::balanceOfCall>(vault(ASSET), |_, _| Some(U256::from(7).abi_encode().into()))
}

fn seed(address: Address) -> VaultSeed {
    VaultSeed {
        features: FeatureSet::new(address, [FeatureTag::Erc4626]),
        first_seen_block: 0,
    }
}

#[tokio::test]
async fn test_reconstruct_isolates_failed_field() {
    let node = plain_vault(MockNode::new(), vault(1), None);
    let node = plain_vault(node, vault(2), Some(110))
        .word::<IERC20::decimalsCall, _>(vault(ASSET), 6u16);
    let provider: Arc<dyn ConnectionProvider> = Arc::new(node.into_provider());
    let options = CallOptions::default().with_retry(RetryPolicy::no_retry());
    let cancel = CancellationToken::new();

    let described = describe_vaults(
        provider.as_ref(),
        CHAIN_ID,
        &[seed(vault(1)), seed(vault(2))],
        BlockTag::Latest,
        &options,
        &cancel,
    )
    .await
    .unwrap();
    assert!(described.failures.is_empty());
    assert_eq!(described.vaults.len(), 2);
    assert_eq!(described.vaults[0].asset, vault(ASSET));
    assert_eq!(described.vaults[0].asset_decimals, 6);
    assert_eq!(described.vaults[0].share_decimals, 18);

    let plan = SamplingPlan::new(100, 120, 10).unwrap();
    let mut points: Vec<_> = Reconstructor::new(Arc::new(CapabilityTable::default()), options)
        .reconstruct(provider, described.vaults, plan, cancel)
        .map(|item| item.unwrap())
        .collect()
        .await;
    points.sort_by_key(|(id, point)| (point.block_number, id.address));

    assert_eq!(points.len(), 6);
    let incomplete: Vec<_> = points
        .iter()
        .filter(|(_, point)| !point.is_complete())
        .collect();
    assert_eq!(incomplete.len(), 1);

    let (id, point) = incomplete[0];
    assert_eq!(id.address, vault(2));
    assert_eq!(point.block_number, 110);
    assert_eq!(point.errors[0].field, FieldName::TotalAssets);
    assert_eq!(point.field(FieldName::TotalAssets), None);
    assert_eq!(point.field(FieldName::TotalSupply), Some(U256::from(1_000)));

    for (id, point) in &points {
        assert_eq!(id.chain_id, CHAIN_ID);
        assert_eq!(point.timestamp, point.block_number * 12);
        assert_eq!(
            point.field(FieldName::SharePrice),
            Some(U256::from(10).pow(U256::from(18)))
        );
        assert_eq!(point.field(FieldName::IdleAssets), Some(U256::from(7)));
        assert_eq!(point.field(FieldName::RedeemableAssets), Some(U256::from(7)));
        assert_eq!(point.fee_mode, Some(FeeMode::Undocumented));
    }
}

#[tokio::test]
async fn test_vaults_not_sampled_before_first_seen() {
    let node = plain_vault(MockNode::new(), vault(1), None)
        .word::<IERC20::decimalsCall, _>(vault(ASSET), 18u16);
    let provider: Arc<dyn ConnectionProvider> = Arc::new(node.into_provider());
    let options = CallOptions::default();
    let cancel = CancellationToken::new();

    let mut late = seed(vault(1));
    late.first_seen_block = 115;
    let described = describe_vaults(
        provider.as_ref(),
        CHAIN_ID,
        &[late],
        BlockTag::Latest,
        &options,
        &cancel,
    )
    .await
    .unwrap();

    let blocks: Vec<u64> = Reconstructor::new(Arc::new(CapabilityTable::default()), options)
        .reconstruct(
            provider,
            described.vaults,
            SamplingPlan::new(100, 130, 10).unwrap(),
            cancel,
        )
        .map(|item| item.unwrap().1.block_number)
        .collect()
        .await;

    let mut blocks = blocks;
    blocks.sort_unstable();
    assert_eq!(blocks, vec![120, 130]);
}
