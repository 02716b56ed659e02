mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolValue;
use common::{vault, MockNode};
use tokio_util::sync::CancellationToken;
use vault_ingest::{
    classify::{Classifier, FeatureTag, RuleTable},
    contracts::{IMetaMorpho, IERC4626},
    multicall::{self, CallOptions},
    planner::ProviderLimits,
    retry::RetryPolicy,
    types::{BlockTag, CallFailureReason, EncodedCall, ReturnShape},
};

fn doubling(node: MockNode, target: Address) -> MockNode {
    node.on::<IERC4626::convertToAssetsCall>(target, |_, args| {
        Some((U256::from_be_slice(args) * U256::from(2)).abi_encode().into())
    })
}

fn convert(target: Address, shares: u64) -> EncodedCall {
    EncodedCall::new(
        target,
        &IERC4626::convertToAssetsCall {
            shares: U256::from(shares),
        },
    )
    .with_shape(ReturnShape::Words(1))
}

fn options() -> CallOptions {
    CallOptions::default()
        .with_worker_count(3)
        .with_retry(RetryPolicy::no_retry())
}

#[tokio::test]
async fn test_one_bad_call_fails_alone() {
    let node = (1..=10u8)
        .filter(|i| *i != 5)
        .fold(MockNode::new(), |node, i| doubling(node, vault(i)));
    let provider = node
        .into_provider()
        .with_limits(ProviderLimits::default().with_max_calls_per_request(3));

    let calls: Vec<EncodedCall> = (1..=10u8).map(|i| convert(vault(i), i as u64 * 100)).collect();
    let results = multicall::execute(
        &provider,
        &calls,
        BlockTag::Latest,
        &options(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 10);
    let failed: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.success())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(failed, vec![4]);
    assert!(matches!(
        results[4].failure().unwrap().reason,
        CallFailureReason::Reverted(_)
    ));

    for (i, result) in results.iter().enumerate().filter(|(i, _)| *i != 4) {
        assert_eq!(result.call, calls[i]);
        let assets = result.decode::<IERC4626::convertToAssetsCall>().unwrap()._0;
        assert_eq!(assets, U256::from((i as u64 + 1) * 200));
    }
    assert_eq!(provider.node.multicall_requests.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_gas_capped_aggregate_is_split() {
    let node = (1..=8u8)
        .fold(MockNode::new(), |node, i| {
            node.word::<IERC4626::totalAssetsCall, _>(vault(i), U256::from(i))
        })
        .with_gas_cap(2);
    let provider = node.into_provider();
    let calls: Vec<EncodedCall> = (1..=8u8)
        .map(|i| {
            EncodedCall::new(vault(i), &IERC4626::totalAssetsCall {})
                .with_shape(ReturnShape::Words(1))
        })
        .collect();

    let results = multicall::execute(
        &provider,
        &calls,
        BlockTag::Latest,
        &options().with_worker_count(1),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(results.iter().filter(|r| r.success()).count(), 8);
    for (i, result) in results.iter().enumerate() {
        let assets = result.decode::<IERC4626::totalAssetsCall>().unwrap()._0;
        assert_eq!(assets, U256::from(i + 1));
    }
    // 8 -> 4 + 4 -> 2 + 2 + 2 + 2
    assert_eq!(provider.node.multicall_requests.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_single_call_over_gas_cap_fails_alone() {
    let node = MockNode::new()
        .word::<IERC4626::totalAssetsCall, _>(vault(1), U256::from(1))
        .with_gas_cap(0);
    let provider = node.into_provider();
    let calls = vec![EncodedCall::new(vault(1), &IERC4626::totalAssetsCall {})];

    let results = multicall::execute(
        &provider,
        &calls,
        BlockTag::Latest,
        &options(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let failure = results[0].failure().unwrap();
    assert!(!failure.is_transport());
    assert!(matches!(failure.reason, CallFailureReason::Reverted(_)));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let provider = doubling(MockNode::new(), vault(1))
        .with_timeouts(2)
        .into_provider();
    let calls: Vec<EncodedCall> = (1..=3u64).map(|s| convert(vault(1), s)).collect();
    let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0);

    let results = multicall::execute(
        &provider,
        &calls,
        BlockTag::Latest,
        &options().with_worker_count(1).with_retry(retry),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(results.iter().all(|r| r.success()));
    assert_eq!(results[2].decode::<IERC4626::convertToAssetsCall>().unwrap()._0, U256::from(6));
}

#[tokio::test]
async fn test_results_follow_input_order() {
    let provider = doubling(MockNode::new(), vault(1)).into_provider();
    let shares = [7u64, 3, 7, 1, 9];
    let calls: Vec<EncodedCall> = shares.iter().map(|s| convert(vault(1), *s)).collect();

    let results = multicall::execute(
        &provider,
        &calls,
        BlockTag::Number(10),
        &options(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let assets: Vec<U256> = results
        .iter()
        .map(|r| r.decode::<IERC4626::convertToAssetsCall>().unwrap()._0)
        .collect();
    assert_eq!(
        assets,
        shares.iter().map(|s| U256::from(s * 2)).collect::<Vec<_>>()
    );
}

/// A MetaMorpho-looking vault: core probes plus `MORPHO()` and `fee()`.
fn morpho_vault(node: MockNode, target: Address) -> MockNode {
    node.word::<IERC4626::convertToSharesCall, _>(target, U256::from(1))
        .word::<IERC4626::assetCall, _>(target, vault(0xaa))
        .word::<IERC4626::totalAssetsCall, _>(target, U256::from(1_000))
        .word::<IMetaMorpho::MORPHOCall, _>(target, vault(0xbb))
        .word::<IMetaMorpho::feeCall, _>(target, U256::from(5))
}

#[tokio::test]
async fn test_chain_restricted_probe_only_on_its_chains() {
    let provider = morpho_vault(MockNode::new(), vault(1)).into_provider();
    let classifier = Classifier::new(Arc::new(RuleTable::default()), options());
    let cancel = CancellationToken::new();

    let mainnet = classifier
        .classify(&provider, &[vault(1)], BlockTag::Latest, 1, &cancel)
        .await
        .unwrap();
    let features = &mainnet.features[&vault(1)];
    assert!(features.has(FeatureTag::Erc4626));
    assert!(features.has(FeatureTag::MetaMorpho));
    assert!(mainnet.ambiguities.is_empty());

    let polygon = classifier
        .classify(&provider, &[vault(1)], BlockTag::Latest, 137, &cancel)
        .await
        .unwrap();
    let features = &polygon.features[&vault(1)];
    assert!(features.has(FeatureTag::Erc4626));
    assert!(!features.has(FeatureTag::MetaMorpho));
}

#[tokio::test]
async fn test_classification_is_per_address() {
    // vault 2 has no code, vault 3 is a plain vault
    let node = morpho_vault(MockNode::new(), vault(1))
        .word::<IERC4626::convertToSharesCall, _>(vault(3), U256::from(1))
        .word::<IERC4626::assetCall, _>(vault(3), vault(0xaa))
        .word::<IERC4626::totalAssetsCall, _>(vault(3), U256::from(1));
    let provider = node.into_provider();

    let report = Classifier::new(Arc::new(RuleTable::default()), options())
        .classify(
            &provider,
            &[vault(1), vault(2), vault(3)],
            BlockTag::Latest,
            8453,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.features[&vault(1)].has(FeatureTag::MetaMorpho));
    assert!(report.features[&vault(2)].is_broken());
    let plain = &report.features[&vault(3)];
    assert!(plain.has(FeatureTag::Erc4626));
    assert_eq!(plain.tags.len(), 1);
    assert!(report.unresolved.is_empty());
}
