use std::collections::BTreeSet;

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    contracts::{
        IBalancerVaultHook, IERC4626, IEulerEarn, IGearboxPool, IHarvestVault, IIporFusion,
        ILagoonVault, IMetaMorpho, IUmamiVault, IYearnV3Vault,
    },
    types::{EncodedCall, ReturnShape},
};

/// Protocol family or structural trait recognised on a vault.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeatureTag {
    Erc4626,
    IporFusion,
    MetaMorpho,
    EulerEarn,
    Lagoon,
    YearnV3,
    Harvest,
    Gearbox,
    Umami,
    BalancerHook,
    /// the core conversion probe failed; no other tag is ever assigned
    Broken,
}

/// Chains a probe may be issued on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRestriction {
    Any,
    /// an empty set retires the probe everywhere
    Only(BTreeSet<u64>),
}

impl ChainRestriction {
    pub fn only(chains: impl IntoIterator<Item = u64>) -> Self {
        Self::Only(chains.into_iter().collect())
    }

    pub fn retired() -> Self {
        Self::Only(BTreeSet::new())
    }

    pub fn allows(&self, chain_id: u64) -> bool {
        match self {
            Self::Any => true,
            Self::Only(chains) => chains.contains(&chain_id),
        }
    }
}

/// A speculative read issued only to see whether it answers.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub name: String,
    pub tag: FeatureTag,
    /// template; the target is replaced per address
    pub call: EncodedCall,
    pub chains: ChainRestriction,
}

impl ProbeSpec {
    pub fn new<C: alloy_sol_types::SolCall>(
        name: impl Into<String>,
        tag: FeatureTag,
        call: &C,
        shape: ReturnShape,
    ) -> Self {
        Self {
            name: name.into(),
            tag,
            call: EncodedCall::new(Address::ZERO, call).with_shape(shape),
            chains: ChainRestriction::Any,
        }
    }

    pub fn on_chains(mut self, chains: ChainRestriction) -> Self {
        self.chains = chains;
        self
    }

    pub fn for_target(&self, target: Address) -> EncodedCall {
        EncodedCall {
            target,
            ..self.call.clone()
        }
        .with_tag(self.name.clone())
    }
}

/// Probes and tag rules for one classification run. Passed in explicitly so
/// runs with different rule versions can coexist.
#[derive(Debug, Clone)]
pub struct RuleTable {
    /// always issued; every address is expected to answer all of them
    pub core: Vec<ProbeSpec>,
    pub probes: Vec<ProbeSpec>,
    /// at most one tag of each group is expected per address
    pub exclusive_groups: Vec<BTreeSet<FeatureTag>>,
}

impl RuleTable {
    pub fn new(core: Vec<ProbeSpec>, probes: Vec<ProbeSpec>) -> Self {
        Self {
            core,
            probes,
            exclusive_groups: Vec::new(),
        }
    }

    pub fn with_exclusive_group(mut self, group: impl IntoIterator<Item = FeatureTag>) -> Self {
        self.exclusive_groups.push(group.into_iter().collect());
        self
    }

    pub fn should_yield_probe(&self, probe: &ProbeSpec, chain_id: u64) -> bool {
        probe.chains.allows(chain_id)
    }

    /// Every probe issued for an address on `chain_id`, core probes first.
    pub fn probes_for(&self, chain_id: u64) -> impl Iterator<Item = (bool, &ProbeSpec)> {
        self.core.iter().map(|p| (true, p)).chain(
            self.probes
                .iter()
                .filter(move |p| self.should_yield_probe(p, chain_id))
                .map(|p| (false, p)),
        )
    }
}

const ETHEREUM: u64 = 1;
const OPTIMISM: u64 = 10;
const POLYGON: u64 = 137;
const BASE: u64 = 8453;
const ARBITRUM: u64 = 42161;
const AVALANCHE: u64 = 43114;

impl Default for RuleTable {
    fn default() -> Self {
        use FeatureTag::*;

        let core = vec![ProbeSpec::new(
            "convertToShares",
            Erc4626,
            &IERC4626::convertToSharesCall {
                assets: U256::from(1),
            },
            ReturnShape::Words(1),
        )];

        let probes = vec![
            ProbeSpec::new("asset", Erc4626, &IERC4626::assetCall {}, ReturnShape::Address),
            ProbeSpec::new(
                "totalAssets",
                Erc4626,
                &IERC4626::totalAssetsCall {},
                ReturnShape::Words(1),
            ),
            ProbeSpec::new(
                "ipor.getPerformanceFeeData",
                IporFusion,
                &IIporFusion::getPerformanceFeeDataCall {},
                ReturnShape::Words(2),
            )
            .on_chains(ChainRestriction::only([ETHEREUM, BASE, ARBITRUM])),
            ProbeSpec::new(
                "morpho.MORPHO",
                MetaMorpho,
                &IMetaMorpho::MORPHOCall {},
                ReturnShape::Address,
            )
            .on_chains(ChainRestriction::only([ETHEREUM, BASE])),
            ProbeSpec::new(
                "morpho.fee",
                MetaMorpho,
                &IMetaMorpho::feeCall {},
                ReturnShape::Words(1),
            )
            .on_chains(ChainRestriction::only([ETHEREUM, BASE])),
            ProbeSpec::new("euler.EVC", EulerEarn, &IEulerEarn::EVCCall {}, ReturnShape::Address)
                .on_chains(ChainRestriction::only([ETHEREUM, BASE, ARBITRUM, AVALANCHE])),
            ProbeSpec::new(
                "lagoon.pendingSilo",
                Lagoon,
                &ILagoonVault::pendingSiloCall {},
                ReturnShape::Address,
            )
            .on_chains(ChainRestriction::only([ETHEREUM, BASE, ARBITRUM, AVALANCHE])),
            ProbeSpec::new(
                "lagoon.feeRates",
                Lagoon,
                &ILagoonVault::feeRatesCall {},
                ReturnShape::Words(2),
            )
            .on_chains(ChainRestriction::only([ETHEREUM, BASE, ARBITRUM, AVALANCHE])),
            // dynamic string: offset, length, data
            ProbeSpec::new(
                "yearn.apiVersion",
                YearnV3,
                &IYearnV3Vault::apiVersionCall {},
                ReturnShape::Words(3),
            ),
            ProbeSpec::new(
                "yearn.accountant",
                YearnV3,
                &IYearnV3Vault::accountantCall {},
                ReturnShape::Words(1),
            ),
            ProbeSpec::new(
                "harvest.vaultFractionToInvestDenominator",
                Harvest,
                &IHarvestVault::vaultFractionToInvestDenominatorCall {},
                ReturnShape::Words(1),
            )
            .on_chains(ChainRestriction::only([ETHEREUM, POLYGON, BASE, ARBITRUM])),
            ProbeSpec::new(
                "gearbox.poolQuotaKeeper",
                Gearbox,
                &IGearboxPool::poolQuotaKeeperCall {},
                ReturnShape::Address,
            )
            .on_chains(ChainRestriction::only([ETHEREUM, OPTIMISM, ARBITRUM])),
            ProbeSpec::new(
                "umami.aggregateVault",
                Umami,
                &IUmamiVault::aggregateVaultCall {},
                ReturnShape::Address,
            )
            .on_chains(ChainRestriction::only([ARBITRUM])),
            // no longer distinguishable from plain vaults
            ProbeSpec::new(
                "balancer.getVault",
                BalancerHook,
                &IBalancerVaultHook::getVaultCall {},
                ReturnShape::Address,
            )
            .on_chains(ChainRestriction::retired()),
        ];

        Self::new(core, probes).with_exclusive_group([
            IporFusion,
            MetaMorpho,
            EulerEarn,
            Lagoon,
            YearnV3,
            Harvest,
            Gearbox,
            Umami,
        ])
    }
}
