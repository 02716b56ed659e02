use std::{fmt::Debug, sync::Arc};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    fields::{idle_assets, FieldCall, FieldName},
    HistoricalPoint, VaultDescriptor,
};
use crate::{
    classify::{FeatureSet, FeatureTag},
    contracts::{IEulerEarn, IIporFusion, ILagoonVault, IMetaMorpho},
};

/// Where a vault's fees can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeMode {
    /// fee parameters live on the vault and are sampled as fields
    Internalised,
    /// fees are charged by a separate contract (accountant, pool keeper)
    Externalised,
    /// the protocol does not publish fee data on-chain
    Undocumented,
}

/// How much of a vault can be redeemed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedemptionStrategy {
    /// underlying asset sitting in the vault
    IdleAssets,
    /// the vault's own `maxRedeem` answer, converted to assets at share price
    MaxRedeem,
}

/// Protocol-specific behaviour of a classified vault, resolved once from its
/// feature set.
pub trait VaultCapability: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn fee_mode(&self) -> FeeMode;

    fn redemption(&self) -> RedemptionStrategy;

    /// Fee fields sampled alongside the base fields.
    fn fee_fields(&self, vault: &VaultDescriptor) -> Vec<FieldCall>;

    /// Extra calls this vault needs at every sample.
    fn extra_fields(&self, vault: &VaultDescriptor) -> Vec<FieldCall> {
        let mut fields = self.fee_fields(vault);
        if self.redemption() == RedemptionStrategy::IdleAssets {
            fields.push(idle_assets(vault));
        }
        fields
    }

    /// Redeemable assets at one point, if the inputs were sampled.
    fn redeemable(&self, vault: &VaultDescriptor, point: &HistoricalPoint) -> Option<U256> {
        match self.redemption() {
            RedemptionStrategy::IdleAssets => point.field(FieldName::IdleAssets),
            RedemptionStrategy::MaxRedeem => {
                let shares = point.field(FieldName::MaxRedeem)?;
                let price = point.field(FieldName::SharePrice)?;
                shares.checked_mul(price)?.checked_div(vault.share_unit)
            }
        }
    }

    /// Stamps the fee mode and the derived redeemable amount on a decoded
    /// point. Missing inputs leave the derived field out.
    fn annotate(&self, vault: &VaultDescriptor, point: &mut HistoricalPoint) {
        point.fee_mode = Some(self.fee_mode());
        if let Some(redeemable) = self.redeemable(vault, point) {
            point.fields.insert(FieldName::RedeemableAssets, redeemable);
        }
    }
}

/// Which fee field comes from which call.
#[derive(Debug, Clone, Copy)]
pub enum FeeSource {
    MetaMorphoFee,
    EulerPerformanceFee,
    LagoonFeeRates,
    IporFeeData,
}

impl FeeSource {
    fn fields(&self, vault: &VaultDescriptor) -> Vec<FieldCall> {
        let target = vault.id.address;
        match self {
            Self::MetaMorphoFee => {
                vec![FieldCall::new(FieldName::PerformanceFee, target, &IMetaMorpho::feeCall {})]
            }
            Self::EulerPerformanceFee => vec![FieldCall::new(
                FieldName::PerformanceFee,
                target,
                &IEulerEarn::performanceFeeCall {},
            )],
            Self::LagoonFeeRates => vec![
                FieldCall::at_word(FieldName::ManagementFee, target, &ILagoonVault::feeRatesCall {}, 0),
                FieldCall::at_word(FieldName::PerformanceFee, target, &ILagoonVault::feeRatesCall {}, 1),
            ],
            Self::IporFeeData => vec![
                FieldCall::at_word(
                    FieldName::PerformanceFee,
                    target,
                    &IIporFusion::getPerformanceFeeDataCall {},
                    1,
                ),
                FieldCall::at_word(
                    FieldName::ManagementFee,
                    target,
                    &IIporFusion::getManagementFeeDataCall {},
                    1,
                ),
            ],
        }
    }
}

/// Data-driven capability for one protocol family.
#[derive(Debug, Clone)]
pub struct ProtocolCapability {
    pub name: String,
    pub fee_mode: FeeMode,
    pub redemption: RedemptionStrategy,
    pub fees: Vec<FeeSource>,
}

impl ProtocolCapability {
    pub fn new(name: impl Into<String>, fee_mode: FeeMode, redemption: RedemptionStrategy) -> Self {
        Self {
            name: name.into(),
            fee_mode,
            redemption,
            fees: Vec::new(),
        }
    }

    pub fn with_fees(mut self, fees: impl IntoIterator<Item = FeeSource>) -> Self {
        self.fees.extend(fees);
        self
    }
}

impl VaultCapability for ProtocolCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn fee_mode(&self) -> FeeMode {
        self.fee_mode
    }

    fn redemption(&self) -> RedemptionStrategy {
        self.redemption
    }

    fn fee_fields(&self, vault: &VaultDescriptor) -> Vec<FieldCall> {
        self.fees.iter().flat_map(|f| f.fields(vault)).collect()
    }
}

/// Maps feature tags to capabilities. Plain data, passed in at construction.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    entries: Vec<(FeatureTag, Arc<dyn VaultCapability>)>,
    fallback: Arc<dyn VaultCapability>,
}

impl CapabilityTable {
    pub fn new(fallback: Arc<dyn VaultCapability>) -> Self {
        Self {
            entries: Vec::new(),
            fallback,
        }
    }

    pub fn with(mut self, tag: FeatureTag, capability: Arc<dyn VaultCapability>) -> Self {
        self.entries.push((tag, capability));
        self
    }

    /// Capability for a vault. `None` for broken vaults; the generic fallback
    /// when no family or more than one family matches.
    pub fn resolve(&self, features: &FeatureSet) -> Option<Arc<dyn VaultCapability>> {
        if features.is_broken() {
            return None;
        }

        let mut matched = self.entries.iter().filter(|(tag, _)| features.has(*tag));
        match (matched.next(), matched.next()) {
            (Some((_, capability)), None) => Some(capability.clone()),
            (None, _) => Some(self.fallback.clone()),
            (Some(_), Some(_)) => {
                warn!(
                    target: "vault_ingest::history",
                    address = %features.address,
                    tags = ?features.tags,
                    "several protocol capabilities match, using the generic one"
                );
                Some(self.fallback.clone())
            }
        }
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        use FeeMode::*;
        use RedemptionStrategy::*;

        let plain = ProtocolCapability::new("erc4626", Undocumented, IdleAssets);

        Self::new(Arc::new(plain))
            .with(
                FeatureTag::IporFusion,
                Arc::new(
                    ProtocolCapability::new("ipor_fusion", Internalised, IdleAssets)
                        .with_fees([FeeSource::IporFeeData]),
                ),
            )
            .with(
                FeatureTag::MetaMorpho,
                Arc::new(
                    ProtocolCapability::new("meta_morpho", Internalised, IdleAssets)
                        .with_fees([FeeSource::MetaMorphoFee]),
                ),
            )
            .with(
                FeatureTag::EulerEarn,
                Arc::new(
                    ProtocolCapability::new("euler_earn", Internalised, IdleAssets)
                        .with_fees([FeeSource::EulerPerformanceFee]),
                ),
            )
            .with(
                FeatureTag::Lagoon,
                Arc::new(
                    ProtocolCapability::new("lagoon", Internalised, MaxRedeem)
                        .with_fees([FeeSource::LagoonFeeRates]),
                ),
            )
            .with(
                FeatureTag::YearnV3,
                Arc::new(ProtocolCapability::new("yearn_v3", Externalised, IdleAssets)),
            )
            .with(
                FeatureTag::Harvest,
                Arc::new(ProtocolCapability::new("harvest", Undocumented, IdleAssets)),
            )
            .with(
                FeatureTag::Gearbox,
                Arc::new(ProtocolCapability::new("gearbox", Externalised, IdleAssets)),
            )
            .with(
                FeatureTag::Umami,
                Arc::new(ProtocolCapability::new("umami", Undocumented, MaxRedeem)),
            )
    }
}
