use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use super::VaultDescriptor;
use crate::{
    contracts::{IERC20, IERC4626},
    types::{CallResult, EncodedCall, ReturnShape},
};

/// Named numeric value recorded on a historical point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldName {
    /// assets per one whole share
    SharePrice,
    TotalAssets,
    TotalSupply,
    MaxDeposit,
    MaxRedeem,
    /// underlying asset held by the vault itself
    IdleAssets,
    PerformanceFee,
    ManagementFee,
    /// derived from other fields by the vault's redemption strategy
    RedeemableAssets,
}

/// One call feeding one field; the value is the `word`-th return word.
#[derive(Debug, Clone)]
pub struct FieldCall {
    pub name: FieldName,
    pub call: EncodedCall,
    pub word: usize,
}

impl FieldCall {
    pub fn new<C: alloy_sol_types::SolCall>(name: FieldName, target: Address, call: &C) -> Self {
        Self::at_word(name, target, call, 0)
    }

    pub fn at_word<C: alloy_sol_types::SolCall>(
        name: FieldName,
        target: Address,
        call: &C,
        word: usize,
    ) -> Self {
        Self {
            name,
            call: EncodedCall::new(target, call)
                .with_shape(ReturnShape::Words(word + 1))
                .with_tag(name.to_string()),
            word,
        }
    }

    /// Reads the field out of the call's result.
    pub fn decode(&self, result: &CallResult) -> Result<U256, FieldError> {
        let data = result.outcome.as_ref().map_err(|failure| FieldError {
            field: self.name,
            reason: failure.reason.to_string(),
        })?;

        data.get(self.word * 32..(self.word + 1) * 32)
            .map(U256::from_be_slice)
            .ok_or_else(|| FieldError {
                field: self.name,
                reason: format!("return data too short for word {}", self.word),
            })
    }
}

/// A field whose call failed or returned something unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: FieldName,
    pub reason: String,
}

/// Fields sampled on every vault regardless of protocol.
pub fn base_fields(vault: &VaultDescriptor) -> Vec<FieldCall> {
    let target = vault.id.address;
    vec![
        FieldCall::new(
            FieldName::SharePrice,
            target,
            &IERC4626::convertToAssetsCall {
                shares: vault.share_unit,
            },
        ),
        FieldCall::new(FieldName::TotalAssets, target, &IERC4626::totalAssetsCall {}),
        FieldCall::new(FieldName::TotalSupply, target, &IERC20::totalSupplyCall {}),
        FieldCall::new(
            FieldName::MaxDeposit,
            target,
            &IERC4626::maxDepositCall {
                receiver: Address::ZERO,
            },
        ),
        FieldCall::new(
            FieldName::MaxRedeem,
            target,
            &IERC4626::maxRedeemCall {
                owner: Address::ZERO,
            },
        ),
    ]
}

/// `asset.balanceOf(vault)`.
pub fn idle_assets(vault: &VaultDescriptor) -> FieldCall {
    FieldCall::new(
        FieldName::IdleAssets,
        vault.asset,
        &IERC20::balanceOfCall {
            account: vault.id.address,
        },
    )
}
