use alloy_primitives::{address, Address};
use alloy_sol_types::sol;

/// Canonical Multicall3 deployment, same address on every EVM chain it exists on.
pub const MULTICALL3_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Aggregate3Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Aggregate3Result[] memory returnData);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IERC20 {
        function decimals() external view returns (uint8);
        function totalSupply() external view returns (uint256);
        function balanceOf(address account) external view returns (uint256);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IERC4626 {
        event Deposit(address indexed sender, address indexed owner, uint256 assets, uint256 shares);
        event Withdraw(address indexed sender, address indexed receiver, address indexed owner, uint256 assets, uint256 shares);

        function asset() external view returns (address);
        function totalAssets() external view returns (uint256);
        function convertToShares(uint256 assets) external view returns (uint256);
        function convertToAssets(uint256 shares) external view returns (uint256);
        function maxDeposit(address receiver) external view returns (uint256);
        function maxRedeem(address owner) external view returns (uint256);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IERC7540 {
        event DepositRequest(address indexed controller, address indexed owner, uint256 indexed requestId, address sender, uint256 assets);
        event RedeemRequest(address indexed controller, address indexed owner, uint256 indexed requestId, address sender, uint256 shares);
    }
}

// Protocol fingerprints. Each function is only implemented by one vault family
// and is called purely to see whether it answers.

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IIporFusion {
        function getPerformanceFeeData() external view returns (address feeAccount, uint16 feeInPercentage);
        function getManagementFeeData() external view returns (address feeAccount, uint16 feeInPercentage);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IMetaMorpho {
        function MORPHO() external view returns (address);
        function fee() external view returns (uint96);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IEulerEarn {
        function EVC() external view returns (address);
        function performanceFee() external view returns (uint96);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface ILagoonVault {
        function pendingSilo() external view returns (address);
        function feeRates() external view returns (uint16 managementRate, uint16 performanceRate);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IYearnV3Vault {
        function apiVersion() external view returns (string);
        function accountant() external view returns (address);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IHarvestVault {
        function vaultFractionToInvestDenominator() external view returns (uint256);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IGearboxPool {
        function poolQuotaKeeper() external view returns (address);
        function availableLiquidity() external view returns (uint256);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IUmamiVault {
        function aggregateVault() external view returns (address);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IBalancerVaultHook {
        function getVault() external view returns (address);
    }
}
