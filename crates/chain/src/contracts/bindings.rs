//! Read-only call interfaces for protocol contracts.
//!
//! Only view functions the state readers batch together are declared.
//! Calls are encoded with `ReadCall::new` and decoded with
//! `abi_decode_returns`. Narrow integers (`uint24`, `uint40`) come back as
//! `Uint<N, L>` and are widened with `.to::<u64>()`.

use alloy::sol;

sol! {
    /// Collateralized debt position.
    interface IPosition {
        function owner() external view returns (address);
        function original() external view returns (address);
        function collateral() external view returns (address);
        function price() external view returns (uint256);
        function virtualPrice() external view returns (uint256);
        function principal() external view returns (uint256);
        function getInterest() external view returns (uint256);
        function getDebt() external view returns (uint256);
        function limit() external view returns (uint256);
        function availableForMinting() external view returns (uint256);
        function riskPremiumPPM() external view returns (uint24);
        function reserveContribution() external view returns (uint24);
        function fixedAnnualRatePPM() external view returns (uint24);
        function minimumCollateral() external view returns (uint256);
        function challengePeriod() external view returns (uint40);
        function start() external view returns (uint40);
        function cooldown() external view returns (uint40);
        function expiration() external view returns (uint40);
        function lastAccrual() external view returns (uint40);
        function challengedAmount() external view returns (uint256);
        function isClosed() external view returns (bool);
    }
}

sol! {
    /// ERC20 subset used for collateral metadata and balances.
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
        function totalSupply() external view returns (uint256);
    }
}

sol! {
    interface IMintingHub {
        function price(uint32 challengeNumber) external view returns (uint256);
    }
}

sol! {
    interface IStablecoin {
        function minterReserve() external view returns (uint256);
        function equity() external view returns (uint256);
    }
}

sol! {
    interface IEquity {
        function price() external view returns (uint256);
        function totalSupply() external view returns (uint256);
    }
}

sol! {
    interface ISavings {
        function currentRatePPM() external view returns (uint24);
    }
}

sol! {
    /// Stablecoin bridge minter. Only bridges expose `horizon()`.
    interface IBridge {
        function usd() external view returns (address);
        function limit() external view returns (uint256);
        function minted() external view returns (uint256);
        function horizon() external view returns (uint256);
    }
}

sol! {
    #[sol(rpc)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Call3Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Call3Result[] memory returnData);
    }
}
