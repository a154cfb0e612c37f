//! Protocol contract types and their event ABI.
//!
//! Every watched address has a `ContractType`. The type selects which
//! events are queried for that address and which descriptors decode them.
//! Read-only call interfaces live in [`bindings`].

pub mod bindings;

pub use bindings::{
    IBridge, IEquity, IERC20, IMintingHub, IMulticall3, IPosition, ISavings, IStablecoin,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Semantic type of a watched contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContractType {
    CoreToken,
    CoreEquity,
    CoreDeps,
    CoreSavings,
    CoreFrontendGateway,
    CoreMintingHub,
    CoreRoller,
    Position,
    Minter,
    Bridge,
}

impl ContractType {
    pub const ALL: [ContractType; 10] = [
        Self::CoreToken,
        Self::CoreEquity,
        Self::CoreDeps,
        Self::CoreSavings,
        Self::CoreFrontendGateway,
        Self::CoreMintingHub,
        Self::CoreRoller,
        Self::Position,
        Self::Minter,
        Self::Bridge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoreToken => "CoreToken",
            Self::CoreEquity => "CoreEquity",
            Self::CoreDeps => "CoreDeps",
            Self::CoreSavings => "CoreSavings",
            Self::CoreFrontendGateway => "CoreFrontendGateway",
            Self::CoreMintingHub => "CoreMintingHub",
            Self::CoreRoller => "CoreRoller",
            Self::Position => "Position",
            Self::Minter => "Minter",
            Self::Bridge => "Bridge",
        }
    }

    /// Seeded from configuration rather than discovered.
    pub fn is_core(&self) -> bool {
        !matches!(self, Self::Position | Self::Minter | Self::Bridge)
    }

    /// Human-readable signatures of the events this type emits.
    pub fn event_signatures(&self) -> &'static [&'static str] {
        match self {
            Self::CoreToken => TOKEN_EVENTS,
            Self::CoreEquity => EQUITY_EVENTS,
            Self::CoreDeps => DEPS_EVENTS,
            Self::CoreSavings => SAVINGS_EVENTS,
            Self::CoreFrontendGateway => FRONTEND_GATEWAY_EVENTS,
            Self::CoreMintingHub => MINTING_HUB_EVENTS,
            Self::CoreRoller => ROLLER_EVENTS,
            Self::Position => POSITION_EVENTS,
            Self::Minter | Self::Bridge => &[],
        }
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown contract type: {}", s))
    }
}

const TRANSFER: &str = "event Transfer(address indexed from, address indexed to, uint256 value)";

const TOKEN_EVENTS: &[&str] = &[
    TRANSFER,
    "event MinterApplied(address indexed minter, uint256 applicationPeriod, uint256 applicationFee, string message)",
    "event MinterDenied(address indexed minter, string message)",
    "event Loss(address indexed reportingMinter, uint256 amount)",
    "event Profit(address indexed reportingMinter, uint256 amount)",
    "event ProfitDistributed(address indexed recipient, uint256 amount)",
];

const EQUITY_EVENTS: &[&str] = &[
    TRANSFER,
    "event Trade(address who, int256 amount, uint256 totPrice, uint256 newprice)",
    "event Delegation(address indexed from, address indexed to)",
];

const DEPS_EVENTS: &[&str] = &[TRANSFER];

const SAVINGS_EVENTS: &[&str] = &[
    "event Saved(address indexed account, uint192 amount)",
    "event InterestCollected(address indexed account, uint256 interest)",
    "event Withdrawn(address indexed account, uint192 amount)",
    "event RateProposed(address who, uint24 nextRate, uint40 nextChange)",
    "event RateChanged(uint24 newRate)",
];

const FRONTEND_GATEWAY_EVENTS: &[&str] = &[
    "event FrontendCodeRegistered(address owner, bytes32 frontendCode)",
    "event FrontendCodeTransferred(address from, address to, bytes32 frontendCode)",
    "event FrontendCodeRewardsWithdrawn(address to, uint256 amount, bytes32 frontendCode)",
    "event NewPositionRegistered(address position, bytes32 frontendCode)",
    "event InvestRewardAdded(bytes32 frontendCode, address user, uint256 amount, uint256 reward)",
];

const MINTING_HUB_EVENTS: &[&str] = &[
    "event PositionOpened(address indexed owner, address indexed position, address original, address collateral)",
    "event ChallengeStarted(address indexed challenger, address indexed position, uint256 size, uint256 number)",
    "event ChallengeAverted(address indexed position, uint256 number, uint256 size)",
    "event ChallengeSucceeded(address indexed position, uint256 number, uint256 bid, uint256 acquiredCollateral, uint256 challengeSize)",
    "event PostponedReturn(address collateral, address indexed beneficiary, uint256 amount)",
    "event ForcedSale(address pos, uint256 amount, uint256 priceE36MinusDecimals)",
];

const ROLLER_EVENTS: &[&str] = &[
    "event Roll(address source, uint256 collWithdraw, uint256 repay, address target, uint256 collDeposit, uint256 mint)",
];

const POSITION_EVENTS: &[&str] = &[
    "event MintingUpdate(uint256 collateral, uint256 price, uint256 principal)",
    "event PositionDenied(address indexed sender, string message)",
    "event OwnershipTransferred(address indexed previousOwner, address indexed newOwner)",
];

/// Event names the indexer reacts to.
pub mod event_names {
    pub const TRANSFER: &str = "Transfer";
    pub const MINTER_APPLIED: &str = "MinterApplied";
    pub const MINTER_DENIED: &str = "MinterDenied";
    pub const LOSS: &str = "Loss";
    pub const PROFIT: &str = "Profit";
    pub const TRADE: &str = "Trade";
    pub const POSITION_OPENED: &str = "PositionOpened";
    pub const CHALLENGE_STARTED: &str = "ChallengeStarted";
    pub const CHALLENGE_AVERTED: &str = "ChallengeAverted";
    pub const CHALLENGE_SUCCEEDED: &str = "ChallengeSucceeded";
    pub const MINTING_UPDATE: &str = "MintingUpdate";
    pub const POSITION_DENIED: &str = "PositionDenied";
    pub const OWNERSHIP_TRANSFERRED: &str = "OwnershipTransferred";
    pub const UNKNOWN: &str = "Unknown";
}
