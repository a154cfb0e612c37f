//! Indexer runtime configuration.
//!
//! Every field has a serde default so a partial TOML file (or none at all)
//! yields a runnable configuration once the core contract addresses are set.

use alloy::primitives::Address;
use indexer_chain::{ContractType, FetcherSettings, RetryPolicy, MULTICALL3_ADDRESS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Target chain
    #[serde(default)]
    pub chain: ChainSection,

    /// Core protocol contract addresses
    #[serde(default)]
    pub contracts: ContractsSection,

    /// Node request retry and caching
    #[serde(default)]
    pub rpc: RpcSection,

    /// Log fetch chunking and concurrency
    #[serde(default)]
    pub fetcher: FetcherSection,

    /// Scheduler and window sizing
    #[serde(default)]
    pub sync: SyncSection,

    /// Persistence
    #[serde(default)]
    pub storage: StorageSection,

    /// External price feed
    #[serde(default)]
    pub price: PriceSection,

    /// Critical alert delivery
    #[serde(default)]
    pub alerts: AlertsSection,
}

/// Chain connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    /// HTTP RPC endpoint (supports ${VAR} expansion)
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Chain ID
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Block the protocol was deployed in; indexing starts here
    #[serde(default)]
    pub deployment_block: u64,

    /// Blocks behind head treated as not yet final
    #[serde(default)]
    pub confirmations: u64,
}

fn default_rpc_url() -> String {
    "http://localhost:8545".to_string()
}
fn default_chain_id() -> u64 {
    1
}

impl Default for ChainSection {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            chain_id: default_chain_id(),
            deployment_block: 0,
            confirmations: 0,
        }
    }
}

/// Fixed protocol contracts seeded into the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractsSection {
    pub token: Option<Address>,
    pub equity: Option<Address>,
    pub deps: Option<Address>,
    pub savings: Option<Address>,
    pub frontend_gateway: Option<Address>,
    pub minting_hub: Option<Address>,
    pub roller: Option<Address>,
}

impl ContractsSection {
    /// Configured core contracts with their types.
    pub fn core_contracts(&self) -> Vec<(ContractType, Address)> {
        [
            (ContractType::CoreToken, self.token),
            (ContractType::CoreEquity, self.equity),
            (ContractType::CoreDeps, self.deps),
            (ContractType::CoreSavings, self.savings),
            (ContractType::CoreFrontendGateway, self.frontend_gateway),
            (ContractType::CoreMintingHub, self.minting_hub),
            (ContractType::CoreRoller, self.roller),
        ]
        .into_iter()
        .filter_map(|(kind, address)| address.map(|a| (kind, a)))
        .collect()
    }
}

/// RPC gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSection {
    /// Deadline per attempt (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Total tries per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff growth factor
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Backoff cap (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Cached block headers
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: usize,

    /// Multicall3 deployment used for batched reads
    #[serde(default = "default_multicall")]
    pub multicall_address: Address,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_block_cache_size() -> usize {
    1_024
}
fn default_multicall() -> Address {
    MULTICALL3_ADDRESS
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            block_cache_size: default_block_cache_size(),
            multicall_address: default_multicall(),
        }
    }
}

impl RpcSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            attempt_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Log fetcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherSection {
    /// Blocks per log query
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Initial parallel queries
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Concurrency halvings before a failing wave is abandoned
    #[serde(default = "default_max_wave_retries")]
    pub max_wave_retries: u32,
}

fn default_chunk_size() -> u64 {
    500
}
fn default_concurrency() -> usize {
    30
}
fn default_max_wave_retries() -> u32 {
    3
}

impl Default for FetcherSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            max_wave_retries: default_max_wave_retries(),
        }
    }
}

impl FetcherSection {
    pub fn settings(&self) -> FetcherSettings {
        FetcherSettings {
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            max_wave_retries: self.max_wave_retries,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Blocks per committed window
    #[serde(default = "default_window_size")]
    pub window_size: u64,

    /// Seconds between cycle triggers
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Consecutive failed cycles before a critical alert
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,

    /// Parallel state refresh reads
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
}

fn default_window_size() -> u64 {
    2_000
}
fn default_interval_secs() -> u64 {
    60
}
fn default_failure_alert_threshold() -> u32 {
    5
}
fn default_read_concurrency() -> usize {
    8
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            interval_secs: default_interval_secs(),
            failure_alert_threshold: default_failure_alert_threshold(),
            read_concurrency: default_read_concurrency(),
        }
    }
}

impl SyncSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// SQLite URL, e.g. `sqlite://indexer.db`
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_database_url() -> String {
    "sqlite://indexer.db".to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

/// Price feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSection {
    /// Query the external feed at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// CoinGecko-compatible API base
    #[serde(default = "default_price_api_url")]
    pub api_url: String,

    /// Asset platform id (e.g. "ethereum")
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Cache TTL (seconds)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Request deadline (milliseconds)
    #[serde(default = "default_price_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_price_api_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}
fn default_platform() -> String {
    "ethereum".to_string()
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_price_timeout_ms() -> u64 {
    5_000
}

impl Default for PriceSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            api_url: default_price_api_url(),
            platform: default_platform(),
            cache_ttl_secs: default_cache_ttl_secs(),
            timeout_ms: default_price_timeout_ms(),
        }
    }
}

impl PriceSection {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Alert delivery settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsSection {
    /// Deliver to Telegram instead of the log
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub telegram_bot_token: String,

    #[serde(default)]
    pub telegram_chat_id: String,
}

impl IndexerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject configurations the indexer cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.contracts.token.is_none() {
            anyhow::bail!("contracts.token is required");
        }
        if self.contracts.minting_hub.is_none() {
            anyhow::bail!("contracts.minting_hub is required");
        }
        if self.sync.window_size == 0 {
            anyhow::bail!("sync.window_size must be positive");
        }
        if self.fetcher.chunk_size == 0 {
            anyhow::bail!("fetcher.chunk_size must be positive");
        }
        if self.rpc.max_attempts == 0 {
            anyhow::bail!("rpc.max_attempts must be positive");
        }
        if self.alerts.enabled
            && (self.alerts.telegram_bot_token.is_empty() || self.alerts.telegram_chat_id.is_empty())
        {
            anyhow::bail!("alerts.enabled requires telegram_bot_token and telegram_chat_id");
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(
            chain_id = self.chain.chain_id,
            deployment_block = self.chain.deployment_block,
            confirmations = self.chain.confirmations,
            "Indexer configuration loaded"
        );
        tracing::info!(
            core_contracts = self.contracts.core_contracts().len(),
            multicall = %self.rpc.multicall_address,
            "Contracts"
        );
        tracing::info!(
            timeout_ms = self.rpc.timeout_ms,
            max_attempts = self.rpc.max_attempts,
            base_delay_ms = self.rpc.base_delay_ms,
            max_delay_ms = self.rpc.max_delay_ms,
            "RPC retry policy"
        );
        tracing::info!(
            chunk_size = self.fetcher.chunk_size,
            concurrency = self.fetcher.concurrency,
            window_size = self.sync.window_size,
            interval_secs = self.sync.interval_secs,
            "Fetch and sync sizing"
        );
        tracing::info!(
            price_feed = self.price.enabled,
            price_ttl_secs = self.price.cache_ttl_secs,
            telegram_alerts = self.alerts.enabled,
            "External services"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IndexerConfig::default();
        assert_eq!(config.fetcher.chunk_size, 500);
        assert_eq!(config.fetcher.concurrency, 30);
        assert_eq!(config.chain.confirmations, 0);
        assert_eq!(config.rpc.multicall_address, MULTICALL3_ADDRESS);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: IndexerConfig = toml::from_str(
            r#"
            [chain]
            deployment_block = 18_000_000

            [contracts]
            token = "0xB58E61C3098d85632Df34EecfB899A1Ed80921cB"
            minting_hub = "0xDe12B620A8a714476A97EfD14E6F7180Ca653557"

            [sync]
            window_size = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.chain.deployment_block, 18_000_000);
        assert_eq!(config.chain.rpc_url, "http://localhost:8545");
        assert_eq!(config.sync.window_size, 500);
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.contracts.core_contracts().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_mapping() {
        let rpc = RpcSection {
            max_attempts: 3,
            base_delay_ms: 100,
            ..Default::default()
        };
        let policy = rpc.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_alerts_require_credentials() {
        let mut config = IndexerConfig::default();
        config.contracts.token = Some(Address::repeat_byte(1));
        config.contracts.minting_hub = Some(Address::repeat_byte(2));
        config.alerts.enabled = true;
        assert!(config.validate().is_err());

        config.alerts.telegram_bot_token = "t".into();
        config.alerts.telegram_chat_id = "c".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialization() {
        let mut config = IndexerConfig::default();
        config.contracts.token = Some(Address::repeat_byte(1));
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: IndexerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.contracts.token, config.contracts.token);
        assert_eq!(parsed.sync.window_size, config.sync.window_size);
    }
}
