//! Configuration system for the indexer.
//!
//! This module provides:
//! - Runtime configuration sections (chain, contracts, rpc, fetcher, sync,
//!   storage, price, alerts)
//! - TOML loading with `${VAR}` expansion and environment overrides

mod indexer;
mod loader;

// Re-export runtime config
pub use indexer::{
    AlertsSection, ChainSection, ContractsSection, FetcherSection, IndexerConfig, PriceSection,
    RpcSection, StorageSection, SyncSection,
};

// Re-export loader
pub use loader::{load_config, load_config_from_env, DEFAULT_CONFIG_PATH};
