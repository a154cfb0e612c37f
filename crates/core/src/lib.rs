//! Indexer core logic.
//!
//! This crate provides the indexing pipeline on top of `indexer-chain`:
//! - Layered configuration (TOML file, `${VAR}` expansion, env overrides)
//! - Contract registry with event-driven discovery
//! - Event ingestion: chunked fetch, decode, timestamping
//! - State reconstruction for positions, challenges, minters, collateral
//!   and the system aggregate
//! - Storage behind the `Store` trait (SQLite, in-memory)
//! - The sync controller committing one block window at a time

pub mod config;
mod ingest;
mod reconstruct;
mod registry;
pub mod state;
pub mod store;
mod sync;
pub mod types;
pub mod u256_math;

pub use config::{load_config, load_config_from_env, IndexerConfig};
pub use ingest::EventIngestor;
pub use reconstruct::{aggregate_collaterals, CoreAddresses, StateReconstructor, WindowContext, WindowStates};
pub use registry::ContractRegistry;
pub use state::{
    ChallengeState, ChallengeStatus, CollateralState, MinterKind, MinterState, MinterStatus,
    PositionState, PositionStatus, SkippedBlock, SystemState,
};
pub use store::{
    BlockRange, ChallengeFilter, EventFilter, MemoryStore, MinterFilter, PositionFilter, SqliteStore, Store,
};
pub use sync::{
    CycleReport, HealthSnapshot, SyncController, SyncSettings, SyncStatus, TriggerOutcome,
};
pub use types::{CommitSummary, ContractRecord, EventKey, RawEvent, WindowBatch};
