//! Indexer chain interaction layer.
//!
//! This crate provides:
//! - A `ChainRpc` node abstraction with an Alloy HTTP implementation
//! - Multicall3 batching of read-only calls
//! - The RPC gateway: per-attempt deadlines, jittered backoff, block cache
//! - Transient/fatal error classification
//! - Contract types, event ABI map and dynamic log decoding
//! - Chunked, adaptive-concurrency log fetching
//!
//! Enable the `test-utils` feature for `MockRpc`, an in-memory node.

pub mod contracts;
mod decoder;
mod error;
mod fetcher;
mod gateway;
mod retry;
mod rpc;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use contracts::{event_names, ContractType};
pub use decoder::{normalize_address, to_json, uint_to_json, DecodedLog, EventDecoder, MAX_SAFE_INTEGER};
pub use error::{is_fatal_rpc, RpcError};
pub use fetcher::{
    chunk_ranges, BatchedEventFetcher, FetchJob, FetchOutcome, FetchQueue, FetchStats,
    FetcherSettings,
};
pub use gateway::RpcGateway;
pub use retry::RetryPolicy;
pub use rpc::{AlloyRpc, BlockInfo, ChainRpc, LogQuery, RawLog, ReadCall, MULTICALL3_ADDRESS};
