//! RPC failure taxonomy.
//!
//! Every node failure is classified once, at the edge, into one of:
//! - `Transient`: rate limits, 5xx, connection resets. Retried with backoff.
//! - `Timeout`: an attempt exceeded its deadline. Treated as transient.
//! - `Fatal`: reverts, bad arguments, oversized responses. Never retried.

use std::fmt::Display;
use thiserror::Error;

/// Message fragments that mark a deterministic failure.
const FATAL_MARKERS: &[&str] = &[
    "payload too large",
    "error 413",
    "response size",
    "query returned more than",
    "log response size exceeded",
    "execution reverted",
    "revert",
    "invalid argument",
    "invalid params",
    "-32602",
];

/// A classified node failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("{op}: transient rpc failure: {message}")]
    Transient { op: &'static str, message: String },

    #[error("{op}: rpc attempt timed out after {elapsed_ms}ms")]
    Timeout { op: &'static str, elapsed_ms: u64 },

    #[error("{op}: fatal rpc failure: {message}")]
    Fatal { op: &'static str, message: String },
}

impl RpcError {
    /// Classify an arbitrary transport error by its rendered message.
    ///
    /// Rate limits, 5xx, resets and anything unrecognised are transient.
    /// A revert reported through a 500 response is still fatal.
    pub fn classify(op: &'static str, err: impl Display) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();

        if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::Fatal { op, message }
        } else {
            Self::Transient { op, message }
        }
    }

    pub fn transient(op: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            op,
            message: message.into(),
        }
    }

    pub fn fatal(op: &'static str, message: impl Into<String>) -> Self {
        Self::Fatal {
            op,
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Name of the node operation that failed.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Transient { op, .. } | Self::Timeout { op, .. } | Self::Fatal { op, .. } => op,
        }
    }
}

/// Find a fatal `RpcError` anywhere in an error chain.
pub fn is_fatal_rpc(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<RpcError>())
        .any(RpcError::is_fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_rate_limit_is_transient() {
        let err = RpcError::classify("eth_getLogs", "HTTP error 429 with body: Too Many Requests");
        assert!(err.is_transient());
        assert_eq!(err.op(), "eth_getLogs");
    }

    #[test]
    fn test_server_errors_are_transient() {
        for msg in ["HTTP error 503", "connection reset by peer", "request timed out"] {
            assert!(RpcError::classify("eth_blockNumber", msg).is_transient(), "{msg}");
        }
    }

    #[test]
    fn test_deterministic_failures_are_fatal() {
        for msg in [
            "server returned an error response: error code 3: execution reverted",
            "error code -32602: invalid argument 0: hex string without 0x prefix",
            "HTTP error 413 with body: Payload Too Large",
            "query returned more than 10000 results",
        ] {
            assert!(RpcError::classify("eth_call", msg).is_fatal(), "{msg}");
        }
    }

    #[test]
    fn test_fatal_wins_over_transient() {
        let err = RpcError::classify("eth_call", "HTTP error 500: execution reverted");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_is_transient() {
        assert!(RpcError::classify("eth_call", "something odd").is_transient());
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = RpcError::Timeout {
            op: "eth_getLogs",
            elapsed_ms: 100,
        };
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_found_through_context() {
        let err: anyhow::Error = Err::<(), _>(RpcError::fatal("eth_getLogs", "execution reverted"))
            .context("fetching window")
            .unwrap_err();
        assert!(is_fatal_rpc(&err));

        let transient: anyhow::Error = RpcError::transient("eth_getLogs", "429").into();
        assert!(!is_fatal_rpc(&transient));
        assert!(!is_fatal_rpc(&anyhow::anyhow!("database is locked")));
    }
}
