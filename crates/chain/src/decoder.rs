//! Log decoding against the protocol ABI map.
//!
//! Signatures from [`ContractType::event_signatures`] are parsed once into
//! dynamic descriptors keyed by `(type, topic0)`. Decoded arguments are
//! normalized into JSON:
//! - addresses as lowercase `0x` hex
//! - integers outside ±(2^53 - 1) as decimal strings
//! - bytes as `0x` hex
//!
//! A log that cannot be decoded becomes an `Unknown` record carrying its raw
//! topics and data.

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::Event;
use alloy::primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::contracts::{event_names, ContractType};
use crate::rpc::RawLog;

/// Largest integer a JSON consumer can hold exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Result of decoding one log.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub name: String,
    pub args: Value,
}

impl DecodedLog {
    pub fn is_unknown(&self) -> bool {
        self.name == event_names::UNKNOWN
    }
}

/// ABI-driven log decoder.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    events: HashMap<(ContractType, B256), Event>,
}

impl EventDecoder {
    pub fn new() -> Result<Self> {
        let mut events = HashMap::new();
        for kind in ContractType::ALL {
            for signature in kind.event_signatures() {
                let event = Event::parse(signature)
                    .with_context(|| format!("Invalid event signature for {}: {}", kind, signature))?;
                events.insert((kind, event.selector()), event);
            }
        }
        debug!(events = events.len(), "Event decoder initialized");
        Ok(Self { events })
    }

    /// topic0 values for every event of `kind`.
    pub fn topics(&self, kind: ContractType) -> Vec<B256> {
        let mut topics: Vec<B256> = self
            .events
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, topic)| *topic)
            .collect();
        topics.sort();
        topics
    }

    /// topic0 of a named event of `kind`.
    pub fn topic(&self, kind: ContractType, name: &str) -> Option<B256> {
        self.events
            .iter()
            .find(|((k, _), event)| *k == kind && event.name == name)
            .map(|((_, topic), _)| *topic)
    }

    pub fn decode(&self, kind: ContractType, log: &RawLog) -> DecodedLog {
        let Some(event) = log.topic0().and_then(|t| self.events.get(&(kind, t))) else {
            return unknown(log);
        };

        let decoded = match event.decode_log_parts(log.topics.iter().copied(), &log.data, true) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(
                    event = %event.name,
                    tx = %log.tx_hash,
                    error = %e,
                    "Failed to decode log"
                );
                return unknown(log);
            }
        };

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut args = Map::new();

        for (i, input) in event.inputs.iter().enumerate() {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            };
            let Some(value) = value else {
                return unknown(log);
            };
            let name = if input.name.is_empty() {
                format!("arg{}", i)
            } else {
                input.name.clone()
            };
            args.insert(name, to_json(&value));
        }

        DecodedLog {
            name: event.name.clone(),
            args: Value::Object(args),
        }
    }
}

fn unknown(log: &RawLog) -> DecodedLog {
    let topics: Vec<String> = log.topics.iter().map(|t| hex_string(t.as_slice())).collect();
    DecodedLog {
        name: event_names::UNKNOWN.to_string(),
        args: json!({
            "topics": topics,
            "data": hex_string(&log.data),
        }),
    }
}

/// Lowercase `0x`-prefixed address.
pub fn normalize_address(address: &Address) -> String {
    hex_string(address.as_slice())
}

fn hex_string(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// JSON form of an unsigned integer.
pub fn uint_to_json(value: U256) -> Value {
    if value <= U256::from(MAX_SAFE_INTEGER) {
        Value::from(value.to::<u64>())
    } else {
        Value::String(value.to_string())
    }
}

/// Normalize a decoded ABI value.
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Address(a) => Value::String(normalize_address(a)),
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(u, _) => uint_to_json(*u),
        DynSolValue::Int(i, _) => {
            let magnitude = i.unsigned_abs();
            if magnitude <= U256::from(MAX_SAFE_INTEGER) {
                let v = magnitude.to::<u64>() as i64;
                Value::from(if i.is_negative() { -v } else { v })
            } else {
                Value::String(i.to_string())
            }
        }
        DynSolValue::FixedBytes(word, size) => Value::String(hex_string(&word[..*size])),
        DynSolValue::Bytes(b) => Value::String(hex_string(b)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Function(f) => Value::String(hex_string(f.as_slice())),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
