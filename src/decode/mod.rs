//! Payload decoding into canonical records.
//!
//! Primary-stream notifications carry ABI-encoded event data; relay frames
//! carry loosely-typed JSON whose field names drift between camelCase and
//! snake_case. Both are normalised here into a [`CanonicalRecord`].
//!
//! Decoding never fails: a payload that cannot be strictly decoded goes
//! through field-presence extraction, and anything still missing takes a
//! deterministic default. Problems are reported as warnings only. No unit
//! conversion happens here; amounts keep whatever scale the source used.

pub mod abi;
mod fields;
mod tables;

pub use fields::{FieldKind, FieldSpec};

use crate::events::{CanonicalRecord, EventCategory};
use alloy::primitives::{hex, keccak256, Bytes};
use fields::FieldSet;
use serde_json::Value;
use std::borrow::Cow;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload length {0} is not a multiple of 32")]
    Misaligned(usize),
    #[error("payload too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("unexpected trailing bytes: expected {expected}, got {actual}")]
    TrailingBytes { expected: usize, actual: usize },
    #[error("param {index}: address word has non-zero upper bytes")]
    InvalidAddress { index: usize },
    #[error("param {index}: bool word is neither 0 nor 1")]
    InvalidBool { index: usize },
    #[error("param {index}: invalid dynamic offset")]
    InvalidOffset { index: usize },
    #[error("param {index}: text is not valid UTF-8")]
    InvalidUtf8 { index: usize },
    #[error("field {field}: value does not fit in u64")]
    Overflow { field: &'static str },
    #[error("field {field}: decoded type does not match its kind")]
    KindMismatch { field: &'static str },
    #[error("invalid hex payload: {0}")]
    Hex(String),
}

/// A payload as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// ABI-encoded event data.
    Binary(Bytes),
    /// Structured JSON, possibly wrapping hex event data under `data`.
    Object(Value),
}

impl From<Value> for RawPayload {
    fn from(value: Value) -> Self {
        Self::Object(value)
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes.into())
    }
}

/// Ordered field table for `category`.
pub fn field_table(category: EventCategory) -> &'static [FieldSpec] {
    tables::fields(category)
}

/// Canonical schema signature, e.g. `BetPlaced(uint256 poolId,...)`.
pub fn schema_signature(category: EventCategory) -> String {
    tables::signature(category)
}

/// keccak256 of the schema signature, 0x-prefixed.
pub fn schema_id(category: EventCategory) -> String {
    hex::encode_prefixed(keccak256(schema_signature(category).as_bytes()))
}

/// Decode `raw` into the canonical record for `category`.
pub fn decode(category: EventCategory, raw: &RawPayload) -> CanonicalRecord {
    let table = tables::fields(category);

    let set = match binary_blob(raw) {
        Some(Ok(bytes)) => match strict(table, &bytes) {
            Ok(set) => set,
            Err(e) => {
                warn!(
                    category = %category,
                    error = %e,
                    len = bytes.len(),
                    "strict decode failed, falling back to field extraction"
                );
                extract(category, table, raw)
            }
        },
        Some(Err(e)) => {
            warn!(category = %category, error = %e, "undecodable hex payload");
            extract(category, table, raw)
        }
        None => extract(category, table, raw),
    };

    tables::build(category, &set)
}

fn strict(table: &[FieldSpec], bytes: &[u8]) -> Result<FieldSet, DecodeError> {
    let params: Vec<abi::AbiType> = table.iter().map(|f| f.abi).collect();
    let tokens = abi::decode_params(bytes, &params)?;
    FieldSet::from_tokens(table, tokens)
}

fn is_hex_blob(s: &str) -> bool {
    s.starts_with("0x")
}

fn from_hex(s: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| DecodeError::Hex(e.to_string()))
}

/// The binary blob a payload carries, if any.
fn binary_blob(raw: &RawPayload) -> Option<Result<Cow<'_, [u8]>, DecodeError>> {
    match raw {
        RawPayload::Binary(bytes) => Some(Ok(Cow::Borrowed(bytes.as_ref()))),
        RawPayload::Object(Value::String(s)) if is_hex_blob(s) => Some(from_hex(s).map(Cow::Owned)),
        RawPayload::Object(Value::Object(map)) => match map.get("data") {
            Some(Value::String(s)) if is_hex_blob(s) => Some(from_hex(s).map(Cow::Owned)),
            _ => None,
        },
        RawPayload::Object(_) => None,
    }
}

fn extract(category: EventCategory, table: &[FieldSpec], raw: &RawPayload) -> FieldSet {
    match raw {
        RawPayload::Object(value @ Value::Object(_)) => {
            let (set, defaulted) = FieldSet::from_object(table, value);
            if defaulted.len() == table.len() {
                warn!(category = %category, "payload matched no known fields, using defaults");
            } else if !defaulted.is_empty() {
                debug!(category = %category, fields = ?defaulted, "defaulted missing fields");
            }
            set
        }
        _ => {
            warn!(category = %category, "payload carries no usable fields, using defaults");
            FieldSet::defaults(table)
        }
    }
}
