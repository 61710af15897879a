//! Field tables and normalisation of individual field values.
//!
//! A table entry carries the canonical (camelCase) field name, its ABI
//! type for binary payloads, the canonical kind it normalises to, and any
//! extra keys seen in loosely-typed JSON payloads.

use super::abi::{AbiType, Token};
use super::DecodeError;
use alloy::primitives::{hex, Address, U256};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

/// Canonical type a field normalises to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Identifier, rendered as a decimal string.
    Id,
    /// EIP-55 checksummed address string.
    Address,
    /// Decimal-string token quantity.
    Amount,
    Count,
    /// Unix seconds.
    Timestamp,
    Flag,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub abi: AbiType,
    pub kind: FieldKind,
    pub aliases: &'static [&'static str],
}

pub const fn field(
    name: &'static str,
    abi: AbiType,
    kind: FieldKind,
    aliases: &'static [&'static str],
) -> FieldSpec {
    FieldSpec {
        name,
        abi,
        kind,
        aliases,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Num(u64),
    Flag(bool),
}

impl FieldKind {
    pub fn default_value(self) -> FieldValue {
        match self {
            Self::Id | Self::Amount => FieldValue::Str("0".to_string()),
            Self::Address => FieldValue::Str(Address::ZERO.to_checksum(None)),
            Self::Count | Self::Timestamp => FieldValue::Num(0),
            Self::Flag => FieldValue::Flag(false),
            Self::Text => FieldValue::Str(String::new()),
        }
    }
}

/// Normalised values for one payload, keyed by canonical field name.
#[derive(Debug, Clone, Default)]
pub struct FieldSet {
    values: Vec<(&'static str, FieldValue)>,
}

impl FieldSet {
    pub fn defaults(fields: &[FieldSpec]) -> Self {
        Self {
            values: fields.iter().map(|f| (f.name, f.kind.default_value())).collect(),
        }
    }

    /// Build from strictly decoded tokens, in table order.
    pub fn from_tokens(fields: &[FieldSpec], tokens: Vec<Token>) -> Result<Self, DecodeError> {
        let values = fields
            .iter()
            .zip(tokens)
            .map(|(spec, token)| Ok((spec.name, normalise_token(spec, token)?)))
            .collect::<Result<Vec<_>, DecodeError>>()?;
        Ok(Self { values })
    }

    /// Field-presence extraction from a JSON object.
    ///
    /// Returns the set and the names of fields that fell back to their
    /// defaults (absent or unparseable).
    pub fn from_object(fields: &[FieldSpec], object: &Value) -> (Self, Vec<&'static str>) {
        let mut defaulted = Vec::new();
        let values = fields
            .iter()
            .map(|spec| {
                let value = lookup(object, spec).and_then(|v| normalise_json(spec.kind, v));
                let value = value.unwrap_or_else(|| {
                    defaulted.push(spec.name);
                    spec.kind.default_value()
                });
                (spec.name, value)
            })
            .collect();
        (Self { values }, defaulted)
    }

    fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn str(&self, name: &str) -> String {
        match self.get(name) {
            Some(FieldValue::Str(s)) => s.clone(),
            Some(FieldValue::Num(n)) => n.to_string(),
            Some(FieldValue::Flag(b)) => b.to_string(),
            None => String::new(),
        }
    }

    pub fn num(&self, name: &str) -> u64 {
        match self.get(name) {
            Some(FieldValue::Num(n)) => *n,
            _ => 0,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(FieldValue::Flag(true)))
    }
}

fn normalise_token(spec: &FieldSpec, token: Token) -> Result<FieldValue, DecodeError> {
    let value = match (spec.kind, token) {
        (FieldKind::Id | FieldKind::Amount, Token::Uint(v)) => FieldValue::Str(v.to_string()),
        (FieldKind::Text, Token::Text(s)) => FieldValue::Str(s),
        (FieldKind::Address, Token::Address(a)) => FieldValue::Str(a.to_checksum(None)),
        (FieldKind::Count | FieldKind::Timestamp, Token::Uint(v)) => FieldValue::Num(
            u64::try_from(v).map_err(|_| DecodeError::Overflow { field: spec.name })?,
        ),
        (FieldKind::Flag, Token::Bool(b)) => FieldValue::Flag(b),
        _ => return Err(DecodeError::KindMismatch { field: spec.name }),
    };
    Ok(value)
}

/// `poolId` -> `pool_id`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Find a field by camelCase, snake_case, then aliases; top level first,
/// then inside nested `args` / `data` objects.
fn lookup<'a>(object: &'a Value, spec: &FieldSpec) -> Option<&'a Value> {
    let snake = snake_case(spec.name);
    let keys = std::iter::once(spec.name)
        .chain(std::iter::once(snake.as_str()))
        .chain(spec.aliases.iter().copied());

    let containers = [Some(object), object.get("args"), object.get("data")];
    let keys: Vec<&str> = keys.collect();

    containers
        .into_iter()
        .flatten()
        .filter(|c| c.is_object())
        .find_map(|container| {
            keys.iter()
                .filter_map(|k| container.get(*k))
                .find(|v| !v.is_null())
        })
}

fn normalise_json(kind: FieldKind, value: &Value) -> Option<FieldValue> {
    match kind {
        FieldKind::Id => match value {
            Value::String(s) => parse_id(s).map(FieldValue::Str),
            // Floats and negatives are not ids.
            Value::Number(n) => n.as_u64().map(|v| FieldValue::Str(v.to_string())),
            _ => None,
        },
        FieldKind::Address => value
            .as_str()
            .and_then(|s| Address::from_str(s.trim()).ok())
            .map(|a| FieldValue::Str(a.to_checksum(None))),
        FieldKind::Amount => match value {
            Value::String(s) => parse_amount(s).map(FieldValue::Str),
            Value::Number(n) => match n.as_u64() {
                Some(v) => Some(FieldValue::Str(v.to_string())),
                None => parse_amount(&n.to_string()).map(FieldValue::Str),
            },
            _ => None,
        },
        FieldKind::Count => parse_count(value).map(FieldValue::Num),
        FieldKind::Timestamp => parse_count(value)
            .or_else(|| value.as_str().and_then(parse_rfc3339))
            .map(FieldValue::Num),
        FieldKind::Flag => parse_flag(value).map(FieldValue::Flag),
        FieldKind::Text => match value {
            Value::String(s) => text_value(s).map(FieldValue::Str),
            Value::Number(n) => Some(FieldValue::Str(n.to_string())),
            _ => None,
        },
    }
}

/// An unsigned integer id, decimal or 0x-hex, as a decimal string.
fn parse_id(raw: &str) -> Option<String> {
    let s = raw.trim();
    let (digits, radix) = match s.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    U256::from_str_radix(digits, radix as u64).ok().map(|v| v.to_string())
}

/// Normalise a decimal, integer or 0x-hex quantity to a decimal string.
fn parse_amount(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(digits) = s.strip_prefix("0x") {
        return U256::from_str_radix(digits, 16).ok().map(|v| v.to_string());
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return U256::from_str_radix(s, 10).ok().map(|v| v.to_string());
    }
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
        .map(|d| d.normalize().to_string())
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f.trunc() as u64)
        }),
        Value::String(s) => {
            let s = s.trim();
            if let Some(digits) = s.strip_prefix("0x") {
                return u64::from_str_radix(digits, 16).ok();
            }
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= 0.0 && *f <= u64::MAX as f64)
                    .map(|f| f.trunc() as u64)
            })
        }
        _ => None,
    }
}

fn parse_rfc3339(s: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .and_then(|dt| u64::try_from(dt.timestamp()).ok())
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Plain text passes through. A 0x-hex string is decoded as NUL-padded
/// UTF-8 of any length; hex that is not valid text is dropped so raw blobs
/// never reach a record.
fn text_value(s: &str) -> Option<String> {
    let Some(digits) = s.strip_prefix("0x") else {
        return Some(s.to_string());
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(s.to_string());
    }
    let text = hex::decode(digits).ok().and_then(|bytes| {
        let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        String::from_utf8(bytes[..end].to_vec()).ok()
    });
    if text.is_none() {
        warn!(len = digits.len(), "hex text field is not valid text, using default");
    }
    text
}
