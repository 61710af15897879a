//! Strict ABI decoding of event data.
//!
//! Only the handful of parameter types the event schemas use are
//! supported. Decoding is strict on purpose: anything that does not match
//! the declared parameter list is an error and the caller falls back to
//! field extraction.

use super::DecodeError;
use alloy::primitives::{Address, U256};

const WORD: usize = 32;

/// Solidity parameter types appearing in event schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    Uint256,
    Address,
    Bool,
    /// Fixed-width text, right-padded with NUL bytes.
    Bytes32,
    /// Dynamic UTF-8 string (offset in the head, length + bytes in the tail).
    String,
}

impl AbiType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uint256 => "uint256",
            Self::Address => "address",
            Self::Bool => "bool",
            Self::Bytes32 => "bytes32",
            Self::String => "string",
        }
    }

    fn is_dynamic(self) -> bool {
        matches!(self, Self::String)
    }
}

/// A decoded parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(U256),
    Address(Address),
    Bool(bool),
    Text(String),
}

/// Decode `data` against an ordered parameter list.
pub fn decode_params(data: &[u8], params: &[AbiType]) -> Result<Vec<Token>, DecodeError> {
    if data.len() % WORD != 0 {
        return Err(DecodeError::Misaligned(data.len()));
    }

    let head = params.len() * WORD;
    if data.len() < head {
        return Err(DecodeError::TooShort {
            expected: head,
            actual: data.len(),
        });
    }
    if !params.iter().any(|p| p.is_dynamic()) && data.len() != head {
        return Err(DecodeError::TrailingBytes {
            expected: head,
            actual: data.len(),
        });
    }

    params
        .iter()
        .enumerate()
        .map(|(index, ty)| decode_param(data, index, *ty, head))
        .collect()
}

fn word(data: &[u8], offset: usize) -> Result<[u8; 32], DecodeError> {
    data.get(offset..offset.saturating_add(WORD))
        .and_then(|w| w.try_into().ok())
        .ok_or(DecodeError::TooShort {
            expected: offset.saturating_add(WORD),
            actual: data.len(),
        })
}

fn as_usize(value: U256) -> Option<usize> {
    u64::try_from(value).ok().and_then(|v| usize::try_from(v).ok())
}

fn text(bytes: &[u8], index: usize) -> Result<Token, DecodeError> {
    std::str::from_utf8(bytes)
        .map(|s| Token::Text(s.to_string()))
        .map_err(|_| DecodeError::InvalidUtf8 { index })
}

fn decode_param(data: &[u8], index: usize, ty: AbiType, head: usize) -> Result<Token, DecodeError> {
    let w = word(data, index * WORD)?;

    match ty {
        AbiType::Uint256 => Ok(Token::Uint(U256::from_be_bytes(w))),
        AbiType::Address => {
            if w[..12].iter().any(|b| *b != 0) {
                return Err(DecodeError::InvalidAddress { index });
            }
            Ok(Token::Address(Address::from_slice(&w[12..])))
        }
        AbiType::Bool => {
            let value = U256::from_be_bytes(w);
            if value == U256::ZERO {
                Ok(Token::Bool(false))
            } else if value == U256::from(1u8) {
                Ok(Token::Bool(true))
            } else {
                Err(DecodeError::InvalidBool { index })
            }
        }
        AbiType::Bytes32 => {
            let end = w.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
            text(&w[..end], index)
        }
        AbiType::String => {
            let offset = as_usize(U256::from_be_bytes(w)).ok_or(DecodeError::InvalidOffset { index })?;
            if offset < head || offset % WORD != 0 {
                return Err(DecodeError::InvalidOffset { index });
            }
            let len = as_usize(U256::from_be_bytes(word(data, offset)?))
                .ok_or(DecodeError::InvalidOffset { index })?;
            let start = offset + WORD;
            let end = start
                .checked_add(len)
                .ok_or(DecodeError::InvalidOffset { index })?;
            let bytes = data.get(start..end).ok_or(DecodeError::TooShort {
                expected: end,
                actual: data.len(),
            })?;
            text(bytes, index)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::words::*;
    use super::*;

    #[test]
    fn test_decode_static_words() {
        let bidder = Address::repeat_byte(0xab);
        let data = concat(&[uint(7), address(bidder), uint(1), text32("HOME")]);
        let tokens = decode_params(
            &data,
            &[AbiType::Uint256, AbiType::Address, AbiType::Bool, AbiType::Bytes32],
        )
        .unwrap();

        assert_eq!(tokens[0], Token::Uint(U256::from(7u8)));
        assert_eq!(tokens[1], Token::Address(bidder));
        assert_eq!(tokens[2], Token::Bool(true));
        assert_eq!(tokens[3], Token::Text("HOME".to_string()));
    }

    #[test]
    fn test_decode_dynamic_string() {
        let mut data = concat(&[uint(1), uint(64)]);
        data.extend(string_tail("Arsenal vs Chelsea, will the home side win by two?"));
        let tokens = decode_params(&data, &[AbiType::Uint256, AbiType::String]).unwrap();
        assert_eq!(
            tokens[1],
            Token::Text("Arsenal vs Chelsea, will the home side win by two?".to_string())
        );
    }

    #[test]
    fn test_rejects_malformed_input() {
        let params = [AbiType::Uint256, AbiType::Bool];
        assert_eq!(decode_params(&[0u8; 33], &params), Err(DecodeError::Misaligned(33)));
        assert_eq!(
            decode_params(&uint(1), &params),
            Err(DecodeError::TooShort {
                expected: 64,
                actual: 32
            })
        );
        assert_eq!(
            decode_params(&concat(&[uint(1), uint(1), uint(1)]), &params),
            Err(DecodeError::TrailingBytes {
                expected: 64,
                actual: 96
            })
        );
        assert_eq!(
            decode_params(&concat(&[uint(1), uint(2)]), &params),
            Err(DecodeError::InvalidBool { index: 1 })
        );
        assert_eq!(
            decode_params(&[0xffu8; 32], &[AbiType::Address]),
            Err(DecodeError::InvalidAddress { index: 0 })
        );
    }

    #[test]
    fn test_rejects_bad_string_offsets() {
        // Offset points back into the head.
        let data = concat(&[uint(0), uint(0)]);
        assert_eq!(
            decode_params(&data, &[AbiType::String]),
            Err(DecodeError::InvalidOffset { index: 0 })
        );

        // Declared length runs past the end of the payload.
        let data = concat(&[uint(32), uint(500)]);
        assert!(matches!(
            decode_params(&data, &[AbiType::String]),
            Err(DecodeError::TooShort { .. })
        ));

        // Length that overflows usize arithmetic.
        let data = concat(&[uint(32), [0xffu8; 32]]);
        assert_eq!(
            decode_params(&data, &[AbiType::String]),
            Err(DecodeError::InvalidOffset { index: 0 })
        );
    }

    #[test]
    fn test_bytes32_must_be_utf8() {
        let mut w = [0u8; 32];
        w[0] = 0xff;
        assert_eq!(
            decode_params(&w, &[AbiType::Bytes32]),
            Err(DecodeError::InvalidUtf8 { index: 0 })
        );
    }
}
