//! Minimal Solidity ABI codec.
//!
//! Covers the types the ticketing contract uses: `uint256`, `address`, `bool`,
//! `string`, dynamic arrays and tuples. Values are laid out in 32-byte words with
//! dynamic values referenced by offset from the start of their enclosing tuple.

use sha3::{Digest, Keccak256};
use thiserror::Error;
use ticketchain_core::{Address, U256};

const WORD: usize = 32;

/// `Error(string)` selector used by `require`/`revert` with a message.
pub const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// `Panic(uint256)` selector used by failed assertions and arithmetic checks.
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Errors decoding ABI data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbiError {
    /// Data ended before a value was complete
    #[error("data truncated at offset {offset}, needed {needed} bytes")]
    Truncated {
        /// Where reading started
        offset: usize,
        /// Bytes required
        needed: usize,
    },

    /// A bool word held something other than 0 or 1
    #[error("invalid bool encoding")]
    InvalidBool,

    /// An address word had non-zero padding
    #[error("invalid address encoding")]
    InvalidAddress,

    /// A string was not UTF-8
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A length or offset did not fit in memory
    #[error("length or offset out of range")]
    OutOfRange,

    /// Decoded values did not have the expected shape
    #[error("unexpected value: expected {0}")]
    UnexpectedToken(&'static str),

    /// Hex input was malformed
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Parameter types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamType {
    /// `uint256`
    Uint,
    /// `address`
    Address,
    /// `bool`
    Bool,
    /// `string`
    String,
    /// `T[]`
    Array(Box<ParamType>),
    /// `(T1, T2, ...)`
    Tuple(Vec<ParamType>),
}

impl ParamType {
    /// Whether values of this type are stored out of line.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::Uint | Self::Address | Self::Bool => false,
            Self::String | Self::Array(_) => true,
            Self::Tuple(members) => members.iter().any(Self::is_dynamic),
        }
    }

    fn head_size(&self) -> usize {
        match self {
            Self::Tuple(members) if !self.is_dynamic() => {
                members.iter().map(Self::head_size).sum()
            },
            _ => WORD,
        }
    }
}

/// Decoded or to-be-encoded values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// `uint256`
    Uint(U256),
    /// `address`
    Address(Address),
    /// `bool`
    Bool(bool),
    /// `string`
    String(String),
    /// `T[]`
    Array(Vec<Token>),
    /// `(T1, T2, ...)`
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Self::Uint(_) | Self::Address(_) | Self::Bool(_) => false,
            Self::String(_) | Self::Array(_) => true,
            Self::Tuple(members) => members.iter().any(Self::is_dynamic),
        }
    }

    fn head_size(&self) -> usize {
        match self {
            Self::Tuple(members) if !self.is_dynamic() => {
                members.iter().map(Self::head_size).sum()
            },
            _ => WORD,
        }
    }

    /// The value as a `uint256`.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::UnexpectedToken`] for other kinds.
    pub fn into_uint(self) -> Result<U256, AbiError> {
        match self {
            Self::Uint(v) => Ok(v),
            _ => Err(AbiError::UnexpectedToken("uint256")),
        }
    }

    /// The value as a `uint256` that fits in a `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::OutOfRange`] for values above `u64::MAX`.
    pub fn into_u64(self) -> Result<u64, AbiError> {
        let value = self.into_uint()?;
        if value > U256::from(u64::MAX) {
            return Err(AbiError::OutOfRange);
        }
        Ok(value.low_u64())
    }

    /// The value as an address.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::UnexpectedToken`] for other kinds.
    pub fn into_address(self) -> Result<Address, AbiError> {
        match self {
            Self::Address(a) => Ok(a),
            _ => Err(AbiError::UnexpectedToken("address")),
        }
    }

    /// The value as a bool.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::UnexpectedToken`] for other kinds.
    pub fn into_bool(self) -> Result<bool, AbiError> {
        match self {
            Self::Bool(b) => Ok(b),
            _ => Err(AbiError::UnexpectedToken("bool")),
        }
    }

    /// The value as a string.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::UnexpectedToken`] for other kinds.
    pub fn into_string(self) -> Result<String, AbiError> {
        match self {
            Self::String(s) => Ok(s),
            _ => Err(AbiError::UnexpectedToken("string")),
        }
    }

    /// The elements of an array.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::UnexpectedToken`] for other kinds.
    pub fn into_array(self) -> Result<Vec<Self>, AbiError> {
        match self {
            Self::Array(items) => Ok(items),
            _ => Err(AbiError::UnexpectedToken("array")),
        }
    }

    /// The members of a tuple.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::UnexpectedToken`] for other kinds.
    pub fn into_tuple(self) -> Result<Vec<Self>, AbiError> {
        match self {
            Self::Tuple(members) => Ok(members),
            _ => Err(AbiError::UnexpectedToken("tuple")),
        }
    }
}

/// Keccak-256 of `data`.
#[must_use]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Four-byte function selector of a canonical signature such as `ownerOf(uint256)`.
#[must_use]
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic hash of a canonical event signature.
#[must_use]
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

fn uint_word(value: U256) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    for (i, byte) in word.iter_mut().enumerate() {
        *byte = value.byte(WORD - 1 - i);
    }
    word
}

fn usize_word(value: usize) -> [u8; WORD] {
    uint_word(U256::from(value))
}

fn encode_token(token: &Token, out: &mut Vec<u8>) {
    match token {
        Token::Uint(v) => out.extend_from_slice(&uint_word(*v)),
        Token::Address(a) => {
            out.extend_from_slice(&[0u8; 12]);
            out.extend_from_slice(a.as_bytes());
        },
        Token::Bool(b) => out.extend_from_slice(&usize_word(usize::from(*b))),
        Token::String(s) => {
            out.extend_from_slice(&usize_word(s.len()));
            out.extend_from_slice(s.as_bytes());
            let padding = (WORD - s.len() % WORD) % WORD;
            out.extend(std::iter::repeat_n(0u8, padding));
        },
        Token::Array(items) => {
            out.extend_from_slice(&usize_word(items.len()));
            out.extend(encode(items));
        },
        Token::Tuple(members) => out.extend(encode(members)),
    }
}

/// Encode a parameter list.
#[must_use]
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len: usize = tokens.iter().map(Token::head_size).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&usize_word(head_len + tail.len()));
            encode_token(token, &mut tail);
        } else {
            encode_token(token, &mut head);
        }
    }

    head.extend(tail);
    head
}

/// Selector followed by the encoded arguments.
#[must_use]
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode(args));
    data
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], AbiError> {
    offset
        .checked_add(WORD)
        .and_then(|end| data.get(offset..end))
        .ok_or(AbiError::Truncated {
            offset,
            needed: WORD,
        })
}

fn u256_at(data: &[u8], offset: usize) -> Result<U256, AbiError> {
    let word = word_at(data, offset)?;
    Ok(word
        .iter()
        .fold(U256::zero(), |acc, byte| (acc << 8usize) | U256::from(*byte)))
}

fn usize_at(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    let value = u256_at(data, offset)?;
    if value > U256::from(u64::MAX) {
        return Err(AbiError::OutOfRange);
    }
    usize::try_from(value.low_u64()).map_err(|_| AbiError::OutOfRange)
}

fn decode_token(ty: &ParamType, data: &[u8]) -> Result<Token, AbiError> {
    match ty {
        ParamType::Uint => u256_at(data, 0).map(Token::Uint),
        ParamType::Address => {
            let word = word_at(data, 0)?;
            if word[..12].iter().any(|b| *b != 0) {
                return Err(AbiError::InvalidAddress);
            }
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&word[12..]);
            Ok(Token::Address(Address::new(bytes)))
        },
        ParamType::Bool => match usize_at(data, 0) {
            Ok(0) => Ok(Token::Bool(false)),
            Ok(1) => Ok(Token::Bool(true)),
            _ => Err(AbiError::InvalidBool),
        },
        ParamType::String => {
            let len = usize_at(data, 0)?;
            let bytes = WORD
                .checked_add(len)
                .and_then(|end| data.get(WORD..end))
                .ok_or(AbiError::Truncated {
                    offset: WORD,
                    needed: len,
                })?;
            String::from_utf8(bytes.to_vec())
                .map(Token::String)
                .map_err(|_| AbiError::InvalidUtf8)
        },
        ParamType::Array(inner) => {
            let len = usize_at(data, 0)?;
            let body = data.get(WORD..).unwrap_or_default();
            // Every element needs at least one head word.
            if len > body.len() / WORD {
                return Err(AbiError::Truncated {
                    offset: WORD,
                    needed: len.saturating_mul(WORD),
                });
            }
            let types = vec![(**inner).clone(); len];
            decode(&types, body).map(Token::Array)
        },
        ParamType::Tuple(members) => decode(members, data).map(Token::Tuple),
    }
}

/// Decode a parameter list.
///
/// # Errors
///
/// Returns [`AbiError`] when the data is truncated or malformed.
pub fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, AbiError> {
    let mut tokens = Vec::with_capacity(types.len());
    let mut offset = 0usize;

    for ty in types {
        if ty.is_dynamic() {
            let pointer = usize_at(data, offset)?;
            let body = data.get(pointer..).ok_or(AbiError::Truncated {
                offset: pointer,
                needed: WORD,
            })?;
            tokens.push(decode_token(ty, body)?);
        } else {
            let body = data.get(offset..).ok_or(AbiError::Truncated {
                offset,
                needed: ty.head_size(),
            })?;
            tokens.push(decode_token(ty, body)?);
        }
        offset += ty.head_size();
    }

    Ok(tokens)
}

/// Parse `0x`-prefixed hex into bytes.
///
/// # Errors
///
/// Returns [`AbiError::InvalidHex`] for malformed input.
pub fn from_hex(data: &str) -> Result<Vec<u8>, AbiError> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(digits).map_err(|e| AbiError::InvalidHex(e.to_string()))
}

/// Render bytes as `0x`-prefixed hex.
#[must_use]
pub fn to_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

/// Human-readable reason from revert data.
///
/// Understands `Error(string)`, `Panic(uint256)` and the ERC-721 nonexistent
/// token custom error; any other custom error is reported by selector. Empty
/// data yields `None`.
#[must_use]
pub fn decode_revert(data: &[u8]) -> Option<String> {
    let (head, body) = data.split_at_checked(4)?;
    if head == ERROR_STRING_SELECTOR {
        return decode(&[ParamType::String], body)
            .ok()?
            .pop()?
            .into_string()
            .ok();
    }
    if head == PANIC_SELECTOR {
        let code = u256_at(body, 0).ok()?;
        return Some(format!("panic code {code:#x}"));
    }
    if head == selector("ERC721NonexistentToken(uint256)") {
        let token = u256_at(body, 0).ok()?;
        return Some(format!("ERC721NonexistentToken({token})"));
    }
    Some(format!("custom error {}", to_hex(head)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_selectors() {
        assert_eq!(to_hex(&selector("ownerOf(uint256)")), "0x6352211e");
        assert_eq!(to_hex(&selector("transfer(address,uint256)")), "0xa9059cbb");
        assert_eq!(selector("Error(string)"), ERROR_STRING_SELECTOR);
        assert_eq!(selector("Panic(uint256)"), PANIC_SELECTOR);
    }

    #[test]
    fn encodes_static_arguments_inline() {
        let data = encode(&[Token::Uint(U256::from(5u64)), Token::Bool(true)]);
        assert_eq!(data.len(), 64);
        assert_eq!(data[31], 5);
        assert_eq!(data[63], 1);
    }

    #[test]
    fn encodes_strings_by_offset() {
        let data = encode(&[
            Token::String("Concert".into()),
            Token::Uint(U256::from(1u64)),
        ]);
        // head: offset (0x40), uint; tail: length, padded bytes
        assert_eq!(usize_at(&data, 0).unwrap(), 64);
        assert_eq!(usize_at(&data, 64).unwrap(), 7);
        assert_eq!(&data[96..103], b"Concert");
        assert_eq!(data.len(), 128);
    }

    #[test]
    fn decodes_array_of_dynamic_tuples() {
        let event = ParamType::Tuple(vec![
            ParamType::Uint,
            ParamType::String,
            ParamType::Address,
            ParamType::Bool,
        ]);
        let value = Token::Array(vec![
            Token::Tuple(vec![
                Token::Uint(U256::from(1u64)),
                Token::String("Concert".into()),
                Token::Address(Address::new([7; 20])),
                Token::Bool(true),
            ]),
            Token::Tuple(vec![
                Token::Uint(U256::from(2u64)),
                Token::String(String::new()),
                Token::Address(Address::ZERO),
                Token::Bool(false),
            ]),
        ]);
        let data = encode(std::slice::from_ref(&value));
        let decoded = decode(&[ParamType::Array(Box::new(event))], &data).unwrap();
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn rejects_truncated_and_malformed_data() {
        assert!(matches!(
            decode(&[ParamType::Uint], &[0u8; 16]),
            Err(AbiError::Truncated { .. })
        ));
        let mut bad_bool = [0u8; 32];
        bad_bool[31] = 2;
        assert_eq!(decode(&[ParamType::Bool], &bad_bool), Err(AbiError::InvalidBool));

        // Array claiming a billion elements in 32 bytes of body.
        let mut huge = usize_word(32).to_vec();
        huge.extend(usize_word(1_000_000_000));
        assert!(decode(&[ParamType::Array(Box::new(ParamType::Uint))], &huge).is_err());
    }

    #[test]
    fn decodes_revert_reasons() {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(encode(&[Token::String("Not owner".into())]));
        assert_eq!(decode_revert(&data).as_deref(), Some("Not owner"));

        let mut panic = PANIC_SELECTOR.to_vec();
        panic.extend(usize_word(0x11));
        assert_eq!(decode_revert(&panic).as_deref(), Some("panic code 0x11"));

        let mut custom = selector("ERC721NonexistentToken(uint256)").to_vec();
        custom.extend(usize_word(9));
        assert_eq!(decode_revert(&custom).as_deref(), Some("ERC721NonexistentToken(9)"));

        assert_eq!(decode_revert(&[]), None);
    }

    proptest! {
        #[test]
        fn uint_and_string_values_survive_encoding(value in any::<u128>(), text in ".{0,80}") {
            let tokens = vec![Token::Uint(U256::from(value)), Token::String(text)];
            let data = encode(&tokens);
            prop_assert_eq!(data.len() % WORD, 0);
            prop_assert_eq!(decode(&[ParamType::Uint, ParamType::String], &data).unwrap(), tokens);
        }
    }
}
