//! Contract ABI: type signatures, and a decoder/encoder for the 32-byte
//! word layout used by event data.
//!
//! Values are laid out as a head of fixed-size slots followed by a tail.
//! Static values sit in the head; dynamic values (`bytes`, `string`, `T[]`
//! and tuples containing any of those) put an offset in the head, relative to
//! the start of the enclosing sequence, and their content in the tail.

use clearnode_core::{Address, H256, U256};
use sha3::{Digest, Keccak256};
use std::fmt;

use crate::error::AbiError;

/// Size of one ABI slot in bytes.
pub const WORD: usize = 32;

pub fn keccak256(bytes: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(bytes))
}

/// A Solidity parameter type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Bool,
    Uint(usize),
    Int(usize),
    FixedBytes(usize),
    Bytes,
    String,
    Array(Box<ParamType>),
    Tuple(Vec<ParamType>),
}

impl ParamType {
    /// Parse a canonical type string such as `uint64` or `(address,uint256)[]`.
    pub fn parse(input: &str) -> Result<Self, AbiError> {
        let invalid = |reason: String| AbiError::Signature {
            signature: input.to_string(),
            reason,
        };
        let s = input.trim();

        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(Self::Array(Box::new(Self::parse(inner)?)));
        }
        if let Some(rest) = s.strip_prefix('(') {
            let inner = rest
                .strip_suffix(')')
                .ok_or_else(|| invalid("unbalanced parentheses".into()))?;
            let members = split_top_level(inner).map_err(&invalid)?;
            return Ok(Self::Tuple(
                members
                    .into_iter()
                    .map(Self::parse)
                    .collect::<Result<_, _>>()?,
            ));
        }

        match s {
            "address" => return Ok(Self::Address),
            "bool" => return Ok(Self::Bool),
            "bytes" => return Ok(Self::Bytes),
            "string" => return Ok(Self::String),
            "uint" => return Ok(Self::Uint(256)),
            "int" => return Ok(Self::Int(256)),
            _ => {}
        }

        let sized = |digits: &str, valid: fn(usize) -> bool| -> Result<usize, AbiError> {
            digits
                .parse::<usize>()
                .ok()
                .filter(|n| valid(*n))
                .ok_or_else(|| invalid(format!("unknown type `{s}`")))
        };
        let int_bits = |n: usize| n > 0 && n <= 256 && n % 8 == 0;

        if let Some(bits) = s.strip_prefix("uint") {
            return Ok(Self::Uint(sized(bits, int_bits)?));
        }
        if let Some(bits) = s.strip_prefix("int") {
            return Ok(Self::Int(sized(bits, int_bits)?));
        }
        if let Some(len) = s.strip_prefix("bytes") {
            return Ok(Self::FixedBytes(sized(len, |n| n > 0 && n <= WORD)?));
        }
        Err(invalid(format!("unknown type `{s}`")))
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::Bytes | Self::String | Self::Array(_) => true,
            Self::Tuple(members) => members.iter().any(Self::is_dynamic),
            _ => false,
        }
    }

    /// Bytes the type occupies in the head of its enclosing sequence.
    fn head_size(&self) -> usize {
        match self {
            Self::Tuple(members) if !self.is_dynamic() => {
                members.iter().map(Self::head_size).sum()
            }
            _ => WORD,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address => f.write_str("address"),
            Self::Bool => f.write_str("bool"),
            Self::Uint(bits) => write!(f, "uint{bits}"),
            Self::Int(bits) => write!(f, "int{bits}"),
            Self::FixedBytes(len) => write!(f, "bytes{len}"),
            Self::Bytes => f.write_str("bytes"),
            Self::String => f.write_str("string"),
            Self::Array(inner) => write!(f, "{inner}[]"),
            Self::Tuple(members) => {
                f.write_str("(")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{member}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Split on commas that are not nested inside parentheses.
fn split_top_level(s: &str) -> Result<Vec<&str>, String> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced parentheses".to_string())?;
            }
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses".into());
    }
    parts.push(&s[start..]);
    Ok(parts)
}

/// A parsed event signature: `Name(type,...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSignature {
    pub name: String,
    pub params: Vec<ParamType>,
}

impl EventSignature {
    pub fn parse(signature: &str) -> Result<Self, AbiError> {
        let invalid = |reason: &str| AbiError::Signature {
            signature: signature.to_string(),
            reason: reason.to_string(),
        };
        let open = signature
            .find('(')
            .ok_or_else(|| invalid("missing parameter list"))?;
        let name = &signature[..open];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("invalid event name"));
        }
        match ParamType::parse(&signature[open..])? {
            ParamType::Tuple(params) => Ok(Self {
                name: name.to_string(),
                params,
            }),
            _ => Err(invalid("parameter list is not a tuple")),
        }
    }

    /// Canonical form, the preimage of the topic.
    pub fn canonical(&self) -> String {
        format!("{}{}", self.name, ParamType::Tuple(self.params.clone()))
    }

    pub fn topic(&self) -> H256 {
        keccak256(self.canonical().as_bytes())
    }
}

/// A decoded ABI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Bool(bool),
    Uint(U256),
    /// Two's-complement 256-bit word.
    Int(U256),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Self::Bytes(_) | Self::String(_) | Self::Array(_) => true,
            Self::Tuple(members) => members.iter().any(Self::is_dynamic),
            _ => false,
        }
    }

    fn head_size(&self) -> usize {
        match self {
            Self::Tuple(members) if !self.is_dynamic() => {
                members.iter().map(Self::head_size).sum()
            }
            _ => WORD,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Address(_) => "address",
            Self::Bool(_) => "bool",
            Self::Uint(_) => "uint",
            Self::Int(_) => "int",
            Self::FixedBytes(_) => "fixed bytes",
            Self::Bytes(_) => "bytes",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Tuple(_) => "tuple",
        }
    }

    fn mismatch(&self, expected: &str) -> AbiError {
        AbiError::Malformed(format!("expected {expected}, found {}", self.kind()))
    }

    pub fn into_address(self) -> Result<Address, AbiError> {
        match self {
            Self::Address(a) => Ok(a),
            other => Err(other.mismatch("address")),
        }
    }

    pub fn into_uint(self) -> Result<U256, AbiError> {
        match self {
            Self::Uint(v) => Ok(v),
            other => Err(other.mismatch("uint")),
        }
    }

    /// An unsigned value that must fit in 64 bits.
    pub fn into_u64(self, field: &str) -> Result<u64, AbiError> {
        let v = self.into_uint()?;
        if v.bits() > 64 {
            return Err(AbiError::OutOfRange(field.to_string()));
        }
        Ok(v.low_u64())
    }

    /// An unsigned value that must fit in 128 bits.
    pub fn into_u128(self, field: &str) -> Result<u128, AbiError> {
        let v = self.into_uint()?;
        if v.bits() > 128 {
            return Err(AbiError::OutOfRange(field.to_string()));
        }
        Ok(v.low_u128())
    }

    /// A signed value that must fit in 128 bits.
    pub fn into_i128(self, field: &str) -> Result<i128, AbiError> {
        match self {
            Self::Int(word) => int_to_i128(word).ok_or_else(|| AbiError::OutOfRange(field.to_string())),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, AbiError> {
        match self {
            Self::Bytes(b) | Self::FixedBytes(b) => Ok(b),
            other => Err(other.mismatch("bytes")),
        }
    }

    pub fn into_array(self) -> Result<Vec<Token>, AbiError> {
        match self {
            Self::Array(items) => Ok(items),
            other => Err(other.mismatch("array")),
        }
    }

    /// The members of a tuple, which must number exactly `arity`.
    pub fn into_tuple(self, arity: usize) -> Result<Vec<Token>, AbiError> {
        match self {
            Self::Tuple(members) if members.len() == arity => Ok(members),
            Self::Tuple(members) => Err(AbiError::Malformed(format!(
                "expected {arity} tuple members, found {}",
                members.len()
            ))),
            other => Err(other.mismatch("tuple")),
        }
    }
}

/// Two's-complement encoding of a signed value.
pub fn int_from_i128(value: i128) -> U256 {
    if value >= 0 {
        U256::from(value.unsigned_abs())
    } else {
        (!U256::from(value.unsigned_abs())).overflowing_add(U256::one()).0
    }
}

/// Decode a two's-complement word, or `None` if it does not fit an `i128`.
pub fn int_to_i128(word: U256) -> Option<i128> {
    if !word.bit(255) {
        if word.bits() > 127 {
            return None;
        }
        return i128::try_from(word.low_u128()).ok();
    }
    let magnitude = (!word).overflowing_add(U256::one()).0;
    if magnitude.bits() > 128 {
        return None;
    }
    let magnitude = magnitude.low_u128();
    if magnitude == 1u128 << 127 {
        return Some(i128::MIN);
    }
    i128::try_from(magnitude).ok().map(|m| -m)
}

/// Decode `data` as the sequence `types`.
pub fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, AbiError> {
    decode_sequence(types.iter(), data, 0)
}

fn decode_sequence<'t>(
    types: impl Iterator<Item = &'t ParamType>,
    data: &[u8],
    base: usize,
) -> Result<Vec<Token>, AbiError> {
    let mut head = base;
    let mut tokens = Vec::new();
    for ty in types {
        if ty.is_dynamic() {
            let offset = read_usize(data, head)?;
            let start = base
                .checked_add(offset)
                .ok_or_else(|| AbiError::Malformed(format!("offset {offset} overflows")))?;
            tokens.push(decode_at(ty, data, start)?);
            head += WORD;
        } else {
            tokens.push(decode_at(ty, data, head)?);
            head += ty.head_size();
        }
    }
    Ok(tokens)
}

fn decode_at(ty: &ParamType, data: &[u8], pos: usize) -> Result<Token, AbiError> {
    match ty {
        ParamType::Address => {
            let w = word(data, pos)?;
            if w[..12].iter().any(|b| *b != 0) {
                return Err(AbiError::Malformed(format!("dirty address word at {pos}")));
            }
            Ok(Token::Address(Address::from_slice(&w[12..])))
        }
        ParamType::Bool => match U256::from_big_endian(word(data, pos)?) {
            v if v.is_zero() => Ok(Token::Bool(false)),
            v if v == U256::one() => Ok(Token::Bool(true)),
            _ => Err(AbiError::Malformed(format!("invalid bool at {pos}"))),
        },
        ParamType::Uint(bits) => {
            let v = U256::from_big_endian(word(data, pos)?);
            if v.bits() > *bits {
                return Err(AbiError::OutOfRange(format!("uint{bits}")));
            }
            Ok(Token::Uint(v))
        }
        ParamType::Int(_) => Ok(Token::Int(U256::from_big_endian(word(data, pos)?))),
        ParamType::FixedBytes(len) => Ok(Token::FixedBytes(word(data, pos)?[..*len].to_vec())),
        ParamType::Bytes => {
            let len = read_usize(data, pos)?;
            Ok(Token::Bytes(slice(data, pos + WORD, len)?.to_vec()))
        }
        ParamType::String => {
            let len = read_usize(data, pos)?;
            let bytes = slice(data, pos + WORD, len)?.to_vec();
            String::from_utf8(bytes)
                .map(Token::String)
                .map_err(|_| AbiError::Malformed(format!("invalid utf-8 string at {pos}")))
        }
        ParamType::Array(inner) => {
            let len = read_usize(data, pos)?;
            let start = pos + WORD;
            // Every element takes at least one head slot.
            let min = len
                .checked_mul(WORD)
                .ok_or_else(|| AbiError::Malformed(format!("array length {len} overflows")))?;
            slice(data, start, min)?;
            Ok(Token::Array(decode_sequence(
                std::iter::repeat(inner.as_ref()).take(len),
                data,
                start,
            )?))
        }
        ParamType::Tuple(members) => Ok(Token::Tuple(decode_sequence(members.iter(), data, pos)?)),
    }
}

fn slice(data: &[u8], offset: usize, needed: usize) -> Result<&[u8], AbiError> {
    let truncated = || AbiError::Truncated {
        offset,
        needed,
        len: data.len(),
    };
    let end = offset.checked_add(needed).ok_or_else(truncated)?;
    data.get(offset..end).ok_or_else(truncated)
}

fn word(data: &[u8], offset: usize) -> Result<&[u8], AbiError> {
    slice(data, offset, WORD)
}

/// A length or offset word; never larger than the data itself.
fn read_usize(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    let v = U256::from_big_endian(word(data, offset)?);
    if v > U256::from(data.len()) {
        return Err(AbiError::Malformed(format!(
            "length or offset {v} at {offset} exceeds data size {}",
            data.len()
        )));
    }
    Ok(v.low_u64() as usize)
}

/// Encode `tokens` as one sequence.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    encode_sequence(tokens)
}

fn encode_sequence(tokens: &[Token]) -> Vec<u8> {
    let head_len: usize = tokens.iter().map(Token::head_size).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&usize_word(head_len + tail.len()));
            tail.extend(encode_token(token));
        } else {
            head.extend(encode_token(token));
        }
    }
    head.extend(tail);
    head
}

fn encode_token(token: &Token) -> Vec<u8> {
    match token {
        Token::Address(a) => {
            let mut out = vec![0u8; 12];
            out.extend_from_slice(a.as_bytes());
            out
        }
        Token::Bool(b) => usize_word(usize::from(*b)).to_vec(),
        Token::Uint(v) | Token::Int(v) => u256_word(v).to_vec(),
        Token::FixedBytes(bytes) => {
            let mut out = [0u8; WORD];
            let n = bytes.len().min(WORD);
            out[..n].copy_from_slice(&bytes[..n]);
            out.to_vec()
        }
        Token::Bytes(bytes) => encode_bytes(bytes),
        Token::String(s) => encode_bytes(s.as_bytes()),
        Token::Array(items) => {
            let mut out = usize_word(items.len()).to_vec();
            out.extend(encode_sequence(items));
            out
        }
        Token::Tuple(members) => encode_sequence(members),
    }
}

fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let padded = bytes.len().div_ceil(WORD) * WORD;
    let mut out = usize_word(bytes.len()).to_vec();
    out.extend_from_slice(bytes);
    out.resize(WORD + padded, 0);
    out
}

fn u256_word(v: &U256) -> [u8; WORD] {
    let mut out = [0u8; WORD];
    v.to_big_endian(&mut out);
    out
}

fn usize_word(v: usize) -> [u8; WORD] {
    u256_word(&U256::from(v))
}
