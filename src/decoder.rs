//! Typed value decoding from stack words, memory images and storage
//!
//! Every entry point returns a [`DecodedValue`]; nothing here fails with an
//! error. Absent inputs (an unmapped storage slot, a missing memory image)
//! produce [`DecodedValue::Unresolved`], malformed inputs produce
//! [`DecodedValue::Undecodable`] carrying the reason.
//!
//! Memory layouts follow Solidity's in-memory representation:
//! - `string`/`bytes`: a length word followed by the data
//! - `T[]`: a length word followed by one word per element
//! - `T[k]` and structs: one word per element/member, with reference-typed
//!   elements stored as pointers to their own memory location

use std::collections::BTreeMap;
use std::fmt;

use alloy::dyn_abi::DynSolValue;
use alloy::json_abi::Param;
use alloy::primitives::keccak256;
use serde::Serialize;

use crate::abi::{canonical_type, split_top_level};
use crate::errors::DecodeError;
use crate::types::{Address, Bytes, B256, I256, U256};
use crate::utils::memory_utils::{read_bytes, read_word, word_to_usize};

/// Longest dynamic `string`/`bytes` payload the decoder will materialise
pub const MAX_DYNAMIC_BYTES: usize = 1 << 20;

/// Largest array the decoder will materialise
pub const MAX_ARRAY_ELEMENTS: usize = 1024;

/// Pointer chains deeper than this are treated as corrupt memory
const MAX_NESTING: usize = 16;

/// A typed value recovered from the trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecodedValue {
    Uint(U256),
    Int(I256),
    Address(Address),
    Bool(bool),
    /// `bytesN`, exactly N bytes
    FixedBytes(Bytes),
    Bytes(Bytes),
    String(String),
    Array(Vec<DecodedValue>),
    Tuple(Vec<TupleField>),
    /// A word whose type the decoder does not interpret
    Raw(B256),
    /// The value is not available in the trace
    Unresolved,
    /// The input was present but could not be decoded
    Undecodable { reason: String },
}

/// One named member of a decoded tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TupleField {
    pub name: String,
    pub ty: String,
    pub value: DecodedValue,
}

/// A named argument of a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Argument {
    pub name: String,
    pub value: DecodedValue,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: DecodedValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

impl DecodedValue {
    /// Wraps a decoding failure
    pub fn undecodable(reason: impl fmt::Display) -> Self {
        DecodedValue::Undecodable {
            reason: reason.to_string(),
        }
    }

    /// Whether a concrete value was recovered
    pub fn is_resolved(&self) -> bool {
        !matches!(
            self,
            DecodedValue::Unresolved | DecodedValue::Undecodable { .. }
        )
    }

    /// Converts an ABI-decoded value, naming tuple members from `components`
    pub fn from_dyn(value: &DynSolValue, components: &[Param]) -> Self {
        match value {
            DynSolValue::Bool(b) => DecodedValue::Bool(*b),
            DynSolValue::Int(i, _) => DecodedValue::Int(*i),
            DynSolValue::Uint(u, _) => DecodedValue::Uint(*u),
            DynSolValue::FixedBytes(word, size) => {
                DecodedValue::FixedBytes(Bytes::copy_from_slice(&word[..(*size).min(32)]))
            }
            DynSolValue::Address(address) => DecodedValue::Address(*address),
            DynSolValue::Function(function) => {
                DecodedValue::FixedBytes(Bytes::copy_from_slice(function.as_slice()))
            }
            DynSolValue::Bytes(bytes) => DecodedValue::Bytes(Bytes::copy_from_slice(bytes)),
            DynSolValue::String(s) => DecodedValue::String(s.clone()),
            DynSolValue::Array(values) | DynSolValue::FixedArray(values) => DecodedValue::Array(
                values
                    .iter()
                    .map(|v| DecodedValue::from_dyn(v, components))
                    .collect(),
            ),
            DynSolValue::Tuple(values) => DecodedValue::Tuple(
                values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| match components.get(i) {
                        Some(param) => TupleField {
                            name: param.name.clone(),
                            ty: canonical_type(param),
                            value: DecodedValue::from_dyn(v, &param.components),
                        },
                        None => TupleField {
                            name: String::new(),
                            ty: v
                                .as_type()
                                .map(|t| t.sol_type_name().into_owned())
                                .unwrap_or_default(),
                            value: DecodedValue::from_dyn(v, &[]),
                        },
                    })
                    .collect(),
            ),
            #[allow(unreachable_patterns)]
            _ => DecodedValue::undecodable("unsupported abi value"),
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Uint(v) => write!(f, "{v}"),
            DecodedValue::Int(v) => write!(f, "{v}"),
            DecodedValue::Address(a) => write!(f, "{a}"),
            DecodedValue::Bool(b) => write!(f, "{b}"),
            DecodedValue::FixedBytes(b) | DecodedValue::Bytes(b) => write!(f, "{b}"),
            DecodedValue::String(s) => write!(f, "{s:?}"),
            DecodedValue::Raw(w) => write!(f, "{w}"),
            DecodedValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            DecodedValue::Tuple(fields) => {
                f.write_str("(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if field.name.is_empty() {
                        write!(f, "{}={}", field.ty, field.value)?;
                    } else {
                        write!(f, "{}[{}]={}", field.name, field.ty, field.value)?;
                    }
                }
                f.write_str(")")
            }
            DecodedValue::Unresolved => f.write_str("<unresolved>"),
            DecodedValue::Undecodable { reason } => write!(f, "<undecodable: {reason}>"),
        }
    }
}

/// Layout of a type as the decoder walks it
#[derive(Debug, Clone, PartialEq)]
enum Shape {
    /// Single-word value type, kept as its type string
    Value(String),
    /// `string` (`true`) or `bytes` (`false`)
    Dynamic { string: bool },
    Array {
        elem: Box<Shape>,
        len: Option<usize>,
    },
    Tuple(Vec<(String, String, Shape)>),
}

impl Shape {
    /// Reference types are stored as pointers inside arrays and structs
    fn is_reference(&self) -> bool {
        !matches!(self, Shape::Value(_))
    }
}

/// Splits `T[2][]` into `T` and `[2][]`, ignoring brackets inside tuples
fn split_array_suffix(ty: &str) -> (&str, &str) {
    let mut depth = 0usize;
    for (i, c) in ty.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '[' if depth == 0 => return (&ty[..i], &ty[i..]),
            _ => {}
        }
    }
    (ty, "")
}

fn wrap_array_suffix(mut shape: Shape, suffix: &str) -> Result<Shape, DecodeError> {
    let mut rest = suffix;
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| DecodeError::InvalidWidth(suffix.to_string()))?;
        let len = match stripped[..close].trim() {
            "" => None,
            n => Some(
                n.parse::<usize>()
                    .map_err(|_| DecodeError::InvalidWidth(suffix.to_string()))?,
            ),
        };
        shape = Shape::Array {
            elem: Box::new(shape),
            len,
        };
        rest = &stripped[close + 1..];
    }
    Ok(shape)
}

fn shape_of(ty: &str) -> Result<Shape, DecodeError> {
    let ty = ty.trim();
    let (base, suffix) = split_array_suffix(ty);
    let base_shape = if let Some(inner) = base.strip_prefix('(').and_then(|b| b.strip_suffix(')')) {
        let fields = split_top_level(inner)
            .into_iter()
            .map(|component| Ok((String::new(), component.to_string(), shape_of(component)?)))
            .collect::<Result<Vec<_>, DecodeError>>()?;
        Shape::Tuple(fields)
    } else {
        match base {
            "tuple" => return Err(DecodeError::MissingComponents(ty.to_string())),
            "string" => Shape::Dynamic { string: true },
            "bytes" => Shape::Dynamic { string: false },
            other => Shape::Value(other.to_string()),
        }
    };
    wrap_array_suffix(base_shape, suffix)
}

fn shape_of_param(param: &Param) -> Result<Shape, DecodeError> {
    match param.ty.strip_prefix("tuple") {
        Some(suffix) => {
            let fields = param
                .components
                .iter()
                .map(|c| Ok((c.name.clone(), canonical_type(c), shape_of_param(c)?)))
                .collect::<Result<Vec<_>, DecodeError>>()?;
            wrap_array_suffix(Shape::Tuple(fields), suffix)
        }
        None => shape_of(&param.ty),
    }
}

fn parse_width(ty: &str, digits: &str, default: usize, max: usize) -> Result<usize, DecodeError> {
    if digits.is_empty() {
        return Ok(default);
    }
    match digits.parse::<usize>() {
        Ok(width) if width > 0 && width <= max => Ok(width),
        _ => Err(DecodeError::InvalidWidth(ty.to_string())),
    }
}

fn decode_word(word: &B256, ty: &str) -> Result<DecodedValue, DecodeError> {
    let ty = ty.trim();
    let raw = U256::from_be_bytes(word.0);

    if ty.ends_with(']') || ty.starts_with("mapping(") {
        return Ok(DecodedValue::Raw(*word));
    }
    if ty == "address" || ty == "address payable" || ty.starts_with("contract ") {
        return Ok(DecodedValue::Address(Address::from_word(*word)));
    }
    if ty == "bool" {
        return Ok(DecodedValue::Bool(!raw.is_zero()));
    }
    if ty.starts_with("enum ") {
        return Ok(DecodedValue::Uint(raw & U256::from(0xff)));
    }
    if let Some(digits) = ty.strip_prefix("uint") {
        let bits = parse_width(ty, digits, 256, 256)?;
        if bits % 8 != 0 {
            return Err(DecodeError::InvalidWidth(ty.to_string()));
        }
        return Ok(DecodedValue::Uint(raw & low_mask(bits)));
    }
    if let Some(digits) = ty.strip_prefix("int") {
        let bits = parse_width(ty, digits, 256, 256)?;
        if bits % 8 != 0 {
            return Err(DecodeError::InvalidWidth(ty.to_string()));
        }
        let mask = low_mask(bits);
        let mut value = raw & mask;
        if bits < 256 && value.bit(bits - 1) {
            value |= !mask;
        }
        return Ok(DecodedValue::Int(I256::from_raw(value)));
    }
    if ty == "string" || ty == "bytes" {
        return Err(DecodeError::NeedsMemory(ty.to_string()));
    }
    if let Some(digits) = ty.strip_prefix("bytes") {
        let size = parse_width(ty, digits, 32, 32)?;
        return Ok(DecodedValue::FixedBytes(Bytes::copy_from_slice(&word[..size])));
    }
    if ty == "tuple" || ty.starts_with('(') {
        return Err(DecodeError::MissingComponents(ty.to_string()));
    }
    Ok(DecodedValue::Raw(*word))
}

fn low_mask(bits: usize) -> U256 {
    if bits >= 256 {
        U256::MAX
    } else {
        (U256::from(1) << bits) - U256::from(1)
    }
}

/// Decodes a single 32-byte word as `ty`
///
/// Dynamic types and tuples cannot be decoded from a word and come back as
/// undecodable; route them through [`extract_from_memory`]. Unknown types
/// (arrays, mappings, user types) come back as the raw word.
pub fn decode(word: &B256, ty: &str) -> DecodedValue {
    decode_word(word, ty).unwrap_or_else(DecodedValue::undecodable)
}

fn memory_value(
    memory: &[u8],
    offset: usize,
    shape: &Shape,
    nesting: usize,
) -> Result<DecodedValue, DecodeError> {
    if nesting > MAX_NESTING {
        return Err(DecodeError::TooLong(nesting));
    }
    match shape {
        Shape::Value(ty) => {
            if let Some(size) = fixed_bytes_size(ty) {
                let bytes = read_bytes(memory, offset, size)?;
                return Ok(DecodedValue::FixedBytes(Bytes::copy_from_slice(bytes)));
            }
            decode_word(&read_word(memory, offset)?, ty)
        }
        Shape::Dynamic { string } => {
            let len = length_at(memory, offset, MAX_DYNAMIC_BYTES)?;
            let data = read_bytes(memory, offset + 32, len)?;
            Ok(if *string {
                DecodedValue::String(String::from_utf8_lossy(data).into_owned())
            } else {
                DecodedValue::Bytes(Bytes::copy_from_slice(data))
            })
        }
        Shape::Array { elem, len } => {
            let (count, start) = match len {
                Some(count) => (*count, offset),
                None => (length_at(memory, offset, MAX_ARRAY_ELEMENTS)?, offset + 32),
            };
            if count > MAX_ARRAY_ELEMENTS {
                return Err(DecodeError::TooLong(count));
            }
            (0..count)
                .map(|i| member_value(memory, start + i * 32, elem, nesting))
                .collect::<Result<Vec<_>, _>>()
                .map(DecodedValue::Array)
        }
        Shape::Tuple(fields) => fields
            .iter()
            .enumerate()
            .map(|(i, (name, ty, field))| {
                Ok(TupleField {
                    name: name.clone(),
                    ty: ty.clone(),
                    value: member_value(memory, offset + i * 32, field, nesting)?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()
            .map(DecodedValue::Tuple),
    }
}

/// Reads an array element or struct member occupying the word at `slot`
fn member_value(
    memory: &[u8],
    slot: usize,
    shape: &Shape,
    nesting: usize,
) -> Result<DecodedValue, DecodeError> {
    if shape.is_reference() {
        let pointer = U256::from_be_bytes(read_word(memory, slot)?.0);
        let target = word_to_usize(pointer).ok_or(DecodeError::OutOfBounds {
            offset: slot,
            len: 32,
        })?;
        memory_value(memory, target, shape, nesting + 1)
    } else {
        memory_value(memory, slot, shape, nesting)
    }
}

fn length_at(memory: &[u8], offset: usize, cap: usize) -> Result<usize, DecodeError> {
    let len = U256::from_be_bytes(read_word(memory, offset)?.0);
    match word_to_usize(len) {
        Some(len) if len <= cap => Ok(len),
        Some(len) => Err(DecodeError::TooLong(len)),
        None => Err(DecodeError::TooLong(usize::MAX)),
    }
}

fn fixed_bytes_size(ty: &str) -> Option<usize> {
    ty.strip_prefix("bytes")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| (1..=32).contains(n))
}

/// Decodes a value of type `ty` located at `offset` in a memory image
///
/// # Arguments
/// * `memory` - Full memory image of the step
/// * `offset` - Byte offset of the value (of the length word for dynamic types)
/// * `ty` - Solidity type string; inline tuples are written `(t1,t2)`
pub fn extract_from_memory(memory: &[u8], offset: usize, ty: &str) -> DecodedValue {
    shape_of(ty)
        .and_then(|shape| memory_value(memory, offset, &shape, 0))
        .unwrap_or_else(DecodedValue::undecodable)
}

/// Decodes an ABI parameter located at `offset` in a memory image
///
/// Unlike [`extract_from_memory`] this keeps tuple member names from the
/// parameter's components.
pub fn extract_param_from_memory(memory: &[u8], offset: usize, param: &Param) -> DecodedValue {
    shape_of_param(param)
        .and_then(|shape| memory_value(memory, offset, &shape, 0))
        .unwrap_or_else(DecodedValue::undecodable)
}

/// Decodes a value of type `ty` stored at `slot`
///
/// Value types decode the slot word. `string`/`bytes` follow Solidity's
/// storage encoding: short values live in the slot itself (length * 2 in
/// the lowest byte), long values at `keccak256(slot)` onwards. Slots missing
/// from the snapshot yield [`DecodedValue::Unresolved`].
pub fn extract_from_storage(storage: &BTreeMap<U256, U256>, slot: U256, ty: &str) -> DecodedValue {
    let Some(word) = storage.get(&slot) else {
        return DecodedValue::Unresolved;
    };
    let word = B256::from(*word);
    match shape_of(ty) {
        Ok(Shape::Value(ty)) => decode(&word, &ty),
        Ok(Shape::Dynamic { string }) => storage_dynamic(storage, slot, &word, string),
        Ok(_) => DecodedValue::Raw(word),
        Err(err) => DecodedValue::undecodable(err),
    }
}

fn storage_dynamic(
    storage: &BTreeMap<U256, U256>,
    slot: U256,
    word: &B256,
    string: bool,
) -> DecodedValue {
    let data = if word[31] & 1 == 0 {
        let len = (word[31] / 2) as usize;
        if len > 31 {
            return DecodedValue::undecodable("malformed short storage string");
        }
        word[..len].to_vec()
    } else {
        let len = U256::from_be_bytes(word.0) >> 1;
        let Some(len) = word_to_usize(len).filter(|len| *len <= MAX_DYNAMIC_BYTES) else {
            return DecodedValue::undecodable(DecodeError::TooLong(usize::MAX));
        };
        let base = U256::from_be_bytes(keccak256(slot.to_be_bytes::<32>()).0);
        let mut data = Vec::with_capacity(len);
        for i in 0..len.div_ceil(32) {
            match storage.get(&base.wrapping_add(U256::from(i))) {
                Some(chunk) => data.extend_from_slice(&chunk.to_be_bytes::<32>()),
                None => return DecodedValue::Unresolved,
            }
        }
        data.truncate(len);
        data
    };
    if string {
        DecodedValue::String(String::from_utf8_lossy(&data).into_owned())
    } else {
        DecodedValue::Bytes(Bytes::from(data))
    }
}
