//! Revert data decoding
//!
//! Turns the bytes a frame reverted with into a human-readable reason:
//! - `Error(string)` (selector `0x08c379a0`) yields the message
//! - `Panic(uint256)` (selector `0x4e487b71`) yields the compiler panic kind
//! - anything else is rendered as hex

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::hex;

const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Describes a Solidity panic code
pub fn panic_reason(code: u64) -> String {
    let kind = match code {
        0x00 => "generic compiler panic",
        0x01 => "assertion failed",
        0x11 => "arithmetic overflow or underflow",
        0x12 => "division or modulo by zero",
        0x21 => "invalid enum conversion",
        0x22 => "incorrectly encoded storage byte array",
        0x31 => "pop on empty array",
        0x32 => "array index out of bounds",
        0x41 => "out of memory",
        0x51 => "call to zero-initialized internal function",
        _ => return format!("Panic(0x{code:x})"),
    };
    format!("Panic(0x{code:x}): {kind}")
}

/// Decodes standard revert payloads
///
/// # Returns
/// * `Some(String)` - Decoded `Error(string)` message or panic description
/// * `None` - Payload is not a recognised standard error
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let (selector, payload) = data.split_first_chunk::<4>()?;
    match *selector {
        ERROR_STRING_SELECTOR => match DynSolType::String.abi_decode(payload) {
            Ok(DynSolValue::String(reason)) => Some(reason),
            _ => None,
        },
        PANIC_SELECTOR => match DynSolType::Uint(256).abi_decode(payload) {
            Ok(DynSolValue::Uint(code, _)) => Some(panic_reason(code.saturating_to::<u64>())),
            _ => None,
        },
        _ => None,
    }
}

/// Decodes a revert payload, falling back to hex for custom errors
///
/// Empty payloads (a bare `revert()`) yield `None`.
pub fn revert_reason_or_hex(data: &[u8]) -> Option<String> {
    if data.is_empty() {
        return None;
    }
    Some(decode_revert_reason(data).unwrap_or_else(|| format!("0x{}", hex::encode(data))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::hex::decode;

    #[test]
    fn test_error_string() {
        let data = decode(
            "08c379a0\
             0000000000000000000000000000000000000000000000000000000000000020\
             000000000000000000000000000000000000000000000000000000000000000e\
             6e6f7420617574686f72697a6564000000000000000000000000000000000000",
        )
        .unwrap();
        assert_eq!(decode_revert_reason(&data), Some("not authorized".to_string()));
        assert_eq!(decode_revert_reason(&data[..4]), None);
    }

    #[test]
    fn test_panic_codes() {
        let mut data = PANIC_SELECTOR.to_vec();
        data.extend_from_slice(&[0u8; 31]);
        data.push(0x11);
        assert_eq!(
            decode_revert_reason(&data),
            Some("Panic(0x11): arithmetic overflow or underflow".to_string())
        );
        assert_eq!(panic_reason(0x99), "Panic(0x99)");
    }

    #[test]
    fn test_custom_error_falls_back_to_hex() {
        assert_eq!(revert_reason_or_hex(&[]), None);
        assert_eq!(
            revert_reason_or_hex(&[0xde, 0xad, 0xbe, 0xef, 0x01]),
            Some("0xdeadbeef01".to_string())
        );
    }
}
