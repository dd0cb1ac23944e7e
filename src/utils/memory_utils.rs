//! Bounds-checked reads from memory images and stack words

use crate::errors::DecodeError;
use crate::types::{B256, U256};

/// Converts a stack word to an in-memory offset or length
///
/// Returns `None` when the word does not fit in `usize`.
pub fn word_to_usize(word: U256) -> Option<usize> {
    usize::try_from(word).ok()
}

/// Reads `len` bytes at `offset`, failing past the end of the image
pub fn read_bytes(memory: &[u8], offset: usize, len: usize) -> Result<&[u8], DecodeError> {
    let end = offset
        .checked_add(len)
        .ok_or(DecodeError::OutOfBounds { offset, len })?;
    memory
        .get(offset..end)
        .ok_or(DecodeError::OutOfBounds { offset, len })
}

/// Reads the 32-byte word at `offset`
pub fn read_word(memory: &[u8], offset: usize) -> Result<B256, DecodeError> {
    read_bytes(memory, offset, 32).map(B256::from_slice)
}

/// Reads a length-prefixed region the way the EVM does
///
/// Bytes past the end of the image read as zero, as memory expansion would
/// produce them. Lengths above `cap` are rejected.
pub fn read_padded(
    memory: &[u8],
    offset: usize,
    len: usize,
    cap: usize,
) -> Result<Vec<u8>, DecodeError> {
    if len > cap {
        return Err(DecodeError::TooLong(len));
    }
    let mut out = vec![0u8; len];
    if offset < memory.len() {
        let available = (memory.len() - offset).min(len);
        out[..available].copy_from_slice(&memory[offset..offset + available]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_word_bounds() {
        let memory = [0u8; 64];
        assert!(read_word(&memory, 32).is_ok());
        assert_eq!(
            read_word(&memory, 33),
            Err(DecodeError::OutOfBounds { offset: 33, len: 32 })
        );
        assert!(read_bytes(&memory, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_read_padded_zero_extends() {
        let memory = [1u8, 2, 3];
        assert_eq!(read_padded(&memory, 1, 4, 16).unwrap(), vec![2, 3, 0, 0]);
        assert_eq!(read_padded(&memory, 10, 2, 16).unwrap(), vec![0, 0]);
        assert_eq!(read_padded(&memory, 0, 17, 16), Err(DecodeError::TooLong(17)));
    }

    #[test]
    fn test_word_to_usize() {
        assert_eq!(word_to_usize(U256::from(0x40)), Some(0x40));
        assert_eq!(word_to_usize(U256::MAX), None);
    }
}
