//! Helper functions shared by the decoder and the call-tree builder
//!
//! # Modules
//!
//! - [`opcode_utils`]: opcode classification and stack arity
//!   - Mnemonic lookup through revm's opcode table
//!   - Grouping of call, create, jump and halting opcodes
//!
//! - [`memory_utils`]: bounds-checked memory reads
//!
//! - [`error_utils`]: revert payload decoding
//!   - `Error(string)` messages
//!   - Solidity panic code interpretation

/// Opcode classification utilities
pub mod opcode_utils;

/// Memory access utilities
pub mod memory_utils;

/// Revert reason parsing utilities
pub mod error_utils;
