//! Opcode classification for struct-log mnemonics
//!
//! Tracers report opcodes by name. This module maps those names back onto
//! revm's opcode table so that stack arity comes from the same source the
//! interpreter uses, and groups the opcodes the call-tree builder reacts to.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use revm::bytecode::opcode::OpCode;

use crate::types::{CallScheme, CreateScheme, U256};

/// Reverse lookup from mnemonic to opcode, built from revm's table
static MNEMONICS: Lazy<HashMap<&'static str, OpCode>> = Lazy::new(|| {
    (0..=u8::MAX)
        .filter_map(OpCode::new)
        .map(|op| (op.as_str(), op))
        .collect()
});

/// Opcodes the call-tree builder distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOp {
    /// CALL-family opcode
    Call(CallScheme),
    /// CREATE (`false`) or CREATE2 (`true`)
    Create { create2: bool },
    JumpDest,
    Jump,
    JumpI,
    Return,
    Revert,
    Stop,
    SelfDestruct,
    Push20,
    Other,
}

impl StepOp {
    /// Whether the opcode ends the current execution context normally or by revert
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepOp::Return | StepOp::Revert | StepOp::Stop | StepOp::SelfDestruct
        )
    }
}

/// Resolves a mnemonic, accepting legacy aliases
pub fn opcode_from_mnemonic(mnemonic: &str) -> Option<OpCode> {
    let name = match mnemonic {
        "SHA3" => "KECCAK256",
        "SUICIDE" => "SELFDESTRUCT",
        other => other,
    };
    MNEMONICS.get(name).copied()
}

/// Classifies a mnemonic for the call-tree builder
pub fn classify(mnemonic: &str) -> StepOp {
    match mnemonic {
        "CALL" => StepOp::Call(CallScheme::Call),
        "CALLCODE" => StepOp::Call(CallScheme::CallCode),
        "DELEGATECALL" => StepOp::Call(CallScheme::DelegateCall),
        "STATICCALL" => StepOp::Call(CallScheme::StaticCall),
        "CREATE" => StepOp::Create { create2: false },
        "CREATE2" => StepOp::Create { create2: true },
        "JUMPDEST" => StepOp::JumpDest,
        "JUMP" => StepOp::Jump,
        "JUMPI" => StepOp::JumpI,
        "RETURN" => StepOp::Return,
        "REVERT" => StepOp::Revert,
        "STOP" => StepOp::Stop,
        "SELFDESTRUCT" | "SUICIDE" => StepOp::SelfDestruct,
        "PUSH20" => StepOp::Push20,
        _ => StepOp::Other,
    }
}

/// Number of stack words the opcode consumes
///
/// # Returns
/// * `Some(n)` - Arity from revm's opcode table
/// * `None` - Mnemonic unknown to revm
pub fn stack_inputs(mnemonic: &str) -> Option<usize> {
    opcode_from_mnemonic(mnemonic).map(|op| op.info().inputs() as usize)
}

/// Builds the create scheme for a CREATE/CREATE2 step
pub fn create_scheme(create2: bool, salt: Option<U256>) -> CreateScheme {
    if create2 {
        CreateScheme::Create2 {
            salt: salt.unwrap_or_default(),
        }
    } else {
        CreateScheme::Create
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_arity_from_revm_table() {
        assert_eq!(stack_inputs("CALL"), Some(7));
        assert_eq!(stack_inputs("CALLCODE"), Some(7));
        assert_eq!(stack_inputs("DELEGATECALL"), Some(6));
        assert_eq!(stack_inputs("STATICCALL"), Some(6));
        assert_eq!(stack_inputs("CREATE"), Some(3));
        assert_eq!(stack_inputs("CREATE2"), Some(4));
        assert_eq!(stack_inputs("NOT_AN_OPCODE"), None);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("STATICCALL"), StepOp::Call(CallScheme::StaticCall));
        assert_eq!(classify("CREATE2"), StepOp::Create { create2: true });
        assert!(classify("REVERT").is_terminal());
        assert!(!classify("JUMPDEST").is_terminal());
        assert_eq!(classify("ADD"), StepOp::Other);
    }

    #[test]
    fn test_legacy_alias() {
        assert_eq!(opcode_from_mnemonic("SHA3").map(|op| op.as_str()), Some("KECCAK256"));
    }
}
