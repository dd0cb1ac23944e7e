//! Core trace types
//!
//! This module defines the input side of the analysis:
//! - Per-instruction trace steps with stack/memory/storage snapshots
//! - Transaction-level trace metadata
//! - The closed set of call kinds a frame can have
//!
//! Stacks are stored **top first**: `stack[0]` is the top of the EVM stack.
//! Geth-style struct logs (bottom first) are reversed on conversion.

use std::collections::BTreeMap;

use alloy::hex;
use alloy::rpc::types::trace::geth::{DefaultFrame, StructLog};
pub use alloy::primitives::{Address, Bytes, Selector, B256, I256, U256};
pub use revm::interpreter::{CallScheme, CreateScheme};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One executed instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Program counter within the executing code
    pub pc: u64,
    /// Opcode mnemonic as reported by the tracer (e.g. `CALL`)
    pub op: String,
    /// Remaining gas before the instruction executes
    pub gas: u64,
    /// Cost charged for the instruction
    pub gas_cost: u64,
    /// EVM call depth (1 for the transaction's own frame)
    pub depth: u64,
    /// Stack words, top first
    pub stack: Vec<U256>,
    /// Full memory image, if captured
    pub memory: Option<Bytes>,
    /// Storage snapshot of the executing account, if captured
    pub storage: Option<BTreeMap<U256, U256>>,
    /// Error reported for this step
    pub error: Option<String>,
}

impl TraceStep {
    /// Creates a step with an empty stack and no memory or storage
    pub fn new(pc: u64, op: impl Into<String>, gas: u64, depth: u64) -> Self {
        Self {
            pc,
            op: op.into(),
            gas,
            gas_cost: 0,
            depth,
            stack: Vec::new(),
            memory: None,
            storage: None,
            error: None,
        }
    }

    /// Sets the stack (top first)
    pub fn with_stack(mut self, stack: Vec<U256>) -> Self {
        self.stack = stack;
        self
    }

    /// Sets the memory image
    pub fn with_memory(mut self, memory: impl Into<Bytes>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    /// Sets the storage snapshot
    pub fn with_storage(mut self, storage: BTreeMap<U256, U256>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Returns the `n`-th stack word counted from the top
    pub fn stack_item(&self, n: usize) -> Option<U256> {
        self.stack.get(n).copied()
    }

    /// Returns the memory image as a byte slice
    pub fn memory(&self) -> Option<&[u8]> {
        self.memory.as_deref().map(|m| &m[..])
    }
}

impl From<&StructLog> for TraceStep {
    fn from(log: &StructLog) -> Self {
        let stack = log
            .stack
            .as_ref()
            .map(|stack| stack.iter().rev().copied().collect())
            .unwrap_or_default();

        let memory = log.memory.as_ref().and_then(|words| {
            let mut image = Vec::with_capacity(words.len() * 32);
            for word in words {
                match hex::decode(word) {
                    Ok(bytes) => image.extend_from_slice(&bytes),
                    Err(err) => {
                        debug!(pc = log.pc, %err, "dropping undecodable memory image");
                        return None;
                    }
                }
            }
            Some(Bytes::from(image))
        });

        let storage = log.storage.as_ref().map(|slots| {
            slots
                .iter()
                .map(|(slot, value)| (U256::from_be_bytes(slot.0), U256::from_be_bytes(value.0)))
                .collect()
        });

        Self {
            pc: log.pc,
            op: log.op.to_string(),
            gas: log.gas,
            gas_cost: log.gas_cost,
            depth: log.depth,
            stack,
            memory,
            storage,
            error: log.error.clone(),
        }
    }
}

/// A transaction together with its per-instruction trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTrace {
    /// Transaction hash, when known
    pub tx_hash: Option<B256>,
    /// Sender
    pub from: Address,
    /// Recipient; `None` for contract creation
    pub to: Option<Address>,
    /// Native value sent
    pub value: U256,
    /// Calldata (or init code for creation)
    pub input: Bytes,
    /// Gas used by the whole transaction
    pub gas_used: u64,
    /// Return data (or revert data)
    pub output: Bytes,
    /// Whether the transaction succeeded
    pub success: bool,
    /// Top-level error message
    pub error: Option<String>,
    /// Executed instructions in order
    pub steps: Vec<TraceStep>,
    /// Address of the contract created by this transaction
    pub contract_address: Option<Address>,
}

impl TransactionTrace {
    /// Creates a successful trace with no steps
    pub fn new(from: Address, to: Option<Address>, input: impl Into<Bytes>) -> Self {
        Self {
            from,
            to,
            input: input.into(),
            success: true,
            ..Default::default()
        }
    }

    /// Builds a trace from a geth `debug_traceTransaction` default frame
    ///
    /// # Arguments
    /// * `from` - Transaction sender
    /// * `to` - Transaction recipient, `None` for creation
    /// * `value` - Native value sent
    /// * `input` - Transaction calldata
    /// * `frame` - Struct-log frame returned by the node
    pub fn from_geth_frame(
        from: Address,
        to: Option<Address>,
        value: U256,
        input: Bytes,
        frame: &DefaultFrame,
    ) -> Self {
        Self {
            tx_hash: None,
            from,
            to,
            value,
            input,
            gas_used: frame.gas,
            output: frame.return_value.clone(),
            success: !frame.failed,
            error: frame.failed.then(|| "execution reverted".to_string()),
            steps: frame.struct_logs.iter().map(TraceStep::from).collect(),
            contract_address: None,
        }
    }

    /// Whether this transaction deploys a contract
    pub fn is_creation(&self) -> bool {
        self.to.map_or(true, |to| to.is_zero())
    }

    /// The function selector at the head of the calldata
    pub fn selector(&self) -> Option<Selector> {
        (!self.is_creation() && self.input.len() >= 4)
            .then(|| Selector::from_slice(&self.input[..4]))
    }

    /// Address executing the transaction's top-level code
    pub fn entry_address(&self) -> Option<Address> {
        if self.is_creation() {
            self.contract_address
        } else {
            self.to
        }
    }
}

/// How a frame was entered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// The transaction's own top-level frame
    Entry,
    /// CALL, CALLCODE, DELEGATECALL or STATICCALL
    External(CallScheme),
    /// CREATE or CREATE2
    Create(CreateScheme),
    /// Compiler-generated internal function call detected at a JUMPDEST
    Internal,
}

impl CallKind {
    /// Whether the frame runs in a new EVM execution context
    pub fn opens_context(&self) -> bool {
        matches!(self, CallKind::External(_) | CallKind::Create(_))
    }

    /// Whether the frame is a contract creation
    pub fn is_create(&self) -> bool {
        matches!(self, CallKind::Create(_))
    }

    /// Short upper-case label used when rendering frames
    pub fn label(&self) -> &'static str {
        match self {
            CallKind::Entry => "ENTRY",
            CallKind::Internal => "INTERNAL",
            CallKind::External(scheme) => match scheme {
                CallScheme::CallCode => "CALLCODE",
                CallScheme::DelegateCall => "DELEGATECALL",
                CallScheme::StaticCall => "STATICCALL",
                _ => "CALL",
            },
            CallKind::Create(scheme) => match scheme {
                CreateScheme::Create2 { .. } => "CREATE2",
                _ => "CREATE",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_struct_log_conversion_reverses_stack() {
        let log: StructLog = serde_json::from_value(serde_json::json!({
            "pc": 7,
            "op": "CALL",
            "gas": 1000,
            "gasCost": 100,
            "depth": 1,
            "stack": ["0x1", "0x2", "0x3"],
            "memory": [
                "0000000000000000000000000000000000000000000000000000000000000001"
            ],
            "storage": {
                "0000000000000000000000000000000000000000000000000000000000000000":
                "000000000000000000000000000000000000000000000000000000000000002a"
            }
        }))
        .unwrap();

        let step = TraceStep::from(&log);
        assert_eq!(step.op, "CALL");
        assert_eq!(step.stack, vec![U256::from(3), U256::from(2), U256::from(1)]);
        assert_eq!(step.memory().map(|m| m.len()), Some(32));
        assert_eq!(step.memory().unwrap()[31], 1);
        assert_eq!(
            step.storage.as_ref().unwrap().get(&U256::ZERO),
            Some(&U256::from(42))
        );
    }

    #[test]
    fn test_selector_and_creation() {
        let to = address!("00000000000000000000000000000000000000aa");
        let trace = TransactionTrace::new(Address::ZERO, Some(to), vec![0xd0, 0x9d, 0xe0, 0x8a, 0x01]);
        assert!(!trace.is_creation());
        assert_eq!(trace.selector(), Some(Selector::from([0xd0, 0x9d, 0xe0, 0x8a])));

        let deploy = TransactionTrace::new(Address::ZERO, None, vec![0x60, 0x80, 0x60, 0x40]);
        assert!(deploy.is_creation());
        assert_eq!(deploy.selector(), None);
    }

    #[test]
    fn test_call_kind_labels() {
        assert_eq!(CallKind::External(CallScheme::StaticCall).label(), "STATICCALL");
        assert_eq!(CallKind::Create(CreateScheme::Create).label(), "CREATE");
        assert!(CallKind::External(CallScheme::Call).opens_context());
        assert!(!CallKind::Internal.opens_context());
    }
}
