//! Shared fixtures for the integration tests
//!
//! Provides an on-disk ETHDebug file set for a small `Counter` contract and
//! helpers to assemble synthetic struct-log traces.
//!
//! # Counter program layout
//! | pc | opcode   | source                          |
//! |----|----------|---------------------------------|
//! | 16 | JUMPDEST | `function increment(...)`       |
//! | 32 | JUMPDEST | `function _add(...)`            |
//! | 33 | SSTORE   | `count += value;` (`value` live)|
//! | 48 | JUMPDEST | `function fail(...)`            |
//! | 64 | JUMPDEST | `function _check(...)`          |
//! | 70 | REVERT   | `require(...)`                  |
//! |112 | JUMPDEST | `function _keep(Item memory ...)`|

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::address;
use ethdebug_trace::abi::selector;
use ethdebug_trace::types::{Address, Bytes, TraceStep, TransactionTrace, B256, U256};
use ethdebug_trace::{CallFrame, CallKind, CallTree};
use serde_json::{json, Value};

pub const COUNTER: Address = address!("5fbdb2315678afecb367f032d93f642f64180aa3");
pub const VAULT: Address = address!("e7f1725e7734ce288f8367e1bb143e90bb3f0512");
pub const CALLER: Address = address!("00000000000000000000000000000000000000cc");
pub const SENDER: Address = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");

pub const COUNTER_SOURCE: &str = r#"// SPDX-License-Identifier: MIT
pragma solidity ^0.8.0;

contract Counter {
    uint256 public count;

    function increment(uint256 amount) public {
        _add(amount);
    }

    function _add(uint256 value) internal {
        count += value;
    }

    function fail(uint256 code) public {
        _check(code);
    }

    function _check(uint256 code) internal pure {
        require(code == 0, "bad code");
    }

    struct Item {
        uint256 id;
    }

    function _keep(Item memory item) internal pure returns (uint256) {
        return item.id;
    }
}
"#;

pub const COUNTER_ABI: &str = r#"[
  {"type":"function","name":"increment","stateMutability":"nonpayable",
   "inputs":[{"name":"amount","type":"uint256","internalType":"uint256"}],"outputs":[]},
  {"type":"function","name":"fail","stateMutability":"nonpayable",
   "inputs":[{"name":"code","type":"uint256","internalType":"uint256"}],"outputs":[]},
  {"type":"function","name":"count","stateMutability":"view",
   "inputs":[],"outputs":[{"name":"","type":"uint256","internalType":"uint256"}]}
]"#;

fn code_context(needle: &str) -> Value {
    let offset = COUNTER_SOURCE.find(needle).expect("needle in fixture source");
    json!({ "code": { "source": { "id": 0 }, "range": { "offset": offset, "length": needle.len() } } })
}

/// Writes the Counter ETHDebug file set and ABI into `dir`
pub fn write_counter(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("Counter.sol"), COUNTER_SOURCE).unwrap();
    std::fs::write(dir.join("Counter.abi"), COUNTER_ABI).unwrap();
    std::fs::write(
        dir.join("ethdebug.json"),
        json!({ "compilation": { "sources": [ { "id": 0, "path": "Counter.sol" } ] } }).to_string(),
    )
    .unwrap();

    let mut body = code_context("count += value;");
    body["variables"] = json!([{
        "identifier": "value",
        "type": { "kind": "uint", "bits": 256 },
        "pointer": { "location": "stack", "slot": 0 }
    }]);

    let mapped: Vec<(u64, &str, Option<Value>)> = vec![
        (0, "PUSH1", None),
        (5, "JUMP", None),
        (16, "JUMPDEST", Some(code_context("function increment"))),
        (20, "JUMP", None),
        (32, "JUMPDEST", Some(code_context("function _add"))),
        (33, "SSTORE", Some(body)),
        (34, "JUMP", None),
        (48, "JUMPDEST", Some(code_context("function fail"))),
        (50, "JUMP", None),
        (64, "JUMPDEST", Some(code_context("function _check"))),
        (70, "REVERT", Some(code_context("require(code == 0"))),
        (80, "JUMPDEST", None),
        (81, "JUMP", None),
        (88, "JUMPDEST", None),
        (89, "STOP", None),
        (96, "JUMPDEST", None),
        (97, "STOP", None),
        (112, "JUMPDEST", Some(code_context("function _keep"))),
        (120, "JUMP", None),
    ];
    let instructions: Vec<Value> = mapped
        .into_iter()
        .map(|(pc, op, context)| {
            let mut entry = json!({ "offset": pc, "operation": { "mnemonic": op } });
            if let Some(context) = context {
                entry["context"] = context;
            }
            entry
        })
        .collect();
    std::fs::write(
        dir.join("Counter_ethdebug-runtime.json"),
        json!({
            "contract": { "name": "Counter" },
            "environment": "call",
            "instructions": instructions
        })
        .to_string(),
    )
    .unwrap();
}

/// Writes a program whose first instruction differs from Counter's
pub fn write_vault(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("ethdebug.json"),
        json!({ "sources": [ { "id": 0, "path": "Vault.sol", "contents": "contract Vault {}\n" } ] })
            .to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.join("Vault_ethdebug-runtime.json"),
        json!({
            "contract": { "name": "Vault" },
            "instructions": [
                { "offset": 0, "operation": { "mnemonic": "CALLVALUE" } },
                { "offset": 1, "operation": { "mnemonic": "DUP1" } }
            ]
        })
        .to_string(),
    )
    .unwrap();
}

pub fn word(n: u64) -> U256 {
    U256::from(n)
}

pub fn address_word(address: Address) -> U256 {
    U256::from_be_slice(address.as_slice())
}

/// ABI-encoded call with static arguments
pub fn calldata(signature: &str, args: &[U256]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    for arg in args {
        data.extend_from_slice(&arg.to_be_bytes::<32>());
    }
    data
}

/// `Error(string)` revert payload
pub fn error_payload(message: &str) -> Vec<u8> {
    let mut data = vec![0x08, 0xc3, 0x79, 0xa0];
    data.extend(DynSolValue::Tuple(vec![DynSolValue::String(message.to_string())]).abi_encode_params());
    data
}

/// Memory image with `bytes` written at `offset`, padded to a word multiple
pub fn memory_with(regions: &[(usize, &[u8])]) -> Bytes {
    let end = regions
        .iter()
        .map(|(offset, bytes)| offset + bytes.len())
        .max()
        .unwrap_or(0);
    let mut memory = vec![0u8; end.div_ceil(32) * 32];
    for (offset, bytes) in regions {
        memory[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    }
    Bytes::from(memory)
}

/// Accumulates steps with gas dropping by 10 per step
#[derive(Default)]
pub struct TraceBuilder {
    steps: Vec<TraceStep>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn gas(&self) -> u64 {
        100_000 - 10 * self.steps.len() as u64
    }

    pub fn op(mut self, depth: u64, pc: u64, op: &str, stack: &[U256]) -> Self {
        let step = TraceStep::new(pc, op, self.gas(), depth).with_stack(stack.to_vec());
        self.steps.push(step);
        self
    }

    pub fn op_with_memory(mut self, depth: u64, pc: u64, op: &str, stack: &[U256], memory: Bytes) -> Self {
        let step = TraceStep::new(pc, op, self.gas(), depth)
            .with_stack(stack.to_vec())
            .with_memory(memory);
        self.steps.push(step);
        self
    }

    pub fn op_with_storage(mut self, depth: u64, pc: u64, op: &str, storage: BTreeMap<U256, U256>) -> Self {
        let step = TraceStep::new(pc, op, self.gas(), depth).with_storage(storage);
        self.steps.push(step);
        self
    }

    pub fn build(self, to: Address, input: Vec<u8>) -> TransactionTrace {
        let mut trace = TransactionTrace::new(SENDER, Some(to), input);
        trace.steps = self.steps;
        trace
    }
}

/// Stack for a CALL: gas, to, value, argsOffset, argsSize, retOffset, retSize
pub fn call_stack(to: U256, args_offset: u64, args_size: u64) -> Vec<U256> {
    vec![word(50_000), to, U256::ZERO, word(args_offset), word(args_size), U256::ZERO, U256::ZERO]
}

pub fn word_b256(n: u64) -> B256 {
    B256::from(U256::from(n))
}

/// Checks the structural invariants every tree must satisfy
pub fn assert_well_formed(tree: &CallTree) {
    let root = tree.root();
    assert_eq!(root.id, 0);
    assert_eq!(root.kind, CallKind::Entry);
    assert!(root.parent.is_none());
    assert_eq!(root.depth, 0);

    let mut reverted = 0;
    for frame in tree.frames() {
        let exit = frame.exit_step.expect("every frame is closed");
        assert!(frame.entry_step <= exit, "frame {} ends before it starts", frame.id);
        if frame.caused_revert {
            reverted += 1;
        }
        if frame.id == 0 {
            continue;
        }
        assert_ne!(frame.kind, CallKind::Entry, "only the root is an entry frame");
        let parent: &CallFrame = tree.get(frame.parent.expect("non-root has a parent")).unwrap();
        assert!(parent.children.contains(&frame.id));
        assert_eq!(frame.depth, parent.depth + 1);
        assert!(parent.entry_step <= frame.entry_step || frame.call_step.is_some());
        assert!(exit <= parent.exit_step.unwrap());

        let children_gas: u64 = tree.children(frame.id).map(|c| c.gas_used).sum();
        assert!(children_gas <= frame.gas_used, "children of {} use more gas than it", frame.id);
    }
    assert!(reverted <= 1);
}
