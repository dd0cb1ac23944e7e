//! Execution context tracking
//!
//! Every CALL or CREATE that enters code runs in a new context: a different
//! address, a different contract and therefore a different debug-info
//! program. The call-tree builder keeps a [`ContextStack`] in lock-step with
//! the frames that open contexts, so that PC lookups always go to the
//! program that is actually executing.
//!
//! Call targets are resolved here as well. The via-ir pipeline may leave a
//! memory offset on the stack where the target address is expected; small
//! target words are therefore looked up in memory first.

use serde::Serialize;
use tracing::debug;

use crate::ethdebug::{EthDebugInfo, Environment};
use crate::registry::{ContractDebugInfo, ContractRegistry};
use crate::types::{Address, CallKind, B256, U256};
use crate::utils::memory_utils::{read_word, word_to_usize};

/// Where a resolved call target came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressSource {
    /// The stack word itself
    Stack,
    /// The word in memory at the offset found on the stack
    Memory,
    /// A small stack word that could not be followed into memory
    Raw,
}

/// A call target and how much it can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: Address,
    pub source: AddressSource,
    /// `false` when the address came from a heuristic and should be checked
    /// against the code that actually runs
    pub confirmed: bool,
}

/// The contract executing in one EVM context
#[derive(Debug, Clone)]
pub struct ExecutionContext<'a> {
    pub address: Option<Address>,
    pub contract: Option<&'a ContractDebugInfo>,
    /// Program used for PC lookups in this context
    pub debug_info: Option<&'a EthDebugInfo>,
    pub kind: CallKind,
    pub environment: Environment,
}

impl ExecutionContext<'_> {
    pub fn contract_name(&self) -> Option<&str> {
        self.contract.map(|c| c.name.as_str())
    }
}

/// Stack of active execution contexts
#[derive(Debug)]
pub struct ContextStack<'a> {
    registry: &'a ContractRegistry,
    memory_offset_threshold: U256,
    contexts: Vec<ExecutionContext<'a>>,
}

impl<'a> ContextStack<'a> {
    pub fn new(registry: &'a ContractRegistry, memory_offset_threshold: u64) -> Self {
        Self {
            registry,
            memory_offset_threshold: U256::from(memory_offset_threshold),
            contexts: Vec::new(),
        }
    }

    fn make_context(
        &self,
        address: Option<Address>,
        kind: CallKind,
        environment: Environment,
    ) -> ExecutionContext<'a> {
        let registry = self.registry;
        let mut contract = address.and_then(|a| registry.get(&a));
        if contract.is_none() && kind == CallKind::Entry {
            contract = registry.primary();
        }
        ExecutionContext {
            address,
            contract,
            debug_info: contract.map(|c| c.debug_info(environment)),
            kind,
            environment,
        }
    }

    /// Pushes the transaction's own context
    ///
    /// Falls back to the primary contract when `address` is not registered.
    pub fn push_entry(&mut self, address: Option<Address>, creation: bool) -> &ExecutionContext<'a> {
        let environment = if creation {
            Environment::Create
        } else {
            Environment::Runtime
        };
        let context = self.make_context(address, CallKind::Entry, environment);
        self.contexts.push(context);
        &self.contexts[self.contexts.len() - 1]
    }

    /// Pushes the context entered by a CALL or CREATE
    ///
    /// Create contexts use the contract's constructor program.
    pub fn push(&mut self, address: Option<Address>, kind: CallKind) -> &ExecutionContext<'a> {
        let environment = if kind.is_create() {
            Environment::Create
        } else {
            Environment::Runtime
        };
        let context = self.make_context(address, kind, environment);
        self.contexts.push(context);
        &self.contexts[self.contexts.len() - 1]
    }

    /// Pops the innermost context; the entry context is never popped
    pub fn pop(&mut self) -> Option<ExecutionContext<'a>> {
        if self.contexts.len() > 1 {
            self.contexts.pop()
        } else {
            None
        }
    }

    pub fn current(&self) -> Option<&ExecutionContext<'a>> {
        self.contexts.last()
    }

    pub fn depth(&self) -> usize {
        self.contexts.len()
    }

    /// Points the innermost context at a different address
    pub fn retarget(&mut self, address: Address) {
        let Some(current) = self.contexts.last() else {
            return;
        };
        let (kind, environment) = (current.kind.clone(), current.environment);
        let context = self.make_context(Some(address), kind, environment);
        debug!(%address, contract = ?context.contract_name(), "retargeted execution context");
        if let Some(last) = self.contexts.last_mut() {
            *last = context;
        }
    }

    /// Resolves the address word of a CALL-family instruction
    ///
    /// # Arguments
    /// * `word` - The `to` stack operand
    /// * `memory` - Memory image at the call step, if captured
    ///
    /// Words below the memory-offset threshold are treated as offsets of the
    /// real address in memory. A non-zero word found there is used but left
    /// unconfirmed; otherwise the raw word is kept and flagged.
    pub fn resolve_address(&self, word: U256, memory: Option<&[u8]>) -> ResolvedAddress {
        let raw = Address::from_word(B256::from(word));
        if word >= self.memory_offset_threshold {
            return ResolvedAddress {
                address: raw,
                source: AddressSource::Stack,
                confirmed: true,
            };
        }
        let from_memory = memory
            .zip(word_to_usize(word))
            .and_then(|(memory, offset)| read_word(memory, offset).ok())
            .map(Address::from_word)
            .filter(|address| !address.is_zero());
        match from_memory {
            Some(address) => {
                debug!(offset = %word, %address, "call target read from memory");
                ResolvedAddress {
                    address,
                    source: AddressSource::Memory,
                    confirmed: false,
                }
            }
            None => ResolvedAddress {
                address: raw,
                source: AddressSource::Raw,
                confirmed: false,
            },
        }
    }
}
