//! Internal function calls
//!
//! Solidity compiles internal calls to plain jumps. An internal frame is
//! opened when a taken JUMP/JUMPI lands on an instruction that maps to a
//! function declaration, and closed when a later JUMP lands on the return
//! address that was below the arguments at entry while the caller's part
//! of the stack is still in place. Return values may leave the stack
//! higher than it was at entry.

use alloy::json_abi::Param;
use tracing::trace;

use super::builder::{CallTreeBuilder, InternalEntry};
use super::CallFrame;
use crate::abi::{canonical_type, is_fixed_size, AbiFunction};
use crate::decoder::{
    decode, extract_from_memory, extract_from_storage, extract_param_from_memory, Argument,
    DecodedValue,
};
use crate::ethdebug::functions::parse_declaration;
use crate::ethdebug::{DeclaredParam, EthDebugInfo, LocationKind, VariableLocation};
use crate::types::{CallKind, TraceStep, B256, U256};
use crate::utils::memory_utils::word_to_usize;
use crate::utils::opcode_utils::{classify, StepOp};

/// A parameter to recover at function entry
struct ParamSpec<'p> {
    name: String,
    ty: String,
    abi: Option<&'p Param>,
}

/// Function whose entry is at `pc`, with its declared parameters and line
fn function_entry(info: &EthDebugInfo, pc: u64) -> Option<(String, Vec<DeclaredParam>, usize)> {
    let boundaries = info.function_boundaries();
    if !boundaries.is_empty() {
        let function = boundaries.function_at(pc)?;
        return Some((function.name.clone(), function.params.clone(), function.source_line));
    }
    let context = info.source_context(pc, 0)?;
    let (name, params) = parse_declaration(&context.content)?;
    Some((name, params, context.line))
}

fn param_specs<'p>(abi: Option<&'p AbiFunction>, declared: &[DeclaredParam]) -> Vec<ParamSpec<'p>> {
    match abi {
        Some(function) => function
            .function
            .inputs
            .iter()
            .enumerate()
            .map(|(i, param)| ParamSpec {
                name: match (param.name.is_empty(), declared.get(i)) {
                    (true, Some(decl)) => decl.name.clone(),
                    (true, None) => format!("arg{i}"),
                    (false, _) => param.name.clone(),
                },
                ty: canonical_type(param),
                abi: Some(param),
            })
            .collect(),
        None => declared
            .iter()
            .enumerate()
            .map(|(i, decl)| ParamSpec {
                name: if decl.name.is_empty() {
                    format!("arg{i}")
                } else {
                    decl.name.clone()
                },
                ty: decl.ty.clone(),
                abi: None,
            })
            .collect(),
    }
}

fn memory_value(memory: &[u8], offset: usize, ty: &str, abi: Option<&Param>) -> DecodedValue {
    match abi {
        Some(param) => extract_param_from_memory(memory, offset, param),
        None => extract_from_memory(memory, offset, ty),
    }
}

/// Reads a variable of type `ty` from the location ETHDebug gives for it
///
/// `abi` supplies tuple component names when the type comes from an ABI.
pub(crate) fn read_variable(
    step: &TraceStep,
    variable: &VariableLocation,
    ty: &str,
    abi: Option<&Param>,
) -> DecodedValue {
    match variable.location {
        LocationKind::Stack => {
            let Some(word) = word_to_usize(variable.offset).and_then(|n| step.stack_item(n)) else {
                return DecodedValue::Unresolved;
            };
            if is_fixed_size(ty) {
                return decode(&B256::from(word), ty);
            }
            // Reference types on the stack hold a memory pointer
            match (step.memory(), word_to_usize(word)) {
                (Some(memory), Some(pointer)) => memory_value(memory, pointer, ty, abi),
                _ => DecodedValue::Unresolved,
            }
        }
        LocationKind::Memory => match (step.memory(), word_to_usize(variable.offset)) {
            (Some(memory), Some(offset)) => memory_value(memory, offset, ty, abi),
            _ => DecodedValue::Unresolved,
        },
        LocationKind::Storage => step.storage.as_ref().map_or(DecodedValue::Unresolved, |storage| {
            extract_from_storage(storage, variable.offset, ty)
        }),
    }
}

impl CallTreeBuilder<'_> {
    /// Opens an internal frame when a jump lands on a function entry
    pub(super) fn on_jumpdest(&mut self, i: usize) {
        if i == 0 {
            return;
        }
        let steps = self.steps;
        let (prev, step) = (&steps[i - 1], &steps[i]);
        if prev.depth != step.depth {
            return;
        }
        let taken = match classify(&prev.op) {
            StepOp::Jump => true,
            StepOp::JumpI => step.pc != prev.pc + 1,
            _ => false,
        };
        if !taken {
            return;
        }

        let Some(context) = self.contexts.current() else { return };
        let Some(info) = context.debug_info else { return };
        let contract_name = context.contract_name().map(str::to_string);
        let contract_address = context.address;
        let Some((name, declared, source_line)) = function_entry(info, step.pc) else {
            return;
        };

        let already_open = self.call_stack.iter().any(|&id| {
            let frame = &self.frames[id];
            frame.kind == CallKind::Internal
                && frame.name == name
                && frame.contract_name == contract_name
                && frame.call_depth == step.depth
        });
        if already_open {
            trace!(step = i, %name, "function already open");
            return;
        }

        let abis = self.abis;
        let candidates: Vec<&AbiFunction> = abis
            .by_name(&name)
            .filter(|f| declared.is_empty() || f.function.inputs.len() == declared.len())
            .collect();
        let abi = candidates
            .iter()
            .copied()
            .find(|f| f.contract.is_some() && f.contract == contract_name)
            .or_else(|| candidates.first().copied());
        let params = param_specs(abi, &declared);

        let parent = self.call_stack.last().copied().unwrap_or(0);
        let args = self.recover_args(step, info, &params, parent, &name);

        let mut frame = CallFrame::new(0, name, CallKind::Internal, i, step.depth);
        frame.contract_name = contract_name;
        frame.contract_address = contract_address;
        frame.signature = abi.map(|f| f.signature.clone());
        frame.source_line = Some(source_line);
        frame.args = args;
        let id = self.push_frame(frame, parent);
        self.internal.insert(
            id,
            InternalEntry {
                return_pc: step.stack_item(params.len()),
                stack_len: step.stack.len(),
                params: params.len(),
            },
        );
    }

    /// Recovers argument values at a function's entry JUMPDEST
    ///
    /// Sources are tried in order: ETHDebug variable locations, the
    /// arguments of an external parent frame calling the same function,
    /// and finally the stack layout (last argument on top) when every
    /// parameter is a single word.
    fn recover_args(
        &self,
        step: &TraceStep,
        info: &EthDebugInfo,
        params: &[ParamSpec<'_>],
        parent: usize,
        name: &str,
    ) -> Vec<Argument> {
        let live = info.variables_at(step.pc);
        let parent = &self.frames[parent];
        let inherit = matches!(parent.kind, CallKind::External(_)) && parent.name == name;
        let all_fixed = params.iter().all(|p| is_fixed_size(&p.ty));
        let count = params.len();

        params
            .iter()
            .enumerate()
            .map(|(index, param)| {
                let value = live
                    .iter()
                    .find(|v| v.name == param.name)
                    .map(|v| read_variable(step, v, &param.ty, param.abi))
                    .filter(DecodedValue::is_resolved)
                    .or_else(|| {
                        inherit
                            .then(|| {
                                parent
                                    .args
                                    .iter()
                                    .find(|a| a.name == param.name)
                                    .or_else(|| parent.args.get(index))
                            })
                            .flatten()
                            .filter(|a| a.value.is_resolved())
                            .map(|a| a.value.clone())
                    })
                    .or_else(|| {
                        all_fixed
                            .then(|| step.stack_item(count - 1 - index))
                            .flatten()
                            .map(|word| decode(&B256::from(word), &param.ty))
                    })
                    .unwrap_or(DecodedValue::Unresolved);
                Argument::new(param.name.clone(), value)
            })
            .collect()
    }

    /// Closes internal frames when a JUMP lands on their return address
    pub(super) fn on_jump(&mut self, i: usize) {
        let steps = self.steps;
        let step = &steps[i];
        let Some(next) = steps.get(i + 1) else { return };
        if next.depth != step.depth {
            return;
        }
        let target = U256::from(next.pc);
        let returning = self.call_stack.iter().rposition(|&id| {
            let frame = &self.frames[id];
            frame.kind == CallKind::Internal
                && frame.call_depth == step.depth
                && self.internal.get(&id).is_some_and(|entry| {
                    // the caller's words below the return address must survive
                    entry.return_pc == Some(target)
                        && next.stack.len() + entry.params + 1 >= entry.stack_len
                })
        });
        let Some(position) = returning else { return };
        let nested_internal = self.call_stack[position..]
            .iter()
            .all(|&id| self.frames[id].kind == CallKind::Internal);
        if !nested_internal {
            return;
        }
        while self.call_stack.len() > position {
            self.close_top(i);
        }
    }
}
