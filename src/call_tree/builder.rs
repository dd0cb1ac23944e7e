use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::{CallFrame, CallTree};
use crate::abi::{parse_signature, AbiFunction, AbiRegistry};
use crate::config::TracerConfig;
use crate::context::ContextStack;
use crate::decoder::{Argument, DecodedValue, MAX_DYNAMIC_BYTES};
use crate::registry::ContractRegistry;
use crate::traits::SignatureLookup;
use crate::types::{
    Address, Bytes, CallKind, CallScheme, Selector, TraceStep, TransactionTrace, B256, U256,
};
use crate::utils::error_utils::revert_reason_or_hex;
use crate::utils::memory_utils::{read_padded, word_to_usize};
use crate::utils::opcode_utils::{classify, create_scheme, stack_inputs, StepOp};

/// Bookkeeping for an open internal frame
#[derive(Debug, Clone, Copy)]
pub(super) struct InternalEntry {
    /// Word found just below the parameters at entry
    pub return_pc: Option<U256>,
    /// Stack height at the entry JUMPDEST
    pub stack_len: usize,
    /// Parameter words above the return address at entry
    pub params: usize,
}

/// Single-pass call-tree construction
///
/// Walks the steps once, keeping the open frames (`call_stack`) and the
/// execution contexts in lock-step with the EVM call depth.
pub(crate) struct CallTreeBuilder<'a> {
    pub(super) trace: &'a TransactionTrace,
    pub(super) steps: &'a [TraceStep],
    pub(super) registry: &'a ContractRegistry,
    pub(super) abis: &'a AbiRegistry,
    pub(super) signatures: &'a dyn SignatureLookup,
    pub(super) config: &'a TracerConfig,
    pub(super) contexts: ContextStack<'a>,
    pub(super) frames: Vec<CallFrame>,
    pub(super) call_stack: Vec<usize>,
    pub(super) internal: HashMap<usize, InternalEntry>,
    /// Call frame whose callee has not executed its first step yet
    awaiting_entry: Option<usize>,
    /// Most recently closed external/create frame
    returning: Option<usize>,
    revert_seen: bool,
    root_depth: u64,
}

impl<'a> CallTreeBuilder<'a> {
    pub(crate) fn new(
        trace: &'a TransactionTrace,
        registry: &'a ContractRegistry,
        abis: &'a AbiRegistry,
        signatures: &'a dyn SignatureLookup,
        config: &'a TracerConfig,
    ) -> Self {
        let limit = config.max_steps.unwrap_or(usize::MAX).min(trace.steps.len());
        if limit < trace.steps.len() {
            debug!(limit, total = trace.steps.len(), "truncating trace");
        }
        Self {
            trace,
            steps: &trace.steps[..limit],
            registry,
            abis,
            signatures,
            config,
            contexts: ContextStack::new(registry, config.memory_offset_threshold),
            frames: Vec::new(),
            call_stack: Vec::new(),
            internal: HashMap::new(),
            awaiting_entry: None,
            returning: None,
            revert_seen: false,
            root_depth: trace.steps.first().map_or(1, |step| step.depth),
        }
    }

    pub(crate) fn build(mut self) -> CallTree {
        self.open_root();
        if self.steps.is_empty() {
            self.frames[0].exit_step = Some(0);
            return CallTree::from_frames(self.frames, 0);
        }

        for i in 0..self.steps.len() {
            self.on_depth_change(i);
            match classify(&self.steps[i].op) {
                StepOp::Call(scheme) => self.on_call(i, scheme),
                StepOp::Create { create2 } => self.on_create(i, create2),
                StepOp::JumpDest => self.on_jumpdest(i),
                StepOp::Jump => self.on_jump(i),
                op if op.is_terminal() => self.on_halt(i, op),
                _ => {}
            }
        }

        let last = self.steps.len() - 1;
        if let Some(id) = self.awaiting_entry.take() {
            self.close_without_code(id);
        }
        while self.call_stack.len() > 1 {
            self.close_top(last);
        }
        self.frames[0].exit_step = Some(last);
        self.call_stack.clear();

        self.identify_main_function();
        let steps = self.steps;
        let gas_at = |step: usize| steps.get(step).map_or(0, |s| s.gas);
        for frame in &mut self.frames {
            let exit = frame.exit_step.unwrap_or(last);
            frame.gas_used = gas_at(frame.entry_step).saturating_sub(gas_at(exit));
        }
        CallTree::from_frames(self.frames, self.steps.len())
    }

    fn open_root(&mut self) {
        let address = self.trace.entry_address();
        let creation = self.trace.is_creation();
        let context = self.contexts.push_entry(address, creation);
        let contract_name = context.contract_name().map(str::to_string);
        let suffix = if creation { "constructor" } else { "runtime_dispatcher" };
        let name = format!("{}::{suffix}", contract_name.as_deref().unwrap_or("Contract"));

        let mut root = CallFrame::new(0, name, CallKind::Entry, 0, self.root_depth);
        root.contract_name = contract_name;
        root.contract_address = address;
        root.success = Some(self.trace.success);
        self.frames.push(root);
        self.call_stack.push(0);
    }

    /// Appends a frame under `parent` and opens it
    pub(super) fn push_frame(&mut self, mut frame: CallFrame, parent: usize) -> usize {
        let id = self.frames.len();
        frame.id = id;
        frame.parent = Some(parent);
        frame.depth = self.frames[parent].depth + 1;
        self.frames[parent].children.push(id);
        self.frames.push(frame);
        self.call_stack.push(id);
        trace!(id, name = %self.frames[id].name, parent, "opened frame");
        id
    }

    /// Nearest open frame running at a shallower call depth
    fn parent_for(&self, call_depth: u64) -> usize {
        self.call_stack
            .iter()
            .rev()
            .copied()
            .find(|&id| self.frames[id].call_depth < call_depth)
            .unwrap_or(0)
    }

    /// Closes the innermost open frame at `step`
    pub(super) fn close_top(&mut self, step: usize) {
        let Some(id) = self.call_stack.pop() else { return };
        let frame = &mut self.frames[id];
        frame.exit_step = Some(step.max(frame.entry_step));
        self.internal.remove(&id);
        if frame.kind.opens_context() {
            self.contexts.pop();
            self.returning = Some(id);
        }
        trace!(id, step, "closed frame");
    }

    fn on_depth_change(&mut self, i: usize) {
        if i == 0 {
            return;
        }
        let steps = self.steps;
        let (prev, step) = (&steps[i - 1], &steps[i]);
        if step.depth > prev.depth {
            self.on_depth_increase(i);
        } else if step.depth < prev.depth {
            self.on_depth_decrease(i);
        } else if let Some(id) = self.awaiting_entry.take() {
            self.close_without_code(id);
            self.record_outcome(id, i);
        }
    }

    fn on_depth_increase(&mut self, i: usize) {
        let steps = self.steps;
        let step = &steps[i];
        let Some(id) = self.awaiting_entry.take() else {
            debug!(step = i, depth = step.depth, "depth increased without a pending call");
            return;
        };
        self.frames[id].entry_step = i;

        let frame = &self.frames[id];
        if !frame.address_confirmed && matches!(frame.kind, CallKind::External(_)) {
            match self
                .registry
                .identify_contract(steps, i, step.depth, self.config.probe_window)
            {
                Some(address) => {
                    if frame.contract_address != Some(address) {
                        debug!(id, from = ?frame.contract_address, to = %address, "call target corrected by code probe");
                        self.contexts.retarget(address);
                    }
                    let name = self.registry.get(&address).map(|c| c.name.clone());
                    let frame = &mut self.frames[id];
                    frame.contract_address = Some(address);
                    frame.contract_name = name;
                    frame.address_confirmed = true;
                }
                None => debug!(id, "call target could not be confirmed"),
            }
        }

        let line = self
            .contexts
            .current()
            .and_then(|c| c.debug_info)
            .and_then(|info| info.source_context(step.pc, 0))
            .map(|c| c.line);
        self.frames[id].source_line = line;
    }

    fn on_depth_decrease(&mut self, i: usize) {
        let depth = self.steps[i].depth;
        if let Some(id) = self.awaiting_entry.take() {
            self.close_without_code(id);
        }
        while let Some(&top) = self.call_stack.last() {
            if top == 0 || self.frames[top].call_depth <= depth {
                break;
            }
            debug!(id = top, step = i - 1, "closing frame left open by exceptional halt");
            self.close_top(i - 1);
        }
        if let Some(id) = self.returning.take() {
            if self.frames[id].call_depth == depth + 1 {
                self.record_outcome(id, i);
            }
        }
    }

    /// Reads the result the caller sees on its stack after the call
    fn record_outcome(&mut self, id: usize, resume_step: usize) {
        let steps = self.steps;
        let Some(top) = steps[resume_step].stack_item(0) else {
            return;
        };
        let frame = &mut self.frames[id];
        match frame.kind {
            CallKind::External(_) => frame.success = Some(!top.is_zero()),
            CallKind::Create(_) => {
                let address = Address::from_word(B256::from(top));
                if address.is_zero() {
                    frame.success = Some(false);
                } else {
                    frame.success = Some(true);
                    frame.contract_address = Some(address);
                    frame.address_confirmed = true;
                    if let Some(contract) = self.registry.get(&address) {
                        frame.contract_name = Some(contract.name.clone());
                    }
                }
            }
            _ => {}
        }
    }

    /// Closes a call whose target ran no code (EOA, precompile, empty account)
    fn close_without_code(&mut self, id: usize) {
        if self.call_stack.last() != Some(&id) {
            return;
        }
        let call_step = self.frames[id].call_step.unwrap_or(self.frames[id].entry_step);
        self.frames[id].entry_step = call_step;
        self.close_top(call_step);
        self.returning = None;
    }

    fn on_call(&mut self, i: usize, scheme: CallScheme) {
        let steps = self.steps;
        let step = &steps[i];
        let kind = CallKind::External(scheme);
        let call_depth = step.depth + 1;
        let parent = self.parent_for(call_depth);
        let arity = stack_inputs(&step.op).unwrap_or(7);

        if step.stack.len() < arity {
            warn!(step = i, op = %step.op, have = step.stack.len(), arity, "call with short stack");
            let mut frame = CallFrame::new(0, "unknown", kind.clone(), i, call_depth);
            frame.call_step = Some(i);
            frame.verified = false;
            frame.address_confirmed = false;
            let id = self.push_frame(frame, parent);
            self.contexts.push(None, kind);
            self.awaiting_entry = Some(id);
            return;
        }

        let resolved = self.contexts.resolve_address(step.stack[1], step.memory());
        let (args_offset, args_size, value) = match scheme {
            CallScheme::Call | CallScheme::CallCode => (step.stack[3], step.stack[4], step.stack[2]),
            _ => (step.stack[2], step.stack[3], U256::ZERO),
        };
        let calldata = self.read_memory(step, args_offset, args_size);

        let mut frame = self.describe_call(&calldata, value, i, call_depth, kind.clone());
        frame.call_step = Some(i);
        frame.contract_address = Some(resolved.address);
        frame.address_confirmed = resolved.confirmed;
        frame.contract_name = self.registry.get(&resolved.address).map(|c| c.name.clone());

        let id = self.push_frame(frame, parent);
        self.contexts.push(Some(resolved.address), kind);
        self.awaiting_entry = Some(id);
    }

    /// Names a call frame from its calldata
    fn describe_call(
        &self,
        calldata: &[u8],
        value: U256,
        step: usize,
        call_depth: u64,
        kind: CallKind,
    ) -> CallFrame {
        let Some((head, rest)) = calldata.split_first_chunk::<4>() else {
            let name = if value.is_zero() { "fallback" } else { "receive" };
            let mut frame = CallFrame::new(0, name, kind, step, call_depth);
            frame.verified = false;
            return frame;
        };
        let selector = Selector::from(*head);
        match self.abis.by_selector(&selector) {
            Some(function) => {
                let mut frame = CallFrame::new(0, function.name(), kind, step, call_depth);
                frame.signature = Some(function.signature.clone());
                frame.selector = Some(selector);
                frame.args = function.decode_inputs(rest);
                frame
            }
            None => {
                let (name, signature) = self.lookup_name(selector);
                let mut frame = CallFrame::new(0, name, kind, step, call_depth);
                frame.signature = signature;
                frame.selector = Some(selector);
                frame.verified = false;
                frame
            }
        }
    }

    /// Name for a selector no ABI knows, via the signature collaborator
    pub(super) fn lookup_name(&self, selector: Selector) -> (String, Option<String>) {
        let fallback = format!("function_{selector}");
        match self.signatures.lookup(selector) {
            Ok(Some(signature)) => {
                let name = parse_signature(&signature)
                    .map(|(name, _)| name)
                    .unwrap_or(fallback);
                (name, Some(signature))
            }
            Ok(None) => (fallback, None),
            Err(err) => {
                warn!(%selector, %err, "signature lookup failed");
                (fallback, None)
            }
        }
    }

    fn on_create(&mut self, i: usize, create2: bool) {
        let steps = self.steps;
        let step = &steps[i];
        let call_depth = step.depth + 1;
        let parent = self.parent_for(call_depth);
        let arity = if create2 { 4 } else { 3 };

        let salt = create2.then(|| step.stack_item(3)).flatten();
        let kind = CallKind::Create(create_scheme(create2, salt));
        let mut frame = CallFrame::new(0, "constructor", kind.clone(), i, call_depth);
        frame.call_step = Some(i);
        frame.address_confirmed = false;

        if step.stack.len() < arity {
            warn!(step = i, op = %step.op, have = step.stack.len(), arity, "create with short stack");
            frame.verified = false;
        } else {
            let init_code = self.read_memory(step, step.stack[1], step.stack[2]);
            frame.args.push(Argument::new("value", DecodedValue::Uint(step.stack[0])));
            if let Some(salt) = salt {
                frame.args.push(Argument::new("salt", DecodedValue::Raw(B256::from(salt))));
            }
            frame.args.push(Argument::new("init_code", DecodedValue::Bytes(Bytes::from(init_code))));
        }

        let address = self.lookahead_create_address(i);
        if let Some(address) = address {
            frame.contract_address = Some(address);
            frame.contract_name = self.registry.get(&address).map(|c| c.name.clone());
        }
        let id = self.push_frame(frame, parent);
        self.contexts.push(address, kind);
        self.awaiting_entry = Some(id);
    }

    /// Looks a few steps ahead for a PUSH20 carrying the new address
    fn lookahead_create_address(&self, i: usize) -> Option<Address> {
        let end = (i + 1 + self.config.create_lookahead).min(self.steps.len());
        (i + 1..end).find_map(|j| {
            (classify(&self.steps[j].op) == StepOp::Push20)
                .then(|| self.steps.get(j + 1).and_then(|next| next.stack_item(0)))
                .flatten()
                .map(|word| Address::from_word(B256::from(word)))
                .filter(|address| !address.is_zero())
        })
    }

    fn on_halt(&mut self, i: usize, op: StepOp) {
        let steps = self.steps;
        let step = &steps[i];
        let data = match (op, step.stack_item(0), step.stack_item(1)) {
            (StepOp::Return | StepOp::Revert, Some(offset), Some(size)) => {
                Some(self.read_memory(step, offset, size))
            }
            _ => None,
        };

        if op == StepOp::Revert && !self.revert_seen {
            self.revert_seen = true;
            if let Some(&deepest) = self.call_stack.last() {
                let reason = data.as_deref().and_then(revert_reason_or_hex);
                debug!(frame = deepest, step = i, ?reason, "first revert");
                let frame = &mut self.frames[deepest];
                frame.caused_revert = true;
                frame.revert_reason = reason;
            }
        }

        if op == StepOp::Return {
            if let (Some(owner), Some(data)) = (self.context_owner(), data.as_deref()) {
                if matches!(self.frames[owner].kind, CallKind::External(_)) {
                    self.frames[owner].return_value =
                        self.decode_return(self.frames[owner].selector, data);
                }
            }
        }

        if step.depth <= self.root_depth {
            while self.call_stack.len() > 1 {
                self.close_top(i);
            }
            return;
        }
        while let Some(&top) = self.call_stack.last() {
            if top == 0 {
                break;
            }
            let opens_context = self.frames[top].kind.opens_context();
            self.close_top(i);
            if opens_context {
                break;
            }
        }
    }

    /// Innermost open frame that opened the current context
    fn context_owner(&self) -> Option<usize> {
        self.call_stack
            .iter()
            .rev()
            .copied()
            .find(|&id| self.frames[id].kind.opens_context())
    }

    pub(super) fn decode_return(&self, selector: Option<Selector>, data: &[u8]) -> Option<DecodedValue> {
        match selector.and_then(|s| self.abis.by_selector(&s)) {
            Some(function) => function.decode_output(data),
            None if data.is_empty() => None,
            None => Some(DecodedValue::Bytes(Bytes::copy_from_slice(data))),
        }
    }

    /// Copies `[offset, offset + size)` from the step's memory
    fn read_memory(&self, step: &TraceStep, offset: U256, size: U256) -> Vec<u8> {
        if size.is_zero() {
            return Vec::new();
        }
        let Some(memory) = step.memory() else {
            trace!(pc = step.pc, "memory not captured");
            return Vec::new();
        };
        let (Some(offset), Some(size)) = (word_to_usize(offset), word_to_usize(size)) else {
            debug!(pc = step.pc, "memory range does not fit in usize");
            return Vec::new();
        };
        read_padded(memory, offset, size, MAX_DYNAMIC_BYTES).unwrap_or_else(|err| {
            debug!(pc = step.pc, %err, "memory range rejected");
            Vec::new()
        })
    }

    /// Names the transaction's top-level function
    ///
    /// The first root-depth internal frame carrying the selector's name is
    /// promoted to an external call; without one a frame covering the whole
    /// trace is inserted between the root and its children.
    fn identify_main_function(&mut self) {
        let Some(selector) = self.trace.selector() else { return };
        let (abis, trace) = (self.abis, self.trace);
        let function: Option<&AbiFunction> = abis.by_selector(&selector);
        let (name, signature) = match function {
            Some(function) => (function.name().to_string(), Some(function.signature.clone())),
            None => self.lookup_name(selector),
        };
        let args = function.map(|f| f.decode_inputs(&trace.input[4..]));
        let return_value = self.decode_return(Some(selector), &trace.output);

        let root_depth = self.frames[0].call_depth;
        let existing = self.frames.iter().position(|frame| {
            frame.kind == CallKind::Internal && frame.call_depth == root_depth && frame.name == name
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.frames.len();
                let children = std::mem::replace(&mut self.frames[0].children, vec![id]);
                let mut frame = CallFrame::new(id, name.clone(), CallKind::Internal, 0, root_depth);
                frame.exit_step = self.frames[0].exit_step;
                frame.parent = Some(0);
                frame.depth = 1;
                frame.contract_name = self.frames[0].contract_name.clone();
                frame.children = children.clone();
                self.frames.push(frame);
                for child in children {
                    self.frames[child].parent = Some(id);
                    self.deepen(child);
                }
                debug!(id, %name, "synthesized top-level function frame");
                id
            }
        };

        let frame = &mut self.frames[id];
        frame.kind = CallKind::External(CallScheme::Call);
        frame.signature = signature;
        frame.selector = Some(selector);
        frame.verified = function.is_some();
        frame.contract_address = trace.to;
        frame.address_confirmed = true;
        frame.success = Some(trace.success);
        if let Some(args) = args {
            frame.args = args;
        }
        if return_value.is_some() {
            frame.return_value = return_value;
        }
    }

    /// Increments the tree depth of a subtree
    fn deepen(&mut self, id: usize) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            self.frames[id].depth += 1;
            pending.extend(self.frames[id].children.iter().copied());
        }
    }
}
