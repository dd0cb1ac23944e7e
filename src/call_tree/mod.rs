//! Hierarchical call view of a transaction
//!
//! A [`CallTree`] is an arena of [`CallFrame`]s produced by one forward pass
//! over a trace. Frame ids are arena indices: they are assigned once and
//! never change, so consumers may hold on to them across queries.
//!
//! Frames cover three kinds of calls:
//! - external calls and creations, seen directly as opcodes
//! - internal Solidity function calls, inferred from jumps into function
//!   entry points
//! - the transaction's own entry frame, which is always the root

mod builder;
mod internal;

use serde::Serialize;

use crate::decoder::{Argument, DecodedValue};
use crate::types::{Address, CallKind, Selector};

pub(crate) use builder::CallTreeBuilder;
pub(crate) use internal::read_variable;

/// One function invocation in the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFrame {
    /// Arena index
    pub id: usize,
    /// Function name, e.g. `transfer` or `Token::runtime_dispatcher`
    pub name: String,
    pub contract_name: Option<String>,
    /// Canonical signature when an ABI entry or lookup matched
    pub signature: Option<String>,
    pub selector: Option<Selector>,
    /// First step executed in the frame
    pub entry_step: usize,
    /// Last step executed in the frame; `None` only during construction
    pub exit_step: Option<usize>,
    /// EVM call depth the frame's code runs at
    pub call_depth: u64,
    /// Tree depth, 0 for the root
    pub depth: usize,
    pub kind: CallKind,
    /// Step of the CALL/CREATE opcode that opened the frame
    pub call_step: Option<usize>,
    pub contract_address: Option<Address>,
    pub args: Vec<Argument>,
    pub return_value: Option<DecodedValue>,
    pub gas_used: u64,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Set on the single frame that was innermost at the first REVERT
    pub caused_revert: bool,
    pub revert_reason: Option<String>,
    /// 1-based source line of the entry instruction
    pub source_line: Option<usize>,
    /// `false` when the selector matched no ABI entry
    pub verified: bool,
    /// `false` while the target address rests on a heuristic
    pub address_confirmed: bool,
    /// Outcome of external and create frames
    pub success: Option<bool>,
}

impl CallFrame {
    pub(crate) fn new(id: usize, name: impl Into<String>, kind: CallKind, entry_step: usize, call_depth: u64) -> Self {
        Self {
            id,
            name: name.into(),
            contract_name: None,
            signature: None,
            selector: None,
            entry_step,
            exit_step: None,
            call_depth,
            depth: 0,
            kind,
            call_step: None,
            contract_address: None,
            args: Vec::new(),
            return_value: None,
            gas_used: 0,
            parent: None,
            children: Vec::new(),
            caused_revert: false,
            revert_reason: None,
            source_line: None,
            verified: true,
            address_confirmed: true,
            success: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit_step.is_none()
    }

    /// Whether `step` lies within the frame's step range
    pub fn contains_step(&self, step: usize) -> bool {
        self.entry_step <= step && self.exit_step.map_or(true, |exit| step <= exit)
    }

    /// `Contract::name`, or just the name when the contract is unknown
    pub fn qualified_name(&self) -> String {
        match &self.contract_name {
            Some(contract) if !self.name.contains("::") => format!("{contract}::{}", self.name),
            _ => self.name.clone(),
        }
    }

    /// Renders the arguments as `name=value, ...`
    pub fn format_args(&self) -> String {
        self.args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Arena of call frames rooted at the transaction's entry frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallTree {
    frames: Vec<CallFrame>,
    /// Number of steps the tree was built from
    pub step_count: usize,
}

impl CallTree {
    pub(crate) fn from_frames(frames: Vec<CallFrame>, step_count: usize) -> Self {
        Self { frames, step_count }
    }

    /// The `Entry` frame
    pub fn root(&self) -> &CallFrame {
        &self.frames[0]
    }

    pub fn get(&self, id: usize) -> Option<&CallFrame> {
        self.frames.get(id)
    }

    /// Frames in id order
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Children of a frame in execution order
    pub fn children(&self, id: usize) -> impl Iterator<Item = &CallFrame> {
        self.frames
            .get(id)
            .into_iter()
            .flat_map(|frame| frame.children.iter())
            .map(move |&child| &self.frames[child])
    }

    /// Depth-first, pre-order walk starting at the root
    pub fn walk(&self) -> Vec<&CallFrame> {
        let mut out = Vec::with_capacity(self.frames.len());
        let mut pending = vec![0];
        while let Some(id) = pending.pop() {
            let Some(frame) = self.frames.get(id) else { continue };
            out.push(frame);
            pending.extend(frame.children.iter().rev());
        }
        out
    }

    /// The call stack at `step`, outermost frame first
    pub fn frames_at_step(&self, step: usize) -> Vec<&CallFrame> {
        let mut stack = Vec::new();
        let Some(mut current) = self.frames.first().filter(|root| root.contains_step(step)) else {
            return stack;
        };
        loop {
            stack.push(current);
            match self
                .children(current.id)
                .filter(|child| child.contains_step(step))
                .last()
            {
                Some(child) => current = child,
                None => return stack,
            }
        }
    }

    /// The innermost frame executing `step`
    pub fn innermost_frame_at(&self, step: usize) -> Option<&CallFrame> {
        self.frames_at_step(step).pop()
    }

    /// The frame that issued the transaction's first REVERT
    pub fn reverted_frame(&self) -> Option<&CallFrame> {
        self.frames.iter().find(|frame| frame.caused_revert)
    }

    /// Frames whose function name is `name`
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a CallFrame> + 'a {
        self.frames.iter().filter(move |frame| frame.name == name)
    }
}
