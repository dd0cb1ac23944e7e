//! Function-boundary table derived from source mappings
//!
//! Solidity's internal functions have no runtime marker. The table below is
//! built by looking at the source line every mapped instruction points to:
//! an instruction whose line is a `function`, `constructor`, `receive` or
//! `fallback` declaration belongs to the entry of that function.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::EthDebugInfo;

static FUNCTION_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*function\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*\(([^)]*)").expect("valid regex")
});

static SPECIAL_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(constructor|receive|fallback)\s*\(([^)]*)").expect("valid regex")
});

/// Data locations and modifiers that may sit between a type and its name
const PARAM_KEYWORDS: &[&str] = &["memory", "storage", "calldata", "payable", "indexed"];

/// A parameter as written in a declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclaredParam {
    pub ty: String,
    pub name: String,
}

/// A function found in the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub params: Vec<DeclaredParam>,
    /// 1-based line of the declaration
    pub source_line: usize,
    /// Lowest PC mapped to the declaration
    pub entry_pc: u64,
}

/// Parses a declaration line into the function name and its parameters
///
/// # Returns
/// * `Some((name, params))` - The line declares a function
/// * `None` - Any other line
pub fn parse_declaration(line: &str) -> Option<(String, Vec<DeclaredParam>)> {
    let (name, params) = if let Some(caps) = FUNCTION_DECL.captures(line) {
        (caps[1].to_string(), caps.get(2).map_or("", |m| m.as_str()))
    } else {
        let caps = SPECIAL_DECL.captures(line)?;
        (caps[1].to_string(), caps.get(2).map_or("", |m| m.as_str()))
    };
    Some((name, parse_params(params)))
}

fn parse_params(list: &str) -> Vec<DeclaredParam> {
    list.split(',')
        .filter_map(|param| {
            let mut tokens = param
                .split_whitespace()
                .filter(|token| !PARAM_KEYWORDS.contains(token));
            let ty = tokens.next()?;
            let ty = match ty {
                "uint" => "uint256",
                "int" => "int256",
                other => other,
            };
            Some(DeclaredParam {
                ty: ty.to_string(),
                name: tokens.last().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// PC-indexed table of function entries
#[derive(Debug, Clone, Default)]
pub struct FunctionBoundaries {
    functions: Vec<FunctionInfo>,
    by_pc: HashMap<u64, usize>,
}

impl FunctionBoundaries {
    /// Scans every mapped instruction of a program for declarations
    pub fn from_debug_info(info: &EthDebugInfo) -> Self {
        let mut table = Self::default();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for instruction in info.instructions() {
            let Some(context) = info.source_context(instruction.offset, 0) else {
                continue;
            };
            let Some((name, params)) = parse_declaration(&context.content) else {
                continue;
            };
            let index = *by_name.entry(name.clone()).or_insert_with(|| {
                table.functions.push(FunctionInfo {
                    name,
                    params,
                    source_line: context.line,
                    entry_pc: instruction.offset,
                });
                table.functions.len() - 1
            });
            let function = &mut table.functions[index];
            function.entry_pc = function.entry_pc.min(instruction.offset);
            table.by_pc.insert(instruction.offset, index);
        }
        table
    }

    /// Function whose declaration the instruction at `pc` maps to
    pub fn function_at(&self, pc: u64) -> Option<&FunctionInfo> {
        self.by_pc.get(&pc).map(|&i| &self.functions[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
