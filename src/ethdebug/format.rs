//! Serde model of the ETHDebug JSON documents
//!
//! Only the parts the debugger consumes are modelled: the compilation's
//! source table, program instructions with their operation mnemonic, and the
//! `code` / `variables` entries of instruction contexts. Contexts are kept as
//! raw JSON and searched through `gather` and `pick` combinators.

use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;

use super::LocationKind;
use crate::types::U256;

/// `ethdebug.json`
#[derive(Debug, Deserialize)]
pub(crate) struct CompilationDocument {
    #[serde(default)]
    pub compilation: Option<Compilation>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl CompilationDocument {
    pub fn into_sources(self) -> Vec<SourceEntry> {
        match self.compilation {
            Some(compilation) if !compilation.sources.is_empty() => compilation.sources,
            _ => self.sources,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Compilation {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SourceEntry {
    pub id: Number,
    pub path: String,
    #[serde(default)]
    pub contents: Option<String>,
}

/// `<Name>_ethdebug.json` / `<Name>_ethdebug-runtime.json`
#[derive(Debug, Deserialize)]
pub(crate) struct ProgramDocument {
    #[serde(default)]
    pub contract: Option<ContractRef>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub instructions: Vec<InstructionEntry>,
    /// Variables listed with explicit PC ranges
    #[serde(default)]
    pub variables: Vec<ExplicitVariable>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContractRef {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstructionEntry {
    pub offset: Number,
    #[serde(default)]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Operation {
    #[serde(default)]
    pub mnemonic: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExplicitVariable {
    #[serde(alias = "identifier")]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Value,
    pub location: String,
    #[serde(alias = "slot")]
    pub offset: Number,
    pub pc_range: [u64; 2],
}

/// A JSON number or a decimal/hex string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Number {
    Int(u64),
    Text(String),
}

impl Number {
    pub fn to_u256(&self) -> Option<U256> {
        match self {
            Number::Int(n) => Some(U256::from(*n)),
            Number::Text(text) => U256::from_str(text.trim()).ok(),
        }
    }

    pub fn to_u64(&self) -> Option<u64> {
        self.to_u256().and_then(|n| u64::try_from(n).ok())
    }
}

fn value_number(value: &Value) -> Option<U256> {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => U256::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Source range of a context: (source id, byte offset, byte length)
pub(crate) fn code_range(context: &Value) -> Option<(u32, usize, usize)> {
    if let Some(code) = context.get("code") {
        let id = code.pointer("/source/id").and_then(value_number)?;
        let offset = code.pointer("/range/offset").and_then(value_number)?;
        let length = code
            .pointer("/range/length")
            .and_then(value_number)
            .unwrap_or_default();
        return Some((
            u32::try_from(id).ok()?,
            usize::try_from(offset).ok()?,
            usize::try_from(length).ok()?,
        ));
    }
    combinator_children(context).find_map(code_range)
}

fn combinator_children(context: &Value) -> impl Iterator<Item = &Value> {
    ["gather", "pick"]
        .into_iter()
        .filter_map(move |key| context.get(key).and_then(Value::as_array))
        .flatten()
}

/// A variable entry found in an instruction context
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContextVariable {
    pub name: String,
    pub ty: String,
    pub location: LocationKind,
    pub offset: U256,
}

/// Collects `variables` entries from a context and its combinators
pub(crate) fn context_variables(context: &Value, out: &mut Vec<ContextVariable>) {
    if let Some(variables) = context.get("variables").and_then(Value::as_array) {
        for variable in variables {
            if let Some(parsed) = parse_context_variable(variable) {
                out.push(parsed);
            }
        }
    }
    for child in combinator_children(context) {
        context_variables(child, out);
    }
}

fn parse_context_variable(variable: &Value) -> Option<ContextVariable> {
    let name = variable
        .get("identifier")
        .or_else(|| variable.get("name"))
        .and_then(Value::as_str)?;
    let pointer = variable.get("pointer")?;
    let location = pointer
        .get("location")
        .and_then(Value::as_str)
        .and_then(LocationKind::parse)?;
    let offset = pointer
        .get("slot")
        .or_else(|| pointer.get("offset"))
        .and_then(value_number)?;
    let ty = variable.get("type").map(render_type).unwrap_or_default();
    Some(ContextVariable {
        name: name.to_string(),
        ty,
        location,
        offset,
    })
}

/// Renders an ETHDebug type description as a Solidity type string
///
/// Accepts plain strings and `{kind, bits, size, contains, count}` objects.
pub(crate) fn render_type(ty: &Value) -> String {
    if let Some(name) = ty.as_str() {
        return name.to_string();
    }
    let kind = ty.get("kind").and_then(Value::as_str).unwrap_or("unknown");
    let number = |key: &str| ty.get(key).and_then(Value::as_u64);
    match kind {
        "uint" | "int" => format!("{kind}{}", number("bits").unwrap_or(256)),
        "bytes" => match number("size") {
            Some(size) => format!("bytes{size}"),
            None => "bytes".to_string(),
        },
        "contract" => "address".to_string(),
        "enum" => match ty.pointer("/definition/name").and_then(Value::as_str) {
            Some(name) => format!("enum {name}"),
            None => "uint8".to_string(),
        },
        "array" => {
            let element = ty
                .get("contains")
                .and_then(|c| c.get("type").or(Some(c)))
                .map(render_type)
                .unwrap_or_else(|| "unknown".to_string());
            match number("count") {
                Some(count) => format!("{element}[{count}]"),
                None => format!("{element}[]"),
            }
        }
        "struct" | "tuple" => "tuple".to_string(),
        other => other.to_string(),
    }
}
