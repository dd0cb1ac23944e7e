//! ABI matching, selector computation and calldata handling
//!
//! This module provides:
//! - Canonical type strings and signatures for ABI functions, including
//!   tuples (`(t1,t2)`) and arrays of tuples (`(t1,t2)[]`)
//! - Structural matching of human-readable signatures against ABI entries,
//!   used to pick the right overload
//! - An [`AbiRegistry`] indexing loaded ABI documents by selector and name
//! - Calldata / return data decoding and call encoding through `dyn-abi`

use std::collections::HashMap;
use std::path::Path;

use alloy::dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy::json_abi::{Function, JsonAbi, Param};
use alloy::primitives::keccak256;
use tracing::debug;

use crate::decoder::{decode, Argument, DecodedValue};
use crate::errors::AbiError;
use crate::types::{Bytes, Selector, B256};

/// Splits a comma-separated type or argument list at nesting depth zero
///
/// Whitespace around items is trimmed and empty items are dropped.
pub fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                items.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(list[start..].trim());
    items.retain(|item| !item.is_empty());
    items
}

/// Parses `name(type1,type2,...)` into its name and parameter types
///
/// Parameter names after the type (`transfer(address to, uint256 amount)`)
/// are dropped.
///
/// # Returns
/// * `Some((name, types))` - Parsed signature
/// * `None` - Input is not of the form `name(...)`
pub fn parse_signature(signature: &str) -> Option<(String, Vec<String>)> {
    let signature = signature.trim();
    let open = signature.find('(')?;
    let inner = signature[open + 1..].strip_suffix(')')?;
    let name = signature[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
        return None;
    }
    let types = split_top_level(inner)
        .into_iter()
        .map(|item| {
            // keep tuple types whole, drop a trailing parameter name otherwise
            if item.starts_with('(') {
                match item.rfind(')') {
                    Some(close) => {
                        let rest = &item[close + 1..];
                        let suffix_end = rest.find(' ').unwrap_or(rest.len());
                        format!("{}{}", &item[..=close], &rest[..suffix_end])
                    }
                    None => item.to_string(),
                }
            } else {
                item.split_whitespace().next().unwrap_or(item).to_string()
            }
        })
        .collect();
    Some((name.to_string(), types))
}

fn normalize_alias(ty: &str) -> &str {
    match ty {
        "uint" => "uint256",
        "int" => "int256",
        "byte" => "bytes1",
        other => other,
    }
}

/// Splits the last array dimension off a type: `T[2][]` -> (`T[2]`, `[]`)
fn last_dimension(ty: &str) -> Option<(&str, &str)> {
    if !ty.ends_with(']') {
        return None;
    }
    let open = ty.rfind('[')?;
    Some((&ty[..open], &ty[open..]))
}

/// Whether a parsed signature type is compatible with an ABI `type` field
///
/// Tuples written out as `(t1,t2)` match the ABI's `tuple`; array types
/// match when their outermost dimensions agree and their bases match.
pub fn match_single_type(parsed: &str, abi_type: &str) -> bool {
    let parsed = normalize_alias(parsed.trim());
    let abi_type = normalize_alias(abi_type.trim());
    if parsed == abi_type {
        return true;
    }
    if let (Some((parsed_base, parsed_dim)), Some((abi_base, abi_dim))) =
        (last_dimension(parsed), last_dimension(abi_type))
    {
        return parsed_dim == abi_dim && match_single_type(parsed_base, abi_base);
    }
    abi_type == "tuple" && parsed.starts_with('(')
}

/// Whether every parsed type matches the ABI type at the same position
pub fn match_abi_types<P, A>(parsed: &[P], abi_types: &[A]) -> bool
where
    P: AsRef<str>,
    A: AsRef<str>,
{
    parsed.len() == abi_types.len()
        && parsed
            .iter()
            .zip(abi_types)
            .all(|(p, a)| match_single_type(p.as_ref(), a.as_ref()))
}

/// Canonical type string of an ABI parameter as used in signatures
///
/// `tuple` becomes `(component types)` and keeps any array suffix.
pub fn canonical_type(param: &Param) -> String {
    match param.ty.strip_prefix("tuple") {
        Some(suffix) => {
            let components: Vec<String> = param.components.iter().map(canonical_type).collect();
            format!("({}){}", components.join(","), suffix)
        }
        None => param.ty.clone(),
    }
}

/// Canonical `name(types)` signature of a function
pub fn function_signature(function: &Function) -> String {
    let types: Vec<String> = function.inputs.iter().map(canonical_type).collect();
    format!("{}({})", function.name, types.join(","))
}

/// First four bytes of the signature's keccak256 hash
pub fn selector(signature: &str) -> Selector {
    Selector::from_slice(&keccak256(signature.as_bytes())[..4])
}

/// An ABI function with its derived signature and selector
#[derive(Debug, Clone)]
pub struct AbiFunction {
    pub function: Function,
    pub signature: String,
    pub selector: Selector,
    /// Contract whose ABI declared the function
    pub contract: Option<String>,
}

impl AbiFunction {
    pub fn new(function: Function, contract: Option<String>) -> Self {
        let signature = function_signature(&function);
        Self {
            selector: selector(&signature),
            signature,
            function,
            contract,
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Decodes ABI-encoded arguments (calldata without the selector)
    ///
    /// Falls back to word-by-word decoding of static parameters when the
    /// payload is not a valid encoding, e.g. when it was truncated.
    pub fn decode_inputs(&self, data: &[u8]) -> Vec<Argument> {
        let inputs = &self.function.inputs;
        let decoded = inputs
            .iter()
            .map(|p| p.resolve())
            .collect::<Result<Vec<DynSolType>, _>>()
            .map_err(|err| err.to_string())
            .and_then(|types| {
                DynSolType::Tuple(types)
                    .abi_decode_params(data)
                    .map_err(|err| err.to_string())
            });

        match decoded {
            Ok(DynSolValue::Tuple(values)) => inputs
                .iter()
                .zip(values.iter())
                .enumerate()
                .map(|(i, (param, value))| {
                    Argument::new(
                        param_name(param, i),
                        DecodedValue::from_dyn(value, &param.components),
                    )
                })
                .collect(),
            Ok(_) => Vec::new(),
            Err(err) => {
                debug!(signature = %self.signature, %err, "falling back to word decoding");
                inputs
                    .iter()
                    .enumerate()
                    .map(|(i, param)| {
                        let value = match data.get(i * 32..i * 32 + 32) {
                            Some(word) if is_fixed_size(&param.ty) => {
                                decode(&B256::from_slice(word), &param.ty)
                            }
                            Some(_) => DecodedValue::undecodable(format!(
                                "invalid encoding for dynamic `{}`",
                                param.ty
                            )),
                            None => DecodedValue::Unresolved,
                        };
                        Argument::new(param_name(param, i), value)
                    })
                    .collect()
            }
        }
    }

    /// Decodes return data with the function's output types
    ///
    /// A single output is returned as-is, several outputs as a tuple
    /// carrying their names. Functions without outputs return `None`.
    pub fn decode_output(&self, data: &[u8]) -> Option<DecodedValue> {
        let outputs = &self.function.outputs;
        if outputs.is_empty() {
            return None;
        }
        let types = match outputs.iter().map(|p| p.resolve()).collect::<Result<Vec<_>, _>>() {
            Ok(types) => types,
            Err(err) => return Some(DecodedValue::undecodable(err)),
        };
        Some(match DynSolType::Tuple(types).abi_decode_params(data) {
            Ok(DynSolValue::Tuple(values)) if values.len() == 1 => {
                DecodedValue::from_dyn(&values[0], &outputs[0].components)
            }
            Ok(value) => DecodedValue::from_dyn(&value, outputs),
            Err(err) => DecodedValue::undecodable(err),
        })
    }
}

fn param_name(param: &Param, index: usize) -> String {
    if param.name.is_empty() {
        format!("arg{index}")
    } else {
        param.name.clone()
    }
}

/// Whether a type occupies exactly one word on the stack and in calldata heads
///
/// Only elementary value types qualify. Struct names and other unknown
/// identifiers do not, so their values are never read off the stack.
pub fn is_fixed_size(ty: &str) -> bool {
    let ty = normalize_alias(ty.trim());
    if ty.starts_with("enum ") || ty.starts_with("contract ") {
        return true;
    }
    match ty {
        "address" | "address payable" | "bool" => true,
        _ => {
            sized(ty, "uint", |bits| bits % 8 == 0 && bits <= 256)
                || sized(ty, "int", |bits| bits % 8 == 0 && bits <= 256)
                || sized(ty, "bytes", |size| size <= 32)
        }
    }
}

/// `prefix` followed by a non-zero width accepted by `valid`
fn sized(ty: &str, prefix: &str, valid: impl Fn(usize) -> bool) -> bool {
    ty.strip_prefix(prefix)
        .and_then(|digits| digits.parse::<usize>().ok())
        .is_some_and(|width| width > 0 && valid(width))
}

/// ABI entries of every loaded contract, indexed by selector and name
#[derive(Debug, Clone, Default)]
pub struct AbiRegistry {
    functions: Vec<AbiFunction>,
    by_selector: HashMap<Selector, usize>,
    by_name: HashMap<String, Vec<usize>>,
}

impl AbiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every function of an ABI document
    ///
    /// The first function registered for a selector wins.
    ///
    /// # Returns
    /// Number of newly indexed functions
    pub fn add_abi(&mut self, abi: &JsonAbi, contract: Option<&str>) -> usize {
        let mut added = 0;
        for function in abi.functions() {
            let entry = AbiFunction::new(function.clone(), contract.map(str::to_string));
            if self.by_selector.contains_key(&entry.selector) {
                continue;
            }
            let index = self.functions.len();
            self.by_selector.insert(entry.selector, index);
            self.by_name
                .entry(entry.function.name.clone())
                .or_default()
                .push(index);
            self.functions.push(entry);
            added += 1;
        }
        added
    }

    /// Parses and adds an ABI JSON document
    pub fn load_json(&mut self, json: &str, contract: Option<&str>) -> Result<usize, AbiError> {
        let abi: JsonAbi =
            serde_json::from_str(json).map_err(|err| AbiError::Malformed(err.to_string()))?;
        Ok(self.add_abi(&abi, contract))
    }

    /// Reads and adds an ABI JSON file
    pub fn load_file(&mut self, path: &Path, contract: Option<&str>) -> Result<usize, AbiError> {
        let json = std::fs::read_to_string(path).map_err(|err| AbiError::Io {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        self.load_json(&json, contract)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn by_selector(&self, selector: &Selector) -> Option<&AbiFunction> {
        self.by_selector.get(selector).map(|&i| &self.functions[i])
    }

    /// All overloads registered under a function name
    pub fn by_name<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a AbiFunction> + 'a {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .map(move |&i| &self.functions[i])
    }

    /// Picks the ABI function a human-readable signature refers to
    ///
    /// Accepts a bare name (first overload), a canonical signature, or a
    /// signature with tuples spelled out and parameter names attached.
    pub fn resolve_signature(&self, signature: &str) -> Result<&AbiFunction, AbiError> {
        let signature = signature.trim();
        if !signature.contains('(') {
            return self
                .by_name(signature)
                .next()
                .ok_or_else(|| AbiError::UnknownSignature(signature.to_string()));
        }
        let (name, parsed) = parse_signature(signature)
            .ok_or_else(|| AbiError::InvalidSignature(signature.to_string()))?;
        self.by_name(&name)
            .find(|candidate| {
                let abi_types: Vec<&str> =
                    candidate.function.inputs.iter().map(|p| p.ty.as_str()).collect();
                match_abi_types(&parsed, &abi_types)
            })
            .ok_or_else(|| AbiError::UnknownSignature(signature.to_string()))
    }

    /// Decodes calldata whose selector is known
    ///
    /// # Returns
    /// * `Some((function, arguments))` - Selector matched a loaded ABI entry
    /// * `None` - Calldata shorter than a selector or selector unknown
    pub fn decode_calldata(&self, calldata: &[u8]) -> Option<(&AbiFunction, Vec<Argument>)> {
        let (head, rest) = calldata.split_first_chunk::<4>()?;
        let function = self.by_selector(&Selector::from(*head))?;
        Some((function, function.decode_inputs(rest)))
    }

    /// Encodes a call from a human-readable signature and string arguments
    ///
    /// Parameter types come from the matching ABI entry when one is loaded,
    /// otherwise from the signature itself.
    ///
    /// # Example
    /// ```
    /// use ethdebug_trace::abi::AbiRegistry;
    ///
    /// let abis = AbiRegistry::new();
    /// let data = abis.encode_call("transfer(address,uint256)", &[
    ///     "0x00000000000000000000000000000000000000aa",
    ///     "1000",
    /// ]).unwrap();
    /// assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
    /// ```
    pub fn encode_call(&self, signature: &str, args: &[&str]) -> Result<Bytes, AbiError> {
        let (name, parsed) = parse_signature(signature)
            .ok_or_else(|| AbiError::InvalidSignature(signature.to_string()))?;

        let types: Vec<DynSolType> = match self.resolve_signature(signature) {
            Ok(function) => function
                .function
                .inputs
                .iter()
                .map(|p| p.resolve())
                .collect::<Result<_, _>>()
                .map_err(|err| AbiError::InvalidSignature(err.to_string()))?,
            Err(_) => parsed
                .iter()
                .map(|ty| DynSolType::parse(normalize_alias(ty)))
                .collect::<Result<_, _>>()
                .map_err(|err| AbiError::InvalidSignature(err.to_string()))?,
        };

        if types.len() != args.len() {
            return Err(AbiError::ArgumentCount {
                expected: types.len(),
                got: args.len(),
            });
        }

        let values = types
            .iter()
            .zip(args)
            .enumerate()
            .map(|(index, (ty, arg))| {
                ty.coerce_str(arg).map_err(|err| AbiError::Encode {
                    index,
                    ty: ty.sol_type_name().into_owned(),
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let type_names: Vec<String> = types.iter().map(|t| t.sol_type_name().into_owned()).collect();
        let canonical = format!("{}({})", name, type_names.join(","));
        if canonical != signature.replace(' ', "") {
            debug!(%signature, %canonical, "encoding with canonicalized signature");
        }

        let mut data = selector(&canonical).to_vec();
        data.extend(DynSolValue::Tuple(values).abi_encode_params());
        Ok(data.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    const STORE_ABI: &str = r#"[
        {"type":"function","name":"increment","stateMutability":"nonpayable",
         "inputs":[{"name":"amount","type":"uint256"}],
         "outputs":[{"name":"","type":"uint256"}]},
        {"type":"function","name":"set","stateMutability":"nonpayable",
         "inputs":[{"name":"key","type":"uint256"},{"name":"value","type":"uint256"}],
         "outputs":[]},
        {"type":"function","name":"set","stateMutability":"nonpayable",
         "inputs":[{"name":"items","type":"tuple[]","components":[
            {"name":"id","type":"uint256"},{"name":"owner","type":"address"}]}],
         "outputs":[]}
    ]"#;

    #[test]
    fn test_parse_signature() {
        assert_eq!(
            parse_signature("transfer(address to, uint256 amount)"),
            Some(("transfer".to_string(), vec!["address".to_string(), "uint256".to_string()]))
        );
        assert_eq!(
            parse_signature("set((uint256,address)[] items)"),
            Some(("set".to_string(), vec!["(uint256,address)[]".to_string()]))
        );
        assert_eq!(parse_signature("noArgs()"), Some(("noArgs".to_string(), vec![])));
        assert_eq!(parse_signature("broken(uint256"), None);
    }

    #[test]
    fn test_match_types() {
        assert!(match_single_type("uint256", "uint256"));
        assert!(match_single_type("uint", "uint256"));
        assert!(match_single_type("(uint256,address)", "tuple"));
        assert!(match_single_type("(uint256,address)[]", "tuple[]"));
        assert!(match_single_type("uint256[3]", "uint256[3]"));
        assert!(!match_single_type("uint256[3]", "uint256[]"));
        assert!(!match_single_type("address", "uint256"));
        assert!(match_abi_types(&["uint256", "(bool)"], &["uint256", "tuple"]));
        assert!(!match_abi_types(&["uint256"], &["uint256", "uint256"]));
    }

    #[test]
    fn test_canonical_signatures_agree_with_alloy() {
        let abi: JsonAbi = serde_json::from_str(STORE_ABI).unwrap();
        for function in abi.functions() {
            assert_eq!(function_signature(function), function.signature());
            assert_eq!(selector(&function_signature(function)), function.selector());
        }
        assert_eq!(selector("transfer(address,uint256)"), Selector::from([0xa9, 0x05, 0x9c, 0xbb]));
    }

    #[test]
    fn test_fixed_size_types() {
        let fixed = [
            "uint256", "uint", "uint8", "int128", "address", "address payable", "bool",
            "bytes32", "bytes1", "enum Store.State", "contract Store",
        ];
        for ty in fixed {
            assert!(is_fixed_size(ty), "{ty}");
        }
        // struct names from declarations are not value types
        let not_fixed = [
            "Item", "Store.Item", "string", "bytes", "uint256[]", "uint256[2]",
            "(uint256,bool)", "tuple", "uint7", "uint512", "bytes33", "int0",
            "mapping(address => uint256)",
        ];
        for ty in not_fixed {
            assert!(!is_fixed_size(ty), "{ty}");
        }
    }

    #[test]
    fn test_overload_resolution() {
        let mut abis = AbiRegistry::new();
        assert_eq!(abis.load_json(STORE_ABI, Some("Store")).unwrap(), 3);

        let pair = abis.resolve_signature("set(uint256,uint256)").unwrap();
        assert_eq!(pair.signature, "set(uint256,uint256)");

        let tuples = abis.resolve_signature("set((uint256,address)[] items)").unwrap();
        assert_eq!(tuples.signature, "set((uint256,address)[])");

        assert_eq!(abis.resolve_signature("increment").unwrap().name(), "increment");
        assert!(matches!(
            abis.resolve_signature("set(bool)"),
            Err(AbiError::UnknownSignature(_))
        ));
    }

    #[test]
    fn test_calldata_and_output_decoding() {
        let mut abis = AbiRegistry::new();
        abis.load_json(STORE_ABI, None).unwrap();

        let calldata = abis.encode_call("increment(uint256)", &["5"]).unwrap();
        let (function, args) = abis.decode_calldata(&calldata).unwrap();
        assert_eq!(function.name(), "increment");
        assert_eq!(args, vec![Argument::new("amount", DecodedValue::Uint(U256::from(5)))]);

        let output = U256::from(6).to_be_bytes::<32>();
        assert_eq!(
            function.decode_output(&output),
            Some(DecodedValue::Uint(U256::from(6)))
        );

        // truncated calldata still yields the words that are present
        let truncated = &calldata[..4 + 16];
        let (_, args) = abis.decode_calldata(truncated).unwrap();
        assert_eq!(args[0].value, DecodedValue::Unresolved);
    }

    #[test]
    fn test_encode_errors() {
        let abis = AbiRegistry::new();
        assert!(matches!(
            abis.encode_call("f(uint256)", &[]),
            Err(AbiError::ArgumentCount { expected: 1, got: 0 })
        ));
        assert!(matches!(
            abis.encode_call("f(uint256)", &["not a number"]),
            Err(AbiError::Encode { index: 0, .. })
        ));
        assert!(matches!(abis.encode_call("nope", &[]), Err(AbiError::InvalidSignature(_))));
    }
}
