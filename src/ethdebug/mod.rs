//! ETHDebug debug-info model
//!
//! Loads the ETHDebug file set a Solidity compiler writes next to a contract
//! and answers the questions a debugger asks about a program counter:
//! - which source file, line and column produced the instruction
//! - which variables are live and where they are stored
//! - which function declaration the instruction belongs to
//!
//! # File set
//! - `ethdebug.json`: compilation info with the source table
//! - `<Name>_ethdebug.json`: constructor (`create` environment) program
//! - `<Name>_ethdebug-runtime.json`: runtime (`call` environment) program
//! - `<Name>.abi`, `<Name>.bin`: standard compiler outputs
//!
//! Source files are resolved through a [`SourceCache`] shared by every
//! contract of a session.

mod format;
pub mod functions;
pub mod source;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::DebugInfoError;
use crate::types::U256;
use format::{CompilationDocument, ProgramDocument};
pub use functions::{DeclaredParam, FunctionBoundaries, FunctionInfo};
pub use source::{SourceCache, SourceFile};

const COMPILATION_FILE: &str = "ethdebug.json";
const RUNTIME_SUFFIX: &str = "_ethdebug-runtime.json";
const CREATE_SUFFIX: &str = "_ethdebug.json";

/// Which bytecode a program describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    /// Init code run by the deploying transaction or CREATE
    Create,
    /// Deployed code run by calls
    Runtime,
}

/// Where a variable's value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationKind {
    Stack,
    Memory,
    Storage,
}

impl LocationKind {
    pub fn parse(location: &str) -> Option<Self> {
        match location {
            "stack" => Some(LocationKind::Stack),
            "memory" => Some(LocationKind::Memory),
            "storage" => Some(LocationKind::Storage),
            _ => None,
        }
    }
}

/// A byte range in a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub source_id: u32,
    pub offset: usize,
    pub length: usize,
}

/// One bytecode instruction of a program
#[derive(Debug, Clone, Serialize)]
pub struct Instruction {
    pub offset: u64,
    pub mnemonic: Option<String>,
    pub source_location: Option<SourceLocation>,
    /// Raw ETHDebug context
    pub context: Option<serde_json::Value>,
}

/// A variable and the PC range over which its location is valid
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableLocation {
    pub name: String,
    pub ty: String,
    pub location: LocationKind,
    /// Stack depth from the top, memory byte offset, or storage slot
    pub offset: U256,
    /// Inclusive PC range
    pub pc_range: (u64, u64),
}

impl VariableLocation {
    pub fn is_live_at(&self, pc: u64) -> bool {
        (self.pc_range.0..=self.pc_range.1).contains(&pc)
    }
}

/// Source position of an instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceContext {
    pub file: PathBuf,
    /// 1-based line
    pub line: usize,
    /// 1-based byte column
    pub column: usize,
    /// Trimmed text of the line
    pub content: String,
    /// Surrounding lines as (line number, text)
    pub excerpt: Vec<(usize, String)>,
}

/// Debug info of one contract program
#[derive(Debug, Clone)]
pub struct EthDebugInfo {
    pub contract_name: String,
    pub environment: Environment,
    pub sources: BTreeMap<u32, PathBuf>,
    instructions: Vec<Instruction>,
    by_offset: HashMap<u64, usize>,
    variables: Vec<VariableLocation>,
    files: HashMap<u32, Arc<SourceFile>>,
    boundaries: OnceCell<FunctionBoundaries>,
}

impl EthDebugInfo {
    /// Loads a contract's runtime program, falling back to its constructor
    ///
    /// # Arguments
    /// * `debug_dir` - Directory holding the ETHDebug file set
    /// * `contract_name` - Contract to load; the first runtime program in the
    ///   directory is used when absent
    /// * `cache` - Session source cache
    pub fn load(
        debug_dir: &Path,
        contract_name: Option<&str>,
        cache: &mut SourceCache,
    ) -> Result<Self, DebugInfoError> {
        let name = resolve_contract_name(debug_dir, contract_name)?;
        let runtime = debug_dir.join(format!("{name}{RUNTIME_SUFFIX}"));
        let environment = if runtime.is_file() {
            Environment::Runtime
        } else {
            Environment::Create
        };
        Self::load_environment(debug_dir, Some(&name), environment, cache)
    }

    /// Loads one specific program of a contract
    pub fn load_environment(
        debug_dir: &Path,
        contract_name: Option<&str>,
        environment: Environment,
        cache: &mut SourceCache,
    ) -> Result<Self, DebugInfoError> {
        let name = resolve_contract_name(debug_dir, contract_name)?;
        let program_path = debug_dir.join(match environment {
            Environment::Runtime => format!("{name}{RUNTIME_SUFFIX}"),
            Environment::Create => format!("{name}{CREATE_SUFFIX}"),
        });
        if !program_path.is_file() {
            return Err(DebugInfoError::MissingFile(program_path));
        }

        let compilation: CompilationDocument = read_json(&debug_dir.join(COMPILATION_FILE))?;
        let program: ProgramDocument = read_json(&program_path)?;

        let mut sources = BTreeMap::new();
        let mut inline = HashMap::new();
        for entry in compilation.into_sources() {
            let Some(id) = entry.id.to_u64().and_then(|id| u32::try_from(id).ok()) else {
                return Err(DebugInfoError::Malformed {
                    path: debug_dir.join(COMPILATION_FILE),
                    reason: format!("invalid source id for {}", entry.path),
                });
            };
            if let Some(contents) = entry.contents {
                inline.insert(id, contents);
            }
            sources.insert(id, PathBuf::from(entry.path));
        }

        let contract_name = program
            .contract
            .and_then(|c| c.name)
            .unwrap_or_else(|| name.clone());

        let mut instructions = Vec::with_capacity(program.instructions.len());
        let mut observed: Vec<(format::ContextVariable, u64, u64)> = Vec::new();
        for entry in program.instructions {
            let Some(offset) = entry.offset.to_u64() else {
                return Err(DebugInfoError::Malformed {
                    path: program_path.clone(),
                    reason: "instruction offset is not a number".to_string(),
                });
            };
            let source_location = entry.context.as_ref().and_then(format::code_range).map(
                |(source_id, offset, length)| SourceLocation {
                    source_id,
                    offset,
                    length,
                },
            );
            if let Some(context) = &entry.context {
                let mut found = Vec::new();
                format::context_variables(context, &mut found);
                for variable in found {
                    match observed.iter_mut().find(|(v, _, _)| {
                        v.name == variable.name
                            && v.location == variable.location
                            && v.offset == variable.offset
                    }) {
                        Some((_, start, end)) => {
                            *start = (*start).min(offset);
                            *end = (*end).max(offset);
                        }
                        None => observed.push((variable, offset, offset)),
                    }
                }
            }
            instructions.push(Instruction {
                offset,
                mnemonic: entry.operation.and_then(|op| op.mnemonic),
                source_location,
                context: entry.context,
            });
        }
        instructions.sort_by_key(|instruction| instruction.offset);

        let mut variables: Vec<VariableLocation> = observed
            .into_iter()
            .map(|(v, start, end)| VariableLocation {
                name: v.name,
                ty: v.ty,
                location: v.location,
                offset: v.offset,
                pc_range: (start, end),
            })
            .collect();
        for explicit in program.variables {
            let (Some(location), Some(offset)) =
                (LocationKind::parse(&explicit.location), explicit.offset.to_u256())
            else {
                debug!(variable = %explicit.name, "skipping variable with unknown location");
                continue;
            };
            variables.push(VariableLocation {
                name: explicit.name,
                ty: format::render_type(&explicit.ty),
                location,
                offset,
                pc_range: (explicit.pc_range[0], explicit.pc_range[1]),
            });
        }

        let referenced: Vec<u32> = {
            let mut ids: Vec<u32> = instructions
                .iter()
                .filter_map(|i| i.source_location.map(|l| l.source_id))
                .collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let mut files = HashMap::new();
        for id in referenced {
            let Some(path) = sources.get(&id) else {
                return Err(DebugInfoError::SourceNotFound {
                    id,
                    path: PathBuf::new(),
                });
            };
            let file = match inline.remove(&id) {
                Some(contents) => cache.insert(&debug_dir.join(path), contents),
                None => load_source(debug_dir, id, path, cache)?,
            };
            files.insert(id, file);
        }

        let by_offset = instructions
            .iter()
            .enumerate()
            .map(|(i, instruction)| (instruction.offset, i))
            .collect();

        debug!(
            contract = %contract_name,
            ?environment,
            instructions = instructions.len(),
            variables = variables.len(),
            "loaded ETHDebug program"
        );

        Ok(Self {
            contract_name,
            environment,
            sources,
            instructions,
            by_offset,
            variables,
            files,
            boundaries: OnceCell::new(),
        })
    }

    /// Instructions ordered by offset
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Instruction at exactly `pc`
    pub fn instruction_at(&self, pc: u64) -> Option<&Instruction> {
        self.by_offset.get(&pc).map(|&i| &self.instructions[i])
    }

    pub fn source_location(&self, pc: u64) -> Option<SourceLocation> {
        self.instruction_at(pc).and_then(|i| i.source_location)
    }

    /// Source file of a source id
    pub fn source_file(&self, source_id: u32) -> Option<&Arc<SourceFile>> {
        self.files.get(&source_id)
    }

    /// Resolves the source position of the instruction at `pc`
    ///
    /// # Arguments
    /// * `pc` - Program counter; only exact instruction offsets resolve
    /// * `context_lines` - Lines of excerpt to include before and after
    ///
    /// # Returns
    /// `None` when the instruction carries no source mapping
    pub fn source_context(&self, pc: u64, context_lines: usize) -> Option<SourceContext> {
        let location = self.source_location(pc)?;
        let file = self.files.get(&location.source_id)?;
        let (line, column) = file.line_col(location.offset);
        let first = line.saturating_sub(context_lines).max(1);
        let last = (line + context_lines).min(file.line_count());
        let excerpt = (first..=last)
            .filter_map(|n| file.line(n).map(|text| (n, text.to_string())))
            .collect();
        Some(SourceContext {
            file: file.path().to_path_buf(),
            line,
            column,
            content: file.line(line).unwrap_or_default().trim().to_string(),
            excerpt,
        })
    }

    /// Variables live at `pc`, in declaration order
    pub fn variables_at(&self, pc: u64) -> Vec<&VariableLocation> {
        self.variables.iter().filter(|v| v.is_live_at(pc)).collect()
    }

    pub fn variables(&self) -> &[VariableLocation] {
        &self.variables
    }

    /// Function-boundary table, built on first use
    pub fn function_boundaries(&self) -> &FunctionBoundaries {
        self.boundaries
            .get_or_init(|| FunctionBoundaries::from_debug_info(self))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DebugInfoError> {
    if !path.is_file() {
        return Err(DebugInfoError::MissingFile(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| DebugInfoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|err| DebugInfoError::Malformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn load_source(
    debug_dir: &Path,
    id: u32,
    path: &Path,
    cache: &mut SourceCache,
) -> Result<Arc<SourceFile>, DebugInfoError> {
    let mut candidates = vec![debug_dir.join(path), path.to_path_buf()];
    if let Some(parent) = debug_dir.parent() {
        candidates.push(parent.join(path));
    }
    for candidate in &candidates {
        if candidate.is_file() {
            return cache.load(candidate).map_err(|source| DebugInfoError::Io {
                path: candidate.clone(),
                source,
            });
        }
    }
    Err(DebugInfoError::SourceNotFound {
        id,
        path: path.to_path_buf(),
    })
}

/// Uses the given name or the first runtime (then constructor) program found
fn resolve_contract_name(debug_dir: &Path, name: Option<&str>) -> Result<String, DebugInfoError> {
    if !debug_dir.is_dir() {
        return Err(DebugInfoError::DirectoryNotFound(debug_dir.to_path_buf()));
    }
    if let Some(name) = name {
        return Ok(name.to_string());
    }
    let entries = std::fs::read_dir(debug_dir).map_err(|source| DebugInfoError::Io {
        path: debug_dir.to_path_buf(),
        source,
    })?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    [RUNTIME_SUFFIX, CREATE_SUFFIX]
        .iter()
        .find_map(|suffix| {
            names
                .iter()
                .find_map(|file| file.strip_suffix(suffix).filter(|n| !n.is_empty()))
        })
        .map(str::to_string)
        .ok_or_else(|| DebugInfoError::NoContract(debug_dir.to_path_buf()))
}
