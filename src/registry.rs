//! Multi-contract debug-info registry
//!
//! Holds the ETHDebug programs of every contract the session knows about,
//! keyed by address, plus an optional unbound "primary" contract used when a
//! single debug directory is given without an address.
//!
//! Contracts can be registered from:
//! - an explicit `(address, debug_dir, name)` triple
//! - a mapping file: `{"contracts": [{"address", "name", "debug_dir"}]}`
//! - a `deployment.json` written by the deploy tooling, either a single
//!   `{"address", "contract", "ethdebug": {"enabled"}}` record or a
//!   `{"contracts": {"Name": {"address"}}}` table
//! - a spec string `address:name:path`, `address:path` or `path`
//!
//! Batch loaders log and skip entries that fail to load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::RegistryError;
use crate::ethdebug::{EthDebugInfo, Environment, SourceCache};
use crate::types::{Address, TraceStep};

/// Debug info of one registered contract
#[derive(Debug, Clone)]
pub struct ContractDebugInfo {
    /// `None` for the primary contract of single-contract mode
    pub address: Option<Address>,
    pub name: String,
    pub debug_dir: PathBuf,
    /// Runtime program (the constructor program when no runtime one exists)
    pub runtime: EthDebugInfo,
    /// Constructor program, when present alongside the runtime one
    pub constructor: Option<EthDebugInfo>,
}

impl ContractDebugInfo {
    /// Loads both programs of a contract
    pub fn load(
        address: Option<Address>,
        debug_dir: &Path,
        name: Option<&str>,
        sources: &mut SourceCache,
    ) -> Result<Self, RegistryError> {
        let runtime = EthDebugInfo::load(debug_dir, name, sources)?;
        let constructor = match runtime.environment {
            Environment::Runtime => EthDebugInfo::load_environment(
                debug_dir,
                Some(&runtime.contract_name),
                Environment::Create,
                sources,
            )
            .map_err(|err| debug!(%err, "no constructor program"))
            .ok(),
            Environment::Create => None,
        };
        Ok(Self {
            address,
            name: runtime.contract_name.clone(),
            debug_dir: debug_dir.to_path_buf(),
            runtime,
            constructor,
        })
    }

    /// Program for the given environment, falling back to the runtime one
    pub fn debug_info(&self, environment: Environment) -> &EthDebugInfo {
        match environment {
            Environment::Create => self.constructor.as_ref().unwrap_or(&self.runtime),
            Environment::Runtime => &self.runtime,
        }
    }

    /// Path of the `<Name>.abi` file next to the debug info
    pub fn abi_path(&self) -> PathBuf {
        self.debug_dir.join(format!("{}.abi", self.name))
    }
}

#[derive(Debug, Deserialize)]
struct MappingFile {
    contracts: Vec<MappingEntry>,
}

#[derive(Debug, Deserialize)]
struct MappingEntry {
    address: String,
    #[serde(default)]
    name: Option<String>,
    debug_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeploymentFile {
    Multi {
        contracts: HashMap<String, DeployedContract>,
    },
    Single {
        address: String,
        contract: String,
        #[serde(default)]
        ethdebug: Option<EthDebugFlag>,
    },
}

#[derive(Debug, Deserialize)]
struct DeployedContract {
    address: String,
}

#[derive(Debug, Deserialize)]
struct EthDebugFlag {
    #[serde(default)]
    enabled: bool,
}

fn parse_address(text: &str) -> Result<Address, RegistryError> {
    Address::from_str(text.trim()).map_err(|_| RegistryError::InvalidAddress(text.to_string()))
}

fn read_registry_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RegistryError> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| RegistryError::FileNotFound(path.to_path_buf()))?;
    serde_json::from_str(&text).map_err(|err| RegistryError::Malformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Directories a deployment's debug info may live in, in search order
fn debug_dir_candidates(base: &Path, name: &str) -> [PathBuf; 4] {
    [
        base.join(format!("debug_{}", name.to_lowercase())),
        base.join("debug").join(name),
        base.join(name).join("debug"),
        base.to_path_buf(),
    ]
}

/// All registered contracts and the session's shared source cache
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: HashMap<Address, ContractDebugInfo>,
    primary: Option<ContractDebugInfo>,
    sources: SourceCache,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a contract at `address`, replacing any previous entry
    pub fn load_contract(
        &mut self,
        address: Address,
        debug_dir: &Path,
        name: Option<&str>,
    ) -> Result<&ContractDebugInfo, RegistryError> {
        let info = ContractDebugInfo::load(Some(address), debug_dir, name, &mut self.sources)?;
        debug!(%address, contract = %info.name, "registered contract");
        self.contracts.insert(address, info);
        Ok(&self.contracts[&address])
    }

    /// Registers the unbound contract of single-contract mode
    pub fn load_primary(
        &mut self,
        debug_dir: &Path,
        name: Option<&str>,
    ) -> Result<&ContractDebugInfo, RegistryError> {
        let info = ContractDebugInfo::load(None, debug_dir, name, &mut self.sources)?;
        Ok(self.primary.insert(info))
    }

    /// Registers every contract of a mapping file
    ///
    /// Relative `debug_dir` entries are resolved against the file's directory.
    ///
    /// # Returns
    /// Addresses that were registered; failed entries are logged and skipped
    pub fn load_from_mapping_file(&mut self, path: &Path) -> Result<Vec<Address>, RegistryError> {
        let mapping: MappingFile = read_registry_json(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut loaded = Vec::new();
        for entry in mapping.contracts {
            let debug_dir = if entry.debug_dir.is_absolute() {
                entry.debug_dir.clone()
            } else {
                base.join(&entry.debug_dir)
            };
            let result = parse_address(&entry.address).and_then(|address| {
                self.load_contract(address, &debug_dir, entry.name.as_deref())
                    .map(|_| address)
            });
            match result {
                Ok(address) => loaded.push(address),
                Err(err) => warn!(address = %entry.address, %err, "skipping mapped contract"),
            }
        }
        Ok(loaded)
    }

    /// Registers the contracts of a `deployment.json`
    pub fn load_from_deployment(&mut self, path: &Path) -> Result<Vec<Address>, RegistryError> {
        let deployment: DeploymentFile = read_registry_json(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let mut loaded = Vec::new();
        match deployment {
            DeploymentFile::Single {
                address,
                contract,
                ethdebug,
            } => {
                if !ethdebug.map_or(true, |flag| flag.enabled) {
                    warn!(%contract, "deployment was compiled without ETHDebug");
                    return Ok(loaded);
                }
                let address = parse_address(&address)?;
                self.load_deployed(&base, &contract, address)?;
                loaded.push(address);
            }
            DeploymentFile::Multi { contracts } => {
                let mut names: Vec<_> = contracts.into_iter().collect();
                names.sort_by(|a, b| a.0.cmp(&b.0));
                for (name, deployed) in names {
                    let result = parse_address(&deployed.address)
                        .and_then(|address| self.load_deployed(&base, &name, address).map(|_| address));
                    match result {
                        Ok(address) => loaded.push(address),
                        Err(err) => warn!(contract = %name, %err, "skipping deployed contract"),
                    }
                }
            }
        }
        Ok(loaded)
    }

    fn load_deployed(
        &mut self,
        base: &Path,
        name: &str,
        address: Address,
    ) -> Result<&ContractDebugInfo, RegistryError> {
        let debug_dir = debug_dir_candidates(base, name)
            .into_iter()
            .find(|dir| dir.join("ethdebug.json").is_file())
            .ok_or_else(|| RegistryError::DebugDirNotFound(name.to_string()))?;
        self.load_contract(address, &debug_dir, Some(name))
    }

    /// Registers contracts from a spec string
    ///
    /// * `address:name:path` - one contract with an explicit name
    /// * `address:path` - one contract, name detected from the directory
    /// * `path` - a `deployment.json`, or a directory containing one
    pub fn load_spec(&mut self, spec: &str) -> Result<Vec<Address>, RegistryError> {
        let parts: Vec<&str> = spec.splitn(3, ':').collect();
        let looks_like_address = |s: &str| s.starts_with("0x") && s.len() == 42;
        match parts.as_slice() {
            [address, name, path] if looks_like_address(address) => {
                let address = parse_address(address)?;
                self.load_contract(address, Path::new(path), Some(*name))?;
                Ok(vec![address])
            }
            [address, path] if looks_like_address(address) => {
                let address = parse_address(address)?;
                self.load_contract(address, Path::new(path), None)?;
                Ok(vec![address])
            }
            _ if !spec.is_empty() && !looks_like_address(parts[0]) => {
                let path = Path::new(spec);
                let deployment = if path.is_dir() {
                    path.join("deployment.json")
                } else {
                    path.to_path_buf()
                };
                self.load_from_deployment(&deployment)
            }
            _ => Err(RegistryError::InvalidSpec(spec.to_string())),
        }
    }

    pub fn get(&self, address: &Address) -> Option<&ContractDebugInfo> {
        self.contracts.get(address)
    }

    pub fn primary(&self) -> Option<&ContractDebugInfo> {
        self.primary.as_ref()
    }

    /// Registered contracts ordered by address
    pub fn contracts(&self) -> Vec<&ContractDebugInfo> {
        let mut contracts: Vec<_> = self.contracts.values().collect();
        contracts.sort_by_key(|c| c.address);
        contracts
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty() && self.primary.is_none()
    }

    pub fn sources(&self) -> &SourceCache {
        &self.sources
    }

    /// Finds the registered contract whose runtime code is being executed
    ///
    /// Compares up to `window` steps at `depth`, starting at `start`, with
    /// each contract's instruction table. A contract scores one point per
    /// step whose PC maps to an instruction with the same mnemonic and is
    /// ruled out by any mismatching mnemonic.
    ///
    /// # Returns
    /// The unique best-scoring contract, or `None` when there is no match
    /// or a tie
    pub fn identify_contract(
        &self,
        steps: &[TraceStep],
        start: usize,
        depth: u64,
        window: usize,
    ) -> Option<Address> {
        let probe: Vec<&TraceStep> = steps
            .iter()
            .skip(start)
            .take_while(|step| step.depth >= depth)
            .filter(|step| step.depth == depth)
            .take(window)
            .collect();

        let mut best: Option<(Address, usize)> = None;
        let mut tied = false;
        for contract in self.contracts() {
            let Some(address) = contract.address else { continue };
            let mut score = 0;
            for step in &probe {
                match contract.runtime.instruction_at(step.pc) {
                    Some(instruction) => match instruction.mnemonic.as_deref() {
                        Some(mnemonic) if mnemonic != step.op => {
                            score = 0;
                            break;
                        }
                        _ => score += 1,
                    },
                    None => {}
                }
            }
            match best {
                _ if score == 0 => {}
                Some((_, top)) if score < top => {}
                Some((_, top)) if score == top => tied = true,
                _ => {
                    best = Some((address, score));
                    tied = false;
                }
            }
        }
        if tied {
            debug!(start, depth, "ambiguous contract identification");
            return None;
        }
        best.map(|(address, _)| address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const VAULT: &str = "0x00000000000000000000000000000000000000bb";

    /// Writes a two-instruction program with an inline source
    fn write_program(dir: &Path, name: &str, ops: &[(u64, &str)]) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("ethdebug.json"),
            json!({ "compilation": { "sources": [
                { "id": 0, "path": format!("{name}.sol"), "contents": format!("contract {name} {{}}\n") }
            ] } })
            .to_string(),
        )
        .unwrap();
        let instructions: Vec<_> = ops
            .iter()
            .map(|(pc, op)| json!({ "offset": pc, "operation": { "mnemonic": op } }))
            .collect();
        std::fs::write(
            dir.join(format!("{name}_ethdebug-runtime.json")),
            json!({ "contract": { "name": name }, "instructions": instructions }).to_string(),
        )
        .unwrap();
    }

    fn step(pc: u64, op: &str, depth: u64) -> TraceStep {
        TraceStep::new(pc, op, 100_000, depth)
    }

    #[test]
    fn test_load_contract_and_primary() {
        let dir = tempfile::tempdir().unwrap();
        write_program(dir.path(), "Token", &[(0, "PUSH1"), (2, "MSTORE")]);

        let mut registry = ContractRegistry::new();
        assert!(registry.is_empty());
        let address = parse_address(TOKEN).unwrap();
        let info = registry.load_contract(address, dir.path(), None).unwrap();
        assert_eq!(info.name, "Token");
        assert!(info.constructor.is_none());
        assert_eq!(info.abi_path(), dir.path().join("Token.abi"));

        registry.load_primary(dir.path(), Some("Token")).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.primary().unwrap().address.is_none());
        assert_eq!(registry.get(&address).unwrap().runtime.instructions().len(), 2);
    }

    #[test]
    fn test_mapping_file_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_program(&dir.path().join("token"), "Token", &[(0, "PUSH1")]);
        let mapping = dir.path().join("contracts.json");
        std::fs::write(
            &mapping,
            json!({ "contracts": [
                { "address": TOKEN, "name": "Token", "debug_dir": "token" },
                { "address": "0xnotanaddress", "name": "Bad", "debug_dir": "token" },
                { "address": VAULT, "name": "Vault", "debug_dir": "missing" }
            ] })
            .to_string(),
        )
        .unwrap();

        let mut registry = ContractRegistry::new();
        let loaded = registry.load_from_mapping_file(&mapping).unwrap();
        assert_eq!(loaded, vec![parse_address(TOKEN).unwrap()]);
        assert!(matches!(
            registry.load_from_mapping_file(&dir.path().join("absent.json")),
            Err(RegistryError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_deployment_files() {
        let dir = tempfile::tempdir().unwrap();
        write_program(&dir.path().join("debug_token"), "Token", &[(0, "PUSH1")]);
        write_program(&dir.path().join("debug").join("Vault"), "Vault", &[(0, "PUSH1")]);
        std::fs::write(
            dir.path().join("deployment.json"),
            json!({ "contracts": {
                "Token": { "address": TOKEN },
                "Vault": { "address": VAULT },
                "Ghost": { "address": "0x00000000000000000000000000000000000000cc" }
            } })
            .to_string(),
        )
        .unwrap();

        let mut registry = ContractRegistry::new();
        let loaded = registry.load_spec(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(registry.get(&parse_address(VAULT).unwrap()).unwrap().name, "Vault");

        let single = tempfile::tempdir().unwrap();
        write_program(single.path(), "Counter", &[(0, "PUSH1")]);
        let deployment = single.path().join("deployment.json");
        std::fs::write(
            &deployment,
            json!({ "address": TOKEN, "contract": "Counter", "ethdebug": { "enabled": true } }).to_string(),
        )
        .unwrap();
        let mut registry = ContractRegistry::new();
        assert_eq!(registry.load_from_deployment(&deployment).unwrap().len(), 1);
        assert_eq!(registry.get(&parse_address(TOKEN).unwrap()).unwrap().name, "Counter");

        std::fs::write(
            &deployment,
            json!({ "address": TOKEN, "contract": "Counter", "ethdebug": { "enabled": false } }).to_string(),
        )
        .unwrap();
        assert!(ContractRegistry::new().load_from_deployment(&deployment).unwrap().is_empty());
    }

    #[test]
    fn test_spec_strings() {
        let dir = tempfile::tempdir().unwrap();
        write_program(dir.path(), "Token", &[(0, "PUSH1")]);
        let path = dir.path().to_str().unwrap();

        let mut registry = ContractRegistry::new();
        registry.load_spec(&format!("{TOKEN}:Token:{path}")).unwrap();
        registry.load_spec(&format!("{VAULT}:{path}")).unwrap();
        assert_eq!(registry.len(), 2);

        assert!(matches!(registry.load_spec(""), Err(RegistryError::InvalidSpec(_))));
        assert!(matches!(registry.load_spec(TOKEN), Err(RegistryError::InvalidSpec(_))));
    }

    #[test]
    fn test_identify_contract_by_pc_probe() {
        let dir = tempfile::tempdir().unwrap();
        write_program(&dir.path().join("a"), "Token", &[(0, "PUSH1"), (2, "PUSH1"), (4, "MSTORE")]);
        write_program(&dir.path().join("b"), "Vault", &[(0, "PUSH1"), (2, "CALLVALUE"), (3, "DUP1")]);

        let mut registry = ContractRegistry::new();
        let token = parse_address(TOKEN).unwrap();
        let vault = parse_address(VAULT).unwrap();
        registry.load_contract(token, &dir.path().join("a"), None).unwrap();
        registry.load_contract(vault, &dir.path().join("b"), None).unwrap();

        let steps = vec![
            step(10, "CALL", 1),
            step(0, "PUSH1", 2),
            step(2, "CALLVALUE", 2),
            step(3, "DUP1", 2),
            step(11, "POP", 1),
        ];
        assert_eq!(registry.identify_contract(&steps, 1, 2, 32), Some(vault));
        // Only the shared first instruction is probed: a tie
        assert_eq!(registry.identify_contract(&steps, 1, 2, 1), None);
        assert_eq!(registry.identify_contract(&steps, 4, 2, 32), None);
    }
}
