//! Analysis session
//!
//! [`TraceAnalyzer`] owns everything that outlives a single transaction:
//! registered contracts with their debug info, loaded ABIs, configuration
//! and the signature-lookup collaborator. Analyses borrow it immutably, so
//! one analyzer can serve any number of traces.
//!
//! # Example
//! ```no_run
//! use ethdebug_trace::{types::Bytes, Address, TraceAnalyzer, TransactionTrace};
//! use std::path::Path;
//!
//! let mut analyzer = TraceAnalyzer::new();
//! let token = Address::with_last_byte(0xaa);
//! analyzer.load_contract(token, Path::new("./debug"), Some("Token"))?;
//!
//! let trace = TransactionTrace::new(Address::ZERO, Some(token), Bytes::new());
//! let tree = analyzer.analyze(&trace);
//! for frame in tree.walk() {
//!     println!("{}{}({})", "  ".repeat(frame.depth), frame.qualified_name(), frame.format_args());
//! }
//! # Ok::<(), ethdebug_trace::TraceError>(())
//! ```

use std::path::Path;

use tracing::{debug, warn};

use crate::abi::AbiRegistry;
use crate::call_tree::{read_variable, CallTree, CallTreeBuilder};
use crate::config::TracerConfig;
use crate::decoder::DecodedValue;
use crate::errors::TraceError;
use crate::ethdebug::{EthDebugInfo, Environment, SourceContext, VariableLocation};
use crate::registry::{ContractDebugInfo, ContractRegistry};
use crate::traits::{NoSignatureLookup, SignatureLookup};
use crate::types::{Address, Bytes, TraceStep, TransactionTrace};

/// Trace analysis session
pub struct TraceAnalyzer {
    registry: ContractRegistry,
    abis: AbiRegistry,
    config: TracerConfig,
    signatures: Box<dyn SignatureLookup>,
}

impl Default for TraceAnalyzer {
    fn default() -> Self {
        Self::with_config(TracerConfig::default())
    }
}

impl std::fmt::Debug for TraceAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceAnalyzer")
            .field("contracts", &self.registry.len())
            .field("abi_functions", &self.abis.len())
            .field("config", &self.config)
            .finish()
    }
}

impl TraceAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TracerConfig) -> Self {
        Self {
            registry: ContractRegistry::new(),
            abis: AbiRegistry::new(),
            config,
            signatures: Box::new(NoSignatureLookup),
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TracerConfig {
        &mut self.config
    }

    /// Sets the collaborator used for selectors no ABI knows
    ///
    /// # Returns
    /// * `&mut Self` - Returns self for method chaining
    pub fn set_signature_lookup(&mut self, lookup: impl SignatureLookup + 'static) -> &mut Self {
        self.signatures = Box::new(lookup);
        self
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn abis(&self) -> &AbiRegistry {
        &self.abis
    }

    /// Registers a contract and the `<Name>.abi` next to its debug info
    pub fn load_contract(
        &mut self,
        address: Address,
        debug_dir: &Path,
        name: Option<&str>,
    ) -> Result<(), TraceError> {
        self.registry.load_contract(address, debug_dir, name)?;
        self.load_registered_abis(&[address]);
        Ok(())
    }

    /// Registers the single contract of a session without an address
    pub fn load_primary(&mut self, debug_dir: &Path, name: Option<&str>) -> Result<(), TraceError> {
        let contract = self.registry.load_primary(debug_dir, name)?;
        let (path, name) = (contract.abi_path(), contract.name.clone());
        if path.is_file() {
            self.abis.load_file(&path, Some(&name))?;
        }
        Ok(())
    }

    /// Registers the contracts listed in a mapping file
    pub fn load_mapping_file(&mut self, path: &Path) -> Result<Vec<Address>, TraceError> {
        let loaded = self.registry.load_from_mapping_file(path)?;
        self.load_registered_abis(&loaded);
        Ok(loaded)
    }

    /// Registers the contracts of a `deployment.json`
    pub fn load_deployment(&mut self, path: &Path) -> Result<Vec<Address>, TraceError> {
        let loaded = self.registry.load_from_deployment(path)?;
        self.load_registered_abis(&loaded);
        Ok(loaded)
    }

    /// Registers contracts from an `address:name:path`, `address:path` or `path` spec
    pub fn load_spec(&mut self, spec: &str) -> Result<Vec<Address>, TraceError> {
        let loaded = self.registry.load_spec(spec)?;
        self.load_registered_abis(&loaded);
        Ok(loaded)
    }

    pub fn load_abi_file(&mut self, path: &Path, contract: Option<&str>) -> Result<usize, TraceError> {
        Ok(self.abis.load_file(path, contract)?)
    }

    pub fn load_abi_json(&mut self, json: &str, contract: Option<&str>) -> Result<usize, TraceError> {
        Ok(self.abis.load_json(json, contract)?)
    }

    fn load_registered_abis(&mut self, addresses: &[Address]) {
        for address in addresses {
            let Some(contract) = self.registry.get(address) else { continue };
            let path = contract.abi_path();
            if !path.is_file() {
                debug!(contract = %contract.name, "no ABI next to debug info");
                continue;
            }
            if let Err(err) = self.abis.load_file(&path, Some(&contract.name)) {
                warn!(contract = %contract.name, %err, "failed to load ABI");
            }
        }
    }

    /// Builds the call tree of a transaction
    pub fn analyze(&self, trace: &TransactionTrace) -> CallTree {
        let tree = CallTreeBuilder::new(
            trace,
            &self.registry,
            &self.abis,
            self.signatures.as_ref(),
            &self.config,
        )
        .build();
        debug!(frames = tree.len(), steps = tree.step_count, "built call tree");
        tree
    }

    /// Encodes calldata from a human-readable signature
    pub fn encode_call(&self, signature: &str, args: &[&str]) -> Result<Bytes, TraceError> {
        Ok(self.abis.encode_call(signature, args)?)
    }

    fn step<'t>(&self, trace: &'t TransactionTrace, index: usize) -> Result<&'t TraceStep, TraceError> {
        trace.steps.get(index).ok_or(TraceError::StepOutOfRange {
            index,
            len: trace.steps.len(),
        })
    }

    /// Program executing at `step`
    ///
    /// The innermost external or create frame containing the step decides
    /// the contract; steps outside any such frame run the entry contract.
    pub fn debug_info_at(
        &self,
        trace: &TransactionTrace,
        tree: &CallTree,
        step: usize,
    ) -> Result<Option<&EthDebugInfo>, TraceError> {
        self.step(trace, step)?;
        let owner = tree
            .frames_at_step(step)
            .into_iter()
            .rev()
            .find(|frame| {
                frame.kind.opens_context()
                    && frame.call_step.is_some_and(|call| call < frame.entry_step)
            });
        let info = match owner {
            Some(frame) => {
                let environment = if frame.kind.is_create() {
                    Environment::Create
                } else {
                    Environment::Runtime
                };
                frame
                    .contract_address
                    .and_then(|address| self.registry.get(&address))
                    .map(|contract| contract.debug_info(environment))
            }
            None => {
                let environment = if trace.is_creation() {
                    Environment::Create
                } else {
                    Environment::Runtime
                };
                self.entry_contract(trace)
                    .map(|contract| contract.debug_info(environment))
            }
        };
        Ok(info)
    }

    fn entry_contract(&self, trace: &TransactionTrace) -> Option<&ContractDebugInfo> {
        trace
            .entry_address()
            .and_then(|address| self.registry.get(&address))
            .or_else(|| self.registry.primary())
    }

    /// Source position of the instruction executed at `step`
    pub fn source_context_at(
        &self,
        trace: &TransactionTrace,
        tree: &CallTree,
        step: usize,
    ) -> Result<Option<SourceContext>, TraceError> {
        let pc = self.step(trace, step)?.pc;
        Ok(self
            .debug_info_at(trace, tree, step)?
            .and_then(|info| info.source_context(pc, self.config.context_lines)))
    }

    /// Variables live at `step` with their current values
    pub fn variables_at(
        &self,
        trace: &TransactionTrace,
        tree: &CallTree,
        step: usize,
    ) -> Result<Vec<(VariableLocation, DecodedValue)>, TraceError> {
        let current = self.step(trace, step)?;
        let Some(info) = self.debug_info_at(trace, tree, step)? else {
            return Ok(Vec::new());
        };
        Ok(info
            .variables_at(current.pc)
            .into_iter()
            .map(|variable| {
                let value = read_variable(current, variable, &variable.ty, None);
                (variable.clone(), value)
            })
            .collect())
    }
}
