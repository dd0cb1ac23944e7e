//! # ETHDebug Trace Analyzer
//!
//! A library for turning flat EVM execution traces into Solidity-level call
//! trees using ETHDebug debug information.
//!
//! ## Core Features
//!
//! - **Call-Tree Reconstruction**
//!   - External calls (CALL, CALLCODE, DELEGATECALL, STATICCALL)
//!   - Contract creation (CREATE, CREATE2) with address recovery
//!   - Internal Solidity function calls detected from jump targets
//!   - Revert origin detection with decoded revert reasons
//!
//! - **Debug Info**
//!   - ETHDebug program loading (runtime and constructor)
//!   - PC to source file, line and column
//!   - Live variable locations on stack, memory and storage
//!
//! - **Value Recovery**
//!   - Typed decoding of stack words, memory and storage
//!   - ABI-driven argument and return value decoding
//!   - Calldata encoding from human-readable signatures
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ethdebug_trace::{StaticSignatures, TraceAnalyzer, TransactionTrace, TracerConfig};
//! use alloy::primitives::address;
//! use std::path::Path;
//!
//! # fn example(trace: TransactionTrace) -> Result<(), ethdebug_trace::TraceError> {
//! let mut config = TracerConfig::default();
//! config.set_probe_window(64);
//!
//! let mut analyzer = TraceAnalyzer::with_config(config);
//! analyzer.load_contract(
//!     address!("5FbDB2315678afecb367f032d93F642f64180aa3"),
//!     Path::new("out/debug_counter"),
//!     Some("Counter"),
//! )?;
//! analyzer.set_signature_lookup(
//!     ["transfer(address,uint256)"].into_iter().collect::<StaticSignatures>(),
//! );
//!
//! let tree = analyzer.analyze(&trace);
//! for frame in tree.walk() {
//!     println!(
//!         "{}[{}] {}({}) gas={}",
//!         "  ".repeat(frame.depth),
//!         frame.kind.label(),
//!         frame.qualified_name(),
//!         frame.format_args(),
//!         frame.gas_used,
//!     );
//! }
//! if let Some(frame) = tree.reverted_frame() {
//!     println!("reverted in {}: {:?}", frame.name, frame.revert_reason);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Structure
//!
//! - `analyzer`: Session facade owning contracts, ABIs and configuration
//! - `call_tree`: Call frames, the call tree and its construction
//! - `ethdebug`: ETHDebug debug-info model and source lookup
//! - `registry`: Multi-contract debug-info registry
//! - `context`: Execution context stack and call-target resolution
//! - `decoder`: Typed value decoding
//! - `abi`: Signatures, selectors, ABI decoding and call encoding
//! - `types`: Trace input types
//! - `traits`: Trait definitions for extensibility
//! - `config`: Analysis tunables
//! - `errors`: Error types and handling
//! - `utils`: Helper functions and utilities

pub mod abi;
pub mod analyzer;
pub mod call_tree;
pub mod config;
pub mod context;
pub mod decoder;
pub mod errors;
pub mod ethdebug;
pub mod registry;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export only the essential types and functions
pub use analyzer::TraceAnalyzer;
pub use call_tree::{CallFrame, CallTree};
pub use config::TracerConfig;
pub use decoder::{Argument, DecodedValue};
pub use errors::TraceError;
pub use traits::{NoSignatureLookup, SignatureLookup, StaticSignatures};
pub use types::{Address, CallKind, TraceStep, TransactionTrace, U256};
