//! Error types for debug-info loading and trace analysis
//!
//! This module defines the error hierarchy used across the crate:
//! - ETHDebug file set loading errors
//! - Contract registry (mapping file, deployment file, spec string) errors
//! - ABI loading, signature resolution and encoding errors
//! - Value decoding failures, surfaced as undecodable values
//!
//! None of these abort call-tree construction: the builder only ever sees
//! already-loaded data, and decoding failures become
//! [`DecodedValue::Undecodable`](crate::decoder::DecodedValue::Undecodable).

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the analysis session
///
/// Encompasses every error a caller of [`TraceAnalyzer`](crate::TraceAnalyzer)
/// can observe.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Errors while reading an ETHDebug file set
    #[error("Debug info error: {0}")]
    DebugInfo(#[from] DebugInfoError),

    /// Errors while registering contracts
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Errors related to ABI documents and signatures
    #[error("ABI error: {0}")]
    Abi(#[from] AbiError),

    /// A step index outside the analyzed trace was requested
    #[error("Step {index} is out of range (trace has {len} steps)")]
    StepOutOfRange { index: usize, len: usize },
}

/// ETHDebug loading errors
///
/// Callers treat these as "no source-level debugging available" for the
/// affected contract.
#[derive(Debug, Error)]
pub enum DebugInfoError {
    /// The debug directory does not exist
    #[error("Debug directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    /// A required ETHDebug file is missing
    #[error("Missing ETHDebug file: {0}")]
    MissingFile(PathBuf),

    /// No `*_ethdebug-runtime.json` or `*_ethdebug.json` file names a contract
    #[error("No ETHDebug program found in {0}")]
    NoContract(PathBuf),

    /// A file exists but its content is not valid ETHDebug JSON
    ///
    /// # Fields
    /// * `path` - File that failed to parse
    /// * `reason` - Parser error message
    #[error("Malformed ETHDebug file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// A source referenced by the compilation could not be read
    #[error("Source {id} not found at {path}")]
    SourceNotFound { id: u32, path: PathBuf },

    /// Underlying I/O failure
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Contract registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A mapping or deployment file does not exist
    #[error("Registry file not found: {0}")]
    FileNotFound(PathBuf),

    /// A mapping or deployment file could not be parsed
    #[error("Malformed registry file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// An address string is not 20 bytes of hex
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A contract spec string is not `address:name:path`, `address:path` or `path`
    #[error("Invalid contract spec: {0}")]
    InvalidSpec(String),

    /// No candidate debug directory contains `ethdebug.json`
    #[error("No ETHDebug directory found for contract {0}")]
    DebugDirNotFound(String),

    /// Loading the contract's debug info failed
    #[error(transparent)]
    DebugInfo(#[from] DebugInfoError),
}

/// ABI errors
#[derive(Debug, Error)]
pub enum AbiError {
    /// ABI file could not be read
    #[error("Failed to read ABI {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    /// ABI JSON is malformed
    #[error("Malformed ABI: {0}")]
    Malformed(String),

    /// A human-readable signature could not be parsed
    #[error("Invalid function signature: {0}")]
    InvalidSignature(String),

    /// No loaded ABI entry matches the signature
    #[error("No ABI function matches signature {0}")]
    UnknownSignature(String),

    /// Argument count differs from the signature's parameter count
    #[error("Expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },

    /// An argument could not be coerced to its parameter type
    #[error("Cannot encode argument {index} as {ty}: {reason}")]
    Encode {
        index: usize,
        ty: String,
        reason: String,
    },
}

/// Value decoding failures
///
/// Never propagated out of the decoder: the message becomes the `reason`
/// of an undecodable value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A read past the end of the memory image
    #[error("memory read out of bounds at 0x{offset:x} (+{len})")]
    OutOfBounds { offset: usize, len: usize },

    /// A dynamic length or element count exceeds the configured cap
    #[error("length {0} exceeds decoding limit")]
    TooLong(usize),

    /// `uintN`/`intN`/`bytesN` with an impossible width
    #[error("invalid type width: {0}")]
    InvalidWidth(String),

    /// Dynamic types need a memory base, not a bare word
    #[error("`{0}` cannot be decoded from a single word")]
    NeedsMemory(String),

    /// Tuples need their component list
    #[error("tuple components unknown for `{0}`")]
    MissingComponents(String),
}
