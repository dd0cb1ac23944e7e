//! Extension seams of the analyzer
//!
//! This module provides the trait for resolving unknown function selectors
//! to human-readable names.
//!
//! # Key Traits
//! - `SignatureLookup`: Selector-to-signature resolution (e.g. a 4byte
//!   database or a local signature file)

use std::collections::HashMap;

use crate::abi::selector;
use crate::types::Selector;

/// Resolves selectors that no loaded ABI knows about
///
/// Implementations may hit the network or disk; failures are logged by the
/// caller and treated as "unknown".
pub trait SignatureLookup: Send + Sync {
    /// Returns the text signature for a selector, e.g. `transfer(address,uint256)`
    ///
    /// # Returns
    /// * `Ok(Some(signature))` - Selector is known
    /// * `Ok(None)` - Selector is unknown
    /// * `Err(_)` - The lookup itself failed
    fn lookup(&self, selector: Selector) -> anyhow::Result<Option<String>>;
}

/// Lookup that knows no selectors
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignatureLookup;

impl SignatureLookup for NoSignatureLookup {
    fn lookup(&self, _selector: Selector) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// In-memory selector table
#[derive(Debug, Clone, Default)]
pub struct StaticSignatures(HashMap<Selector, String>);

impl StaticSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a text signature, keyed by its keccak selector
    pub fn insert(&mut self, signature: &str) -> &mut Self {
        self.0.insert(selector(signature), signature.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for StaticSignatures {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut table = Self::new();
        for signature in iter {
            table.insert(signature.as_ref());
        }
        table
    }
}

impl SignatureLookup for StaticSignatures {
    fn lookup(&self, selector: Selector) -> anyhow::Result<Option<String>> {
        Ok(self.0.get(&selector).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_signatures() {
        let table: StaticSignatures = ["transfer(address,uint256)", "approve(address,uint256)"]
            .into_iter()
            .collect();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup(Selector::from([0xa9, 0x05, 0x9c, 0xbb])).unwrap().as_deref(),
            Some("transfer(address,uint256)")
        );
        assert_eq!(table.lookup(Selector::ZERO).unwrap(), None);
        assert_eq!(NoSignatureLookup.lookup(Selector::ZERO).unwrap(), None);
    }
}
