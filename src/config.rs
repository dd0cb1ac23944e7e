//! Analysis configuration
//!
//! Provides the tunables of the call-tree builder:
//! - Via-ir memory-offset threshold for call targets
//! - CREATE address lookahead window
//! - PC-probing window used to confirm heuristic call targets
//! - Source excerpt size and an optional step limit

use serde::Deserialize;

/// Tunables of a [`TraceAnalyzer`](crate::TraceAnalyzer)
///
/// Deserializes from JSON with every field optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Call-target words below this are treated as memory offsets
    pub memory_offset_threshold: u64,
    /// Steps searched after CREATE for a pushed 20-byte address
    pub create_lookahead: usize,
    /// Callee steps compared against each contract's instruction table
    pub probe_window: usize,
    /// Lines of source shown around a location
    pub context_lines: usize,
    /// Steps analysed at most; the rest of the trace is ignored
    pub max_steps: Option<usize>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            memory_offset_threshold: 0x1000,
            create_lookahead: 10,
            probe_window: 32,
            context_lines: 2,
            max_steps: None,
        }
    }
}

impl TracerConfig {
    /// Sets the via-ir memory-offset threshold
    ///
    /// # Returns
    /// * `&mut Self` - Returns self for method chaining
    pub fn set_memory_offset_threshold(&mut self, threshold: u64) -> &mut Self {
        self.memory_offset_threshold = threshold;
        self
    }

    /// Sets how many steps after CREATE are searched for the new address
    pub fn set_create_lookahead(&mut self, steps: usize) -> &mut Self {
        self.create_lookahead = steps;
        self
    }

    /// Sets how many callee steps are compared when confirming a call target
    pub fn set_probe_window(&mut self, steps: usize) -> &mut Self {
        self.probe_window = steps;
        self
    }

    pub fn set_context_lines(&mut self, lines: usize) -> &mut Self {
        self.context_lines = lines;
        self
    }

    /// Limits how many steps are analysed
    pub fn set_max_steps(&mut self, max_steps: Option<usize>) -> &mut Self {
        self.max_steps = max_steps;
        self
    }

    /// Parses a JSON configuration, defaulting missing fields
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = TracerConfig::from_json(r#"{ "create_lookahead": 4 }"#).unwrap();
        assert_eq!(config.create_lookahead, 4);
        assert_eq!(config.memory_offset_threshold, 0x1000);
        assert_eq!(config.max_steps, None);
    }

    #[test]
    fn test_chained_setters() {
        let mut config = TracerConfig::default();
        config.set_memory_offset_threshold(0x200).set_max_steps(Some(10));
        assert_eq!(config.memory_offset_threshold, 0x200);
        assert_eq!(config.max_steps, Some(10));
    }
}
