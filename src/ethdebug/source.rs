//! Source files shared by every loaded contract
//!
//! Each file is read once per session. Its line-start table is built the
//! first time an offset in it is resolved and reused afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;

/// A Solidity source file and its lazily built line index
#[derive(Debug)]
pub struct SourceFile {
    path: PathBuf,
    content: String,
    line_starts: OnceCell<Vec<usize>>,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            line_starts: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    fn line_starts(&self) -> &[usize] {
        self.line_starts.get_or_init(|| {
            std::iter::once(0)
                .chain(self.content.match_indices('\n').map(|(i, _)| i + 1))
                .collect()
        })
    }

    /// Number of lines in the file
    pub fn line_count(&self) -> usize {
        self.line_starts().len()
    }

    /// Converts a byte offset to a 1-based (line, column) pair
    ///
    /// Offsets past the end clamp to the last line.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let starts = self.line_starts();
        let index = starts.partition_point(|&start| start <= offset).saturating_sub(1);
        (index + 1, offset.saturating_sub(starts[index]) + 1)
    }

    /// Text of a 1-based line without its line terminator
    pub fn line(&self, line: usize) -> Option<&str> {
        let starts = self.line_starts();
        let start = *starts.get(line.checked_sub(1)?)?;
        let end = starts.get(line).map_or(self.content.len(), |&next| next);
        Some(self.content[start..end].trim_end_matches(&['\n', '\r'][..]))
    }
}

/// Session-wide cache of source files keyed by path
#[derive(Debug, Default)]
pub struct SourceCache {
    files: HashMap<PathBuf, Arc<SourceFile>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached file or reads it from disk
    pub fn load(&mut self, path: &Path) -> std::io::Result<Arc<SourceFile>> {
        if let Some(file) = self.files.get(path) {
            return Ok(Arc::clone(file));
        }
        let content = std::fs::read_to_string(path)?;
        let file = Arc::new(SourceFile::new(path, content));
        self.files.insert(path.to_path_buf(), Arc::clone(&file));
        Ok(file)
    }

    /// Registers contents embedded in the debug info
    ///
    /// An already cached file under the same path is kept.
    pub fn insert(&mut self, path: &Path, content: String) -> Arc<SourceFile> {
        Arc::clone(
            self.files
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(SourceFile::new(path, content))),
        )
    }

    pub fn get(&self, path: &Path) -> Option<Arc<SourceFile>> {
        self.files.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let file = SourceFile::new("A.sol", "contract A {\n    uint x;\n}\n");
        assert_eq!(file.line_col(0), (1, 1));
        assert_eq!(file.line_col(13), (2, 1));
        assert_eq!(file.line_col(17), (2, 5));
        assert_eq!(file.line(2), Some("    uint x;"));
        assert_eq!(file.line(0), None);
        assert_eq!(file.line_count(), 4);
    }

    #[test]
    fn test_cache_shares_files() {
        let mut cache = SourceCache::new();
        let first = cache.insert(Path::new("A.sol"), "one".to_string());
        let second = cache.insert(Path::new("A.sol"), "two".to_string());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.content(), "one");
        assert_eq!(cache.len(), 1);
    }
}
