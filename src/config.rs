//! Node configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::script::DEFAULT_MAX_CALL_DEPTH;

/// Configuration for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Upper bound on worker threads running target bodies
    pub max_blocking_threads: usize,

    /// Maximum length of a future-of-future chain (and of dataflow output
    /// resolution rounds)
    pub max_unwrap_depth: usize,

    /// Maximum nesting of script function calls
    pub max_call_depth: usize,

    /// Name prefix for worker threads
    pub thread_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_blocking_threads: 64,
            max_unwrap_depth: 64,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            thread_name: "xscript-worker".to_string(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: NodeConfig = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no node can run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_blocking_threads == 0 {
            return Err(Error::Config("max_blocking_threads must be at least 1".into()));
        }
        if self.max_unwrap_depth == 0 {
            return Err(Error::Config("max_unwrap_depth must be at least 1".into()));
        }
        if self.max_call_depth == 0 {
            return Err(Error::Config("max_call_depth must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_unwrap_depth": 8, "thread_name": "w"}}"#).unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.max_unwrap_depth, 8);
        assert_eq!(config.thread_name, "w");
        assert_eq!(config.max_blocking_threads, NodeConfig::default().max_blocking_threads);
    }

    #[test]
    fn load_rejects_bad_files() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(NodeConfig::load(file.path()), Err(Error::Config(_))));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_blocking_threads": 0}}"#).unwrap();
        assert!(matches!(NodeConfig::load(file.path()), Err(Error::Config(_))));

        assert!(NodeConfig::load("/nonexistent/xscript.json").is_err());
    }
}
