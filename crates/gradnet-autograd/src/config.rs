//! Config - Engine Configuration
//!
//! Worker-pool sizing and reentrancy limits for [`crate::Engine`], loadable
//! from TOML.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::path::Path;

use gradnet_core::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Engine Configuration
// =============================================================================

/// Engine configuration (`[engine]` table or standalone file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workers serving the CPU ready queue
    #[serde(default = "default_cpu_threads")]
    pub cpu_threads: usize,

    /// Accelerator devices; each gets one ready queue and one worker
    #[serde(default)]
    pub num_devices: usize,

    /// Nesting depth up to which a worker drains its own queue for a
    /// reentrant backward
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,

    /// Upper bound on threads in the reentrant pool
    #[serde(default = "default_reentrant_pool_size")]
    pub reentrant_pool_size: usize,
}

fn default_cpu_threads() -> usize {
    num_cpus::get().clamp(1, 8)
}

fn default_max_recursion_depth() -> usize {
    60
}

fn default_reentrant_pool_size() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_threads: default_cpu_threads(),
            num_devices: 0,
            max_recursion_depth: default_max_recursion_depth(),
            reentrant_pool_size: default_reentrant_pool_size(),
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::invalid_state(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_threads == 0 {
            return Err(Error::invalid_state("cpu_threads must be at least 1"));
        }
        if self.reentrant_pool_size == 0 {
            return Err(Error::invalid_state(
                "reentrant_pool_size must be at least 1",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.cpu_threads >= 1);
        assert_eq!(config.num_devices, 0);
        assert_eq!(config.max_recursion_depth, 60);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("num_devices = 2\ncpu_threads = 3\n").unwrap();
        assert_eq!(config.num_devices, 2);
        assert_eq!(config.cpu_threads, 3);
        assert_eq!(config.reentrant_pool_size, 32);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(EngineConfig::from_toml_str("cpu_threads = \"many\"").is_err());
        assert!(EngineConfig::from_toml_str("cpu_threads = 0").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
