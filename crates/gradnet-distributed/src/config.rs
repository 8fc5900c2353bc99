//! Config - Distributed Autograd Configuration
//!
//! Container sharding and RPC agent settings, loadable from TOML.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::path::Path;
use std::time::Duration;

use gradnet_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Shard count upper bound when derived from available parallelism.
pub const MAX_DEFAULT_SHARDS: usize = 128;

// =============================================================================
// Distributed Autograd Configuration
// =============================================================================

/// Distributed autograd configuration (`[dist_autograd]` table or standalone file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistAutogradConfig {
    /// Context map shards; rounded up to a power of two. Derived from
    /// available parallelism when unset.
    #[serde(default)]
    pub num_shards: Option<usize>,

    /// Deadline for gradient propagation and cleanup RPCs, in milliseconds.
    /// Zero disables the deadline.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Threads per worker handling incoming requests
    #[serde(default = "default_rpc_threads")]
    pub rpc_threads: usize,
}

fn default_rpc_timeout_ms() -> u64 {
    60_000
}

fn default_rpc_threads() -> usize {
    4
}

impl Default for DistAutogradConfig {
    fn default() -> Self {
        Self {
            num_shards: None,
            rpc_timeout_ms: default_rpc_timeout_ms(),
            rpc_threads: default_rpc_threads(),
        }
    }
}

impl DistAutogradConfig {
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

    /// Rejects configurations the container or agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_shards == Some(0) {
            return Err(Error::invalid_state("num_shards must be at least 1"));
        }
        if self.rpc_threads == 0 {
            return Err(Error::invalid_state("rpc_threads must be at least 1"));
        }
        Ok(())
    }

    /// Effective shard count: a power of two.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        match self.num_shards {
            Some(n) => n.max(1).next_power_of_two(),
            None => num_cpus::get()
                .max(1)
                .next_power_of_two()
                .min(MAX_DEFAULT_SHARDS),
        }
    }

    /// RPC deadline, `None` when disabled.
    #[must_use]
    pub fn rpc_timeout(&self) -> Option<Duration> {
        (self.rpc_timeout_ms > 0).then(|| Duration::from_millis(self.rpc_timeout_ms))
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
        let config = DistAutogradConfig::default();
        assert_eq!(config.num_shards, None);
        assert_eq!(config.rpc_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.rpc_threads, 4);

        let shards = config.shard_count();
        assert!(shards.is_power_of_two());
        assert!(shards <= MAX_DEFAULT_SHARDS);
    }

    #[test]
    fn test_shard_count_rounds_up() {
        let config = DistAutogradConfig {
            num_shards: Some(5),
            ..DistAutogradConfig::default()
        };
        assert_eq!(config.shard_count(), 8);
    }

    #[test]
    fn test_from_toml() {
        let config =
            DistAutogradConfig::from_toml_str("num_shards = 16\nrpc_timeout_ms = 0\n").unwrap();
        assert_eq!(config.shard_count(), 16);
        assert_eq!(config.rpc_timeout(), None);
        assert_eq!(config.rpc_threads, 4);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(DistAutogradConfig::from_toml_str("rpc_threads = 0").is_err());
        assert!(DistAutogradConfig::from_toml_str("num_shards = 0").is_err());
        assert!(DistAutogradConfig::from_toml_str("rpc_threads = \"x\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(DistAutogradConfig::load("/nonexistent/dist.toml").is_err());
    }
}
