//! Process-level runtime configuration.
//!
//! These knobs describe the environment the subject runs in, not the subject
//! itself (that comes from the input header). They are read once and cached.

use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

/// Environment variable selecting the number of NUMA partitions.
pub const NUMA_PARTITIONS_VAR: &str = "PAGEHEAP_NUMA_PARTITIONS";

/// Environment variable sizing the diagnostic scratch buffer.
pub const SCRATCH_BYTES_VAR: &str = "PAGEHEAP_SCRATCH_BYTES";

pub const DEFAULT_NUMA_PARTITIONS: usize = 1;
pub const MAX_NUMA_PARTITIONS: usize = 2;

/// Default size of the buffer diagnostic dumps are written into (1 MiB).
pub const DEFAULT_SCRATCH_BYTES: usize = 1 << 20;
pub const MAX_SCRATCH_BYTES: usize = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: `{value}` is not an unsigned integer")]
    NotANumber { var: &'static str, value: String },
    #[error("{var}: {value} is outside [{min}, {max}]")]
    OutOfRange {
        var: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// NUMA partitions available to the subject. With a single partition the
    /// second normal memory tag does not exist.
    pub numa_partitions: usize,
    /// Capacity of the scratch buffer used by the dump operations.
    pub scratch_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            numa_partitions: DEFAULT_NUMA_PARTITIONS,
            scratch_bytes: DEFAULT_SCRATCH_BYTES,
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RuntimeConfig::default();
        if let Some(raw) = lookup(NUMA_PARTITIONS_VAR) {
            config.numa_partitions =
                parse_bounded(NUMA_PARTITIONS_VAR, &raw, 1, MAX_NUMA_PARTITIONS)?;
        }
        if let Some(raw) = lookup(SCRATCH_BYTES_VAR) {
            config.scratch_bytes = parse_bounded(SCRATCH_BYTES_VAR, &raw, 1, MAX_SCRATCH_BYTES)?;
        }
        Ok(config)
    }

    /// The cached process configuration. Invalid environment values are
    /// reported once and replaced by defaults.
    pub fn global() -> &'static RuntimeConfig {
        static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
        CONFIG.get_or_init(|| match Self::from_env() {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "ignoring invalid runtime configuration, using defaults");
                RuntimeConfig::default()
            }
        })
    }
}

fn parse_bounded(
    var: &'static str,
    raw: &str,
    min: usize,
    max: usize,
) -> Result<usize, ConfigError> {
    let value: usize = raw.trim().parse().map_err(|_| ConfigError::NotANumber {
        var,
        value: raw.to_string(),
    })?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            var,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.numa_partitions, 1);
        assert_eq!(config.scratch_bytes, 1 << 20);
    }

    #[test]
    fn reads_both_knobs() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (NUMA_PARTITIONS_VAR, "2"),
            (SCRATCH_BYTES_VAR, " 4096 "),
        ]))
        .unwrap();
        assert_eq!(config.numa_partitions, 2);
        assert_eq!(config.scratch_bytes, 4096);
    }

    #[test]
    fn rejects_bad_values() {
        let err = RuntimeConfig::from_lookup(lookup(&[(NUMA_PARTITIONS_VAR, "3")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { value: 3, .. }));

        let err = RuntimeConfig::from_lookup(lookup(&[(SCRATCH_BYTES_VAR, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotANumber { .. }));
        assert!(err.to_string().contains(SCRATCH_BYTES_VAR));
    }
}
