// CLI Configuration
//
// TOML configuration for the Strata CLI.

use std::path::Path;

use serde::Deserialize;
use strata_kernel::BucketConfig;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Bucket the script runs against.
    pub bucket: BucketConfig,
    /// Logging configuration.
    pub log: LogSection,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bucket: BucketConfig::new("KV"),
            log: LogSection::default(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }
}
