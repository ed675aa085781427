//! Pipeline-wide defaults, loadable from a TOML file.
//!
//! Every field has a sensible default, so a configuration file is optional.
//! The file path can be supplied explicitly with [`PipelineConfig::from_file`]
//! or through the [`CONFIG_ENV_VAR`] environment variable:
//!
//! ```toml
//! queue_capacity = 256
//! port_policy = "discard-if-full"
//! log_level = "info"
//! ```

use std::env;
use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::port::{PortPolicy, DEFAULT_QUEUE_CAPACITY};

/// Environment variable holding the path of the configuration file.
pub const CONFIG_ENV_VAR: &str = "CONFLUX_CONFIG";

/// Defaults applied to every node at [`Pipeline::prepare`](crate::Pipeline::prepare)
/// unless overridden per port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Capacity of each in-port sub-queue.
    pub queue_capacity: usize,
    /// Back-pressure policy of in-ports that did not set their own.
    pub port_policy: PortPolicy,
    /// Level filter applied to the global logger, one of
    /// `error | warn | info | debug | trace | off`.
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            port_policy: PortPolicy::default(),
            log_level: "error".into(),
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig =
            toml::from_str(&content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.log_level_filter()?;
        Ok(config)
    }

    /// Load the file named by [`CONFIG_ENV_VAR`], falling back to the
    /// defaults when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn log_level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| PipelineError::Config(format!("unknown log level `{}`", self.log_level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.port_policy, PortPolicy::BlockIfFull);
        assert_eq!(config.log_level_filter().unwrap(), LevelFilter::Error);
    }

    #[test]
    fn parse_toml() {
        let config: PipelineConfig = toml::from_str(
            r#"
            queue_capacity = 4
            port_policy = "discard-if-full"
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.port_policy, PortPolicy::DiscardIfFull);
        assert_eq!(config.log_level_filter().unwrap(), LevelFilter::Debug);
    }

    #[test]
    fn reject_unknown_level() {
        let config = PipelineConfig {
            log_level: "verbose".into(),
            ..Default::default()
        };
        assert!(config.log_level_filter().is_err());
    }
}
