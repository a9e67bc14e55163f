use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use quiver_core::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub http_host: String,
    pub http_port: u16,
    pub data_dir: String,
    pub param_cache_ttl_secs: u64,
    pub param_cache_maxsize: usize,
    pub agent_cache_ttl_secs: u64,
    pub agent_cache_maxsize: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8091,
            data_dir: "./data/selector".to_string(),
            param_cache_ttl_secs: 60,
            param_cache_maxsize: 1000,
            agent_cache_ttl_secs: 300,
            agent_cache_maxsize: 100,
        }
    }
}

impl SelectorConfig {
    /// File (optional) layered under `QUIVER_SELECTOR_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("QUIVER_SELECTOR"));
        let settings = builder
            .build()
            .map_err(|e| Error::InvalidArgument(format!("selector config: {e}")))?;
        let config: SelectorConfig = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidArgument(format!("selector config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.param_cache_maxsize == 0 || self.agent_cache_maxsize == 0 {
            return Err(Error::InvalidArgument(
                "cache maxsize must be positive".into(),
            ));
        }
        if self.param_cache_ttl_secs > self.agent_cache_ttl_secs {
            warn!(
                param_ttl = self.param_cache_ttl_secs,
                agent_ttl = self.agent_cache_ttl_secs,
                "param_cache_ttl > agent_cache_ttl causes avoidable store lookups"
            );
        }
        Ok(())
    }
}
