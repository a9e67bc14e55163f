use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use quiver_core::error::{Error, Result};

const DEFAULT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub http_host: String,
    pub http_port: u16,
    pub data_dir: String,
    /// Remote selector base URL; unset runs the selector in-process.
    pub selector_url: Option<String>,
    /// Run the trainer consumer loop inside this process (single-node mode).
    pub embed_trainer: bool,
    pub stream_name: String,
    pub stream_max_len: usize,
    pub token_secret: String,
    pub token_max_age_ms: Option<i64>,
    pub gate_cache_maxsize: usize,
    pub gate_cache_ttl_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8090,
            data_dir: "./data/proxy".to_string(),
            selector_url: None,
            embed_trainer: true,
            stream_name: "feedback".to_string(),
            stream_max_len: 100_000,
            token_secret: DEFAULT_SECRET.to_string(),
            token_max_age_ms: None,
            gate_cache_maxsize: 1000,
            gate_cache_ttl_secs: 30,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("QUIVER_PROXY"));
        let settings = builder
            .build()
            .map_err(|e| Error::InvalidArgument(format!("proxy config: {e}")))?;
        let config: ProxyConfig = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidArgument(format!("proxy config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_secret.is_empty() {
            return Err(Error::InvalidArgument("token_secret must be set".into()));
        }
        if self.token_secret == DEFAULT_SECRET {
            warn!("token_secret is the shipped default; set a real secret in production");
        }
        if self.gate_cache_maxsize == 0 {
            return Err(Error::InvalidArgument(
                "gate_cache_maxsize must be positive".into(),
            ));
        }
        Ok(())
    }
}
