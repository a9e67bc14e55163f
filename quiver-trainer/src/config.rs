use std::path::Path;

use serde::{Deserialize, Serialize};

use quiver_core::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub http_host: String,
    pub http_port: u16,
    pub data_dir: String,
    pub stream_name: String,
    pub stream_max_len: usize,
    pub consumer_group: String,
    /// Exactly one active consumer per name; operators scale by adding new
    /// consumer names.
    pub consumer_name: String,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub flush_interval_secs: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8092,
            data_dir: "./data/trainer".to_string(),
            stream_name: "feedback".to_string(),
            stream_max_len: 100_000,
            consumer_group: "trainer".to_string(),
            consumer_name: "worker-0".to_string(),
            batch_size: 100,
            batch_timeout_ms: 5_000,
            flush_interval_secs: 10,
        }
    }
}

impl TrainerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("QUIVER_TRAINER"));
        let settings = builder
            .build()
            .map_err(|e| Error::InvalidArgument(format!("trainer config: {e}")))?;
        let config: TrainerConfig = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidArgument(format!("trainer config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".into()));
        }
        if self.consumer_name.is_empty() || self.consumer_group.is_empty() {
            return Err(Error::InvalidArgument(
                "consumer_group and consumer_name must be set".into(),
            ));
        }
        Ok(())
    }
}
