use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{reaper::ReaperConfig, retention::RetentionConfig};

const ENV_PREFIX: &str = "ATTACHMENT_SERVER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_env() -> String {
    "local".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            structured_logging: false,
            blob_storage: Default::default(),
            reaper: Default::default(),
            retention: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml(&config_str)
    }

    /// Parses YAML, then applies `ATTACHMENT_SERVER_*` environment overrides
    /// (`__` separates nested keys).
    pub fn from_yaml(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.blob_storage.path)
            .map_err(|e| anyhow!("invalid blob storage path {}: {}", self.blob_storage.path, e))?;
        if !matches!(url.scheme(), "s3" | "s3a" | "file" | "memory") {
            return Err(anyhow!(
                "unsupported blob storage scheme: {}",
                url.scheme()
            ));
        }
        if self.blob_storage.operation_timeout_secs == 0 {
            return Err(anyhow!("blob_storage.operation_timeout_secs must be positive"));
        }
        if self.reaper.batch_size == 0 || self.reaper.interval_secs == 0 {
            return Err(anyhow!("reaper interval and batch size must be positive"));
        }
        if self.retention.interval_secs == 0 {
            return Err(anyhow!("retention.interval_secs must be positive"));
        }
        for (kind, policy) in &self.retention.policies {
            policy
                .validate()
                .map_err(|e| anyhow!("invalid retention policy for {}: {}", kind, e))?;
        }
        Ok(())
    }
}
