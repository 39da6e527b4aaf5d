//! Configuration file handling

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use vpnbill_core::BillingConfig;

pub async fn load_config(path: &Path) -> Result<BillingConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: BillingConfig = toml::from_str(&contents).context("Failed to parse config")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid config: {}", e))?;
    Ok(config)
}

pub fn default_toml() -> Result<String> {
    toml::to_string_pretty(&BillingConfig::default()).context("Failed to serialize config")
}

pub async fn write_default(path: &Path) -> Result<()> {
    tokio::fs::write(path, default_toml()?)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
