//! Configuration types for portway.

mod engine;
mod listen;
mod protocol;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::forward::RuleConfig;

pub use engine::{EngineConfig, EngineSettings};
pub use listen::AdminConfig;
pub use protocol::Protocol;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Rules created at startup
    #[serde(default)]
    pub rules: Vec<SeedRule>,
}

/// A rule declared in the configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeedRule {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    #[serde(default)]
    pub remark: String,
    /// Start the rule once it is created
    #[serde(default)]
    pub autostart: bool,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

impl SeedRule {
    pub fn config(&self) -> RuleConfig {
        RuleConfig {
            name: self.name.clone(),
            protocol: self.protocol,
            listen_address: self.listen_address.clone(),
            listen_port: self.listen_port,
            target_address: self.target_address.clone(),
            target_port: self.target_port,
            remark: self.remark.clone(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.admin.socket_addr()?;
        self.engine.validate()?;

        // Seed rules must be valid and must not claim overlapping tuples
        let mut tuples = Vec::with_capacity(self.rules.len());
        for seed in &self.rules {
            let config = seed
                .config()
                .normalize()
                .map_err(|e| anyhow::anyhow!("Invalid seed rule '{}': {}", seed.name, e))?;
            let tuple = config
                .listen_tuple()
                .map_err(|e| anyhow::anyhow!("Invalid seed rule '{}': {}", seed.name, e))?;
            if let Some((other, _)) = tuples.iter().find(|(_, claimed)| tuple.overlaps(claimed)) {
                anyhow::bail!(
                    "Seed rules '{}' and '{}' both claim {}",
                    other,
                    seed.name,
                    tuple
                );
            }
            tuples.push((seed.name.as_str(), tuple));
        }
        Ok(())
    }
}
