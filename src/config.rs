use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents).context("Invalid config YAML")?;
        if config.simulation.planning_stride == 0 {
            anyhow::bail!("simulation.planning_stride must be at least 1");
        }
        Ok(config)
    }

    /// Tracing filter directive for this crate, e.g. `drive_loop=info`.
    pub fn log_directive(&self) -> String {
        format!("drive_loop={},reqwest=warn", self.logging.level)
    }
}
