use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::Config;
use crate::events::compile_pattern;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.selectors.is_empty() {
            anyhow::bail!("at least one selector must be defined");
        }

        let bans = &self.bans;

        if let Some(bits) = bans.ban_subnet_bits {
            if bits > 32 {
                anyhow::bail!("ban_subnet_bits must be between 0 and 32, got {}", bits);
            }
        }

        if bans.ban_repeated_offense_max == Some(0) {
            anyhow::bail!("ban_repeated_offense_max must be at least 1");
        }

        if let Some(coefficient) = bans.ban_repeated_offense_coefficient {
            if !coefficient.is_finite() || coefficient < 0.0 {
                anyhow::bail!(
                    "ban_repeated_offense_coefficient must be a non-negative number, got {}",
                    coefficient
                );
            }
        }

        if bans.ban_period.is_zero() {
            anyhow::bail!("ban_period must be greater than zero");
        }

        if bans.failure_window.is_zero() {
            anyhow::bail!("failure_window must be greater than zero");
        }

        for selector in &self.selectors {
            if selector.log_name.trim().is_empty() {
                anyhow::bail!("selector for event {} has an empty log_name", selector.event_id);
            }

            if let Some(pattern) = &selector.ip_address_pattern {
                compile_pattern(pattern).with_context(|| {
                    format!(
                        "invalid ip_address_pattern for event {} in log {}",
                        selector.event_id, selector.log_name
                    )
                })?;
            }
        }

        info!("configuration validated successfully");
        Ok(())
    }
}
