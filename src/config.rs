// src/config.rs

use crate::types::Config;
use anyhow::{bail, Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Config = serde_yaml::from_str(&contents).context("invalid config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            bail!("config must list at least one camera");
        }
        for cam in &self.cameras {
            if cam.name.is_empty() {
                bail!("camera name must not be empty");
            }
            if cam.time_scale <= 0.0 {
                bail!("camera {}: time_scale must be positive", cam.name);
            }
        }
        let mut names: Vec<&str> = self.cameras.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.cameras.len() {
            bail!("camera names must be unique");
        }
        if self.clock.tick_interval_secs <= 0.0 {
            bail!("clock.tick_interval_secs must be positive");
        }
        if self.clock.stall_secs <= 0.0 {
            bail!("clock.stall_secs must be positive");
        }
        if self.clustering.recluster_interval_secs < 0.0 {
            bail!("clustering.recluster_interval_secs must not be negative");
        }
        if !matches!(
            self.clustering.linkage.as_str(),
            "single" | "average" | "complete"
        ) {
            bail!(
                "clustering.linkage must be one of single/average/complete, got {}",
                self.clustering.linkage
            );
        }
        if self.live.target_fps <= 0.0 {
            bail!("live.target_fps must be positive");
        }
        Ok(())
    }
}
