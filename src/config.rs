use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Complete configuration for one PPO agent controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentControllerConfig {
    /// Name used in log lines and metric reports (default: "ppo").
    pub controller_name: String,
    /// Timesteps to collect before each learning step (default: 50_000).
    pub timesteps_per_iteration: u64,
    /// Timesteps between checkpoint saves (default: 1_000_000).
    pub save_every_ts: u64,
    /// Append `-<unix nanos>` to fresh run directories (default: true).
    pub add_unix_timestamp: bool,
    /// Checkpoint directory to resume from, if any.
    pub checkpoint_load_folder: Option<PathBuf>,
    /// Number of checkpoints retained in the run directory; 0 keeps all
    /// (default: 5).
    pub n_checkpoints_to_keep: usize,
    /// Seed forwarded to collaborators that sample (default: 123).
    pub random_seed: u64,
    /// Base name for fresh run directories (default: "rlgym-learn-run").
    pub run_name: String,
    /// Root under which run directories are created.
    pub save_folder: PathBuf,
    pub experience_buffer: ExperienceBufferConfig,
}

/// Configuration for the in-crate experience buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperienceBufferConfig {
    /// Maximum number of timesteps retained (default: 100_000).
    pub max_size: usize,
    /// Timesteps per sampled minibatch (default: 10_000).
    pub batch_size: usize,
}

impl Default for AgentControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: "ppo".into(),
            timesteps_per_iteration: 50_000,
            save_every_ts: 1_000_000,
            add_unix_timestamp: true,
            checkpoint_load_folder: None,
            n_checkpoints_to_keep: 5,
            random_seed: 123,
            run_name: "rlgym-learn-run".into(),
            save_folder: PathBuf::from("agents_checkpoints"),
            experience_buffer: ExperienceBufferConfig::default(),
        }
    }
}

impl Default for ExperienceBufferConfig {
    fn default() -> Self {
        Self {
            max_size: 100_000,
            batch_size: 10_000,
        }
    }
}

impl AgentControllerConfig {
    /// Read a JSON configuration file; missing fields take their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.timesteps_per_iteration == 0 {
            bail!("timesteps_per_iteration must be positive");
        }
        if self.save_every_ts == 0 {
            bail!("save_every_ts must be positive");
        }
        if self.experience_buffer.max_size == 0 {
            bail!("experience_buffer.max_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentControllerConfig::default();
        assert_eq!(config.timesteps_per_iteration, 50_000);
        assert_eq!(config.save_every_ts, 1_000_000);
        assert_eq!(config.n_checkpoints_to_keep, 5);
        assert!(config.add_unix_timestamp);
        assert!(config.checkpoint_load_folder.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentControllerConfig =
            serde_json::from_str(r#"{"timesteps_per_iteration": 64, "run_name": "demo"}"#).unwrap();
        assert_eq!(config.timesteps_per_iteration, 64);
        assert_eq!(config.run_name, "demo");
        assert_eq!(config.save_every_ts, 1_000_000);
        assert_eq!(config.experience_buffer.max_size, 100_000);
    }

    #[test]
    fn test_validate_rejects_zero_iteration() {
        let config = AgentControllerConfig {
            timesteps_per_iteration: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"n_checkpoints_to_keep": 2}"#).unwrap();
        let config = AgentControllerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.n_checkpoints_to_keep, 2);

        assert!(AgentControllerConfig::load_from_file(dir.path().join("missing.json")).is_err());
    }
}
