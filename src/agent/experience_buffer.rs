//! Bounded in-memory experience buffer.
//!
//! Keeps the most recent trajectories up to a timestep budget, evicting the
//! oldest first. Sampling shuffles with a seeded RNG so that a resumed run
//! draws the same batches it would have drawn without the interruption.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ExperienceBufferConfig;
use crate::trajectory::Trajectory;

use super::traits::ExperienceBuffer;

const BUFFER_STATE_FILE: &str = "experience_buffer.json";

#[derive(Debug, Serialize, Deserialize)]
struct BufferState {
    submissions: u64,
    trajectories: Vec<Trajectory>,
}

/// FIFO trajectory store bounded by total timesteps.
#[derive(Debug)]
pub struct InMemoryExperienceBuffer {
    config: ExperienceBufferConfig,
    seed: u64,
    rng: StdRng,
    trajectories: VecDeque<Trajectory>,
    timesteps: usize,
    submissions: u64,
}

impl InMemoryExperienceBuffer {
    pub fn new(config: ExperienceBufferConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            rng: StdRng::seed_from_u64(seed),
            trajectories: VecDeque::new(),
            timesteps: 0,
            submissions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn config(&self) -> &ExperienceBufferConfig {
        &self.config
    }

    fn evict(&mut self) {
        while self.timesteps > self.config.max_size {
            match self.trajectories.pop_front() {
                Some(old) => self.timesteps -= old.len(),
                None => break,
            }
        }
    }

    fn reseed(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.submissions));
    }
}

impl ExperienceBuffer for InMemoryExperienceBuffer {
    async fn submit_experience(&mut self, trajectories: Vec<Trajectory>) -> Result<Value> {
        let n_trajectories = trajectories.len();
        let n_timesteps: usize = trajectories.iter().map(Trajectory::len).sum();
        let total_reward: f32 = trajectories.iter().map(Trajectory::total_reward).sum();
        let truncated = trajectories.iter().filter(|t| t.truncated).count();

        self.timesteps += n_timesteps;
        self.trajectories.extend(trajectories);
        self.evict();
        self.submissions += 1;
        self.reseed();

        let per_trajectory = |x: f64| {
            if n_trajectories == 0 {
                0.0
            } else {
                x / n_trajectories as f64
            }
        };
        Ok(json!({
            "n_trajectories": n_trajectories,
            "n_timesteps": n_timesteps,
            "mean_trajectory_reward": per_trajectory(total_reward as f64),
            "mean_trajectory_length": per_trajectory(n_timesteps as f64),
            "truncated_fraction": per_trajectory(truncated as f64),
            "buffer_timesteps": self.timesteps,
        }))
    }

    fn num_timesteps(&self) -> usize {
        self.timesteps
    }

    fn sample_trajectories(&mut self, min_timesteps: usize) -> Vec<Trajectory> {
        let mut order: Vec<usize> = (0..self.trajectories.len()).collect();
        order.shuffle(&mut self.rng);

        let mut batch = Vec::new();
        let mut taken = 0;
        for idx in order {
            if taken >= min_timesteps {
                break;
            }
            taken += self.trajectories[idx].len();
            batch.push(self.trajectories[idx].clone());
        }
        batch
    }

    fn save_checkpoint(&self, folder: &Path) -> Result<()> {
        std::fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create {}", folder.display()))?;
        let state = BufferState {
            submissions: self.submissions,
            trajectories: self.trajectories.iter().cloned().collect(),
        };
        let json = serde_json::to_string(&state).context("Failed to serialize experience buffer")?;
        std::fs::write(folder.join(BUFFER_STATE_FILE), json)
            .with_context(|| format!("Failed to write experience buffer to {}", folder.display()))?;
        tracing::debug!(
            trajectories = self.trajectories.len(),
            timesteps = self.timesteps,
            "Saved experience buffer"
        );
        Ok(())
    }

    fn load_checkpoint(&mut self, folder: &Path) -> Result<()> {
        let path = folder.join(BUFFER_STATE_FILE);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state: BufferState = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        self.timesteps = state.trajectories.iter().map(Trajectory::len).sum();
        self.trajectories = state.trajectories.into();
        self.submissions = state.submissions;
        self.reseed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trajectory(agent: &str, len: usize, reward: f32) -> Trajectory {
        Trajectory {
            agent_id: agent.into(),
            obs: vec![vec![0.0]; len],
            actions: vec![vec![0.0]; len],
            log_probs: vec![0.0; len],
            rewards: vec![reward; len],
            value_predictions: Some(vec![0.0; len]),
            final_obs: vec![0.0],
            final_value_prediction: Some(0.0),
            truncated: false,
        }
    }

    fn small_buffer() -> InMemoryExperienceBuffer {
        InMemoryExperienceBuffer::new(
            ExperienceBufferConfig {
                max_size: 10,
                batch_size: 4,
            },
            7,
        )
    }

    #[tokio::test]
    async fn test_submit_reports_diagnostics() {
        let mut buffer = small_buffer();
        let data = buffer
            .submit_experience(vec![make_trajectory("a", 2, 1.0), make_trajectory("b", 4, 0.5)])
            .await
            .unwrap();
        assert_eq!(data["n_trajectories"], json!(2));
        assert_eq!(data["n_timesteps"], json!(6));
        assert_eq!(data["mean_trajectory_reward"], json!(2.0));
        assert_eq!(buffer.num_timesteps(), 6);
    }

    #[tokio::test]
    async fn test_evicts_oldest_over_budget() {
        let mut buffer = small_buffer();
        buffer.submit_experience(vec![make_trajectory("old", 6, 0.0)]).await.unwrap();
        buffer.submit_experience(vec![make_trajectory("new", 6, 0.0)]).await.unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.num_timesteps(), 6);
        assert_eq!(buffer.sample_trajectories(1)[0].agent_id, "new");
    }

    #[tokio::test]
    async fn test_sample_reaches_minimum() {
        let mut buffer = small_buffer();
        let batch: Vec<_> = (0..5).map(|i| make_trajectory(&format!("a{i}"), 2, 0.0)).collect();
        buffer.submit_experience(batch).await.unwrap();
        let sample = buffer.sample_trajectories(5);
        assert_eq!(sample.len(), 3);
        assert!(buffer.sample_trajectories(100).len() == 5);
    }

    #[tokio::test]
    async fn test_checkpoint_restores_sampling_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = small_buffer();
        let batch: Vec<_> = (0..5).map(|i| make_trajectory(&format!("a{i}"), 2, 0.0)).collect();
        buffer.submit_experience(batch).await.unwrap();
        buffer.save_checkpoint(dir.path()).unwrap();

        let mut restored = small_buffer();
        restored.load_checkpoint(dir.path()).unwrap();
        assert_eq!(restored.num_timesteps(), buffer.num_timesteps());
        assert_eq!(restored.sample_trajectories(4), buffer.sample_trajectories(4));
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_masked_log_probs() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = small_buffer();
        let mut masked = make_trajectory("a", 2, 0.0);
        masked.log_probs = vec![f32::NEG_INFINITY, -0.5];
        buffer.submit_experience(vec![masked.clone()]).await.unwrap();
        buffer.save_checkpoint(dir.path()).unwrap();

        let mut restored = small_buffer();
        restored.load_checkpoint(dir.path()).unwrap();
        assert_eq!(restored.sample_trajectories(1), vec![masked]);
    }
}
