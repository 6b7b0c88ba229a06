//! Deterministic critic and learner stand-ins.
//!
//! These let the controller, the checkpoint code and the CLI `simulate`
//! command run end to end without a neural-network backend.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::trajectory::Observation;

use super::traits::{Critic, ExperienceBuffer, Learner};

const LEARNER_STATE_FILE: &str = "learner.json";

/// Predicts the mean of each observation vector.
#[derive(Debug, Default)]
pub struct MockCritic {
    calls: AtomicUsize,
}

impl MockCritic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batched inference calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Critic for MockCritic {
    async fn predict_values(&self, agent_ids: &[&str], obs: &[&Observation]) -> Result<Vec<f32>> {
        anyhow::ensure!(
            agent_ids.len() == obs.len(),
            "critic received {} agent ids for {} observations",
            agent_ids.len(),
            obs.len()
        );
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(obs
            .iter()
            .map(|o| {
                if o.is_empty() {
                    0.0
                } else {
                    o.iter().sum::<f32>() / o.len() as f32
                }
            })
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LearnerState {
    updates: u64,
}

/// Counts updates and summarises the batches it is handed.
#[derive(Debug, Default)]
pub struct MockLearner {
    critic: MockCritic,
    batch_size: usize,
    updates: u64,
}

impl MockLearner {
    pub fn new(batch_size: usize) -> Self {
        Self {
            critic: MockCritic::new(),
            batch_size,
            updates: 0,
        }
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl Learner for MockLearner {
    type Critic = MockCritic;

    fn critic(&self) -> &MockCritic {
        &self.critic
    }

    async fn learn<B: ExperienceBuffer>(&mut self, buffer: &mut B) -> Result<Value> {
        let batch = buffer.sample_trajectories(self.batch_size);
        let timesteps: usize = batch.iter().map(|t| t.len()).sum();
        let (value_sum, value_count) = batch
            .iter()
            .filter_map(|t| t.value_predictions.as_ref())
            .flatten()
            .fold((0.0f64, 0usize), |(sum, n), v| (sum + *v as f64, n + 1));
        let mean_value = if value_count == 0 {
            0.0
        } else {
            value_sum / value_count as f64
        };
        self.updates += 1;

        tracing::debug!(updates = self.updates, timesteps, "Mock learner update");
        Ok(json!({
            "updates": self.updates,
            "batch_trajectories": batch.len(),
            "batch_timesteps": timesteps,
            "mean_value_prediction": mean_value,
        }))
    }

    fn save_checkpoint(&self, folder: &Path) -> Result<()> {
        std::fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create {}", folder.display()))?;
        let json = serde_json::to_string_pretty(&LearnerState {
            updates: self.updates,
        })?;
        std::fs::write(folder.join(LEARNER_STATE_FILE), json)
            .with_context(|| format!("Failed to write learner state to {}", folder.display()))
    }

    fn load_checkpoint(&mut self, folder: &Path) -> Result<()> {
        let path = folder.join(LEARNER_STATE_FILE);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state: LearnerState = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        self.updates = state.updates;
        Ok(())
    }
}
