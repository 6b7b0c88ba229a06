//! Iteration collector: routes timestep deliveries into per-environment
//! trackers and decides, per environment, whether to reset or keep stepping.
//!
//! The collector owns the [`IterationState`]. A delivery is ingested as one
//! unit; the caller then asks for the action of every environment it
//! referenced before sending the next delivery.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::agent::ObsStandardizer;
use crate::trajectory::{EnvId, EnvTrajectories, Observation, Timestep};

use super::state::IterationState;

/// What an environment should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvAction {
    Step,
    Reset,
}

/// One environment's share of a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvStepBatch {
    pub timesteps: Vec<Timestep>,
    /// One log-probability per agent tracked for the environment, in the
    /// tracker's agent order.
    #[serde(with = "crate::trajectory::json_float")]
    pub log_probs: Vec<f32>,
    /// Opaque state-level metrics for this environment.
    #[serde(default)]
    pub state_metrics: Value,
}

/// Result of ingesting one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Timesteps accepted across all environments.
    pub timesteps_added: u64,
    /// State-metric payloads appended to the iteration's list.
    pub state_metrics_collected: usize,
}

/// Owner of the iteration state during collection.
#[derive(Debug, Clone, Default)]
pub struct IterationCollector {
    state: IterationState,
}

impl IterationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a restored state.
    pub fn from_state(state: IterationState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &IterationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut IterationState {
        &mut self.state
    }

    /// Feed one delivery into the trackers.
    ///
    /// The first non-empty batch seen for an environment fixes its agent set.
    /// Empty batches create no tracker but still contribute their metrics.
    /// Every batch is checked before any tracker, counter or metric changes, so
    /// a rejected delivery leaves the state untouched.
    pub fn ingest(&mut self, batches: BTreeMap<EnvId, EnvStepBatch>) -> Result<IngestOutcome> {
        let mut new_trackers = BTreeMap::new();
        for (env_id, batch) in &batches {
            if batch.timesteps.is_empty() {
                continue;
            }
            let checked = match self.state.env_trajectories.get(env_id) {
                Some(tracker) => tracker.check_steps(&batch.timesteps, &batch.log_probs),
                None => {
                    let tracker = EnvTrajectories::from_timesteps(&batch.timesteps)
                        .with_context(|| format!("Failed to start tracking env {env_id}"))?;
                    let checked = tracker.check_steps(&batch.timesteps, &batch.log_probs);
                    new_trackers.insert(env_id.clone(), tracker);
                    checked
                }
            };
            checked.with_context(|| format!("Rejected timesteps for env {env_id}"))?;
        }

        for (env_id, tracker) in new_trackers {
            debug!(
                env_id = %env_id,
                agents = tracker.agent_ids().len(),
                "Tracking new environment"
            );
            self.state.env_trajectories.insert(env_id, tracker);
        }

        let mut timesteps_added = 0u64;
        let mut state_metrics_collected = 0;
        for (env_id, batch) in batches {
            if !batch.timesteps.is_empty() {
                if let Some(tracker) = self.state.env_trajectories.get_mut(&env_id) {
                    let added = tracker
                        .add_steps(batch.timesteps, &batch.log_probs)
                        .with_context(|| format!("Rejected timesteps for env {env_id}"))?;
                    timesteps_added += added as u64;
                }
            }
            self.state.iteration_state_metrics.push(batch.state_metrics);
            state_metrics_collected += 1;
        }

        self.state.iteration_timesteps += timesteps_added;
        self.state.cumulative_timesteps += timesteps_added;

        Ok(IngestOutcome {
            timesteps_added,
            state_metrics_collected,
        })
    }

    /// Decide what `env_id` does next.
    ///
    /// An environment without a tracker has just been reset, so it steps. One
    /// whose agents are all done resets, and its trajectories move to the
    /// pending list.
    pub fn decide_env_action(&mut self, env_id: &str) -> Result<EnvAction> {
        let done = match self.state.env_trajectories.get(env_id) {
            None => return Ok(EnvAction::Step),
            Some(tracker) => tracker.is_done(),
        };
        if !done {
            return Ok(EnvAction::Step);
        }

        if let Some(tracker) = self.state.env_trajectories.remove(env_id) {
            let trajectories = tracker
                .into_trajectories()
                .with_context(|| format!("Failed to assemble trajectories for env {env_id}"))?;
            debug!(env_id, trajectories = trajectories.len(), "Environment finished");
            self.state.trajectories.extend(trajectories);
        }
        Ok(EnvAction::Reset)
    }

    /// Decide for every environment referenced by a delivery.
    pub fn choose_env_actions<'a>(
        &mut self,
        env_ids: impl IntoIterator<Item = &'a EnvId>,
    ) -> Result<BTreeMap<EnvId, EnvAction>> {
        env_ids
            .into_iter()
            .map(|env_id| Ok((env_id.clone(), self.decide_env_action(env_id)?)))
            .collect()
    }

    /// Whether enough timesteps were collected for a learning step.
    pub fn reached_iteration_boundary(&self, timesteps_per_iteration: u64) -> bool {
        self.state.iteration_timesteps >= timesteps_per_iteration
    }

    /// Truncate every open tracker and move its trajectories to the pending
    /// list, in environment-id order. Returns the number of trackers closed.
    pub fn finalize_open_trackers(&mut self) -> Result<usize> {
        let open = std::mem::take(&mut self.state.env_trajectories);
        let closed = open.len();
        for (env_id, mut tracker) in open {
            tracker.finalize();
            let trajectories = tracker
                .into_trajectories()
                .with_context(|| format!("Failed to assemble trajectories for env {env_id}"))?;
            self.state.trajectories.extend(trajectories);
        }
        Ok(closed)
    }
}

// ---------------------------------------------------------------------------
// Observation standardization
// ---------------------------------------------------------------------------

/// Standardize the `obs` and `next_obs` of every timestep in one batched call.
///
/// The standardizer sees the observations interleaved per timestep
/// (`obs_0, next_obs_0, obs_1, next_obs_1, ...`), each paired with its agent
/// id, and its outputs are written back in that same order.
pub fn standardize_observations(
    standardizer: &mut dyn ObsStandardizer,
    timesteps: &mut [Timestep],
) -> Result<()> {
    if timesteps.is_empty() {
        return Ok(());
    }
    let standardized = {
        let agent_ids: Vec<&str> = timesteps
            .iter()
            .flat_map(|t| [t.agent_id.as_str(), t.agent_id.as_str()])
            .collect();
        let obs: Vec<&Observation> = timesteps.iter().flat_map(|t| [&t.obs, &t.next_obs]).collect();
        standardizer.standardize(&agent_ids, &obs)?
    };
    if standardized.len() != 2 * timesteps.len() {
        bail!(
            "Observation standardizer returned {} observations for {} inputs",
            standardized.len(),
            2 * timesteps.len()
        );
    }

    for (i, obs) in standardized.into_iter().enumerate() {
        let timestep = &mut timesteps[i / 2];
        if i % 2 == 0 {
            timestep.obs = obs;
        } else {
            timestep.next_obs = obs;
        }
    }
    Ok(())
}
