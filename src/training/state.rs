//! The single mutable value a training run revolves around.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;

use crate::trajectory::{EnvId, EnvTrajectories, Trajectory};

/// Wall-clock seconds since the Unix epoch.
pub fn unix_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Counters, timers and in-flight data for the current iteration.
///
/// Owned by the [`IterationCollector`](super::collector::IterationCollector)
/// and lent to the learning step and the checkpoint manager. Everything here
/// except `timesteps_since_last_save` is persisted with each checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationState {
    pub cur_iteration: u64,
    pub cumulative_timesteps: u64,
    /// Timesteps accepted since the last learning step.
    pub iteration_timesteps: u64,
    pub timesteps_since_last_save: u64,
    pub iteration_start_time: f64,
    pub timestep_collection_start_time: f64,
    /// Open trackers, keyed by environment id.
    pub env_trajectories: BTreeMap<EnvId, EnvTrajectories>,
    /// Finished trajectories waiting for the next learning step.
    pub trajectories: Vec<Trajectory>,
    /// Opaque per-environment state metrics gathered this iteration.
    pub iteration_state_metrics: Vec<Value>,
    /// Identity of the external metrics run, if one is attached.
    pub run_identity_token: Option<String>,
}

impl IterationState {
    pub fn new() -> Self {
        let now = unix_seconds();
        Self {
            cur_iteration: 0,
            cumulative_timesteps: 0,
            iteration_timesteps: 0,
            timesteps_since_last_save: 0,
            iteration_start_time: now,
            timestep_collection_start_time: now,
            env_trajectories: BTreeMap::new(),
            trajectories: Vec::new(),
            iteration_state_metrics: Vec::new(),
            run_identity_token: None,
        }
    }

    /// Clear iteration-scoped data after a learning step and start the next
    /// iteration at `now`.
    pub fn finish_iteration(&mut self, now: f64) {
        self.iteration_state_metrics.clear();
        self.env_trajectories.clear();
        self.trajectories.clear();
        self.timesteps_since_last_save += self.iteration_timesteps;
        self.iteration_timesteps = 0;
        self.iteration_start_time = now;
        self.timestep_collection_start_time = now;
        self.cur_iteration += 1;
    }

    /// Steps held in open trackers and pending trajectories.
    pub fn pending_timesteps(&self) -> usize {
        self.env_trajectories
            .values()
            .map(EnvTrajectories::num_steps)
            .sum::<usize>()
            + self.trajectories.iter().map(Trajectory::len).sum::<usize>()
    }
}

impl Default for IterationState {
    fn default() -> Self {
        Self::new()
    }
}
